//! Restore plan.

use crate::catalog::{Catalog, VmClass, VmRecord};
use crate::config::Config;
use crate::vmhost::VmHost;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Problem {
    Excluded,
    AlreadyExists,
    MissingTemplate,
    MissingNetvm,
    MissingKernel,
    /// dom0 only.
    UsernameMismatch,
}

#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub source: VmRecord,
    pub target_name: String,
    pub resolved_template: Option<String>,
    pub resolved_netvm: Option<String>,
    pub resolved_default_dispvm: Option<String>,
    pub problems: HashSet<Problem>,
}

impl PlanEntry {
    pub fn good_to_go(&self) -> bool {
        self.problems.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct RestorePlan {
    /// Keyed by the *source* (archive) VM name, so the dispatcher can map
    /// archive paths straight back to an entry regardless of renaming.
    pub entries: BTreeMap<String, PlanEntry>,
    pub dom0_home: Option<PlanEntry>,
}

impl RestorePlan {
    pub fn good_to_go_names(&self) -> HashSet<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.good_to_go())
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Builds the initial plan from the catalog, applying the include/exclude
/// filter, then resolves conflicts, templates and netvms against the
/// host.
pub fn build(
    catalog: &Catalog,
    include: Option<&HashSet<String>>,
    exclude: &HashSet<String>,
    config: &Config,
    host: &dyn VmHost,
    host_username: Option<&str>,
) -> RestorePlan {
    let mut plan = RestorePlan::default();
    let mut claimed_names: HashSet<String> = host.vm_names().into_iter().collect();

    for (name, vm) in &catalog.vms {
        if name == "dom0" {
            continue;
        }
        let mut problems = HashSet::new();
        if !vm.included_in_backup() {
            problems.insert(Problem::Excluded);
        }
        if let Some(include) = include {
            if !include.contains(name) {
                problems.insert(Problem::Excluded);
            }
        }
        if exclude.contains(name) {
            problems.insert(Problem::Excluded);
        }

        let target_name = resolve_name(name, &mut claimed_names, config, &mut problems);

        let resolved_template = resolve_reference(
            vm.template.as_deref(),
            catalog,
            host,
            VmClass::TemplateVM,
            config.default_template.as_deref(),
            Problem::MissingTemplate,
            &mut problems,
        );

        let resolved_netvm = resolve_netvm(vm.netvm.as_deref(), catalog, host, config, &mut problems);
        let resolved_default_dispvm = resolve_default_dispvm(vm.default_dispvm.as_deref(), catalog, host);

        plan.entries.insert(
            name.clone(),
            PlanEntry {
                source: vm.clone(),
                target_name,
                resolved_template,
                resolved_netvm,
                resolved_default_dispvm,
                problems,
            },
        );
    }

    if let Some(dom0) = catalog.dom0() {
        let mut problems = HashSet::new();
        if let Some(username) = dom0.properties.get("username").and_then(|v| v.clone()) {
            match host_username {
                Some(actual) if actual == username => {}
                _ => {
                    problems.insert(Problem::UsernameMismatch);
                }
            }
        } else if host_username.is_none() {
            // An unresolved dom0 user must be
            // fatal, never a silent proceed.
            problems.insert(Problem::UsernameMismatch);
        }
        plan.dom0_home = Some(PlanEntry {
            source: dom0.clone(),
            target_name: "dom0".into(),
            resolved_template: None,
            resolved_netvm: None,
            resolved_default_dispvm: None,
            problems,
        });
    }

    plan
}

fn resolve_name(
    name: &str,
    claimed_names: &mut HashSet<String>,
    config: &Config,
    problems: &mut HashSet<Problem>,
) -> String {
    if !claimed_names.contains(name) {
        claimed_names.insert(name.to_owned());
        return name.to_owned();
    }
    if !config.rename_conflicting {
        problems.insert(Problem::AlreadyExists);
        return name.to_owned();
    }
    for suffix in 1..100 {
        let candidate = format!("{}{}", name, suffix);
        if !claimed_names.contains(&candidate) {
            claimed_names.insert(candidate.clone());
            return candidate;
        }
    }
    problems.insert(Problem::AlreadyExists);
    name.to_owned()
}

#[allow(clippy::too_many_arguments)]
fn resolve_reference(
    reference: Option<&str>,
    catalog: &Catalog,
    host: &dyn VmHost,
    required_class: VmClass,
    default: Option<&str>,
    missing: Problem,
    problems: &mut HashSet<Problem>,
) -> Option<String> {
    let reference = reference?;
    if host.vm_exists_with_class(reference, required_class) {
        return Some(reference.to_owned());
    }
    if let Some(vm) = catalog.vms.get(reference) {
        if vm.class == required_class {
            return Some(reference.to_owned());
        }
    }
    if let Some(default) = default {
        return Some(default.to_owned());
    }
    problems.insert(missing);
    None
}

fn resolve_netvm(
    reference: Option<&str>,
    catalog: &Catalog,
    host: &dyn VmHost,
    config: &Config,
    problems: &mut HashSet<Problem>,
) -> Option<String> {
    match reference {
        None => None,
        Some(name) => {
            if host.vm_exists(name) {
                return Some(name.to_owned());
            }
            if let Some(vm) = catalog.vms.get(name) {
                let netvm_capable = matches!(
                    vm.class,
                    VmClass::AppVM | VmClass::TemplateVM | VmClass::StandaloneVM
                );
                if netvm_capable {
                    return Some(name.to_owned());
                }
            }
            if config.default_netvm_is_none {
                return None;
            }
            problems.insert(Problem::MissingNetvm);
            None
        }
    }
}

/// Unlike `netvm`/`template`, an unresolved `default_dispvm` is not a
/// restore blocker: qubes-core falls back to its own global default when
/// the property is absent.
fn resolve_default_dispvm(reference: Option<&str>, catalog: &Catalog, host: &dyn VmHost) -> Option<String> {
    let name = reference?;
    if host.vm_exists(name) {
        return Some(name.to_owned());
    }
    if catalog.vms.contains_key(name) {
        return Some(name.to_owned());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmhost::NullVmHost;
    use std::collections::HashMap;

    fn vm(name: &str, class: VmClass, template: Option<&str>, backup_path: Option<&str>) -> VmRecord {
        VmRecord {
            name: name.to_owned(),
            class,
            label: "red".into(),
            template: template.map(str::to_owned),
            netvm: None,
            default_dispvm: None,
            properties: HashMap::new(),
            features: HashMap::new(),
            tags: Default::default(),
            devices: Default::default(),
            backup_path: backup_path.map(str::to_owned),
            size: 0,
        }
    }

    fn catalog_with(vms: Vec<VmRecord>) -> Catalog {
        let mut c = Catalog::default();
        c.vms.insert("dom0".into(), vm("dom0", VmClass::AdminVM, None, None));
        for v in vms {
            c.vms.insert(v.name.clone(), v);
        }
        c
    }

    #[test]
    fn good_to_go_when_template_present_on_host() {
        let cat = catalog_with(vec![vm("myvm", VmClass::AppVM, Some("debian-11"), Some("myvm"))]);
        let host = NullVmHost::with_vms(vec![("debian-11", VmClass::TemplateVM)]);
        let config = Config::default();
        let plan = build(&cat, None, &Default::default(), &config, &host, Some("user"));
        assert!(plan.entries["myvm"].good_to_go());
    }

    #[test]
    fn missing_template_without_skip_broken() {
        let cat = catalog_with(vec![vm("myvm", VmClass::AppVM, Some("nope"), Some("myvm"))]);
        let host = NullVmHost::default();
        let config = Config::default();
        let plan = build(&cat, None, &Default::default(), &config, &host, Some("user"));
        assert!(plan.entries["myvm"].problems.contains(&Problem::MissingTemplate));
    }

    #[test]
    fn conflict_rename_suffix() {
        let cat = catalog_with(vec![vm("work", VmClass::AppVM, None, Some("work"))]);
        let host = NullVmHost::with_vms(vec![("work", VmClass::AppVM)]);
        let mut config = Config::default();
        config.rename_conflicting = true;
        let plan = build(&cat, None, &Default::default(), &config, &host, Some("user"));
        assert_eq!(plan.entries["work"].target_name, "work1");
        assert!(!plan.entries["work"].problems.contains(&Problem::AlreadyExists));
    }

    #[test]
    fn conflict_without_rename_flag_is_already_exists() {
        let cat = catalog_with(vec![vm("work", VmClass::AppVM, None, Some("work"))]);
        let host = NullVmHost::with_vms(vec![("work", VmClass::AppVM)]);
        let config = Config::default();
        let plan = build(&cat, None, &Default::default(), &config, &host, Some("user"));
        assert!(plan.entries["work"].problems.contains(&Problem::AlreadyExists));
    }

    #[test]
    fn excluded_vm_is_not_included() {
        let cat = catalog_with(vec![vm("x", VmClass::AppVM, None, None)]);
        let host = NullVmHost::default();
        let config = Config::default();
        let plan = build(&cat, None, &Default::default(), &config, &host, Some("user"));
        assert!(plan.entries["x"].problems.contains(&Problem::Excluded));
    }

    #[test]
    fn empty_include_filter_yields_empty_good_to_go() {
        let cat = catalog_with(vec![vm("x", VmClass::AppVM, None, Some("x"))]);
        let host = NullVmHost::default();
        let config = Config::default();
        let include: HashSet<String> = HashSet::new();
        let plan = build(&cat, Some(&include), &Default::default(), &config, &host, Some("user"));
        assert!(plan.good_to_go_names().is_empty());
    }
}
