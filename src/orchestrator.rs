//! Orchestrator: single-writer restore driver.
//!
//! Acquires the restore lock, runs a narrow first pass to recover the
//! header and catalog, builds a restore plan against the host, then runs
//! a second pass that creates VMs and feeds their data to handlers. The
//! first pass is cheap and can fail fast before anything is created.

use crate::catalog::{self, Catalog};
use crate::config::Config;
use crate::crypto;
use crate::dispatcher::{self, DispatchReport};
use crate::error::{RestoreError, Result};
use crate::handlers::{self, Handler};
use crate::header::{self, Header};
use crate::outer_extractor::{self, Emitted};
use crate::plan::{self, RestorePlan};
use crate::source;
use crate::vmhost::{VmHandle, VmHost};
use console::style;
use crossbeam::channel::unbounded;
use fs2::FileExt;
use indicatif::ProgressBar;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

fn step(i: u32) -> console::StyledObject<String> {
    style(format!("[{}/5]", i)).blue()
}

#[derive(Debug, Default)]
pub struct RestoreSummary {
    pub plan: RestorePlan,
    pub created_vms: Vec<String>,
    pub failed_vms: Vec<(String, String)>,
    pub dom0_home_restored: bool,
}

pub struct Orchestrator<'a> {
    config: &'a Config,
    progress: ProgressBar,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a Config, show_progress: bool) -> Self {
        Self {
            config,
            progress: if show_progress {
                ProgressBar::new(1)
            } else {
                ProgressBar::hidden()
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        location: &str,
        source_vm: Option<&str>,
        service_name: Option<&str>,
        passphrase: &[u8],
        include: Option<&HashSet<String>>,
        exclude: &HashSet<String>,
        host: &dyn VmHost,
        cancel: &Arc<AtomicBool>,
    ) -> Result<RestoreSummary> {
        let _lock = self.acquire_lock()?;
        let scratch_dir = self.create_scratch_dir()?;
        let outcome = self.run_locked(
            location,
            source_vm,
            service_name,
            passphrase,
            include,
            exclude,
            host,
            cancel,
            &scratch_dir,
        );
        if !self.config.debug_keep_scratch {
            let _ = std::fs::remove_dir_all(&scratch_dir);
        }
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    fn run_locked(
        &self,
        location: &str,
        source_vm: Option<&str>,
        service_name: Option<&str>,
        passphrase: &[u8],
        include: Option<&HashSet<String>>,
        exclude: &HashSet<String>,
        host: &dyn VmHost,
        cancel: &Arc<AtomicBool>,
        scratch_dir: &Path,
    ) -> Result<RestoreSummary> {
        self.progress
            .println(format!("{} Reading backup header and catalog", step(1)));
        let header_filter = vec!["backup-header".to_owned(), "qubes.xml".to_owned()];
        let mut header_source = source::open(location, source_vm, service_name, &header_filter)?;
        let (header, catalog) =
            self.extract_header_and_catalog(&mut header_source, scratch_dir, passphrase)?;
        drop(header_source);

        if header.version < 2 && !self.config.allow_legacy_headers {
            return Err(RestoreError::BadHeader(
                "archive predates the backup-header format; refusing without allow_legacy_headers"
                    .into(),
            ));
        }

        let host_username = host.resolve_username();
        let plan = plan::build(&catalog, include, exclude, self.config, host, host_username.as_deref());
        self.print_plan_summary(&plan);

        if self.config.dry_run {
            return Ok(RestoreSummary {
                plan,
                created_vms: Vec::new(),
                failed_vms: Vec::new(),
                dom0_home_restored: false,
            });
        }

        self.check_disk_space(&plan, scratch_dir)?;

        if !self.config.skip_broken {
            let broken: Vec<&str> = plan
                .entries
                .iter()
                .filter(|(_, entry)| {
                    entry
                        .problems
                        .iter()
                        .any(|p| *p != plan::Problem::Excluded)
                })
                .map(|(name, _)| name.as_str())
                .collect();
            if !broken.is_empty() {
                return Err(RestoreError::DependencyMissing(format!(
                    "{} (pass --skip-broken to restore the rest anyway)",
                    broken.join(", ")
                )));
            }
        }

        self.progress.println(format!("{} Creating VMs", step(3)));
        let (vm_handles, mut failed_vms) = self.create_vms(&plan, host);

        let handler_names: Vec<(String, String)> = vm_handles
            .keys()
            .map(|name| (name.clone(), plan.entries[name].target_name.clone()))
            .collect();
        let mut table = handlers::build_table(&handler_names);
        let restoring_dom0_home = plan
            .dom0_home
            .as_ref()
            .map(|e| e.good_to_go())
            .unwrap_or(false);
        if restoring_dom0_home {
            table.extend(handlers::dom0_home_table(host_username.as_deref()));
        }

        let mut filter: Vec<String> = handler_names.iter().map(|(name, _)| name.clone()).collect();
        if restoring_dom0_home {
            filter.push("dom0-home".to_owned());
        }

        self.progress.println(format!("{} Restoring VM data", step(4)));
        let data_result = if filter.is_empty() {
            Ok(DispatchReport::default())
        } else {
            self.run_data_pass(location, source_vm, service_name, &filter, scratch_dir, &header, passphrase, &table, host, &vm_handles, cancel)
        };

        match data_result {
            Ok(report) => {
                let succeeded = report.succeeded.len();
                let dom0_home_restored = restoring_dom0_home
                    && report.succeeded.iter().any(|logical| logical.starts_with("dom0-home/"));
                failed_vms.extend(report.failed);
                self.progress.println(format!(
                    "{} Restore finished: {} logical files succeeded, {} failures",
                    step(5),
                    succeeded,
                    failed_vms.len()
                ));
                Ok(RestoreSummary {
                    plan,
                    created_vms: vm_handles.keys().cloned().collect(),
                    failed_vms,
                    dom0_home_restored,
                })
            }
            Err(e) => {
                // A failure here is not per-VM (bad passphrase, cancellation,
                // quota): roll back every VM this run created.
                for handle in vm_handles.values() {
                    let _ = host.destroy(handle);
                }
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_data_pass(
        &self,
        location: &str,
        source_vm: Option<&str>,
        service_name: Option<&str>,
        filter: &[String],
        scratch_dir: &Path,
        header: &Header,
        passphrase: &[u8],
        table: &BTreeMap<String, Handler>,
        host: &dyn VmHost,
        vm_handles: &BTreeMap<String, VmHandle>,
        cancel: &Arc<AtomicBool>,
    ) -> Result<DispatchReport> {
        let mut data_source = source::open(location, source_vm, service_name, filter)?;
        let stdout = std::mem::replace(&mut data_source.stdout, Box::new(std::io::empty()));
        let (rx, handle) = outer_extractor::spawn(
            stdout,
            scratch_dir.to_path_buf(),
            filter.to_vec(),
            self.config.max_files,
            self.config.max_bytes,
            self.config.low_water_bytes,
        );
        let report = dispatcher::run(rx, scratch_dir, header, passphrase, table, host, vm_handles, cancel);
        data_source.kill();
        let extractor_result = handle.join().expect("outer extractor thread panicked");
        extractor_result?;
        report
    }

    fn create_vms(
        &self,
        plan: &RestorePlan,
        host: &dyn VmHost,
    ) -> (BTreeMap<String, VmHandle>, Vec<(String, String)>) {
        let mut handles = BTreeMap::new();
        let mut failed = Vec::new();
        for name in vm_creation_order(plan) {
            let entry = &plan.entries[&name];
            match host.create(
                entry.source.class,
                &entry.target_name,
                &entry.source.label,
                entry.resolved_template.as_deref(),
            ) {
                Ok(created) => {
                    if let Some(netvm) = &entry.resolved_netvm {
                        let _ = host.set_property(&created, "netvm", netvm);
                    }
                    if let Some(dispvm) = &entry.resolved_default_dispvm {
                        let _ = host.set_property(&created, "default_dispvm", dispvm);
                    }
                    for (key, value) in &entry.source.properties {
                        if let Some(value) = value {
                            let _ = host.set_property(&created, key, value);
                        }
                    }
                    for (key, value) in &entry.source.features {
                        let _ = host.set_feature(&created, key, value);
                    }
                    for tag in &entry.source.tags {
                        let _ = host.add_tag(&created, tag);
                    }
                    for assignments in entry.source.devices.values() {
                        for assignment in assignments {
                            let _ = host.attach_device(
                                &created,
                                &assignment.bus_id.bus,
                                &assignment.bus_id.backend,
                                &assignment.bus_id.port_id,
                                &assignment.options,
                            );
                        }
                    }
                    handles.insert(name, created);
                }
                Err(reason) => failed.push((name, reason)),
            }
        }
        (handles, failed)
    }

    fn extract_header_and_catalog(
        &self,
        source: &mut source::SourceStream,
        scratch_dir: &Path,
        passphrase: &[u8],
    ) -> Result<(Header, Catalog)> {
        let stdout = std::mem::replace(&mut source.stdout, Box::new(std::io::empty()));
        let (rx, handle) = outer_extractor::spawn(
            stdout,
            scratch_dir.to_path_buf(),
            vec!["backup-header".to_owned(), "qubes.xml".to_owned()],
            self.config.max_files,
            self.config.max_bytes,
            self.config.low_water_bytes,
        );
        // The header pass only ever touches a handful of small files, so
        // unlike the main data pass it is safe to buffer the emitted names
        // before replaying them through the dispatcher.
        let emitted: Vec<Emitted> = rx.iter().collect();
        source.kill();
        handle.join().expect("outer extractor thread panicked")?;

        let header = self.read_header(scratch_dir, passphrase)?;

        let (replay_tx, replay_rx) = unbounded();
        for item in emitted {
            let _ = replay_tx.send(item);
        }
        drop(replay_tx);

        let mut table = BTreeMap::new();
        table.insert("qubes.xml".to_owned(), Handler::SaveQubesXml);
        let dummy_host = crate::vmhost::NullVmHost::default();
        let no_vms = BTreeMap::new();
        let cancel = Arc::new(AtomicBool::new(false));
        let report = dispatcher::run(replay_rx, scratch_dir, &header, passphrase, &table, &dummy_host, &no_vms, &cancel)?;
        let xml_bytes = report
            .qubes_xml
            .ok_or_else(|| RestoreError::CatalogFormat("archive did not contain qubes.xml".into()))?;
        let xml_text = String::from_utf8(xml_bytes)
            .map_err(|_| RestoreError::CatalogFormat("qubes.xml is not valid UTF-8".into()))?;
        let catalog = catalog::parse(&xml_text)?;
        Ok((header, catalog))
    }

    fn read_header(&self, scratch_dir: &Path, passphrase: &[u8]) -> Result<Header> {
        let header_path = scratch_dir.join("backup-header");
        if !header_path.exists() {
            return Ok(Header::legacy_v1());
        }
        let bytes = std::fs::read(&header_path)?;
        let hmac_path = scratch_dir.join("backup-header.hmac");
        let plaintext = if hmac_path.exists() {
            let hmac_bytes = std::fs::read(&hmac_path)?;
            crypto::verify_legacy_hmac(&bytes, &hmac_bytes, crate::config::LEGACY_HMAC_ALGORITHM, passphrase)?;
            bytes
        } else {
            let password = crypto::derive_v4_header_password(passphrase);
            crypto::decrypt_v4(&bytes, &password)?
        };
        header::parse(&plaintext)
    }

    fn acquire_lock(&self) -> Result<File> {
        if let Some(parent) = self.config.lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&self.config.lock_path)?;
        file.try_lock_exclusive()
            .map_err(|_| RestoreError::LockHeld(self.config.lock_path.clone()))?;
        Ok(file)
    }

    fn create_scratch_dir(&self) -> Result<PathBuf> {
        let dir = self.config.scratch_root.join(format!("restore-{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Pre-flight check against the catalog's declared sizes. Only a
    /// sanity check: the scratch area is a proxy for destination capacity
    /// since this crate does not model the host's storage pools.
    fn check_disk_space(&self, plan: &RestorePlan, scratch_dir: &Path) -> Result<()> {
        let needed: u64 = plan
            .entries
            .values()
            .filter(|e| e.good_to_go())
            .map(|e| e.source.size)
            .sum();
        if needed == 0 {
            return Ok(());
        }
        let available = fs2::available_space(scratch_dir)?;
        if available < needed {
            return Err(RestoreError::QuotaExceeded(format!(
                "restore needs {} bytes, only {} available under {}",
                needed,
                available,
                scratch_dir.display()
            )));
        }
        Ok(())
    }

    fn print_plan_summary(&self, plan: &RestorePlan) {
        self.progress
            .println(format!("{} Restore plan", step(2)));
        for (name, entry) in &plan.entries {
            if entry.good_to_go() {
                self.progress.println(format!(
                    "    {} -> {}",
                    name,
                    style(&entry.target_name).green()
                ));
            } else {
                self.progress.println(format!(
                    "    {} {} ({:?})",
                    name,
                    style("SKIPPED").red(),
                    entry.problems
                ));
            }
        }
    }
}

fn vm_creation_order(plan: &RestorePlan) -> Vec<String> {
    let mut names: Vec<String> = plan
        .entries
        .iter()
        .filter(|(_, entry)| entry.good_to_go())
        .map(|(name, _)| name.clone())
        .collect();
    names.sort_by_key(|name| class_rank(plan.entries[name].source.class));
    names
}

fn class_rank(class: crate::catalog::VmClass) -> u8 {
    use crate::catalog::VmClass::*;
    match class {
        TemplateVM => 0,
        StandaloneVM => 1,
        AppVM => 2,
        DispVM => 3,
        AdminVM => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::VmClass;

    fn entry(class: VmClass, target: &str) -> plan::PlanEntry {
        plan::PlanEntry {
            source: crate::catalog::VmRecord {
                name: target.into(),
                class,
                label: "red".into(),
                template: None,
                netvm: None,
                default_dispvm: None,
                properties: Default::default(),
                features: Default::default(),
                tags: Default::default(),
                devices: Default::default(),
                backup_path: Some(target.into()),
                size: 0,
            },
            target_name: target.into(),
            resolved_template: None,
            resolved_netvm: None,
            resolved_default_dispvm: None,
            problems: Default::default(),
        }
    }

    #[test]
    fn templates_are_created_before_appvms() {
        let mut plan = RestorePlan::default();
        plan.entries.insert("work".into(), entry(VmClass::AppVM, "work"));
        plan.entries.insert("debian-11".into(), entry(VmClass::TemplateVM, "debian-11"));
        let order = vm_creation_order(&plan);
        assert_eq!(order, vec!["debian-11".to_owned(), "work".to_owned()]);
    }
}
