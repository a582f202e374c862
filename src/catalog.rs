//! Backup catalog: parsed from the inner
//! `qubes.xml`, a mapping from VM name to a VM record.

use crate::error::{RestoreError, Result};
use quick_xml::de::from_str;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VmClass {
    AdminVM,
    TemplateVM,
    AppVM,
    StandaloneVM,
    DispVM,
}

impl VmClass {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "AdminVM" => VmClass::AdminVM,
            "TemplateVM" => VmClass::TemplateVM,
            "AppVM" => VmClass::AppVM,
            "StandaloneVM" => VmClass::StandaloneVM,
            "DispVM" => VmClass::DispVM,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BusId {
    pub bus: String,
    pub backend: String,
    pub port_id: String,
}

#[derive(Debug, Clone)]
pub struct DeviceAssignment {
    pub bus_id: BusId,
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct VmRecord {
    pub name: String,
    pub class: VmClass,
    pub label: String,
    pub template: Option<String>,
    pub netvm: Option<String>,
    pub default_dispvm: Option<String>,
    pub properties: HashMap<String, Option<String>>,
    pub features: HashMap<String, String>,
    pub tags: HashSet<String>,
    pub devices: BTreeMap<String, Vec<DeviceAssignment>>,
    /// Path of this VM's data relative to the archive root; `None` means
    /// the VM was cataloged but not included in the backup (e.g. a
    /// halted DispVM the backup tool skipped).
    pub backup_path: Option<String>,
    pub size: u64,
}

impl VmRecord {
    pub fn included_in_backup(&self) -> bool {
        self.backup_path.is_some()
    }
}

#[derive(Debug, Default)]
pub struct Catalog {
    pub vms: BTreeMap<String, VmRecord>,
}

impl Catalog {
    pub fn dom0(&self) -> Option<&VmRecord> {
        self.vms.get("dom0")
    }
}

// --- wire format (qubes.xml) -------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename = "qubes")]
struct QubesXml {
    #[serde(rename = "properties", default)]
    #[allow(dead_code)]
    properties: Option<XmlProperties>,
    #[serde(rename = "labels", default)]
    #[allow(dead_code)]
    labels: Option<XmlLabels>,
    #[serde(rename = "domains", default)]
    domains: Option<XmlDomains>,
}

#[derive(Debug, Deserialize, Default)]
struct XmlProperties {
    #[serde(rename = "property", default)]
    #[allow(dead_code)]
    items: Vec<XmlProperty>,
}

#[derive(Debug, Deserialize)]
struct XmlProperty {
    #[allow(dead_code)]
    name: String,
    #[serde(rename = "$text", default)]
    #[allow(dead_code)]
    value: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct XmlLabels {
    #[serde(rename = "label", default)]
    #[allow(dead_code)]
    items: Vec<XmlLabel>,
}

#[derive(Debug, Deserialize)]
struct XmlLabel {
    #[allow(dead_code)]
    id: String,
    #[serde(rename = "$text", default)]
    #[allow(dead_code)]
    name: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct XmlDomains {
    #[serde(rename = "domain", default)]
    items: Vec<XmlDomain>,
}

#[derive(Debug, Deserialize)]
struct XmlDomain {
    class: String,
    name: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(rename = "properties", default)]
    properties: Option<XmlDomainProperties>,
    #[serde(rename = "features", default)]
    features: Option<XmlFeatures>,
    #[serde(rename = "tags", default)]
    tags: Option<XmlTags>,
    #[serde(rename = "devices", default)]
    devices: Option<XmlDevicesWrapper>,
    #[serde(rename = "backup-path", default)]
    backup_path: Option<String>,
    #[serde(rename = "backup-size", default)]
    backup_size: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct XmlDomainProperties {
    #[serde(rename = "property", default)]
    items: Vec<XmlProperty>,
}

#[derive(Debug, Deserialize, Default)]
struct XmlFeatures {
    #[serde(rename = "feature", default)]
    items: Vec<XmlProperty>,
}

#[derive(Debug, Deserialize, Default)]
struct XmlTags {
    #[serde(rename = "tag", default)]
    items: Vec<XmlTag>,
}

#[derive(Debug, Deserialize)]
struct XmlTag {
    name: String,
}

#[derive(Debug, Deserialize, Default)]
struct XmlDevicesWrapper {
    #[serde(rename = "device-collection", default)]
    collections: Vec<XmlDeviceCollection>,
}

#[derive(Debug, Deserialize)]
struct XmlDeviceCollection {
    bus: String,
    #[serde(rename = "device", default)]
    items: Vec<XmlDevice>,
}

#[derive(Debug, Deserialize)]
struct XmlDevice {
    backend_domain: String,
    port_id: String,
    #[serde(rename = "option", default)]
    options: Vec<XmlProperty>,
}

/// Properties regenerated fresh on restore and never imported from the
/// backup.
const STRIPPED_PROPERTIES: &[&str] = &["backup-id", "qid", "uuid"];

pub fn parse(xml: &str) -> Result<Catalog> {
    let doc: QubesXml =
        from_str(xml).map_err(|e| RestoreError::CatalogFormat(e.to_string()))?;

    let mut catalog = Catalog::default();
    let domains = doc.domains.unwrap_or_default();
    for d in domains.items {
        let class = VmClass::parse(&d.class)
            .ok_or_else(|| RestoreError::CatalogFormat(format!("unknown VM class `{}`", d.class)))?;

        let mut properties: HashMap<String, Option<String>> = d
            .properties
            .unwrap_or_default()
            .items
            .into_iter()
            .filter(|p| !STRIPPED_PROPERTIES.contains(&p.name.as_str()))
            .map(|p| (p.name, p.value))
            .collect();

        let template = properties.remove("template").flatten();
        let netvm = properties.remove("netvm").flatten();
        let default_dispvm = properties.remove("default_dispvm").flatten();

        let features = d
            .features
            .unwrap_or_default()
            .items
            .into_iter()
            .map(|p| (p.name, p.value.unwrap_or_default()))
            .collect();

        let tags = d
            .tags
            .unwrap_or_default()
            .items
            .into_iter()
            .map(|t| t.name)
            .collect();

        let mut devices: BTreeMap<String, Vec<DeviceAssignment>> = BTreeMap::new();
        for coll in d.devices.unwrap_or_default().collections {
            let entries = devices.entry(coll.bus.clone()).or_default();
            for dev in coll.items {
                entries.push(DeviceAssignment {
                    bus_id: BusId {
                        bus: coll.bus.clone(),
                        backend: dev.backend_domain,
                        port_id: dev.port_id,
                    },
                    options: dev
                        .options
                        .into_iter()
                        .map(|p| (p.name, p.value.unwrap_or_default()))
                        .collect(),
                });
            }
        }

        let record = VmRecord {
            name: d.name.clone(),
            class,
            label: d.label.unwrap_or_else(|| "black".to_owned()),
            template,
            netvm,
            default_dispvm,
            properties,
            features,
            tags,
            devices,
            backup_path: d.backup_path,
            size: d.backup_size.unwrap_or(0),
        };
        catalog.vms.insert(d.name, record);
    }

    let admin_count = catalog.vms.values().filter(|v| v.class == VmClass::AdminVM).count();
    if admin_count != 1 {
        return Err(RestoreError::CatalogFormat(format!(
            "expected exactly one AdminVM, found {}",
            admin_count
        )));
    }
    if !catalog.vms.contains_key("dom0") {
        return Err(RestoreError::CatalogFormat("AdminVM must be named `dom0`".into()));
    }

    for vm in catalog.vms.values() {
        if let Some(tmpl) = &vm.template {
            if !catalog.vms.contains_key(tmpl) {
                // A template may legitimately live only on the host; the
                // plan-building stage resolves that case. Here we only
                // reject an obviously self-inconsistent catalog, i.e. a
                // template name that collides with a non-template entry
                // also present in this same catalog.
                if let Some(t) = catalog.vms.get(tmpl) {
                    if t.class != VmClass::TemplateVM {
                        return Err(RestoreError::CatalogFormat(format!(
                            "VM `{}` references `{}` as template but it is a {:?}",
                            vm.name, tmpl, t.class
                        )));
                    }
                }
            }
        }
    }

    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" ?>
<qubes version="3">
  <domains>
    <domain class="AdminVM" name="dom0">
      <properties><property name="default_kernel">5.10</property></properties>
    </domain>
    <domain class="TemplateVM" name="debian-11">
      <label ref="label-1">green</label>
    </domain>
    <domain class="AppVM" name="myvm">
      <label ref="label-2">red</label>
      <properties>
        <property name="template">debian-11</property>
        <property name="netvm">sys-firewall</property>
      </properties>
      <features><feature name="service.foo">1</feature></features>
      <tags><tag name="work"/></tags>
      <backup-path>myvm</backup-path>
      <backup-size>4096</backup-size>
    </domain>
  </domains>
</qubes>"#;

    #[test]
    fn parses_sample_catalog() {
        let cat = parse(SAMPLE).unwrap();
        assert!(cat.dom0().is_some());
        let myvm = &cat.vms["myvm"];
        assert_eq!(myvm.template.as_deref(), Some("debian-11"));
        assert_eq!(myvm.netvm.as_deref(), Some("sys-firewall"));
        assert!(myvm.tags.contains("work"));
        assert_eq!(myvm.backup_path.as_deref(), Some("myvm"));
        assert!(myvm.included_in_backup());
        assert!(!cat.vms["debian-11"].included_in_backup());
    }

    #[test]
    fn rejects_missing_dom0() {
        let xml = r#"<qubes version="3"><domains></domains></qubes>"#;
        assert!(parse(xml).is_err());
    }

    #[test]
    fn strips_only_the_regenerated_properties() {
        let xml = r#"<?xml version="1.0" ?>
<qubes version="3">
  <domains>
    <domain class="AdminVM" name="dom0"/>
    <domain class="AppVM" name="myvm">
      <properties>
        <property name="backup-id">old-id</property>
        <property name="qid">7</property>
        <property name="memory">400</property>
      </properties>
      <backup-path>myvm</backup-path>
    </domain>
  </domains>
</qubes>"#;
        let cat = parse(xml).unwrap();
        let expected = maplit::hashmap! { "memory".to_owned() => Some("400".to_owned()) };
        assert_eq!(cat.vms["myvm"].properties, expected);
    }
}
