//! VM object boundary.
//!
//! The host object model is explicitly out of scope here; this
//! trait is the seam a real embedding plugs into. `NullVmHost` is a
//! bookkeeping-only implementation used by tests and `--dry-run`.

use crate::catalog::VmClass;
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct VmHandle(pub String);

pub trait VmHost: Send + Sync {
    fn vm_exists(&self, name: &str) -> bool;
    fn vm_exists_with_class(&self, name: &str, class: VmClass) -> bool;
    fn vm_names(&self) -> Vec<String>;

    fn create(
        &self,
        class: VmClass,
        name: &str,
        label: &str,
        template: Option<&str>,
    ) -> Result<VmHandle, String>;
    fn set_property(&self, vm: &VmHandle, name: &str, value: &str) -> Result<(), String>;
    fn set_feature(&self, vm: &VmHandle, key: &str, value: &str) -> Result<(), String>;
    fn add_tag(&self, vm: &VmHandle, name: &str) -> Result<(), String>;
    fn attach_device(
        &self,
        vm: &VmHandle,
        bus: &str,
        backend: &str,
        port: &str,
        options: &BTreeMap<String, String>,
    ) -> Result<(), String>;
    fn import_volume(
        &self,
        vm: &VmHandle,
        volume: &str,
        stream: &mut dyn Read,
        size_hint: Option<u64>,
    ) -> Result<(), String>;
    fn set_firewall(&self, vm: &VmHandle, rules_xml: &str) -> Result<(), String>;
    fn set_notes(&self, vm: &VmHandle, text: &str) -> Result<(), String>;
    fn destroy(&self, vm: &VmHandle) -> Result<(), String>;

    fn resolve_username(&self) -> Option<String>;
}

#[derive(Debug, Default)]
struct Inner {
    vms: BTreeMap<String, VmClass>,
    created: Vec<String>,
    destroyed: Vec<String>,
    properties: Vec<(String, String, String)>,
    features: Vec<(String, String, String)>,
    tags: Vec<(String, String)>,
    volumes_imported: Vec<(String, String, u64)>,
    firewalls: Vec<(String, String)>,
    notes: Vec<(String, String)>,
    devices: Vec<(String, String, String, String)>,
}

/// Records every call it receives without touching any real VM registry.
/// Stands in for the real host object model in tests and `--dry-run`.
#[derive(Debug, Default)]
pub struct NullVmHost {
    inner: Mutex<Inner>,
    username: Option<String>,
}

impl NullVmHost {
    pub fn with_vms(vms: Vec<(&str, VmClass)>) -> Self {
        let mut inner = Inner::default();
        for (name, class) in vms {
            inner.vms.insert(name.to_owned(), class);
        }
        Self {
            inner: Mutex::new(inner),
            username: Some("user".to_owned()),
        }
    }

    pub fn with_username(mut self, username: Option<&str>) -> Self {
        self.username = username.map(str::to_owned);
        self
    }

    pub fn created_vms(&self) -> Vec<String> {
        self.inner.lock().unwrap().created.clone()
    }

    pub fn destroyed_vms(&self) -> Vec<String> {
        self.inner.lock().unwrap().destroyed.clone()
    }

    pub fn imported_volumes(&self) -> Vec<(String, String, u64)> {
        self.inner.lock().unwrap().volumes_imported.clone()
    }

    pub fn notes_for(&self, vm: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .notes
            .iter()
            .find(|(n, _)| n == vm)
            .map(|(_, t)| t.clone())
    }

    pub fn firewall_for(&self, vm: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .firewalls
            .iter()
            .find(|(n, _)| n == vm)
            .map(|(_, t)| t.clone())
    }

    pub fn devices_for(&self, vm: &str) -> Vec<(String, String, String)> {
        self.inner
            .lock()
            .unwrap()
            .devices
            .iter()
            .filter(|(n, _, _, _)| n == vm)
            .map(|(_, bus, backend, port)| (bus.clone(), backend.clone(), port.clone()))
            .collect()
    }
}

impl VmHost for NullVmHost {
    fn vm_exists(&self, name: &str) -> bool {
        self.inner.lock().unwrap().vms.contains_key(name)
    }

    fn vm_exists_with_class(&self, name: &str, class: VmClass) -> bool {
        self.inner.lock().unwrap().vms.get(name) == Some(&class)
    }

    fn vm_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().vms.keys().cloned().collect()
    }

    fn create(
        &self,
        class: VmClass,
        name: &str,
        _label: &str,
        _template: Option<&str>,
    ) -> Result<VmHandle, String> {
        let mut inner = self.inner.lock().unwrap();
        if inner.vms.contains_key(name) {
            return Err(format!("VM `{}` already exists", name));
        }
        inner.vms.insert(name.to_owned(), class);
        inner.created.push(name.to_owned());
        Ok(VmHandle(name.to_owned()))
    }

    fn set_property(&self, vm: &VmHandle, name: &str, value: &str) -> Result<(), String> {
        self.inner
            .lock()
            .unwrap()
            .properties
            .push((vm.0.clone(), name.to_owned(), value.to_owned()));
        Ok(())
    }

    fn set_feature(&self, vm: &VmHandle, key: &str, value: &str) -> Result<(), String> {
        self.inner
            .lock()
            .unwrap()
            .features
            .push((vm.0.clone(), key.to_owned(), value.to_owned()));
        Ok(())
    }

    fn add_tag(&self, vm: &VmHandle, name: &str) -> Result<(), String> {
        self.inner.lock().unwrap().tags.push((vm.0.clone(), name.to_owned()));
        Ok(())
    }

    fn attach_device(
        &self,
        vm: &VmHandle,
        bus: &str,
        backend: &str,
        port: &str,
        _options: &BTreeMap<String, String>,
    ) -> Result<(), String> {
        self.inner.lock().unwrap().devices.push((
            vm.0.clone(),
            bus.to_owned(),
            backend.to_owned(),
            port.to_owned(),
        ));
        Ok(())
    }

    fn import_volume(
        &self,
        vm: &VmHandle,
        volume: &str,
        stream: &mut dyn Read,
        _size_hint: Option<u64>,
    ) -> Result<(), String> {
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).map_err(|e| e.to_string())?;
        self.inner
            .lock()
            .unwrap()
            .volumes_imported
            .push((vm.0.clone(), volume.to_owned(), buf.len() as u64));
        Ok(())
    }

    fn set_firewall(&self, vm: &VmHandle, rules_xml: &str) -> Result<(), String> {
        self.inner
            .lock()
            .unwrap()
            .firewalls
            .push((vm.0.clone(), rules_xml.to_owned()));
        Ok(())
    }

    fn set_notes(&self, vm: &VmHandle, text: &str) -> Result<(), String> {
        self.inner.lock().unwrap().notes.push((vm.0.clone(), text.to_owned()));
        Ok(())
    }

    fn destroy(&self, vm: &VmHandle) -> Result<(), String> {
        let mut inner = self.inner.lock().unwrap();
        inner.vms.remove(&vm.0);
        inner.destroyed.push(vm.0.clone());
        Ok(())
    }

    fn resolve_username(&self) -> Option<String> {
        self.username.clone()
    }
}
