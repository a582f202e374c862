//! Typed handlers: the closed set of callbacks a logical
//! file's plaintext can be handed to. Modeled as a variant type, not a
//! trait object, since the set is fixed and known at plan-build time.

use crate::vmhost::{VmHandle, VmHost};
use std::collections::BTreeMap;
use std::io::Read;

#[derive(Debug, Clone)]
pub enum Handler {
    SaveQubesXml,
    Volume { vm: String, volume: String },
    Firewall { vm: String },
    Appmenus { vm: String },
    Notes { vm: String },
    Dom0Home { user: String },
}

pub struct QubesXmlResult(pub Vec<u8>);

impl Handler {
    /// Consumes the (already decrypted, decompressed, inner-tar-extracted)
    /// plaintext of one logical file. `vm_handle` is `None` only for
    /// `SaveQubesXml`, which runs before any VM exists.
    pub fn consume(
        &self,
        host: &dyn VmHost,
        vm_handle: Option<&VmHandle>,
        reader: &mut dyn Read,
        size_hint: Option<u64>,
    ) -> Result<Option<QubesXmlResult>, String> {
        match self {
            Handler::SaveQubesXml => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).map_err(|e| e.to_string())?;
                Ok(Some(QubesXmlResult(buf)))
            }
            Handler::Volume { volume, .. } => {
                let vm = vm_handle.expect("Volume handler requires a VM handle");
                host.import_volume(vm, volume, reader, size_hint)?;
                Ok(None)
            }
            Handler::Firewall { .. } => {
                let vm = vm_handle.expect("Firewall handler requires a VM handle");
                let mut buf = String::new();
                reader.read_to_string(&mut buf).map_err(|e| e.to_string())?;
                if let Err(e) = host.set_firewall(vm, &buf) {
                    log::warn!("failed to apply firewall rules: {}", e);
                }
                Ok(None)
            }
            Handler::Appmenus { .. } => {
                let vm = vm_handle.expect("Appmenus handler requires a VM handle");
                let mut buf = String::new();
                reader.read_to_string(&mut buf).map_err(|e| e.to_string())?;
                let joined = buf.lines().collect::<Vec<_>>().join(" ");
                host.set_feature(vm, "menu-items", &joined)?;
                Ok(None)
            }
            Handler::Notes { .. } => {
                let vm = vm_handle.expect("Notes handler requires a VM handle");
                let mut buf = String::new();
                reader.read_to_string(&mut buf).map_err(|e| e.to_string())?;
                host.set_notes(vm, &buf)?;
                Ok(None)
            }
            Handler::Dom0Home { user } => {
                // The real dom0-home extraction unpacks a whole directory
                // tree into a timestamped subdirectory of the user's home
                // and chowns it; the host-object boundary does not model
                // a filesystem, so this records intent instead.
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).map_err(|e| e.to_string())?;
                log::info!(
                    "would extract {} bytes of dom0 home data for user `{}`",
                    buf.len(),
                    user
                );
                Ok(None)
            }
        }
    }
}

/// Looks up the handler registered for a logical path, per the dispatcher
/// rules: exact path match, or a directory match when the
/// logical name ends with `.`.
pub fn lookup(table: &BTreeMap<String, Handler>, logical_path: &str) -> Option<Handler> {
    if let Some(h) = table.get(logical_path) {
        return Some(h.clone());
    }
    if let Some(stripped) = logical_path.strip_suffix('.') {
        if let Some(h) = table.get(stripped) {
            return Some(h.clone());
        }
    }
    None
}

/// Builds the handler table for one restore from the set of VMs that are
/// good to go.
pub fn build_table(good_to_go_vms: &[(String, String)]) -> BTreeMap<String, Handler> {
    let mut table = BTreeMap::new();
    for (archive_name, _target_name) in good_to_go_vms {
        table.insert(
            format!("{}/firewall.xml", archive_name),
            Handler::Firewall {
                vm: archive_name.clone(),
            },
        );
        table.insert(
            format!("{}/whitelisted-appmenus.list", archive_name),
            Handler::Appmenus {
                vm: archive_name.clone(),
            },
        );
        table.insert(
            format!("{}/notes.txt", archive_name),
            Handler::Notes {
                vm: archive_name.clone(),
            },
        );
        for volume in ["private", "root", "volatile"] {
            table.insert(
                format!("{}/{}.img", archive_name, volume),
                Handler::Volume {
                    vm: archive_name.clone(),
                    volume: volume.to_owned(),
                },
            );
        }
    }
    table
}

pub fn dom0_home_table(username: Option<&str>) -> BTreeMap<String, Handler> {
    let mut table = BTreeMap::new();
    if let Some(user) = username {
        table.insert(
            format!("dom0-home/{}", user),
            Handler::Dom0Home { user: user.to_owned() },
        );
    }
    table
}
