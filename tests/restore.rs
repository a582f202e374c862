//! End-to-end exercise of the Orchestrator against fixture archives built
//! in-process, driving the public API against small generated inputs
//! rather than checked-in blobs.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use qubes_restore_core::crypto::{derive_v4_header_password, derive_v4_password};
use qubes_restore_core::{Config, NullVmHost, Orchestrator};
use rand::RngCore;
use scrypt::Params as ScryptParams;
use std::collections::HashSet;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

const BACKUP_ID: &str = "T1";
const PASSPHRASE: &[u8] = b"correct horse battery staple";

/// Builds a v4 `.enc` payload the same way the backup-creation side would:
/// `salt(16) || nonce(12) || aead-ciphertext`, AES-256-GCM keyed by a
/// scrypt-stretched password.
fn encrypt_v4(plaintext: &[u8], password: &[u8]) -> Vec<u8> {
    let mut salt = [0u8; 16];
    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let params = ScryptParams::new(15, 8, 1, 32).unwrap();
    let mut key = [0u8; 32];
    scrypt::scrypt(password, &salt, &params, &mut key).unwrap();
    let cipher = Aes256Gcm::new_from_slice(&key).unwrap();
    let nonce = Nonce::from_slice(&nonce_bytes);
    let mut out = salt.to_vec();
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&cipher.encrypt(nonce, plaintext).unwrap());
    out
}

fn inner_tar(name: &str, data: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_cksum();
    builder.append_data(&mut header, name, data).unwrap();
    builder.into_inner().unwrap()
}

fn v4_encrypt(logical: &str, plaintext: &[u8]) -> Vec<u8> {
    let password = derive_v4_password(BACKUP_ID, logical, PASSPHRASE);
    encrypt_v4(plaintext, &password)
}

fn append(builder: &mut tar::Builder<Vec<u8>>, name: &str, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, data).unwrap();
}

fn build_v4_archive(qubes_xml: &str, vm_name: &str, volume_data: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());

    let header_text = format!(
        "version=4\nencrypted=true\ncompressed=false\nhmac-algorithm=scrypt\nbackup-id={}\n",
        BACKUP_ID
    );
    let header_password = derive_v4_header_password(PASSPHRASE);
    let header_ct = encrypt_v4(header_text.as_bytes(), &header_password);
    append(&mut builder, "backup-header", &header_ct);

    let xml_inner = inner_tar("qubes.xml", qubes_xml.as_bytes());
    append(&mut builder, "qubes.xml.000.enc", &v4_encrypt("qubes.xml", &xml_inner));

    let volume_inner = inner_tar("private.img", volume_data);
    let logical = format!("{}/private.img", vm_name);
    append(
        &mut builder,
        &format!("{}.000.enc", logical),
        &v4_encrypt(&logical, &volume_inner),
    );

    builder.into_inner().unwrap()
}

fn write_archive(dir: &std::path::Path, bytes: &[u8]) -> std::path::PathBuf {
    let path = dir.join("archive.tar");
    std::fs::File::create(&path).unwrap().write_all(bytes).unwrap();
    path
}

fn sample_qubes_xml() -> String {
    r#"<?xml version="1.0" ?>
<qubes version="3">
  <domains>
    <domain class="AdminVM" name="dom0">
      <properties><property name="username">user</property></properties>
    </domain>
    <domain class="TemplateVM" name="debian-11"/>
    <domain class="AppVM" name="work">
      <properties><property name="template">debian-11</property></properties>
      <backup-path>work</backup-path>
      <backup-size>9</backup-size>
    </domain>
  </domains>
</qubes>"#
        .to_owned()
}

fn test_config(tmp: &tempdir::TempDir) -> Config {
    let mut config = Config::default();
    config.scratch_root = tmp.path().join("scratch");
    config.lock_path = tmp.path().join("restore.lock");
    config.assume_yes = true;
    config
}

#[test]
fn restores_single_appvm_from_v4_archive() {
    let tmp = tempdir::TempDir::new("qrc-restore").unwrap();
    let archive = build_v4_archive(&sample_qubes_xml(), "work", b"volumedata");
    let archive_path = write_archive(tmp.path(), &archive);

    let config = test_config(&tmp);
    let host = NullVmHost::with_vms(vec![(
        "debian-11",
        qubes_restore_core::catalog::VmClass::TemplateVM,
    )])
    .with_username(Some("user"));
    let cancel = Arc::new(AtomicBool::new(false));
    let orchestrator = Orchestrator::new(&config, false);

    let summary = orchestrator
        .run(
            archive_path.to_str().unwrap(),
            None,
            None,
            PASSPHRASE,
            None,
            &HashSet::new(),
            &host,
            &cancel,
        )
        .unwrap();

    assert!(summary.failed_vms.is_empty(), "unexpected failures: {:?}", summary.failed_vms);
    assert_eq!(summary.created_vms, vec!["work".to_owned()]);
    assert_eq!(
        host.imported_volumes(),
        vec![("work".to_owned(), "private".to_owned(), 10)]
    );
}

#[test]
fn wrong_passphrase_is_rejected_before_any_vm_is_created() {
    let tmp = tempdir::TempDir::new("qrc-wrongpw").unwrap();
    let archive = build_v4_archive(&sample_qubes_xml(), "work", b"volumedata");
    let archive_path = write_archive(tmp.path(), &archive);

    let config = test_config(&tmp);
    let host = NullVmHost::with_vms(vec![(
        "debian-11",
        qubes_restore_core::catalog::VmClass::TemplateVM,
    )])
    .with_username(Some("user"));
    let cancel = Arc::new(AtomicBool::new(false));
    let orchestrator = Orchestrator::new(&config, false);

    let err = orchestrator
        .run(
            archive_path.to_str().unwrap(),
            None,
            None,
            b"wrong passphrase entirely",
            None,
            &HashSet::new(),
            &host,
            &cancel,
        )
        .unwrap_err();

    assert!(matches!(err, qubes_restore_core::RestoreError::BadPassphrase));
    assert!(host.created_vms().is_empty());
}

#[test]
fn dry_run_creates_nothing() {
    let tmp = tempdir::TempDir::new("qrc-dryrun").unwrap();
    let archive = build_v4_archive(&sample_qubes_xml(), "work", b"volumedata");
    let archive_path = write_archive(tmp.path(), &archive);

    let mut config = test_config(&tmp);
    config.dry_run = true;
    let host = NullVmHost::with_vms(vec![(
        "debian-11",
        qubes_restore_core::catalog::VmClass::TemplateVM,
    )])
    .with_username(Some("user"));
    let cancel = Arc::new(AtomicBool::new(false));
    let orchestrator = Orchestrator::new(&config, false);

    let summary = orchestrator
        .run(
            archive_path.to_str().unwrap(),
            None,
            None,
            PASSPHRASE,
            None,
            &HashSet::new(),
            &host,
            &cancel,
        )
        .unwrap();

    assert!(summary.plan.entries["work"].good_to_go());
    assert!(host.created_vms().is_empty());
}

#[test]
fn missing_template_is_skipped_without_aborting_others() {
    let qubes_xml = r#"<?xml version="1.0" ?>
<qubes version="3">
  <domains>
    <domain class="AdminVM" name="dom0">
      <properties><property name="username">user</property></properties>
    </domain>
    <domain class="AppVM" name="orphan">
      <properties><property name="template">nonexistent-template</property></properties>
      <backup-path>orphan</backup-path>
    </domain>
  </domains>
</qubes>"#;
    let tmp = tempdir::TempDir::new("qrc-orphan").unwrap();
    let archive = build_v4_archive(qubes_xml, "orphan", b"data123456");
    let archive_path = write_archive(tmp.path(), &archive);

    let mut config = test_config(&tmp);
    config.skip_broken = true;
    let host = NullVmHost::default().with_username(Some("user"));
    let cancel = Arc::new(AtomicBool::new(false));
    let orchestrator = Orchestrator::new(&config, false);

    let summary = orchestrator
        .run(
            archive_path.to_str().unwrap(),
            None,
            None,
            PASSPHRASE,
            None,
            &HashSet::new(),
            &host,
            &cancel,
        )
        .unwrap();

    assert!(!summary.plan.entries["orphan"].good_to_go());
    assert!(summary.created_vms.is_empty());
}

#[test]
fn missing_template_aborts_whole_restore_without_skip_broken() {
    let qubes_xml = r#"<?xml version="1.0" ?>
<qubes version="3">
  <domains>
    <domain class="AdminVM" name="dom0">
      <properties><property name="username">user</property></properties>
    </domain>
    <domain class="AppVM" name="orphan">
      <properties><property name="template">nonexistent-template</property></properties>
      <backup-path>orphan</backup-path>
    </domain>
  </domains>
</qubes>"#;
    let tmp = tempdir::TempDir::new("qrc-orphan-abort").unwrap();
    let archive = build_v4_archive(qubes_xml, "orphan", b"data123456");
    let archive_path = write_archive(tmp.path(), &archive);

    let config = test_config(&tmp);
    let host = NullVmHost::default().with_username(Some("user"));
    let cancel = Arc::new(AtomicBool::new(false));
    let orchestrator = Orchestrator::new(&config, false);

    let err = orchestrator
        .run(
            archive_path.to_str().unwrap(),
            None,
            None,
            PASSPHRASE,
            None,
            &HashSet::new(),
            &host,
            &cancel,
        )
        .unwrap_err();

    assert!(matches!(err, qubes_restore_core::RestoreError::DependencyMissing(_)));
    assert!(host.created_vms().is_empty());
}
