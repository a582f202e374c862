//! Immutable configuration threaded through the Orchestrator.
//!
//! Global state some implementations keep as module-level
//! constants (lock file path, scratch root, digest preference list) is
//! data here instead, following the "Config, not mutable globals" design
//! note.

use std::path::PathBuf;

/// Digests considered for MAC verification, in the order they are tried
/// when the header does not pin one down. `scrypt` is not a digest in the
/// cryptographic sense; it stands for the v4 AEAD envelope and is always
/// tried if present in the header.
pub const HMAC_ALGORITHMS: &[&str] = &["SHA512", "SHA256", "scrypt", "SHA1"];

/// v2 archives predating the `backup-header` file use these fixed
/// defaults. Implementers should consider
/// refusing such archives unless `allow_v1_v2` is set).
pub const LEGACY_HMAC_ALGORITHM: &str = "SHA1";
pub const LEGACY_CRYPTO_ALGORITHM: &str = "aes-256-cbc";

/// Filters this crate's decompressor actually implements. `bzip2`/`xz`
/// archives are rejected at the header stage rather than accepted and
/// then failing every logical file once decompression is attempted.
pub const COMPRESSION_FILTERS: &[&str] = &["gzip"];

#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory under which a scratch directory is created for the
    /// duration of one restore.
    pub scratch_root: PathBuf,
    /// Path to the single-writer lock file.
    pub lock_path: PathBuf,
    /// Hard cap on the number of chunk files OuterExtractor may create.
    pub max_files: u64,
    /// Hard cap on total bytes OuterExtractor may write.
    pub max_bytes: u64,
    /// Free-space threshold on the scratch directory below which
    /// OuterExtractor back-pressures.
    pub low_water_bytes: u64,
    /// Number of decompression/handler worker threads.
    pub threads: u8,
    /// If true, v1/v2 archives (no `backup-header`) are accepted using the
    /// hard-coded legacy defaults. Default false: this is
    /// as a policy question, and this crate defaults to the safer side.
    pub allow_legacy_headers: bool,
    /// If true, conflicting VM names are renamed (`name1`..`name99`)
    /// instead of being marked `ALREADY_EXISTS`.
    pub rename_conflicting: bool,
    /// If true, VMs whose template/netvm cannot be resolved are skipped
    /// instead of aborting the whole restore.
    pub skip_broken: bool,
    /// If set, a missing template falls back to this VM name instead of
    /// `MISSING_TEMPLATE`.
    pub default_template: Option<String>,
    /// If true, a missing netvm falls back to "no netvm" instead of
    /// `MISSING_NETVM`.
    pub default_netvm_is_none: bool,
    /// Keep the scratch directory around after completion (for
    /// debugging); normally it is always removed.
    pub debug_keep_scratch: bool,
    /// Render a summary and stop before any destructive action.
    pub dry_run: bool,
    /// Proceed without an interactive confirmation prompt.
    pub assume_yes: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scratch_root: PathBuf::from("/var/lib/qubes/restore-incoming"),
            lock_path: PathBuf::from("/var/run/qubes/restore.lock"),
            max_files: 1_000_000,
            max_bytes: 10 * 1024 * 1024 * 1024 * 1024, // 10 TiB
            low_water_bytes: 256 * 1024 * 1024,
            threads: Self::default_threads(),
            allow_legacy_headers: false,
            rename_conflicting: false,
            skip_broken: false,
            default_template: None,
            default_netvm_is_none: false,
            debug_keep_scratch: false,
            dry_run: false,
            assume_yes: false,
        }
    }
}

impl Config {
    fn default_threads() -> u8 {
        num_cpus::get().clamp(1, 32) as u8
    }
}
