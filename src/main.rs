use clap::Parser;
use qubes_restore_core::{Config, NullVmHost, Orchestrator, RestoreError};
use std::collections::HashSet;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Restore a compartmentalized-VM backup archive.
#[derive(Parser, Debug)]
#[command(name = "qubes-restore-core", version, about)]
struct Args {
    /// Path to a local archive file, or a location string understood by
    /// the source VM's restore service.
    location: String,

    /// Name of the VM to fetch the archive from. Omit to read a local file.
    #[arg(long)]
    source_vm: Option<String>,

    /// RPC service name to invoke in `source_vm` (default `qubes.Restore`).
    #[arg(long)]
    service_name: Option<String>,

    /// Read the passphrase from this file instead of prompting on stdin.
    #[arg(long)]
    passphrase_file: Option<String>,

    /// Restrict the restore to these VM names (comma-separated).
    #[arg(long, value_delimiter = ',')]
    include: Vec<String>,

    /// Exclude these VM names (comma-separated).
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,

    /// Rename VMs that conflict with an existing name instead of skipping them.
    #[arg(long)]
    rename_conflicting: bool,

    /// Skip VMs whose template or netvm cannot be resolved instead of aborting.
    #[arg(long)]
    skip_broken: bool,

    /// Render the restore plan and exit without creating anything.
    #[arg(long)]
    dry_run: bool,

    /// Proceed without an interactive confirmation prompt.
    #[arg(short = 'y', long)]
    assume_yes: bool,

    /// Accept archives older than the `backup-header` format (v1/v2
    /// without a modern header). Off by default: see DESIGN.md.
    #[arg(long)]
    allow_legacy_headers: bool,
}

fn read_passphrase(path: Option<&str>) -> std::io::Result<Zeroizing<Vec<u8>>> {
    let bytes = match path {
        Some(path) => std::fs::read(path).map(|mut b| {
            if b.last() == Some(&b'\n') {
                b.pop();
            }
            b
        })?,
        None => {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
            line.trim_end_matches('\n').as_bytes().to_vec()
        }
    };
    Ok(Zeroizing::new(bytes))
}

fn exit_code_for(err: &RestoreError) -> u8 {
    match err {
        RestoreError::BadPassphrase
        | RestoreError::BadHeader(_)
        | RestoreError::UnsupportedVersion(_)
        | RestoreError::QuotaExceeded(_)
        | RestoreError::RemoteRefused(_)
        | RestoreError::DependencyMissing(_)
        | RestoreError::ChunkSequence { .. }
        | RestoreError::CatalogFormat(_)
        | RestoreError::LockHeld(_)
        | RestoreError::Cancelled
        | RestoreError::HandlerFailed { .. } => 1,
        RestoreError::Io(_) => 64,
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let passphrase = match read_passphrase(args.passphrase_file.as_deref()) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("could not read passphrase: {}", e);
            return ExitCode::from(2);
        }
    };

    let mut config = Config::default();
    config.rename_conflicting = args.rename_conflicting;
    config.skip_broken = args.skip_broken;
    config.dry_run = args.dry_run;
    config.assume_yes = args.assume_yes;
    config.allow_legacy_headers = args.allow_legacy_headers;

    let include: Option<HashSet<String>> = if args.include.is_empty() {
        None
    } else {
        Some(args.include.into_iter().collect())
    };
    let exclude: HashSet<String> = args.exclude.into_iter().collect();

    let host = NullVmHost::default();
    let cancel = Arc::new(AtomicBool::new(false));

    let orchestrator = Orchestrator::new(&config, true);
    match orchestrator.run(
        &args.location,
        args.source_vm.as_deref(),
        args.service_name.as_deref(),
        &passphrase,
        include.as_ref(),
        &exclude,
        &host,
        &cancel,
    ) {
        Ok(summary) => {
            if !summary.failed_vms.is_empty() {
                for (name, reason) in &summary.failed_vms {
                    eprintln!("{}: {}", name, reason);
                }
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            eprintln!("restore failed: {}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}
