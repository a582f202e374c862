//! OuterExtractor.
//!
//! Consumes the outer tar stream on a worker thread (a thread in this
//! process, not a forked child) and deposits each member as a chunk file
//! in the scratch directory, sending its logical name over a bounded
//! channel in emission order. Enforces the hard file/byte caps and backs
//! off while the scratch directory is low on free space.

use crate::error::{RestoreError, Result};
use crossbeam::channel::{bounded, Receiver, Sender};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tar::Archive;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub enum Emitted {
    Chunk { member_path: String },
    Eof,
}

/// Runs the outer extractor on the calling thread's spawned worker and
/// returns a receiver of emitted chunk names plus a join handle whose
/// result is the extractor's final status.
pub fn spawn(
    mut stdout: Box<dyn Read + Send>,
    scratch_dir: PathBuf,
    filter: Vec<String>,
    max_files: u64,
    max_bytes: u64,
    low_water_bytes: u64,
) -> (Receiver<Emitted>, thread::JoinHandle<Result<()>>) {
    // Depth 1: a chunk is already unpacked to the scratch directory before
    // its name is sent, so the channel depth is the number of undeleted
    // chunk files that can pile up waiting for the dispatcher. Keeping it
    // at 1 holds scratch usage to one chunk per logical file in flight.
    let (tx, rx) = bounded(1);
    let handle = thread::spawn(move || {
        run(&mut stdout, &scratch_dir, &filter, max_files, max_bytes, low_water_bytes, &tx)
    });
    (rx, handle)
}

fn run(
    stdout: &mut dyn Read,
    scratch_dir: &Path,
    filter: &[String],
    max_files: u64,
    max_bytes: u64,
    low_water_bytes: u64,
    tx: &Sender<Emitted>,
) -> Result<()> {
    let mut archive = Archive::new(stdout);
    let mut seen = std::collections::HashSet::new();
    let mut total_files: u64 = 0;
    let mut total_bytes: u64 = 0;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();

        if !filter.is_empty() && !filter.iter().any(|p| path.starts_with(p.as_str())) {
            continue;
        }
        // `--occurrence=1` semantics: only the first copy of any path is
        // extracted.
        if !seen.insert(path.clone()) {
            continue;
        }

        total_files += 1;
        if total_files > max_files {
            return Err(RestoreError::QuotaExceeded(format!(
                "more than {} files in archive",
                max_files
            )));
        }
        let size = entry.header().size()?;
        total_bytes += size;
        if total_bytes > max_bytes {
            return Err(RestoreError::QuotaExceeded(format!(
                "more than {} bytes in archive",
                max_bytes
            )));
        }

        wait_for_space(scratch_dir, low_water_bytes)?;

        let dest = scratch_dir.join(sanitize(&path));
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&dest)?;

        if tx.send(Emitted::Chunk { member_path: path }).is_err() {
            // Receiver dropped: the dispatcher gave up (cancellation).
            return Err(RestoreError::Cancelled);
        }
    }

    let _ = tx.send(Emitted::Eof);
    Ok(())
}

/// A tar member path never leaves the scratch directory: no `..`
/// components, no absolute paths. Chunk names are already constrained by
/// `ChunkName::parse` downstream, but this is the first line of defense
/// against a hostile archive before any parsing happens.
fn sanitize(path: &str) -> PathBuf {
    Path::new(path)
        .components()
        .filter(|c| matches!(c, std::path::Component::Normal(_)))
        .collect()
}

fn wait_for_space(scratch_dir: &Path, low_water_bytes: u64) -> Result<()> {
    loop {
        match fs2::available_space(scratch_dir) {
            Ok(avail) if avail < low_water_bytes => {
                thread::sleep(POLL_INTERVAL);
                continue;
            }
            Ok(_) => return Ok(()),
            Err(_) => return Ok(()), // best-effort; do not fail the restore over a stat error
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_traversal() {
        assert_eq!(sanitize("../../etc/passwd"), PathBuf::from("etc/passwd"));
        assert_eq!(sanitize("/abs/path"), PathBuf::from("abs/path"));
        assert_eq!(sanitize("myvm/private.img.000"), PathBuf::from("myvm/private.img.000"));
    }

    #[test]
    fn quota_exceeded_on_file_count() {
        let mut builder = tar::Builder::new(Vec::new());
        for i in 0..3 {
            let data = format!("chunk{}", i).into_bytes();
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_cksum();
            builder
                .append_data(&mut header, format!("f.{:03}", i), data.as_slice())
                .unwrap();
        }
        let tar_bytes = builder.into_inner().unwrap();

        let tmp = tempdir::TempDir::new("outer_extractor").unwrap();
        let (tx, _rx) = bounded(64);
        let err = run(
            &mut &tar_bytes[..],
            tmp.path(),
            &[],
            2,
            u64::MAX,
            0,
            &tx,
        )
        .unwrap_err();
        assert!(matches!(err, RestoreError::QuotaExceeded(_)));
    }

    #[test]
    fn emits_chunks_in_order() {
        let mut builder = tar::Builder::new(Vec::new());
        for i in 0..3 {
            let data = format!("chunk{}", i).into_bytes();
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_cksum();
            builder
                .append_data(&mut header, format!("f.{:03}", i), data.as_slice())
                .unwrap();
        }
        let tar_bytes = builder.into_inner().unwrap();

        let tmp = tempdir::TempDir::new("outer_extractor").unwrap();
        let (tx, rx) = bounded(64);
        run(&mut &tar_bytes[..], tmp.path(), &[], u64::MAX, u64::MAX, 0, &tx).unwrap();
        drop(tx);
        let names: Vec<_> = rx
            .iter()
            .filter_map(|e| match e {
                Emitted::Chunk { member_path } => Some(member_path),
                Emitted::Eof => None,
            })
            .collect();
        assert_eq!(names, vec!["f.000", "f.001", "f.002"]);
    }
}
