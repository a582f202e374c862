//! SourceReader: produces a single ordered byte stream for
//! the outer tar archive, either from a qrexec-style RPC service in a
//! remote VM or from a local file.

use crate::error::{RestoreError, Result};
use std::io::{BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;

const STDERR_CAP: usize = 1024;

/// Default RPC service name used when the caller does not request a
/// specific one.
pub const DEFAULT_SERVICE: &str = "qubes.Restore";

/// Handle to terminate the source process/stream.
pub trait KillHandle: Send {
    fn kill(&mut self);
}

struct NoopKill;
impl KillHandle for NoopKill {
    fn kill(&mut self) {}
}

struct ChildKill(Child);
impl KillHandle for ChildKill {
    fn kill(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

/// A bounded tail of the source's stderr, captured on a background
/// thread so it never blocks the primary stdout stream.
pub struct StderrTail {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl StderrTail {
    fn spawn<R: Read + Send + 'static>(mut reader: R) -> Self {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 256];
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        if buf.len() > STDERR_CAP {
                            let excess = buf.len() - STDERR_CAP;
                            buf.drain(0..excess);
                        }
                    }
                }
            }
            let _ = tx.send(buf);
        });
        Self { rx }
    }

    /// Blocks (briefly) to collect whatever stderr has accumulated.
    pub fn collect(self) -> Vec<u8> {
        self.rx.recv_timeout(std::time::Duration::from_millis(500)).unwrap_or_default()
    }
}

pub struct SourceStream {
    pub stdout: Box<dyn Read + Send>,
    pub stderr: StderrTail,
    kill: Box<dyn KillHandle>,
}

impl std::fmt::Debug for SourceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceStream").finish_non_exhaustive()
    }
}

impl SourceStream {
    pub fn kill(&mut self) {
        self.kill.kill();
    }
}

/// Opens the archive stream either from a remote VM's RPC service or from
/// a local file.
pub fn open(
    location: &str,
    source_vm: Option<&str>,
    service_name: Option<&str>,
    filter: &[String],
) -> Result<SourceStream> {
    match source_vm {
        Some(vm) => open_remote(location, vm, service_name.unwrap_or(DEFAULT_SERVICE), filter),
        None => open_local(location),
    }
}

fn open_local(location: &str) -> Result<SourceStream> {
    let path = Path::new(location);
    if !path.exists() {
        return Err(RestoreError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("backup source `{}` not found", location),
        )));
    }
    let file = std::fs::File::open(path)?;
    Ok(SourceStream {
        stdout: Box::new(BufReader::with_capacity(1 << 20, file)),
        stderr: StderrTail::spawn(std::io::empty()),
        kill: Box::new(NoopKill),
    })
}

fn open_remote(location: &str, source_vm: &str, service: &str, filter: &[String]) -> Result<SourceStream> {
    // `qrexec-client-vm <vm> <service>` is the conventional boundary for
    // invoking an RPC service in another VM; stdin carries the location
    // followed by the filter list, one path prefix per line.
    let mut child = Command::new("qrexec-client-vm")
        .arg(source_vm)
        .arg(service)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(RestoreError::Io)?;

    {
        use std::io::Write;
        let mut stdin = child.stdin.take().expect("piped stdin");
        writeln!(stdin, "{}", location)?;
        for prefix in filter {
            writeln!(stdin, "{}", prefix)?;
        }
    }

    let stderr = child.stderr.take().expect("piped stderr");
    let stdout = child.stdout.take().expect("piped stdout");

    Ok(SourceStream {
        stdout: Box::new(stdout),
        stderr: StderrTail::spawn(stderr),
        kill: Box::new(ChildKill(child)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempdir::TempDir;

    #[test]
    fn local_file_not_found() {
        let err = open_local("/nonexistent/path/surely").unwrap_err();
        assert!(matches!(err, RestoreError::Io(_)));
    }

    #[test]
    fn local_file_reads_contents() {
        let tmp = TempDir::new("source").unwrap();
        let p = tmp.path().join("archive.tar");
        std::fs::File::create(&p).unwrap().write_all(b"tar bytes").unwrap();
        let mut s = open_local(p.to_str().unwrap()).unwrap();
        let mut buf = Vec::new();
        s.stdout.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"tar bytes");
    }
}
