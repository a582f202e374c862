//! HandlerDispatcher: the inner extraction worker.
//!
//! Consumes chunk names from the outer extractor in emission order,
//! reassembles the chunks of each logical file, verifies/decrypts them,
//! decompresses and un-tars the result, and feeds the plaintext to the
//! handler registered for that path.

use crate::chunk::{ChunkName, Suffix};
use crate::crypto;
use crate::error::{RestoreError, Result};
use crate::handlers::{self, Handler, QubesXmlResult};
use crate::header::Header;
use crate::outer_extractor::Emitted;
use crate::vmhost::{VmHandle, VmHost};
use crossbeam::channel::{bounded, Receiver, Sender};
use crossbeam::thread::{scope, Scope, ScopedJoinHandle};
use flate2::read::MultiGzDecoder;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Per-VM outcome of the per-logical-file dispatch loop.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub qubes_xml: Option<Vec<u8>>,
}

/// A `Read` adapter over a channel of byte buffers: lets the decryption
/// loop push plaintext into a pipeline built from ordinary `Read`
/// combinators (a gzip decoder, a tar reader) without buffering a whole
/// logical file in memory.
struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    current: std::io::Cursor<Vec<u8>>,
}

impl ChannelReader {
    fn new(rx: Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            current: std::io::Cursor::new(Vec::new()),
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let n = self.current.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            match self.rx.recv() {
                Ok(data) => self.current = std::io::Cursor::new(data),
                Err(_) => return Ok(0), // sender dropped: EOF
            }
        }
    }
}

type HandlerResult = std::result::Result<Option<QubesXmlResult>, String>;

/// Runs the dispatcher to completion. `cancel` is polled at each chunk
/// handoff to the next logical file.
pub fn run(
    chunks: Receiver<Emitted>,
    scratch_dir: &Path,
    header: &Header,
    passphrase: &[u8],
    handler_table: &BTreeMap<String, Handler>,
    host: &dyn VmHost,
    vm_handles: &BTreeMap<String, VmHandle>,
    cancel: &Arc<AtomicBool>,
) -> Result<DispatchReport> {
    scope(|s| {
        run_in_scope(
            s,
            chunks,
            scratch_dir,
            header,
            passphrase,
            handler_table,
            host,
            vm_handles,
            cancel,
        )
    })
    .expect("dispatcher scope panicked")
}

#[allow(clippy::too_many_arguments)]
fn run_in_scope<'a, 'scope: 'a>(
    s: &'a Scope<'scope>,
    chunks: Receiver<Emitted>,
    scratch_dir: &'scope Path,
    header: &'scope Header,
    passphrase: &'scope [u8],
    handler_table: &'scope BTreeMap<String, Handler>,
    host: &'scope dyn VmHost,
    vm_handles: &'scope BTreeMap<String, VmHandle>,
    cancel: &'scope Arc<AtomicBool>,
) -> Result<DispatchReport> {
    let mut report = DispatchReport::default();
    let mut active: Option<ActiveLogical<'a>> = None;

    loop {
        if cancel.load(Ordering::SeqCst) {
            if let Some(a) = active.take() {
                drop(a.sender);
                let _ = a.join.join();
            }
            drain(&chunks);
            return Err(RestoreError::Cancelled);
        }
        let emitted = match chunks.recv() {
            Ok(e) => e,
            Err(_) => break,
        };
        let member_path = match emitted {
            Emitted::Eof => break,
            Emitted::Chunk { member_path } => member_path,
        };
        let name = match ChunkName::parse(&member_path) {
            Some(n) => n,
            None => continue, // backup-header/.hmac are read by the caller directly
        };

        if let Some(a) = &active {
            if a.logical != name.logical {
                finish_active(active.take().unwrap(), &mut report);
            }
        }

        if active.is_none() {
            if name.suffix == Suffix::Hmac {
                let p = scratch_dir.join(name.filename());
                let _ = std::fs::remove_file(p);
                continue;
            }
            if !name.is_first() {
                report
                    .failed
                    .push((name.logical.clone(), "chunk arrived before ordinal 000".into()));
                let p = scratch_dir.join(name.filename());
                let _ = std::fs::remove_file(p);
                continue;
            }
            let handler = handlers::lookup(handler_table, &name.logical);
            active = Some(ActiveLogical::start(s, name.logical.clone(), handler, header, host, vm_handles));
        }

        let a = active.as_mut().unwrap();
        match a.feed(scratch_dir, &name, header, passphrase) {
            Ok(()) => {}
            Err(FeedError::Sequence(reason)) => a.failed = Some(reason),
            Err(FeedError::Authentication) => {
                let a = active.take().unwrap();
                drop(a.sender);
                let _ = a.join.join();
                drain(&chunks);
                return Err(RestoreError::BadPassphrase);
            }
        }
    }

    if let Some(a) = active.take() {
        finish_active(a, &mut report);
    }

    Ok(report)
}

/// Consumes whatever remains on `chunks` so the outer extractor's
/// producer thread, blocked sending into a depth-1 channel, can finish
/// rather than hang once the dispatcher has stopped reading it.
fn drain(chunks: &Receiver<Emitted>) {
    while chunks.recv().is_ok() {}
}

struct ActiveLogical<'a> {
    logical: String,
    expect_ordinal: u32,
    pending_data: Option<(u32, Vec<u8>)>,
    sender: Sender<Vec<u8>>,
    join: ScopedJoinHandle<'a, HandlerResult>,
    failed: Option<String>,
    discarded: bool,
}

impl<'a> ActiveLogical<'a> {
    fn start<'scope: 'a>(
        s: &'a Scope<'scope>,
        logical: String,
        handler: Option<Handler>,
        header: &'scope Header,
        host: &'scope dyn VmHost,
        vm_handles: &'scope BTreeMap<String, VmHandle>,
    ) -> Self {
        let (tx, rx) = bounded::<Vec<u8>>(4);
        let compressed = header.compressed;
        let discarded = handler.is_none();

        let join = if let Some(handler) = handler {
            let vm_handle = handler_vm(&handler).and_then(|vm| vm_handles.get(&vm));
            s.spawn(move |_| {
                let reader = ChannelReader::new(rx);
                let mut decompressed: Box<dyn Read> = if compressed {
                    Box::new(MultiGzDecoder::new(reader))
                } else {
                    Box::new(reader)
                };
                run_handler(&handler, host, vm_handle, &mut decompressed)
            })
        } else {
            s.spawn(move |_| {
                while rx.recv().is_ok() {}
                Ok(None)
            })
        };

        Self {
            logical,
            expect_ordinal: 0,
            pending_data: None,
            sender: tx,
            join,
            failed: None,
            discarded,
        }
    }

    fn feed(
        &mut self,
        scratch_dir: &Path,
        name: &ChunkName,
        header: &Header,
        passphrase: &[u8],
    ) -> std::result::Result<(), FeedError> {
        let path = scratch_dir.join(name.filename());
        let bytes = std::fs::read(&path).map_err(|e| FeedError::Sequence(e.to_string()))?;
        let _ = std::fs::remove_file(&path);

        if header.uses_authenticated_encryption() {
            if name.ordinal != self.expect_ordinal {
                return Err(FeedError::Sequence(format!(
                    "expected ordinal {}, got {}",
                    self.expect_ordinal, name.ordinal
                )));
            }
            self.expect_ordinal += 1;
            let password = crypto::derive_v4_password(
                header.backup_id.as_deref().unwrap_or_default(),
                &self.logical,
                passphrase,
            );
            let plaintext = crypto::decrypt_v4(&bytes, &password).map_err(|_| FeedError::Authentication)?;
            if !self.discarded {
                let _ = self.sender.send(plaintext);
            }
            return Ok(());
        }

        match name.suffix {
            Suffix::None => {
                if name.ordinal != self.expect_ordinal {
                    return Err(FeedError::Sequence(format!(
                        "expected ordinal {}, got {}",
                        self.expect_ordinal, name.ordinal
                    )));
                }
                self.pending_data = Some((name.ordinal, bytes));
                Ok(())
            }
            Suffix::Hmac => {
                let (ord, data) = self.pending_data.take().ok_or_else(|| {
                    FeedError::Sequence("hmac chunk arrived without a matching data chunk".to_owned())
                })?;
                if ord != name.ordinal {
                    return Err(FeedError::Sequence("hmac/data ordinal mismatch".into()));
                }
                crypto::verify_legacy_hmac(&data, &bytes, &header.hmac_algorithm, passphrase)
                    .map_err(|_| FeedError::Authentication)?;
                self.expect_ordinal += 1;
                let plaintext = if header.encrypted {
                    crypto::decrypt_legacy(
                        &data,
                        header.crypto_algorithm.as_deref().unwrap_or("aes-256-cbc"),
                        passphrase,
                    )
                    .map_err(|_| FeedError::Authentication)?
                } else {
                    data
                };
                if !self.discarded {
                    let _ = self.sender.send(plaintext);
                }
                Ok(())
            }
            Suffix::Enc => Err(FeedError::Sequence("unexpected .enc chunk in non-v4 archive".into())),
        }
    }
}

/// `feed`'s failure modes. A sequence error (ordinal gap, missing hmac
/// sibling) only invalidates the one logical file it occurs in. An
/// authentication failure is this crate's tamper-detection signal and
/// must abort the whole restore rather than be recorded as one more
/// per-VM failure: a tampered or wrong-passphrase chunk means nothing
/// downstream can be trusted, whether or not decryption "succeeds" for
/// chunks already processed.
enum FeedError {
    Sequence(String),
    Authentication,
}

fn handler_vm(handler: &Handler) -> Option<String> {
    match handler {
        Handler::Volume { vm, .. }
        | Handler::Firewall { vm }
        | Handler::Appmenus { vm }
        | Handler::Notes { vm } => Some(vm.clone()),
        Handler::SaveQubesXml | Handler::Dom0Home { .. } => None,
    }
}

fn run_handler(
    handler: &Handler,
    host: &dyn VmHost,
    vm_handle: Option<&VmHandle>,
    decompressed: &mut dyn Read,
) -> HandlerResult {
    // Each logical file's plaintext is itself a single-entry tar stream
    // (the "inner tar"), produced by the same backup tool that wrote the
    // outer archive.
    let mut archive = tar::Archive::new(decompressed);
    let mut entries = archive.entries().map_err(|e| e.to_string())?;
    let mut entry = entries
        .next()
        .ok_or_else(|| "inner tar archive is empty".to_owned())?
        .map_err(|e| e.to_string())?;
    let size_hint = entry.header().size().ok();
    handler.consume(host, vm_handle, &mut entry, size_hint)
}

fn finish_active(active: ActiveLogical<'_>, report: &mut DispatchReport) {
    let ActiveLogical {
        logical,
        sender,
        join,
        failed,
        discarded,
        ..
    } = active;
    drop(sender);
    let outcome = join.join();
    if let Some(reason) = failed {
        report.failed.push((logical, reason));
        return;
    }
    match outcome {
        Ok(Ok(Some(QubesXmlResult(bytes)))) => {
            report.qubes_xml = Some(bytes);
            report.succeeded.push(logical);
        }
        Ok(Ok(None)) => {
            if !discarded {
                report.succeeded.push(logical);
            }
        }
        Ok(Err(reason)) => report.failed.push((logical, reason)),
        Err(_) => report.failed.push((logical, "handler thread panicked".into())),
    }
}
