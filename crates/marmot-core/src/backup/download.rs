use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};
use tracing::{debug, warn};

use super::metadata::EntryMetadata;
use crate::chunkhash::hasher::{build_chunk_hashes, ChunkHashJob};
use crate::error::{BackupError, Result};

/// Outcome of one transfer as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Complete,
    /// The body arrived incompletely; the file is kept but must be
    /// re-diffed next incremental.
    Partial,
    Failed,
}

/// Network transport for file bodies, specified only by the interface
/// the core consumes. Implementations own connection management and
/// per-file retries; a sustained failure surfaces as `ClientOffline`.
pub trait FileTransport: Send {
    /// Fetch a whole file body into `dest`.
    fn fetch_full(&mut self, remote_path: &str, dest: &Path) -> Result<TransferOutcome>;

    /// Fetch only changed big chunks into `dest`, negotiating with the
    /// hash grid in `prev_hashes`; the transport writes the updated grid
    /// to `hash_out`.
    fn fetch_chunked(
        &mut self,
        remote_path: &str,
        dest: &Path,
        prev_hashes: &Path,
        hash_out: &Path,
    ) -> Result<TransferOutcome>;

    /// Fetch the metadata record for an entry.
    fn fetch_metadata(&mut self, remote_path: &str) -> Result<TransferOutcome>;

    /// Bytes received so far over this session.
    fn received_bytes(&self) -> u64 {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Full,
    Chunked,
    /// Entry needs no body, only its metadata record.
    MetadataOnly,
    /// Accumulated directory record, enqueued when the walker ascends
    /// out of a changed directory.
    DirMetadata,
}

/// One queued transfer. `line` ties the job to a listing line for the
/// final client-list rewrite; directory records carry `None`.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub line: Option<usize>,
    pub kind: TransferKind,
    pub remote_path: String,
    pub dest: PathBuf,
    /// Where the new hashfile goes for chunked transfers.
    pub hash_dest: PathBuf,
    /// Previous version of the file, for building a missing hash grid.
    pub prev_file: Option<PathBuf>,
    pub prev_hashes: Option<PathBuf>,
    pub size: i64,
    pub metadata: EntryMetadata,
}

enum QueueMsg {
    Job(Box<DownloadJob>),
    Stop { skip: bool },
}

#[derive(Default)]
struct LineResults {
    failed: BTreeSet<usize>,
    partial: BTreeSet<usize>,
}

struct SchedulerShared {
    lines: Mutex<LineResults>,
    offline: AtomicBool,
    metadata_error: AtomicBool,
    received_bytes: AtomicU64,
}

impl SchedulerShared {
    fn mark_failed(&self, line: Option<usize>, kind: TransferKind) {
        if matches!(kind, TransferKind::MetadataOnly | TransferKind::DirMetadata) {
            self.metadata_error.store(true, Ordering::Relaxed);
        }
        if let Some(line) = line {
            self.lines.lock().unwrap().failed.insert(line);
        }
    }

    fn mark_partial(&self, line: Option<usize>) {
        if let Some(line) = line {
            self.lines.lock().unwrap().partial.insert(line);
        }
    }
}

/// The downloader worker: owns the transport sessions and processes
/// queued transfers in submission order, so per-line completion is
/// totally ordered by line index.
pub struct DownloadScheduler {
    tx: Sender<QueueMsg>,
    handle: Option<JoinHandle<()>>,
    shared: Arc<SchedulerShared>,
}

const QUEUE_DEPTH: usize = 256;

impl DownloadScheduler {
    pub fn spawn(mut transport: Box<dyn FileTransport>) -> Self {
        let (tx, rx) = bounded::<QueueMsg>(QUEUE_DEPTH);
        let shared = Arc::new(SchedulerShared {
            lines: Mutex::new(LineResults::default()),
            offline: AtomicBool::new(false),
            metadata_error: AtomicBool::new(false),
            received_bytes: AtomicU64::new(0),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("downloader".into())
            .spawn(move || {
                let mut skip_rest = false;
                for msg in rx {
                    match msg {
                        QueueMsg::Stop { skip } => {
                            if skip {
                                skip_rest = true;
                            } else {
                                break;
                            }
                        }
                        QueueMsg::Job(job) => {
                            if skip_rest || worker_shared.offline.load(Ordering::Relaxed) {
                                worker_shared.mark_failed(job.line, job.kind);
                                continue;
                            }
                            match run_job(&mut *transport, &job) {
                                Ok(TransferOutcome::Complete) => {
                                    debug!(remote = %job.remote_path, "transfer complete");
                                }
                                Ok(TransferOutcome::Partial) => {
                                    worker_shared.mark_partial(job.line);
                                }
                                Ok(TransferOutcome::Failed) => {
                                    worker_shared.mark_failed(job.line, job.kind);
                                }
                                Err(BackupError::ClientOffline(reason)) => {
                                    warn!(%reason, "client went offline, draining queue");
                                    worker_shared.offline.store(true, Ordering::Relaxed);
                                    worker_shared.mark_failed(job.line, job.kind);
                                }
                                Err(e) => {
                                    warn!(remote = %job.remote_path, error = %e, "transfer failed");
                                    worker_shared.mark_failed(job.line, job.kind);
                                }
                            }
                            worker_shared
                                .received_bytes
                                .store(transport.received_bytes(), Ordering::Relaxed);
                        }
                    }
                }
            })
            .expect("spawn downloader thread");

        DownloadScheduler {
            tx,
            handle: Some(handle),
            shared,
        }
    }

    /// Enqueue a transfer. Returns `false` if the worker is gone.
    pub fn queue(&self, job: DownloadJob) -> bool {
        self.tx.send(QueueMsg::Job(Box::new(job))).is_ok()
    }

    /// Signal the worker to stop. With `skip` the remaining queue is
    /// drained without starting new transfers.
    pub fn queue_stop(&self, skip: bool) {
        let _ = self.tx.send(QueueMsg::Stop { skip });
    }

    /// Wait for the worker to drain and exit.
    pub fn join(&mut self) {
        let _ = self.tx.send(QueueMsg::Stop { skip: false });
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_offline(&self) -> bool {
        self.shared.offline.load(Ordering::Relaxed)
    }

    pub fn has_metadata_error(&self) -> bool {
        self.shared.metadata_error.load(Ordering::Relaxed)
    }

    /// Lines never queued, or queued and completed, count as ok.
    pub fn is_download_ok(&self, line: usize) -> bool {
        !self.shared.lines.lock().unwrap().failed.contains(&line)
    }

    pub fn is_download_partial(&self, line: usize) -> bool {
        self.shared.lines.lock().unwrap().partial.contains(&line)
    }

    pub fn received_bytes(&self) -> u64 {
        self.shared.received_bytes.load(Ordering::Relaxed)
    }
}

impl Drop for DownloadScheduler {
    fn drop(&mut self) {
        self.join();
    }
}

fn run_job(transport: &mut dyn FileTransport, job: &DownloadJob) -> Result<TransferOutcome> {
    match job.kind {
        TransferKind::Full => transport.fetch_full(&job.remote_path, &job.dest),
        TransferKind::Chunked => {
            let prev_hashes = ensure_prev_hashes(job)?;
            match &prev_hashes {
                Some(prev) => transport.fetch_chunked(
                    &job.remote_path,
                    &job.dest,
                    prev,
                    &job.hash_dest,
                ),
                // Nothing to diff against; a full fetch plus a locally
                // built grid is equivalent.
                None => {
                    let outcome = transport.fetch_full(&job.remote_path, &job.dest)?;
                    if outcome == TransferOutcome::Complete {
                        let mut src = File::open(&job.dest)?;
                        let mut hash_out = File::create(&job.hash_dest)?;
                        build_chunk_hashes(ChunkHashJob::new(&mut src, &mut hash_out))?;
                    }
                    Ok(outcome)
                }
            }
        }
        TransferKind::MetadataOnly | TransferKind::DirMetadata => {
            transport.fetch_metadata(&job.remote_path)
        }
    }
}

/// Make sure the chunked transfer has a hash grid to negotiate with.
/// A missing grid is rebuilt from the previous file version.
fn ensure_prev_hashes(job: &DownloadJob) -> Result<Option<PathBuf>> {
    if let Some(prev_hashes) = &job.prev_hashes {
        if prev_hashes.exists() {
            return Ok(Some(prev_hashes.clone()));
        }
    }
    let Some(prev_file) = &job.prev_file else {
        return Ok(None);
    };
    if !prev_file.exists() {
        return Ok(None);
    }
    let rebuilt = job.hash_dest.with_extension("prev");
    let mut src = File::open(prev_file)?;
    let mut hash_out = File::create(&rebuilt)?;
    build_chunk_hashes(ChunkHashJob::new(&mut src, &mut hash_out))?;
    debug!(prev = %prev_file.display(), "rebuilt missing hash grid for chunked transfer");
    Ok(Some(rebuilt))
}
