use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};
use tracing::{debug, warn};

use crate::chunkhash::hasher::{build_chunk_hashes, ChunkHashJob};
use crate::error::Result;
use crate::index::{EntryStore, FileEntry};

enum QueueMsg {
    File { path: PathBuf, hash_path: PathBuf },
    Stop,
}

/// Off-thread hashing of already-linked files.
///
/// The walker queues `(file, hashfile)` pairs whose hashes the server can
/// no longer prove; the worker re-reads each file, recomputes its
/// whole-file hash through the chunk hasher, and collects the resulting
/// entries for registration. Runs concurrently with the walker; the
/// result list is guarded by a mutex.
pub struct HashExistingQueue {
    tx: Sender<QueueMsg>,
    handle: Option<JoinHandle<()>>,
    results: Arc<Mutex<Vec<FileEntry>>>,
    skip: Arc<AtomicBool>,
}

const QUEUE_DEPTH: usize = 128;

impl HashExistingQueue {
    pub fn spawn() -> Self {
        let (tx, rx) = bounded::<QueueMsg>(QUEUE_DEPTH);
        let results: Arc<Mutex<Vec<FileEntry>>> = Arc::new(Mutex::new(Vec::new()));
        let skip = Arc::new(AtomicBool::new(false));

        let worker_results = Arc::clone(&results);
        let worker_skip = Arc::clone(&skip);
        let handle = std::thread::Builder::new()
            .name("hash-existing".into())
            .spawn(move || {
                for msg in rx {
                    match msg {
                        QueueMsg::Stop => break,
                        QueueMsg::File { .. } if worker_skip.load(Ordering::Relaxed) => {}
                        QueueMsg::File { path, hash_path } => {
                            match hash_one(&path, &hash_path) {
                                Ok(entry) => {
                                    debug!(path = %path.display(), hash = %entry.file_hash, "rehashed existing file");
                                    worker_results.lock().unwrap().push(entry);
                                }
                                Err(e) => {
                                    warn!(path = %path.display(), error = %e, "failed to rehash existing file");
                                }
                            }
                        }
                    }
                }
            })
            .expect("spawn hash-existing thread");

        HashExistingQueue {
            tx,
            handle: Some(handle),
            results,
            skip,
        }
    }

    /// Enqueue one already-linked file for rehashing.
    pub fn queue_file(&self, path: PathBuf, hash_path: PathBuf) {
        let _ = self.tx.send(QueueMsg::File { path, hash_path });
    }

    /// Signal the worker to finish. With `skip`, queued files that have
    /// not started yet are dropped instead of hashed.
    pub fn queue_stop(&self, skip: bool) {
        if skip {
            self.skip.store(true, Ordering::Relaxed);
        }
        let _ = self.tx.send(QueueMsg::Stop);
    }

    pub fn join(&mut self) {
        let _ = self.tx.send(QueueMsg::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Drain collected entries into the store.
    pub fn flush_into(&self, store: &mut dyn EntryStore, incremental: i64) -> Result<usize> {
        let drained: Vec<FileEntry> = std::mem::take(&mut *self.results.lock().unwrap());
        let n = drained.len();
        for entry in &drained {
            store.add_entry(entry, incremental)?;
        }
        Ok(n)
    }
}

impl Drop for HashExistingQueue {
    fn drop(&mut self) {
        self.join();
    }
}

fn hash_one(path: &std::path::Path, hash_path: &std::path::Path) -> Result<FileEntry> {
    let mut src = File::open(path)?;
    let file_size = src.metadata()?.len();

    // The grid itself is discarded; only the whole-file hash matters here.
    let mut scratch = tempfile::tempfile()?;
    let mut job = ChunkHashJob::new(&mut src, &mut scratch);
    job.want_file_hash = true;
    let outcome = build_chunk_hashes(job)?;

    let file_hash = outcome
        .file_hash
        .ok_or_else(|| crate::error::BackupError::Other("hash requested but absent".into()))?;

    Ok(FileEntry {
        full_path: path.to_path_buf(),
        hash_path: hash_path.to_path_buf(),
        file_hash,
        file_size,
        recv_size: 0,
    })
}
