use std::path::Path;

use adler32::RollingAdler32;
use tracing::debug;

use marmot_types::file_hash::FileHash;

use super::hash_existing::HashExistingQueue;
use crate::error::Result;
use crate::index::{EntryStore, FileEntry};

/// Files below this size are never re-added; small entries are cheap to
/// regenerate and pruning them loses little.
pub const READD_SIZE_THRESHOLD: i64 = 100 * 1024;

/// A file re-registers when the adler-32 of its virtual path modulo the
/// tunable equals the run's incremental number. Every file is therefore
/// re-anchored to the hash index within `modulo` incrementals.
pub fn readd_hash_matches(virtual_path: &str, modulo: i64, incremental: i64) -> bool {
    if modulo <= 0 {
        return false;
    }
    let crc = RollingAdler32::from_buffer(virtual_path.as_bytes()).hash() as i32;
    i64::from(crc) % modulo == incremental
}

pub struct SparseReaddParams {
    pub modulo: i64,
    pub incremental: i64,
    pub trust_client_hashes: bool,
}

/// Re-register one file entry if this incremental is its turn.
///
/// With a trusted client hash the entry goes straight to the store;
/// otherwise the file is queued for off-thread rehashing (flushing
/// already-collected results first so registration order follows queue
/// order). Returns `true` if the entry was re-added or queued.
#[allow(clippy::too_many_arguments)]
pub fn add_sparse_file_entry(
    virtual_path: &str,
    file_size: i64,
    local_path: &Path,
    hash_path: Option<&Path>,
    client_hash: Option<FileHash>,
    params: &SparseReaddParams,
    store: &mut dyn EntryStore,
    hash_queue: Option<&HashExistingQueue>,
) -> Result<bool> {
    if file_size < READD_SIZE_THRESHOLD {
        return Ok(false);
    }
    if !readd_hash_matches(virtual_path, params.modulo, params.incremental) {
        return Ok(false);
    }

    let hash_path = hash_path.map(Path::to_path_buf).unwrap_or_default();

    if params.trust_client_hashes {
        if let Some(file_hash) = client_hash {
            debug!(path = %virtual_path, "re-adding entry from trusted client hash");
            store.add_entry(
                &FileEntry {
                    full_path: local_path.to_path_buf(),
                    hash_path,
                    file_hash,
                    file_size: file_size as u64,
                    recv_size: 0,
                },
                params.incremental,
            )?;
            return Ok(true);
        }
    }

    if let Some(queue) = hash_queue {
        queue.flush_into(store, params.incremental)?;
        queue.queue_file(local_path.to_path_buf(), hash_path);
        return Ok(true);
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemoryEntryStore;
    use std::path::PathBuf;

    #[test]
    fn modulo_selects_a_stable_subset() {
        let modulo = 4;
        // Over many paths, each path matches exactly one residue class.
        for i in 0..64 {
            let path = format!("/docs/report_{i}.txt");
            let matching: Vec<i64> = (0..modulo)
                .filter(|&inc| readd_hash_matches(&path, modulo, inc))
                .collect();
            assert_eq!(matching.len(), 1, "path {path} matched {matching:?}");
        }
    }

    #[test]
    fn zero_modulo_never_matches() {
        assert!(!readd_hash_matches("/a", 0, 0));
    }

    #[test]
    fn small_files_are_ignored() {
        let params = SparseReaddParams {
            modulo: 1,
            incremental: 0,
            trust_client_hashes: true,
        };
        let mut store = MemoryEntryStore::default();
        let added = add_sparse_file_entry(
            "/small",
            READD_SIZE_THRESHOLD - 1,
            &PathBuf::from("/b/small"),
            None,
            Some(FileHash([7; 64])),
            &params,
            &mut store,
            None,
        )
        .unwrap();
        assert!(!added);
        assert!(store.added().is_empty());
    }

    #[test]
    fn trusted_hash_registers_directly() {
        // modulo 1 matches every path at incremental 0.
        let params = SparseReaddParams {
            modulo: 1,
            incremental: 0,
            trust_client_hashes: true,
        };
        let mut store = MemoryEntryStore::default();
        let added = add_sparse_file_entry(
            "/big/file",
            READD_SIZE_THRESHOLD,
            &PathBuf::from("/b/big/file"),
            Some(&PathBuf::from("/b/.hashes/big/file")),
            Some(FileHash([9; 64])),
            &params,
            &mut store,
            None,
        )
        .unwrap();
        assert!(added);
        let rows = store.added();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0.file_hash, FileHash([9; 64]));
        assert_eq!(rows[0].0.hash_path, PathBuf::from("/b/.hashes/big/file"));
    }

    #[test]
    fn untrusted_hash_defers_to_queue() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("payload");
        std::fs::write(&file, vec![1u8; 200 * 1024]).unwrap();

        let params = SparseReaddParams {
            modulo: 1,
            incremental: 0,
            trust_client_hashes: false,
        };
        let mut store = MemoryEntryStore::default();
        let mut queue = HashExistingQueue::spawn();
        let added = add_sparse_file_entry(
            "/payload",
            200 * 1024,
            &file,
            None,
            None,
            &params,
            &mut store,
            Some(&queue),
        )
        .unwrap();
        assert!(added);
        queue.join();
        assert_eq!(queue.flush_into(&mut store, 0).unwrap(), 1);
    }
}
