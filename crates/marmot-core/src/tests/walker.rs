use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha512};

use marmot_types::backup_id::BackupId;

use crate::backup::diff::TreeDiff;
use crate::backup::download::{DownloadScheduler, FileTransport, TransferOutcome};
use crate::backup::linker::DirectoryLinkPool;
use crate::backup::walker::{FileAction, TreeWalker, WalkParams};
use crate::backup::{BackupState, SequenceInfo};
use crate::config::ServerSettings;
use crate::error::Result;
use crate::index::FileEntryIndex;
use crate::testutil::MemoryEntryStore;

/// Transport that records which transfers ran and materializes bodies.
struct RecordingTransport {
    calls: Arc<Mutex<Vec<String>>>,
}

impl FileTransport for RecordingTransport {
    fn fetch_full(&mut self, remote: &str, dest: &Path) -> Result<TransferOutcome> {
        self.calls.lock().unwrap().push(format!("full:{remote}"));
        std::fs::write(dest, b"downloaded")?;
        Ok(TransferOutcome::Complete)
    }
    fn fetch_chunked(
        &mut self,
        remote: &str,
        dest: &Path,
        _prev_hashes: &Path,
        _hash_out: &Path,
    ) -> Result<TransferOutcome> {
        self.calls.lock().unwrap().push(format!("chunked:{remote}"));
        std::fs::write(dest, b"patched")?;
        Ok(TransferOutcome::Complete)
    }
    fn fetch_metadata(&mut self, remote: &str) -> Result<TransferOutcome> {
        self.calls.lock().unwrap().push(format!("meta:{remote}"));
        Ok(TransferOutcome::Complete)
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    listing: PathBuf,
    state: BackupState,
    calls: Arc<Mutex<Vec<String>>>,
    downloads: DownloadScheduler,
}

impl Harness {
    /// Lay out a previous backup and a listing; `files` maps
    /// listing-relative paths (with leading `/`) to contents.
    fn new(listing_text: &str, files: &[(&str, &[u8])]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base");
        let new = dir.path().join("new");
        for (rel, content) in files {
            let path = base.join(rel.trim_start_matches('/'));
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, content).unwrap();
            let hash_path = base.join(".hashes").join(rel.trim_start_matches('/'));
            std::fs::create_dir_all(hash_path.parent().unwrap()).unwrap();
            std::fs::write(&hash_path, b"hashfile").unwrap();
        }
        std::fs::create_dir_all(&new).unwrap();
        std::fs::create_dir_all(new.join(".hashes")).unwrap();

        let listing = dir.path().join("listing.ub");
        std::fs::write(&listing, listing_text).unwrap();

        let calls = Arc::new(Mutex::new(Vec::new()));
        let downloads = DownloadScheduler::spawn(Box::new(RecordingTransport {
            calls: Arc::clone(&calls),
        }));

        let state = BackupState {
            backup_id: BackupId(7),
            incremental_num: 0,
            base_backup_path: base.clone(),
            base_hash_path: base.join(".hashes"),
            new_backup_path: new.clone(),
            new_hash_path: new.join(".hashes"),
            use_snapshots: false,
            offline: false,
            had_error: false,
            continuous_sequences: HashMap::new(),
        };

        Harness {
            _dir: dir,
            listing,
            state,
            calls,
            downloads,
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[test]
fn diff_scenario_links_unchanged_and_queues_changed() {
    // Lines: 0 = dir A, 1 = file a, 2 = dir B, 3 = file b, 4 = file c.
    let listing = "d\"A\" 0 10\n\
                   f\"a\" 2 11\n\
                   d\"B\" 0 12\n\
                   f\"b\" 2 13\n\
                   d\"..\" 0 0\n\
                   f\"c\" 2 14\n\
                   d\"..\" 0 0\n";
    let mut h = Harness::new(
        listing,
        &[("/A/a", b"aa"), ("/A/B/b", b"bb"), ("/A/c", b"cc")],
    );

    let diff = TreeDiff {
        changed: vec![3],
        ..Default::default()
    };
    let settings = ServerSettings::default();
    let mut store = MemoryEntryStore::default();
    let index = FileEntryIndex::new();
    let stop = AtomicBool::new(false);

    let outcome = {
        let mut params = WalkParams {
            listing: &h.listing,
            diff: &diff,
            settings: &settings,
            state: &mut h.state,
            store: &mut store,
            index: &index,
            downloads: &h.downloads,
            hash_queue: None,
            dir_pool: None,
            space_cb: None,
            stop: &stop,
            copy_last_entries: false,
            online: true,
        };
        TreeWalker::new().walk(&mut params).unwrap()
    };
    h.downloads.join();

    // Totality: every line classified exactly once.
    let lines: Vec<usize> = outcome.actions.keys().copied().collect();
    assert_eq!(lines, vec![0, 1, 2, 3, 4]);

    assert_eq!(outcome.actions[&1], FileAction::Linked);
    assert_eq!(outcome.actions[&3], FileAction::QueuedFull);
    assert_eq!(outcome.actions[&4], FileAction::Linked);
    assert!(!outcome.has_error);

    // Unchanged files are hard links of the previous backup's copies.
    let new = &h.state.new_backup_path;
    assert_eq!(std::fs::read(new.join("A/a")).unwrap(), b"aa");
    assert_eq!(std::fs::read(new.join("A/c")).unwrap(), b"cc");
    assert_eq!(std::fs::read(new.join("A/B/b")).unwrap(), b"downloaded");

    // Their hashfiles travelled along.
    assert!(h.state.new_hash_path.join("A/a").exists());

    // Both B and A get a directory-metadata record: line 3 changed
    // below them.
    let calls = h.calls();
    assert!(calls.contains(&"full:A/B/b".to_string()), "calls: {calls:?}");
    assert!(calls.contains(&"meta:A/B".to_string()), "calls: {calls:?}");
    assert!(calls.contains(&"meta:A".to_string()), "calls: {calls:?}");
}

#[test]
fn large_unchanged_subtree_links_once_and_readds_sparsely() {
    let big = 200 * 1024i64;
    let payload = vec![0x42u8; 1024];
    let digest = hex::encode(Sha512::digest(&payload));

    // Lines: 0 = dir D, 1 = file f1, 2 = file f2.
    let listing = format!(
        "d\"D\" 0 10\n\
         f\"f1\" {big} 11#sha512={digest}\n\
         f\"f2\" {big} 12#sha512={digest}\n\
         d\"..\" 0 0\n"
    );
    let mut h = Harness::new(&listing, &[("/D/f1", &payload), ("/D/f2", &payload)]);

    let diff = TreeDiff {
        large_unchanged_subtrees: vec![0],
        ..Default::default()
    };
    let mut settings = ServerSettings::default();
    settings.trust_client_hashes = true;
    settings.readd_modulo = 1;

    let mut store = MemoryEntryStore::default();
    let index = FileEntryIndex::new();
    let stop = AtomicBool::new(false);
    let pool_root = h.state.base_backup_path.parent().unwrap().join("pool");
    let mut pool = DirectoryLinkPool::new(pool_root);

    let outcome = {
        let mut params = WalkParams {
            listing: &h.listing,
            diff: &diff,
            settings: &settings,
            state: &mut h.state,
            store: &mut store,
            index: &index,
            downloads: &h.downloads,
            hash_queue: None,
            dir_pool: Some(&mut pool),
            space_cb: None,
            stop: &stop,
            copy_last_entries: false,
            online: true,
        };
        TreeWalker::new().walk(&mut params).unwrap()
    };
    h.downloads.join();

    // One directory-pool link substitutes for the whole subtree.
    assert_eq!(outcome.actions[&0], FileAction::Linked);
    let linked_dir = h.state.new_backup_path.join("D");
    assert!(std::fs::symlink_metadata(&linked_dir)
        .unwrap()
        .file_type()
        .is_symlink());
    assert_eq!(std::fs::read(linked_dir.join("f1")).unwrap(), payload);

    // No per-file transfers for D's contents.
    assert!(h.calls().is_empty(), "calls: {:?}", h.calls());
    assert_eq!(outcome.actions[&1], FileAction::Skipped);
    assert_eq!(outcome.actions[&2], FileAction::Skipped);

    // Yet both large files were re-anchored to the hash index
    // (modulo 1 matches every path at incremental 0).
    assert_eq!(outcome.num_readded, 2);
    assert_eq!(store.added().len(), 2);
}

#[test]
fn offline_changed_files_become_download_nok() {
    // Lines: 0 = file x, 1 = file y.
    let listing = "f\"x\" 4 20\nf\"y\" 4 21\n";
    let mut h = Harness::new(listing, &[("/x", b"xxxx"), ("/y", b"yyyy")]);
    h.state.offline = true;

    let diff = TreeDiff {
        changed: vec![0, 1],
        modified_inplace: vec![1],
        ..Default::default()
    };
    let settings = ServerSettings::default();
    let mut store = MemoryEntryStore::default();
    let index = FileEntryIndex::new();
    let stop = AtomicBool::new(false);

    let outcome = {
        let mut params = WalkParams {
            listing: &h.listing,
            diff: &diff,
            settings: &settings,
            state: &mut h.state,
            store: &mut store,
            index: &index,
            downloads: &h.downloads,
            hash_queue: None,
            dir_pool: None,
            space_cb: None,
            stop: &stop,
            copy_last_entries: false,
            online: false,
        };
        TreeWalker::new().walk(&mut params).unwrap()
    };
    h.downloads.join();

    // x could not be scheduled; y is modifiable in place and still goes.
    assert_eq!(outcome.download_nok, vec![0]);
    assert_eq!(outcome.actions[&0], FileAction::Dropped);
    assert_eq!(outcome.actions[&1], FileAction::QueuedFull);
}

#[test]
fn changed_file_reuses_identical_body_from_index() {
    let payload = b"identical body".to_vec();
    let digest_hex = hex::encode(Sha512::digest(&payload));

    // Line 0 = file f, changed, but an identical body already exists.
    let listing = format!(
        "f\"f\" {} 30#sha512={digest_hex}\n",
        payload.len()
    );
    let mut h = Harness::new(&listing, &[]);

    // Seed the index with an existing on-disk file of the same content.
    let donor = h.state.base_backup_path.join("donor");
    std::fs::create_dir_all(donor.parent().unwrap()).unwrap();
    std::fs::write(&donor, &payload).unwrap();
    let mut index = FileEntryIndex::new();
    index.insert(crate::index::FileEntry {
        full_path: donor,
        hash_path: PathBuf::new(),
        file_hash: marmot_types::file_hash::FileHash::from_slice(
            Sha512::digest(&payload).as_slice(),
        )
        .unwrap(),
        file_size: payload.len() as u64,
        recv_size: payload.len() as u64,
    });

    let diff = TreeDiff {
        changed: vec![0],
        ..Default::default()
    };
    let settings = ServerSettings::default();
    let mut store = MemoryEntryStore::default();
    let stop = AtomicBool::new(false);

    let outcome = {
        let mut params = WalkParams {
            listing: &h.listing,
            diff: &diff,
            settings: &settings,
            state: &mut h.state,
            store: &mut store,
            index: &index,
            downloads: &h.downloads,
            hash_queue: None,
            dir_pool: None,
            space_cb: None,
            stop: &stop,
            copy_last_entries: false,
            online: true,
        };
        TreeWalker::new().walk(&mut params).unwrap()
    };
    h.downloads.join();

    assert_eq!(outcome.actions[&0], FileAction::Linked);
    assert_eq!(outcome.linked_bytes, payload.len() as u64);
    assert_eq!(
        std::fs::read(h.state.new_backup_path.join("f")).unwrap(),
        payload
    );
    // No body transfer, only the metadata record.
    assert_eq!(h.calls(), vec!["meta:f".to_string()]);
    // The new path was registered in the store.
    assert_eq!(store.added().len(), 1);
}

#[test]
fn top_level_sequence_extras_are_recorded() {
    let listing = "d\"vol\" 0 1#sequence_id=12&sequence_next=13\nd\"..\" 0 0\n";
    let mut h = Harness::new(listing, &[]);

    let diff = TreeDiff::default();
    let settings = ServerSettings::default();
    let mut store = MemoryEntryStore::default();
    let index = FileEntryIndex::new();
    let stop = AtomicBool::new(false);

    {
        let mut params = WalkParams {
            listing: &h.listing,
            diff: &diff,
            settings: &settings,
            state: &mut h.state,
            store: &mut store,
            index: &index,
            downloads: &h.downloads,
            hash_queue: None,
            dir_pool: None,
            space_cb: None,
            stop: &stop,
            copy_last_entries: false,
            online: true,
        };
        TreeWalker::new().walk(&mut params).unwrap();
    }
    h.downloads.join();

    assert_eq!(
        h.state.continuous_sequences.get("vol"),
        Some(&SequenceInfo { id: 12, next: 13 })
    );
}

#[test]
fn symlink_and_special_entries_materialize() {
    // Line 0 = symlink, line 1 = special sentinel.
    let listing = "f\"lnk\" 0 1#sym_target=target_elsewhere\n\
                   f\"dev\" 0 1#special=1\n";
    let mut h = Harness::new(listing, &[]);

    let diff = TreeDiff::default();
    let settings = ServerSettings::default();
    let mut store = MemoryEntryStore::default();
    let index = FileEntryIndex::new();
    let stop = AtomicBool::new(false);

    let outcome = {
        let mut params = WalkParams {
            listing: &h.listing,
            diff: &diff,
            settings: &settings,
            state: &mut h.state,
            store: &mut store,
            index: &index,
            downloads: &h.downloads,
            hash_queue: None,
            dir_pool: None,
            space_cb: None,
            stop: &stop,
            copy_last_entries: false,
            online: true,
        };
        TreeWalker::new().walk(&mut params).unwrap()
    };
    h.downloads.join();

    assert_eq!(outcome.actions[&0], FileAction::Symlink);
    assert_eq!(outcome.actions[&1], FileAction::Special);

    let new = &h.state.new_backup_path;
    assert_eq!(
        std::fs::read_link(new.join("lnk")).unwrap(),
        PathBuf::from("target_elsewhere")
    );
    assert_eq!(std::fs::metadata(new.join("dev")).unwrap().len(), 0);

    // Both entries scheduled metadata-only transfers.
    let calls = h.calls();
    assert!(calls.contains(&"meta:lnk".to_string()));
    assert!(calls.contains(&"meta:dev".to_string()));
}
