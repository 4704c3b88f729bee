use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use marmot_types::backup_id::BackupId;
use marmot_types::file_hash::FileHash;

use crate::error::Result;

/// One row of the file-entry bookkeeping: a backed-up file body, where it
/// lives, and where its sidecar hashfile lives.
///
/// An empty `hash_path` means the file has no hashfile at all (see
/// DESIGN.md on the directory-pool ambiguity).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub full_path: PathBuf,
    pub hash_path: PathBuf,
    pub file_hash: FileHash,
    pub file_size: u64,
    /// Bytes actually received over the wire for this file; zero for
    /// linked entries.
    pub recv_size: u64,
}

/// Content lookup used for hash-based reuse: `(hash, size)` resolves to
/// an existing on-disk file that can be linked instead of transferred.
pub trait HashIndex {
    fn lookup(&self, hash: &FileHash, size: u64) -> Option<FileEntry>;
}

/// In-memory hash index over file entries.
///
/// The production deployment backs this with the relational store; the
/// in-memory form is the reference implementation and the test double.
#[derive(Debug, Default, Clone)]
pub struct FileEntryIndex {
    entries: HashMap<(FileHash, u64), FileEntry>,
}

impl FileEntryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: FileEntry) {
        self.entries
            .insert((entry.file_hash, entry.file_size), entry);
    }

    pub fn remove(&mut self, hash: &FileHash, size: u64) -> Option<FileEntry> {
        self.entries.remove(&(*hash, size))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.values()
    }
}

impl HashIndex for FileEntryIndex {
    fn lookup(&self, hash: &FileHash, size: u64) -> Option<FileEntry> {
        let found = self.entries.get(&(*hash, size)).cloned();
        if found.is_some() {
            debug!(hash = %hash, size, "hash index hit");
        }
        found
    }
}

/// What is known about the most recent backup of a client, as recorded
/// by the metadata store.
#[derive(Debug, Clone)]
pub struct LastBackup {
    pub backup_id: BackupId,
    pub incremental: i64,
    /// Directory name of the backup under the client root.
    pub path: String,
    /// Directory name of the most recent complete backup, if different.
    pub complete_path: Option<String>,
    pub complete: bool,
}

/// The relational metadata store for file-entry bookkeeping, specified
/// only by the interface the core consumes.
pub trait EntryStore: Send {
    /// Record a file entry for the running incremental.
    fn add_entry(&mut self, entry: &FileEntry, incremental: i64) -> Result<()>;

    /// Look up the previous backup's entry for an exact path (the
    /// "temporary last-files table" during resumed runs).
    fn entry_for_path(&self, path: &Path) -> Option<FileEntry>;

    /// All previous-backup entries whose path starts with `dir` (used
    /// when a whole subtree is linked through the directory pool).
    fn entries_under(&self, dir: &Path) -> Vec<FileEntry>;

    /// The newest backup of this client and group, if any exists.
    fn last_incremental(&self, client: &str, group: crate::config::BackupGroup)
        -> Option<LastBackup>;

    /// Open a new backup row; returns its identifier.
    fn new_backup(
        &mut self,
        client: &str,
        incremental: i64,
        path: &str,
        resumed: bool,
    ) -> Result<BackupId>;

    /// Seal the backup row once the run finished.
    fn set_backup_done(&mut self, backup: BackupId) -> Result<()>;
}
