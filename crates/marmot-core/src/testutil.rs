use std::collections::HashMap;
use std::path::{Path, PathBuf};

use marmot_types::backup_id::BackupId;

use crate::config::BackupGroup;
use crate::error::Result;
use crate::index::{EntryStore, FileEntry, LastBackup};

/// In-memory entry store for testing.
#[derive(Default)]
pub struct MemoryEntryStore {
    added: Vec<(FileEntry, i64)>,
    last_entries: HashMap<PathBuf, FileEntry>,
    last: Option<LastBackup>,
    next_id: i64,
    done: Vec<BackupId>,
}

impl MemoryEntryStore {
    /// Entries added during the run, with their incremental number.
    pub fn added(&self) -> &[(FileEntry, i64)] {
        &self.added
    }

    pub fn done_backups(&self) -> &[BackupId] {
        &self.done
    }

    /// Pretend `last` was the newest backup of every client.
    pub fn set_last(&mut self, last: LastBackup) {
        self.last = Some(last);
    }

    /// Seed the previous backup's entry table.
    pub fn insert_last_entry(&mut self, entry: FileEntry) {
        self.last_entries.insert(entry.full_path.clone(), entry);
    }
}

impl EntryStore for MemoryEntryStore {
    fn add_entry(&mut self, entry: &FileEntry, incremental: i64) -> Result<()> {
        self.added.push((entry.clone(), incremental));
        Ok(())
    }

    fn entry_for_path(&self, path: &Path) -> Option<FileEntry> {
        self.last_entries.get(path).cloned()
    }

    fn entries_under(&self, dir: &Path) -> Vec<FileEntry> {
        self.last_entries
            .values()
            .filter(|e| e.full_path.starts_with(dir))
            .cloned()
            .collect()
    }

    fn last_incremental(&self, _client: &str, _group: BackupGroup) -> Option<LastBackup> {
        self.last.clone()
    }

    fn new_backup(
        &mut self,
        _client: &str,
        _incremental: i64,
        _path: &str,
        _resumed: bool,
    ) -> Result<BackupId> {
        self.next_id += 1;
        Ok(BackupId(self.next_id))
    }

    fn set_backup_done(&mut self, backup: BackupId) -> Result<()> {
        self.done.push(backup);
        Ok(())
    }
}
