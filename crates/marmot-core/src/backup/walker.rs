use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, info, warn};

use marmot_types::file_hash::FileHash;

use super::diff::{has_change, TreeDiff};
use super::download::{DownloadJob, DownloadScheduler, TransferKind};
use super::hash_existing::HashExistingQueue;
use super::linker::{self, DirectoryLinkPool};
use super::metadata::{
    carry_over_metadata, write_metadata_file, EntryMetadata, METADATA_DIR_FN,
};
use super::snapshot::fix_sibling_name;
use super::sparse_readd::{add_sparse_file_entry, SparseReaddParams};
use super::{BackupState, SequenceInfo};
use crate::chunkhash::writer::SpaceCallback;
use crate::config::ServerSettings;
use crate::error::Result;
use crate::index::{EntryStore, FileEntry, HashIndex};
use crate::list::parser::ListParser;
use crate::list::ListEntry;
use crate::platform::fs as platform_fs;

/// What the walker decided to do with one listing line. Every line is
/// classified exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    /// Hard link, reflink, hash-index link or directory-pool link.
    Linked,
    /// Byte copy after the hardlink limit was reached.
    Copied,
    QueuedFull,
    QueuedChunked,
    Symlink,
    Special,
    /// No filesystem action needed (snapshot-unchanged entries,
    /// directories, contents of pool-linked subtrees).
    Skipped,
    /// Could not be scheduled; omitted from the client list.
    Dropped,
}

/// Everything the walker needs, passed by reference so the walk never
/// observes driver lifecycle.
pub struct WalkParams<'a> {
    pub listing: &'a Path,
    pub diff: &'a TreeDiff,
    pub settings: &'a ServerSettings,
    pub state: &'a mut BackupState,
    pub store: &'a mut dyn EntryStore,
    pub index: &'a dyn HashIndex,
    pub downloads: &'a DownloadScheduler,
    pub hash_queue: Option<&'a HashExistingQueue>,
    pub dir_pool: Option<&'a mut DirectoryLinkPool>,
    pub space_cb: Option<&'a dyn SpaceCallback>,
    pub stop: &'a AtomicBool,
    /// Resumed run: copy file-entry rows from the previous backup.
    pub copy_last_entries: bool,
    pub online: bool,
}

#[derive(Debug, Default)]
pub struct WalkOutcome {
    pub actions: BTreeMap<usize, FileAction>,
    /// Lines that could not be scheduled while offline, sorted.
    pub download_nok: Vec<usize>,
    pub linked_bytes: u64,
    pub num_readded: u64,
    pub num_copied: u64,
    pub has_error: bool,
    pub stopped: bool,
}

/// Per-directory state; one frame per open directory. Bundling the
/// sibling-name set, the item counter and the dir-diff flag in a single
/// stack makes the underflow bugs of parallel stacks impossible.
struct DirFrame {
    names: HashSet<String>,
    items: u64,
    dir_diff: bool,
}

impl DirFrame {
    fn new(dir_diff: bool) -> Self {
        DirFrame {
            names: HashSet::new(),
            items: 0,
            dir_diff,
        }
    }
}

/// Join a listing-relative path (leading `/`) onto an on-disk root.
pub(crate) fn local_path(root: &Path, rel: &str) -> PathBuf {
    root.join(rel.trim_start_matches('/'))
}

fn pop_component(path: &mut String) {
    if let Some(idx) = path.rfind('/') {
        path.truncate(idx);
    }
}

fn pop_orig_component(path: &mut String, sep: &str) {
    if sep.is_empty() {
        return;
    }
    if let Some(idx) = path.rfind(sep) {
        path.truncate(idx);
    }
}

/// Drives the list parser across the full listing and classifies every
/// entry. The walker is the only mutator of the new backup tree.
pub struct TreeWalker {
    frames: Vec<DirFrame>,
    depth: i32,
    curr_path: String,
    curr_os_path: String,
    curr_orig_path: String,
    orig_sep: String,
    indirchange: bool,
    changelevel: i32,
    skip_dir_completely: usize,
    skip_dir_copy_sparse: bool,
    readd_sparse_enabled: bool,
    line: usize,
    link_log_count: u32,
    outcome: WalkOutcome,
}

impl TreeWalker {
    pub fn new() -> Self {
        TreeWalker {
            frames: vec![DirFrame::new(false)],
            depth: 0,
            curr_path: String::new(),
            curr_os_path: String::new(),
            curr_orig_path: String::new(),
            orig_sep: "\\".to_string(),
            indirchange: false,
            changelevel: 0,
            skip_dir_completely: 0,
            skip_dir_copy_sparse: false,
            readd_sparse_enabled: false,
            line: 0,
            link_log_count: 0,
            outcome: WalkOutcome::default(),
        }
    }

    /// Walk the listing once, front to back. Component failures set
    /// `has_error` and the walk keeps going, so as much linkable state
    /// as possible is saved.
    pub fn walk(mut self, params: &mut WalkParams<'_>) -> Result<WalkOutcome> {
        self.readd_sparse_enabled = params.online
            && params.settings.client_hashes
            && params.settings.readd_file_entries;

        let mut reader = BufReader::new(File::open(params.listing)?);
        let mut parser = ListParser::new();
        let mut buf = [0u8; 4096];

        loop {
            let read = reader.read(&mut buf)?;
            if read == 0 {
                break;
            }
            for &b in &buf[..read] {
                if let Some(entry) = parser.feed(b) {
                    self.handle_entry(entry, params)?;
                }
            }
        }

        self.outcome.download_nok.sort_unstable();
        info!(
            lines = self.line,
            linked_bytes = self.outcome.linked_bytes,
            readded = self.outcome.num_readded,
            copied_entries = self.outcome.num_copied,
            "walked listing"
        );
        Ok(self.outcome)
    }

    fn check_workers(&mut self, params: &mut WalkParams<'_>) {
        if params.stop.load(Ordering::Relaxed) && !self.outcome.stopped {
            self.outcome.stopped = true;
            params.state.offline = true;
            error!("backup stopped by administrator");
            params.downloads.queue_stop(true);
            if let Some(queue) = params.hash_queue {
                queue.queue_stop(true);
            }
        }
        if params.downloads.is_offline() && !params.state.offline {
            warn!("client went offline during walk");
            params.state.offline = true;
        }
    }

    fn handle_entry(&mut self, entry: ListEntry, params: &mut WalkParams<'_>) -> Result<()> {
        self.check_workers(params);

        let is_dir_up = entry.is_dir_up();
        let os_name = if !is_dir_up {
            let frame = self.frames.last_mut().expect("root frame always present");
            fix_sibling_name(&entry.name, &mut frame.names)
        } else {
            String::new()
        };

        // Inside a pool-linked subtree: stream past the contents without
        // re-processing, but keep paths and sparse re-adds going.
        if self.skip_dir_completely > 0 {
            if entry.is_dir {
                if is_dir_up {
                    self.skip_dir_completely -= 1;
                    if self.skip_dir_completely > 0 {
                        pop_component(&mut self.curr_path);
                        pop_component(&mut self.curr_os_path);
                        self.frames.pop();
                    }
                    // At zero the boundary directory's own ascent falls
                    // through to the normal close handling below.
                } else {
                    self.curr_path.push('/');
                    self.curr_path.push_str(&entry.name);
                    self.curr_os_path.push('/');
                    self.curr_os_path.push_str(&os_name);
                    self.skip_dir_completely += 1;
                    self.frames.push(DirFrame::new(false));
                }
            } else if self.skip_dir_copy_sparse {
                self.readd_inside_linked_subtree(&entry, &os_name, params)?;
            }

            if self.skip_dir_completely > 0 {
                if !is_dir_up {
                    self.outcome.actions.insert(self.line, FileAction::Skipped);
                    self.line += 1;
                }
                return Ok(());
            }
        }

        let mut metadata = EntryMetadata::from_entry(&entry);
        if let Some(orig) = &metadata.orig_path {
            self.curr_orig_path = orig.clone();
            self.orig_sep = entry
                .extras
                .get("orig_sep")
                .filter(|s| !s.is_empty())
                .cloned()
                .unwrap_or_else(|| "\\".to_string());
        }

        if entry.is_dir {
            if is_dir_up {
                self.handle_dir_close(&entry, &metadata, params)?;
            } else {
                self.handle_dir_open(&entry, &os_name, &mut metadata, params)?;
                self.line += 1;
            }
        } else {
            self.handle_file(&entry, &os_name, &mut metadata, params)?;
            self.line += 1;
        }
        Ok(())
    }

    fn readd_inside_linked_subtree(
        &mut self,
        entry: &ListEntry,
        os_name: &str,
        params: &mut WalkParams<'_>,
    ) -> Result<()> {
        let virtual_path = format!("{}/{}", self.curr_path, entry.name);
        let rel = format!("{}/{}", self.curr_os_path, os_name);
        let local = local_path(&params.state.new_backup_path, &rel);
        let hash_local = local_path(&params.state.new_hash_path, &rel);
        let readd_params = SparseReaddParams {
            modulo: params.settings.readd_modulo,
            incremental: params.state.incremental_num,
            trust_client_hashes: params.settings.trust_client_hashes,
        };
        let client_hash = client_hash(entry, params.settings);
        if add_sparse_file_entry(
            &virtual_path,
            entry.size,
            &local,
            Some(&hash_local),
            client_hash,
            &readd_params,
            params.store,
            params.hash_queue,
        )? {
            self.outcome.num_readded += 1;
        }
        Ok(())
    }

    fn handle_dir_open(
        &mut self,
        entry: &ListEntry,
        os_name: &str,
        metadata: &mut EntryMetadata,
        params: &mut WalkParams<'_>,
    ) -> Result<()> {
        let line = self.line;

        if !self.indirchange && has_change(line, &params.diff.changed) {
            // Once a directory is marked changed every descendant is
            // forced-changed until the walk ascends back to this level.
            self.indirchange = true;
            self.changelevel = self.depth;
        }
        let dir_diff = if self.indirchange {
            false
        } else {
            has_change(line, &params.diff.dir_diffs)
        };

        if self.indirchange || dir_diff {
            for frame in &mut self.frames {
                frame.items += 1;
            }
        }

        self.curr_path.push('/');
        self.curr_path.push_str(&entry.name);
        self.curr_os_path.push('/');
        self.curr_os_path.push_str(os_name);

        if !metadata.has_orig_path() {
            self.curr_orig_path
                .push_str(&format!("{}{}", self.orig_sep, entry.name));
            metadata.orig_path = Some(self.curr_orig_path.clone());
        }

        let rel = self.curr_os_path.clone();
        let mut dir_linked = false;

        if params.settings.use_directory_links
            && has_change(line, &params.diff.large_unchanged_subtrees)
        {
            if let Some(pool) = params.dir_pool.as_deref_mut() {
                let src = local_path(&params.state.base_backup_path, &rel);
                let dst = local_path(&params.state.new_backup_path, &rel);
                if pool.link_directory(&src, &dst)? {
                    dir_linked = true;
                    self.skip_dir_completely = 1;
                    self.outcome.actions.insert(line, FileAction::Linked);

                    let src_hashes = local_path(&params.state.base_hash_path, &rel);
                    let dst_hashes = local_path(&params.state.new_hash_path, &rel);
                    let curr_has_hashes = match pool.link_directory(&src_hashes, &dst_hashes) {
                        Ok(linked) => linked,
                        Err(e) => {
                            warn!(src = %src_hashes.display(), error = %e, "could not pool-link hashfile subtree, treating it as hashfile-less");
                            false
                        }
                    };

                    if params.copy_last_entries {
                        self.copy_subtree_entries(
                            params,
                            &src,
                            &dst,
                            &src_hashes,
                            &dst_hashes,
                            curr_has_hashes,
                        )?;
                        self.skip_dir_copy_sparse = false;
                    } else {
                        self.skip_dir_copy_sparse = self.readd_sparse_enabled;
                    }
                }
            }
        }

        if !dir_linked && (!params.state.use_snapshots || self.indirchange || dir_diff) {
            self.materialize_directory(entry, metadata, &rel, dir_diff, params)?;
        }
        self.outcome
            .actions
            .entry(line)
            .or_insert(FileAction::Skipped);

        self.frames.push(DirFrame::new(dir_diff));
        self.depth += 1;

        if self.depth == 1 {
            if let (Some(id), Some(next)) = (
                entry.extras.get("sequence_id"),
                entry.extras.get("sequence_next"),
            ) {
                params.state.continuous_sequences.insert(
                    entry.name.clone(),
                    SequenceInfo {
                        id: id.parse().unwrap_or(0),
                        next: next.parse().unwrap_or(0),
                    },
                );
            }
        }
        Ok(())
    }

    fn copy_subtree_entries(
        &mut self,
        params: &mut WalkParams<'_>,
        src: &Path,
        dst: &Path,
        src_hashes: &Path,
        dst_hashes: &Path,
        curr_has_hashes: bool,
    ) -> Result<()> {
        for prev in params.store.entries_under(src) {
            let Ok(tail) = prev.full_path.strip_prefix(src) else {
                continue;
            };
            if tail.as_os_str().is_empty() {
                continue;
            }
            // An empty hash path records "no hashfile" for this entry.
            let hash_path = if curr_has_hashes {
                prev.hash_path
                    .strip_prefix(src_hashes)
                    .map(|t| dst_hashes.join(t))
                    .unwrap_or_default()
            } else {
                PathBuf::new()
            };
            params.store.add_entry(
                &FileEntry {
                    full_path: dst.join(tail),
                    hash_path,
                    file_hash: prev.file_hash,
                    file_size: prev.file_size,
                    recv_size: prev.recv_size,
                },
                params.state.incremental_num,
            )?;
            self.outcome.num_copied += 1;
        }
        Ok(())
    }

    fn materialize_directory(
        &mut self,
        entry: &ListEntry,
        metadata: &EntryMetadata,
        rel: &str,
        dir_diff: bool,
        params: &mut WalkParams<'_>,
    ) -> Result<()> {
        let dst = local_path(&params.state.new_backup_path, rel);
        let dst_hash_dir = local_path(&params.state.new_hash_path, rel);
        let snapshot_reuse = dir_diff && params.state.use_snapshots;

        if let Some(target) = entry.extras.get("sym_target") {
            if snapshot_reuse {
                if let Err(e) = platform_fs::remove_dir_symlink(&dst) {
                    error!(path = %dst.display(), error = %e, "could not remove stale directory symlink");
                    self.outcome.has_error = true;
                    return Ok(());
                }
            }
            if let Err(e) = platform_fs::symlink_dir(Path::new(target), &dst) {
                error!(path = %dst.display(), link_target = %target, error = %e, "creating directory symlink failed");
                self.outcome.has_error = true;
            }
            return Ok(());
        }

        // In a snapshot the unchanged-content directory already exists.
        if !snapshot_reuse {
            if let Err(e) = std::fs::create_dir_all(&dst) {
                error!(path = %dst.display(), error = %e, "creating directory failed");
                self.outcome.has_error = true;
                return Ok(());
            }
        }
        if let Err(e) = std::fs::create_dir_all(&dst_hash_dir) {
            error!(path = %dst_hash_dir.display(), error = %e, "creating hash directory failed");
            self.outcome.has_error = true;
            return Ok(());
        }

        let metadata_fn = dst_hash_dir.join(METADATA_DIR_FN);
        if snapshot_reuse {
            // Stale record from the snapshotted previous run.
            if metadata_fn.exists() {
                if let Err(e) = std::fs::remove_file(&metadata_fn) {
                    error!(path = %metadata_fn.display(), error = %e, "could not delete stale metadata record");
                    self.outcome.has_error = true;
                    return Ok(());
                }
            }
        }

        if !self.indirchange && !dir_diff {
            let src_meta =
                local_path(&params.state.base_hash_path, rel).join(METADATA_DIR_FN);
            if src_meta.exists() {
                if let Err(e) = carry_over_metadata(&src_meta, &metadata_fn, params.space_cb) {
                    warn!(src = %src_meta.display(), error = %e, "could not carry over directory metadata");
                }
            }
        } else if let Err(e) = write_metadata_file(&metadata_fn, metadata, params.space_cb) {
            error!(path = %metadata_fn.display(), error = %e, "writing directory metadata failed");
            self.outcome.has_error = true;
        }
        Ok(())
    }

    fn handle_dir_close(
        &mut self,
        entry: &ListEntry,
        metadata: &EntryMetadata,
        params: &mut WalkParams<'_>,
    ) -> Result<()> {
        if self.frames.len() <= 1 {
            error!("unbalanced directory-up entry in listing");
            self.outcome.has_error = true;
            return Ok(());
        }
        let frame = self.frames.pop().expect("checked above");

        // A directory record travels when the directory itself differed
        // or any descendant changed (the item counter tracks those).
        if self.indirchange || frame.dir_diff || frame.items > 0 {
            // The directory's metadata record travels with its
            // accumulated item count.
            let mut dir_metadata = EntryMetadata::from_entry(entry);
            dir_metadata.orig_path = Some(self.curr_orig_path.clone());
            dir_metadata.item_count = Some(frame.items);
            let job = DownloadJob {
                line: None,
                kind: TransferKind::DirMetadata,
                remote_path: self.curr_path.trim_start_matches('/').to_string(),
                dest: local_path(&params.state.new_hash_path, &self.curr_os_path)
                    .join(METADATA_DIR_FN),
                hash_dest: PathBuf::new(),
                prev_file: None,
                prev_hashes: None,
                size: 0,
                metadata: dir_metadata,
            };
            if !params.downloads.queue(job) {
                self.outcome.has_error = true;
            }
        }

        self.depth -= 1;
        if self.indirchange && self.depth == self.changelevel {
            self.indirchange = false;
        }
        pop_component(&mut self.curr_path);
        pop_component(&mut self.curr_os_path);
        if !metadata.has_orig_path() {
            let sep = self.orig_sep.clone();
            pop_orig_component(&mut self.curr_orig_path, &sep);
        }
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn handle_file(
        &mut self,
        entry: &ListEntry,
        os_name: &str,
        metadata: &mut EntryMetadata,
        params: &mut WalkParams<'_>,
    ) -> Result<()> {
        let line = self.line;
        let rel = format!("{}/{}", self.curr_os_path, os_name);
        let virtual_path = format!("{}/{}", self.curr_path, entry.name);

        let src = local_path(&params.state.base_backup_path, &rel);
        let dst = local_path(&params.state.new_backup_path, &rel);
        let hash_src = local_path(&params.state.base_hash_path, &rel);
        let hash_dst = local_path(&params.state.new_hash_path, &rel);

        if !metadata.has_orig_path() {
            metadata.orig_path =
                Some(format!("{}{}{}", self.curr_orig_path, self.orig_sep, entry.name));
        }

        let curr_hash = client_hash(entry, params.settings);

        let mut copy_entry = false;
        let mut curr_has_hash = true;
        let mut readd_sparse = false;
        let mut download_metadata = false;

        if let Some(target) = entry.extras.get("sym_target") {
            if let Err(e) = platform_fs::symlink_file(Path::new(target), &dst) {
                error!(path = %dst.display(), link_target = %target, error = %e, "creating symlink failed");
                self.outcome.has_error = true;
                self.outcome.actions.insert(line, FileAction::Dropped);
                return Ok(());
            }
            self.outcome.actions.insert(line, FileAction::Symlink);
            download_metadata = true;
        } else if entry.extras.contains_key("special") {
            // Device nodes, fifos and friends become empty sentinel
            // files; their nature travels in the metadata record.
            if let Err(e) = File::create(&dst) {
                error!(path = %dst.display(), error = %e, "creating sentinel file failed");
                self.outcome.has_error = true;
                self.outcome.actions.insert(line, FileAction::Dropped);
                return Ok(());
            }
            self.outcome.actions.insert(line, FileAction::Special);
            download_metadata = true;
        } else if self.indirchange || has_change(line, &params.diff.changed) {
            let mut linked = false;
            if let Some(hash) = curr_hash {
                if let Some(hit) = linker::link_by_hash(
                    params.index,
                    &hash,
                    entry.size.max(0) as u64,
                    &dst,
                    params.settings.use_reflinks,
                    params.space_cb,
                )? {
                    self.after_hash_link(&hit, &dst, &hash_dst, params)?;
                    self.outcome.linked_bytes += entry.size.max(0) as u64;
                    self.outcome.actions.insert(line, FileAction::Linked);
                    download_metadata = true;
                    linked = true;
                }
            }
            if !linked {
                if !params.state.offline || has_change(line, &params.diff.modified_inplace) {
                    self.enqueue_body(entry, metadata, &rel, &virtual_path, params);
                } else {
                    self.outcome.download_nok.push(line);
                    self.outcome.actions.insert(line, FileAction::Dropped);
                }
            }
        } else if !params.state.use_snapshots {
            let link_result = if params.settings.use_reflinks
                && platform_fs::reflink(&src, &dst).is_ok()
            {
                Ok(())
            } else {
                platform_fs::create_hardlink(&src, &dst)
            };

            match link_result {
                Ok(()) => {
                    copy_entry = params.copy_last_entries;
                    readd_sparse = self.readd_sparse_enabled;
                    curr_has_hash = platform_fs::create_hardlink(&hash_src, &hash_dst).is_ok();
                    self.outcome.actions.insert(line, FileAction::Linked);
                    self.outcome.linked_bytes += entry.size.max(0) as u64;
                }
                Err(e) if platform_fs::is_too_many_links(&e) => {
                    debug!(src = %src.display(), "hardlink limit reached, copying file and hashes");
                    match linker::copy_file_with_hashes(
                        &src,
                        &dst,
                        &hash_src,
                        &hash_dst,
                        params.space_cb,
                    ) {
                        Ok(copied_hashes) => {
                            curr_has_hash = copied_hashes;
                            copy_entry = params.copy_last_entries;
                            readd_sparse = self.readd_sparse_enabled;
                            self.outcome.actions.insert(line, FileAction::Copied);
                            self.outcome.linked_bytes += entry.size.max(0) as u64;
                        }
                        Err(e) => {
                            error!(src = %src.display(), error = %e, "copy fallback failed");
                            self.outcome.has_error = true;
                            self.outcome.actions.insert(line, FileAction::Dropped);
                        }
                    }
                }
                Err(e) => {
                    if self.link_log_count < 5 {
                        warn!(src = %src.display(), dst = %dst.display(), error = %e, "hardlink failed, loading file");
                    } else if self.link_log_count == 5 {
                        warn!("more hardlink failures follow; suppressing further warnings");
                    }
                    self.link_log_count += 1;

                    let mut linked = false;
                    if let Some(hash) = curr_hash {
                        if let Some(hit) = linker::link_by_hash(
                            params.index,
                            &hash,
                            entry.size.max(0) as u64,
                            &dst,
                            params.settings.use_reflinks,
                            params.space_cb,
                        )? {
                            self.after_hash_link(&hit, &dst, &hash_dst, params)?;
                            copy_entry = params.copy_last_entries;
                            readd_sparse = self.readd_sparse_enabled;
                            self.outcome.linked_bytes += entry.size.max(0) as u64;
                            self.outcome.actions.insert(line, FileAction::Linked);
                            download_metadata = true;
                            linked = true;
                        }
                    }
                    if !linked {
                        self.enqueue_body(entry, metadata, &rel, &virtual_path, params);
                    }
                }
            }
        } else {
            // Snapshots carry unchanged files implicitly.
            copy_entry = params.copy_last_entries;
            readd_sparse = self.readd_sparse_enabled;
            self.outcome.actions.insert(line, FileAction::Skipped);
        }

        if copy_entry {
            if let Some(prev) = params.store.entry_for_path(&src) {
                params.store.add_entry(
                    &FileEntry {
                        full_path: dst.clone(),
                        hash_path: if curr_has_hash {
                            hash_dst.clone()
                        } else {
                            PathBuf::new()
                        },
                        file_hash: prev.file_hash,
                        file_size: prev.file_size,
                        recv_size: prev.recv_size,
                    },
                    params.state.incremental_num,
                )?;
                self.outcome.num_copied += 1;
                readd_sparse = false;
            }
        }

        if readd_sparse {
            let readd_params = SparseReaddParams {
                modulo: params.settings.readd_modulo,
                incremental: params.state.incremental_num,
                trust_client_hashes: params.settings.trust_client_hashes,
            };
            if add_sparse_file_entry(
                &virtual_path,
                entry.size,
                &dst,
                curr_has_hash.then_some(hash_dst.as_path()),
                curr_hash,
                &readd_params,
                params.store,
                params.hash_queue,
            )? {
                self.outcome.num_readded += 1;
            }
        }

        if download_metadata {
            for frame in &mut self.frames {
                frame.items += 1;
            }
            let job = DownloadJob {
                line: Some(line),
                kind: TransferKind::MetadataOnly,
                remote_path: virtual_path.trim_start_matches('/').to_string(),
                dest: dst,
                hash_dest: PathBuf::new(),
                prev_file: None,
                prev_hashes: None,
                size: 0,
                metadata: metadata.clone(),
            };
            if !params.downloads.queue(job) {
                self.outcome.has_error = true;
            }
        }
        Ok(())
    }

    /// Bookkeeping after a successful hash-index link: carry the
    /// matched file's hashfile next to the new file and register an
    /// entry row for the new path.
    fn after_hash_link(
        &mut self,
        hit: &FileEntry,
        dst: &Path,
        hash_dst: &Path,
        params: &mut WalkParams<'_>,
    ) -> Result<()> {
        let mut carried = false;
        if !hit.hash_path.as_os_str().is_empty() && hit.hash_path.exists() {
            match linker::copy_file(&hit.hash_path, hash_dst, params.space_cb) {
                Ok(()) => carried = true,
                Err(e) => {
                    warn!(src = %hit.hash_path.display(), error = %e, "could not carry hashfile for linked file");
                }
            }
        }
        params.store.add_entry(
            &FileEntry {
                full_path: dst.to_path_buf(),
                hash_path: if carried {
                    hash_dst.to_path_buf()
                } else {
                    PathBuf::new()
                },
                file_hash: hit.file_hash,
                file_size: hit.file_size,
                recv_size: 0,
            },
            params.state.incremental_num,
        )?;
        Ok(())
    }

    fn enqueue_body(
        &mut self,
        entry: &ListEntry,
        metadata: &EntryMetadata,
        rel: &str,
        virtual_path: &str,
        params: &mut WalkParams<'_>,
    ) {
        for frame in &mut self.frames {
            frame.items += 1;
        }
        let chunked = params.settings.intra_file_diffs();
        let job = DownloadJob {
            line: Some(self.line),
            kind: if chunked {
                TransferKind::Chunked
            } else {
                TransferKind::Full
            },
            remote_path: virtual_path.trim_start_matches('/').to_string(),
            dest: local_path(&params.state.new_backup_path, rel),
            hash_dest: local_path(&params.state.new_hash_path, rel),
            prev_file: Some(local_path(&params.state.base_backup_path, rel)),
            prev_hashes: Some(local_path(&params.state.base_hash_path, rel)),
            size: entry.size,
            metadata: metadata.clone(),
        };
        if params.downloads.queue(job) {
            self.outcome.actions.insert(
                self.line,
                if chunked {
                    FileAction::QueuedChunked
                } else {
                    FileAction::QueuedFull
                },
            );
        } else {
            self.outcome.has_error = true;
            self.outcome.actions.insert(self.line, FileAction::Dropped);
        }
    }
}

impl Default for TreeWalker {
    fn default() -> Self {
        Self::new()
    }
}

fn client_hash(entry: &ListEntry, settings: &ServerSettings) -> Option<FileHash> {
    if !settings.client_hashes {
        return None;
    }
    entry
        .extras
        .get("sha512")
        .and_then(|s| hex::decode(s).ok())
        .and_then(|bytes| FileHash::from_slice(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_components_pop_cleanly() {
        let mut p = "/a/b/c".to_string();
        pop_component(&mut p);
        assert_eq!(p, "/a/b");
        pop_component(&mut p);
        pop_component(&mut p);
        assert_eq!(p, "");
    }

    #[test]
    fn orig_path_pops_with_client_separator() {
        let mut p = "C:\\users\\bob".to_string();
        pop_orig_component(&mut p, "\\");
        assert_eq!(p, "C:\\users");
    }

    #[test]
    fn local_path_strips_leading_slash() {
        assert_eq!(
            local_path(Path::new("/backups/c1/250801-0101"), "/docs/a.txt"),
            PathBuf::from("/backups/c1/250801-0101/docs/a.txt")
        );
    }
}
