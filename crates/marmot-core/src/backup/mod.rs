pub mod client_list;
pub mod diff;
pub mod download;
pub mod hash_existing;
pub mod linker;
pub mod metadata;
pub mod snapshot;
pub mod sparse_readd;
pub mod verify;
pub mod walker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use chrono::Utc;
use tracing::{error, info, warn};

use marmot_types::backup_id::BackupId;

use crate::chunkhash::writer::SpaceCallback;
use crate::config::{BackupGroup, ServerSettings};
use crate::error::{BackupError, Result};
use crate::index::{EntryStore, HashIndex};
use crate::platform::fs as platform_fs;

use client_list::{write_client_list, ClientListRewrite};
use diff::{has_change, DiffOracle};
use download::{DownloadScheduler, FileTransport, TransferOutcome};
use hash_existing::HashExistingQueue;
use linker::DirectoryLinkPool;
use snapshot::{delete_files_in_snapshot, SnapshotOps};
use verify::verify_backup;
use walker::{TreeWalker, WalkOutcome, WalkParams};

/// Continuous-backup sequence bookkeeping from a top-level directory's
/// listing extras.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceInfo {
    pub id: i64,
    pub next: i64,
}

/// Mutable per-run state. Created when the run starts and sealed
/// (client-list rename, alias repoint) on success. Single-writer: the
/// walker mutates it, workers read paths through shared references
/// taken before spawn.
#[derive(Debug)]
pub struct BackupState {
    pub backup_id: BackupId,
    pub incremental_num: i64,
    pub base_backup_path: PathBuf,
    pub base_hash_path: PathBuf,
    pub new_backup_path: PathBuf,
    pub new_hash_path: PathBuf,
    /// May be downgraded mid-run when snapshot creation fails.
    pub use_snapshots: bool,
    pub offline: bool,
    pub had_error: bool,
    pub continuous_sequences: HashMap<String, SequenceInfo>,
}

/// Result of one incremental run.
#[derive(Debug)]
pub struct BackupOutcome {
    pub state: BackupState,
    pub walk: WalkOutcome,
    /// Whether the client list was promoted and aliases repointed.
    pub sealed: bool,
    /// Verification verdict, when verification ran.
    pub verified: Option<bool>,
}

/// Subdirectory of a backup holding the hashfile mirror.
pub const HASHES_DIR: &str = ".hashes";

/// Remote name of the listing the client serves.
const REMOTE_FILELIST: &str = "filelist.ub";

/// One incremental file backup run for a single client.
///
/// External collaborators arrive as trait objects: the transport, the
/// diff oracle, the snapshot helper and the entry store; the core owns
/// the walk, the workers and the sealing protocol.
pub struct IncrFileBackup<'a> {
    pub settings: &'a ServerSettings,
    pub client_name: &'a str,
    pub group: BackupGroup,
    pub oracle: &'a dyn DiffOracle,
    pub snapshots: Option<&'a dyn SnapshotOps>,
    pub store: &'a mut dyn EntryStore,
    pub index: &'a dyn HashIndex,
    pub space_cb: Option<&'a dyn SpaceCallback>,
    pub stop: &'a AtomicBool,
}

impl<'a> IncrFileBackup<'a> {
    /// Run the incremental backup to completion.
    ///
    /// Fails early only on connection loss, tree-diff failure and
    /// unrecoverable snapshot errors; everything else degrades and is
    /// reported through the returned outcome.
    pub fn run(self, mut transport: Box<dyn FileTransport>) -> Result<BackupOutcome> {
        let IncrFileBackup {
            settings,
            client_name,
            group,
            oracle,
            snapshots,
            store,
            index,
            space_cb,
            stop,
        } = self;

        info!(client = %client_name, "starting incremental file backup");

        let last = store
            .last_incremental(client_name, group)
            .ok_or(BackupError::FullBackupRequired)?;
        let resumed = !last.complete;
        let resumed_full = resumed && last.incremental == 0;
        let incremental_num = if resumed_full { 0 } else { last.incremental + 1 };
        if resumed {
            info!(client = %client_name, resumed_full, "resuming unfinished backup");
        }

        let client_root = settings.backup_folder.join(client_name);
        std::fs::create_dir_all(&client_root)?;
        let prev_list = client_root.join(format!("clientlist{}.ub", group.list_suffix()));
        let curr_list = client_root.join(format!("incoming{}.ub", group.list_suffix()));

        info!(client = %client_name, "loading file list");
        match transport.fetch_full(REMOTE_FILELIST, &curr_list)? {
            TransferOutcome::Complete => {}
            _ => {
                return Err(BackupError::ClientOffline(
                    "could not load the client file list".into(),
                ));
            }
        }

        info!(client = %client_name, "calculating file tree differences");
        let want_subtrees = !settings.use_snapshots && settings.use_directory_links;
        let diff = match oracle.diff_trees(
            &prev_list,
            &curr_list,
            settings.use_snapshots,
            want_subtrees,
        ) {
            Ok(diff) => diff,
            Err(e) => {
                // The client is reachable (the listing just arrived), so
                // the run restarts as a full backup instead of aborting.
                error!(error = %e, "tree diff failed, a full backup is required");
                return Err(BackupError::FullBackupRequired);
            }
        };

        let new_dir_name = Utc::now().format("%y%m%d-%H%M").to_string();
        let base_backup_path = client_root.join(&last.path);
        let base_hash_path = base_backup_path.join(HASHES_DIR);
        let new_backup_path = client_root.join(&new_dir_name);
        let new_hash_path = new_backup_path.join(HASHES_DIR);

        let backup_id = store.new_backup(client_name, incremental_num, &new_dir_name, resumed)?;

        let mut use_snapshots = settings.use_snapshots && snapshots.is_some();
        if use_snapshots {
            let snap = snapshots.expect("checked above");
            info!(client = %client_name, "creating snapshot");
            let snapshotted = snap
                .snapshot_filesystem(client_name, &base_backup_path, &new_backup_path)
                .is_ok()
                && snap.is_subvolume(client_name, &new_backup_path);
            if !snapshotted {
                warn!("creating snapshot failed, falling back to empty filesystem");
                snap.create_empty_filesystem(client_name, &new_backup_path)
                    .map_err(|e| BackupError::Snapshot(e.to_string()))?;
                std::fs::create_dir_all(&new_hash_path)?;
                use_snapshots = false;
            }
        }
        if !use_snapshots {
            std::fs::create_dir_all(&new_backup_path)?;
            std::fs::create_dir_all(&new_hash_path)?;
        }

        if use_snapshots && !diff.deleted.is_empty() {
            info!(deleted = diff.deleted.len(), "deleting files in snapshot");
            delete_files_in_snapshot(&prev_list, &diff.deleted, &new_backup_path, false)?;
            delete_files_in_snapshot(&prev_list, &diff.deleted, &new_hash_path, true)?;
        }

        let mut state = BackupState {
            backup_id,
            incremental_num,
            base_backup_path,
            base_hash_path,
            new_backup_path,
            new_hash_path,
            use_snapshots,
            offline: false,
            had_error: false,
            continuous_sequences: HashMap::new(),
        };

        // Workers: downloader first, then the existing-hash verifier.
        // They are joined in reverse start order.
        let downloads = DownloadScheduler::spawn(transport);
        let readd_sparse =
            settings.client_hashes && settings.readd_file_entries && !resumed_full;
        let mut hash_queue =
            (readd_sparse && !settings.trust_client_hashes).then(HashExistingQueue::spawn);

        let mut dir_pool = (!use_snapshots && settings.use_directory_links).then(|| {
            DirectoryLinkPool::new(settings.backup_folder.join(".directory_pool"))
        });

        info!(client = %client_name, "linking unchanged and loading new files");
        let walk = {
            let mut params = WalkParams {
                listing: &curr_list,
                diff: &diff,
                settings,
                state: &mut state,
                store: &mut *store,
                index,
                downloads: &downloads,
                hash_queue: hash_queue.as_ref(),
                dir_pool: dir_pool.as_mut(),
                space_cb,
                stop,
                copy_last_entries: resumed && !resumed_full,
                online: true,
            };
            TreeWalker::new().walk(&mut params)?
        };
        state.had_error |= walk.has_error;

        info!("waiting for file transfers");
        let mut downloads = downloads;
        if let Some(queue) = &hash_queue {
            queue.queue_stop(false);
        }
        downloads.queue_stop(false);
        if let Some(queue) = hash_queue.as_mut() {
            queue.join();
        }
        downloads.join();

        if downloads.is_offline() {
            state.offline = true;
        }

        let mut num_readded = walk.num_readded;
        if let Some(queue) = &hash_queue {
            num_readded += queue.flush_into(&mut *store, incremental_num)? as u64;
        }
        if num_readded > 0 {
            info!(num_readded, "re-added file entries");
        }
        if walk.num_copied > 0 {
            info!(copied = walk.num_copied, "copied file entries from last backup");
        }

        info!("writing new file list");
        let new_list = client_root.join(format!("clientlist{}.ub.new", group.list_suffix()));
        let metadata_ok = !downloads.has_metadata_error();
        write_client_list(
            &curr_list,
            &new_list,
            &ClientListRewrite {
                downloads: &downloads,
                download_nok: &walk.download_nok,
                dir_diffs: &diff.dir_diffs,
                scramble_changed_dirs: state.offline || !metadata_ok,
            },
        )?;

        let mut verified = None;
        if !state.offline && !state.had_error && settings.wants_verification(true) {
            info!("verifying backup");
            let ok = verify_backup(&curr_list, &state, settings, &|line| {
                downloads.is_download_ok(line) && !has_change(line, &walk.download_nok)
            })?;
            if !ok {
                error!("backup verification failed");
                state.had_error = true;
            }
            verified = Some(ok);
        }

        let mut sealed = false;
        if !state.offline && !state.had_error {
            std::fs::rename(&new_list, &prev_list)?;
            store.set_backup_done(backup_id)?;
            if let Some(alias) = group.alias() {
                let alias_path = client_root.join(alias);
                if let Err(e) =
                    platform_fs::repoint_dir_symlink(&state.new_backup_path, &alias_path)
                {
                    warn!(alias = %alias_path.display(), error = %e, "could not repoint backup alias");
                }
            }
            sealed = true;
            info!(client = %client_name, backup = %backup_id, "incremental backup finished");
        } else if !state.had_error {
            // Offline run: keep the partial list so linked and downloaded
            // entries survive, and leave the backup row open so the next
            // run resumes it.
            warn!("client disconnected while backing up, keeping partial state");
            std::fs::rename(&new_list, &prev_list)?;
        } else {
            error!("fatal error during backup, backup not completed");
        }

        let _ = std::fs::remove_file(&curr_list);

        Ok(BackupOutcome {
            state,
            walk,
            sealed,
            verified,
        })
    }
}
