use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use tracing::{error, warn};

use super::diff::has_change;
use crate::error::{BackupError, Result};
use crate::list::parser::ListParser;

/// Filesystem snapshot/subvolume operations, provided by the deployment
/// (btrfs, ZFS, LVM, ...). Specified only by the interface the core
/// consumes.
pub trait SnapshotOps {
    /// Snapshot the previous backup's subvolume as the new backup path.
    fn snapshot_filesystem(&self, client: &str, base: &Path, new: &Path) -> Result<()>;

    /// Whether the path is a subvolume this helper manages.
    fn is_subvolume(&self, client: &str, path: &Path) -> bool;

    /// Create an empty subvolume (the downgrade path after a failed
    /// snapshot).
    fn create_empty_filesystem(&self, client: &str, path: &Path) -> Result<()>;
}

/// Remove the entries named by `deleted_ids` from a snapshot that
/// started as a copy of the previous backup.
///
/// Walks the previous listing to reconstruct on-disk names (including
/// the sibling-collision renames) and deletes files and whole
/// directories flagged as deleted. With `ignore_errors` a failed delete
/// is logged and skipped; otherwise it fails the operation.
pub fn delete_files_in_snapshot(
    listing: &Path,
    deleted_ids: &[usize],
    snapshot_root: &Path,
    ignore_errors: bool,
) -> Result<()> {
    let mut reader = BufReader::new(File::open(listing)?);
    let mut parser = ListParser::new();
    let mut buf = [0u8; 4096];

    let mut frames: Vec<HashSet<String>> = vec![HashSet::new()];
    let mut curr_os_path = PathBuf::from(snapshot_root);
    let mut curr_dir_exists = true;
    let mut line = 0usize;

    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        for &b in &buf[..read] {
            let Some(entry) = parser.feed(b) else {
                continue;
            };

            if entry.is_dir_up() {
                frames.pop();
                if frames.is_empty() {
                    return Err(BackupError::InvalidListing(
                        "unbalanced directory-up entry".into(),
                    ));
                }
                curr_os_path.pop();
                if !curr_dir_exists {
                    curr_dir_exists = curr_os_path.is_dir();
                }
                continue;
            }

            let os_name = fix_sibling_name(&entry.name, frames.last_mut().unwrap());

            if has_change(line, deleted_ids) {
                let target = curr_os_path.join(&os_name);
                if entry.is_dir {
                    if curr_dir_exists {
                        if let Err(e) = std::fs::remove_dir_all(&target) {
                            if ignore_errors {
                                warn!(path = %target.display(), error = %e, "could not remove directory from snapshot");
                            } else {
                                error!(path = %target.display(), error = %e, "could not remove directory from snapshot");
                                return Err(e.into());
                            }
                        }
                    }
                    curr_os_path.push(&os_name);
                    curr_dir_exists = false;
                    frames.push(HashSet::new());
                } else if curr_dir_exists {
                    if let Err(e) = std::fs::remove_file(&target) {
                        if e.kind() == std::io::ErrorKind::NotFound {
                            warn!(path = %target.display(), "file to delete was already gone");
                        } else if ignore_errors {
                            warn!(path = %target.display(), error = %e, "could not remove file from snapshot");
                        } else {
                            error!(path = %target.display(), error = %e, "could not remove file from snapshot");
                            return Err(e.into());
                        }
                    }
                }
            } else if entry.is_dir {
                curr_os_path.push(&os_name);
                frames.push(HashSet::new());
            }
            line += 1;
        }
    }
    Ok(())
}

/// De-duplicate sibling names the way the walker does, so snapshot
/// deletion sees the same on-disk names the original run produced.
pub(crate) fn fix_sibling_name(name: &str, seen: &mut HashSet<String>) -> String {
    let mut candidate = name.to_string();
    let mut suffix = 0u32;
    while !seen.insert(sibling_key(&candidate)) {
        suffix += 1;
        candidate = format!("{name}_{suffix}");
    }
    candidate
}

#[cfg(windows)]
fn sibling_key(name: &str) -> String {
    name.to_lowercase()
}

#[cfg(not(windows))]
fn sibling_key(name: &str) -> String {
    name.to_string()
}
