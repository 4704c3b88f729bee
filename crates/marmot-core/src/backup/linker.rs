use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use adler32::RollingAdler32;
use tracing::{debug, warn};

use marmot_types::file_hash::FileHash;

use crate::chunkhash::writer::{write_retry, SpaceCallback};
use crate::error::Result;
use crate::index::{FileEntry, HashIndex};
use crate::platform::fs as platform_fs;

/// Try to satisfy a file by linking an identical existing body found in
/// the hash index. On a miss nothing happens and `None` is returned; on
/// a hit the destination exists afterwards and the matched entry is
/// returned so the caller can copy its bookkeeping.
///
/// A hardlink that fails with "too many links to the inode" falls back
/// to a byte copy and still counts as linked.
pub fn link_by_hash(
    index: &dyn HashIndex,
    hash: &FileHash,
    size: u64,
    dest: &Path,
    use_reflinks: bool,
    cb: Option<&dyn SpaceCallback>,
) -> Result<Option<FileEntry>> {
    let Some(existing) = index.lookup(hash, size) else {
        return Ok(None);
    };

    if use_reflinks && platform_fs::reflink(&existing.full_path, dest).is_ok() {
        debug!(src = %existing.full_path.display(), dest = %dest.display(), "reflinked by hash");
        return Ok(Some(existing));
    }

    match platform_fs::create_hardlink(&existing.full_path, dest) {
        Ok(()) => {
            debug!(src = %existing.full_path.display(), dest = %dest.display(), "hardlinked by hash");
            Ok(Some(existing))
        }
        Err(e) if platform_fs::is_too_many_links(&e) => {
            debug!(src = %existing.full_path.display(), "hardlink limit reached, copying");
            copy_file(&existing.full_path, dest, cb)?;
            Ok(Some(existing))
        }
        Err(e) => {
            warn!(src = %existing.full_path.display(), error = %e, "hardlink by hash failed");
            Ok(None)
        }
    }
}

/// Byte copy honoring the no-space callback for every write.
pub fn copy_file(src: &Path, dst: &Path, cb: Option<&dyn SpaceCallback>) -> Result<()> {
    let mut reader = File::open(src)?;
    let mut writer = File::create(dst)?;
    let dst_name = dst.display().to_string();
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        write_retry(&mut writer, &dst_name, &buf[..n], cb)?;
    }
    Ok(())
}

/// Copy a file together with its sidecar hashfile (the too-many-links
/// fallback path). A missing hashfile is not an error; the caller then
/// treats the destination as hashfile-less.
pub fn copy_file_with_hashes(
    src: &Path,
    dst: &Path,
    hash_src: &Path,
    hash_dst: &Path,
    cb: Option<&dyn SpaceCallback>,
) -> Result<bool> {
    copy_file(src, dst, cb)?;
    if hash_src.exists() {
        copy_file(hash_src, hash_dst, cb)?;
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Directory-granularity reuse pool.
///
/// A pooled subtree is stored once under the pool root and referenced by
/// symlinks from every backup that shares it. Linking moves the source
/// subtree into the pool on first use (leaving a symlink behind) and
/// adds one more referencing symlink per subsequent backup.
pub struct DirectoryLinkPool {
    pool_root: PathBuf,
    refcounts: HashMap<PathBuf, u64>,
    counter: u64,
}

impl DirectoryLinkPool {
    pub fn new(pool_root: PathBuf) -> Self {
        DirectoryLinkPool {
            pool_root,
            refcounts: HashMap::new(),
            counter: 0,
        }
    }

    /// Substitute a single directory link for a recursive traversal of
    /// `src`. Returns `false` (without side effects) when `src` does not
    /// exist or pooling is impossible.
    pub fn link_directory(&mut self, src: &Path, dst: &Path) -> Result<bool> {
        let src_meta = match std::fs::symlink_metadata(src) {
            Ok(m) => m,
            Err(_) => return Ok(false),
        };

        let pool_entry = if src_meta.file_type().is_symlink() {
            // Already pooled: follow the existing reference.
            let target = std::fs::read_link(src)?;
            if !target.starts_with(&self.pool_root) {
                return Ok(false);
            }
            target
        } else if src_meta.is_dir() {
            let entry = self.new_pool_entry(src)?;
            std::fs::rename(src, &entry)?;
            platform_fs::symlink_dir(&entry, src)?;
            entry
        } else {
            return Ok(false);
        };

        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        platform_fs::symlink_dir(&pool_entry, dst)?;
        *self.refcounts.entry(pool_entry.clone()).or_insert(0) += 1;
        debug!(pool = %pool_entry.display(), dst = %dst.display(), "linked subtree from pool");
        Ok(true)
    }

    pub fn references(&self, pool_entry: &Path) -> u64 {
        self.refcounts.get(pool_entry).copied().unwrap_or(0)
    }

    fn new_pool_entry(&mut self, src: &Path) -> Result<PathBuf> {
        let key = RollingAdler32::from_buffer(src.as_os_str().as_encoded_bytes()).hash();
        // Two-hex-char shard directory keeps pool directories small.
        let shard = self.pool_root.join(format!("{:02x}", key & 0xFF));
        std::fs::create_dir_all(&shard)?;
        self.counter += 1;
        Ok(shard.join(format!("{key:08x}_{}", self.counter)))
    }
}
