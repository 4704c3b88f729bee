use std::fs::File;
use std::io;
use std::path::Path;

/// Create a hard link, distinguishing "too many links to the inode" from
/// other failures so callers can fall back to a byte copy.
pub fn create_hardlink(original: &Path, link: &Path) -> io::Result<()> {
    std::fs::hard_link(original, link)
}

/// `true` when a hardlink failed because the inode's link count is
/// exhausted. Expected on filesystems with low link limits; handled by
/// copy fallback, not treated as an error.
pub fn is_too_many_links(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::TooManyLinks
}

/// Punch a hole into an open file, deallocating the byte range while
/// keeping the file size. Fails with `Unsupported` where the platform or
/// filesystem cannot do it; callers fall back to writing zeros.
#[cfg(target_os = "linux")]
pub fn punch_hole(file: &File, offset: u64, len: u64) -> io::Result<()> {
    use rustix::fs::{fallocate, FallocateFlags};

    fallocate(
        file,
        FallocateFlags::PUNCH_HOLE | FallocateFlags::KEEP_SIZE,
        offset,
        len,
    )
    .map_err(io::Error::from)
}

#[cfg(not(target_os = "linux"))]
pub fn punch_hole(_file: &File, _offset: u64, _len: u64) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "hole punching not supported on this platform",
    ))
}

/// Clone file contents via reflink where the filesystem supports it.
#[cfg(target_os = "linux")]
pub fn reflink(src: &Path, dst: &Path) -> io::Result<()> {
    let src_file = File::open(src)?;
    let dst_file = File::create(dst)?;
    rustix::fs::ioctl_ficlone(&dst_file, &src_file).map_err(io::Error::from)
}

#[cfg(not(target_os = "linux"))]
pub fn reflink(_src: &Path, _dst: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "reflinks not supported on this platform",
    ))
}

/// Create a symbolic link pointing at a file.
pub fn symlink_file(target: &Path, link: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link)
    }
    #[cfg(windows)]
    {
        std::os::windows::fs::symlink_file(target, link)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (target, link);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "symlinks not supported on this platform",
        ))
    }
}

/// Create a symbolic link pointing at a directory.
pub fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link)
    }
    #[cfg(windows)]
    {
        std::os::windows::fs::symlink_dir(target, link)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (target, link);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "symlinks not supported on this platform",
        ))
    }
}

/// Remove a directory symlink if present. Missing links are fine.
pub fn remove_dir_symlink(link: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(link) {
        Ok(meta) if meta.file_type().is_symlink() => {
            #[cfg(windows)]
            {
                std::fs::remove_dir(link)
            }
            #[cfg(not(windows))]
            {
                std::fs::remove_file(link)
            }
        }
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("'{}' exists and is not a symlink", link.display()),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Point `link` at `target`, replacing any previous symlink atomically
/// enough for the single-writer backup process.
pub fn repoint_dir_symlink(target: &Path, link: &Path) -> io::Result<()> {
    remove_dir_symlink(link)?;
    symlink_dir(target, link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    #[test]
    fn hardlink_shares_content() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"payload").unwrap();
        create_hardlink(&a, &b).unwrap();
        assert_eq!(std::fs::read(&b).unwrap(), b"payload");
    }

    #[test]
    fn too_many_links_matches_emlink_only() {
        let emlink = io::Error::from_raw_os_error(31);
        assert!(is_too_many_links(&emlink));
        let enoent = io::Error::from_raw_os_error(2);
        assert!(!is_too_many_links(&enoent));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn punch_hole_zeroes_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("holey");
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        f.write_all(&[0xFFu8; 8192]).unwrap();

        // Not every CI filesystem supports PUNCH_HOLE; skip if it doesn't.
        if punch_hole(&f, 0, 4096).is_err() {
            return;
        }

        f.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = vec![0u8; 8192];
        f.read_exact(&mut buf).unwrap();
        assert!(buf[..4096].iter().all(|&b| b == 0));
        assert!(buf[4096..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn repoint_replaces_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let t1 = dir.path().join("t1");
        let t2 = dir.path().join("t2");
        std::fs::create_dir(&t1).unwrap();
        std::fs::create_dir(&t2).unwrap();
        let link = dir.path().join("current");

        repoint_dir_symlink(&t1, &link).unwrap();
        assert_eq!(std::fs::read_link(&link).unwrap(), t1);
        repoint_dir_symlink(&t2, &link).unwrap();
        assert_eq!(std::fs::read_link(&link).unwrap(), t2);
    }

    #[test]
    fn remove_dir_symlink_refuses_real_dir() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        std::fs::create_dir(&real).unwrap();
        assert!(remove_dir_symlink(&real).is_err());
    }
}
