use std::io::{ErrorKind, Write};
use std::time::Duration;

use tracing::warn;

use crate::error::{BackupError, Result};

/// Invoked when a sink reports that it is out of space.
///
/// `target` names the file being written. Returning `true` means space
/// was freed and the write should be retried.
pub trait SpaceCallback {
    fn handle_no_space(&self, target: &str) -> bool;
}

const WRITE_RETRIES: u32 = 50;
const RETRY_WAIT: Duration = Duration::from_secs(10);

/// Write `buf` completely to `sink`, or fail.
///
/// Short writes are always retried. A zero-byte write (or an explicit
/// out-of-space error) escalates to `cb` if one is given; without a
/// callback a bounded retry loop waits for space to reappear. A partial
/// write is never reported as success.
pub fn write_retry(
    sink: &mut impl Write,
    target: &str,
    buf: &[u8],
    cb: Option<&dyn SpaceCallback>,
) -> Result<()> {
    match cb {
        Some(cb) => write_with_callback(sink, target, buf, cb),
        None => write_repeat_tries(sink, target, buf),
    }
}

fn is_no_space(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::StorageFull | ErrorKind::QuotaExceeded)
}

fn write_with_callback(
    sink: &mut impl Write,
    target: &str,
    buf: &[u8],
    cb: &dyn SpaceCallback,
) -> Result<()> {
    let mut written = 0usize;
    while written < buf.len() {
        match sink.write(&buf[written..]) {
            Ok(0) => {
                if !cb.handle_no_space(target) {
                    return Err(BackupError::NoSpace(target.to_string()));
                }
            }
            Ok(n) => {
                written += n;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if is_no_space(&e) => {
                if !cb.handle_no_space(target) {
                    return Err(BackupError::NoSpace(target.to_string()));
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn write_repeat_tries(sink: &mut impl Write, target: &str, buf: &[u8]) -> Result<()> {
    let mut written = 0usize;
    let mut tries = WRITE_RETRIES;
    while written < buf.len() {
        match sink.write(&buf[written..]) {
            Ok(0) => {
                if tries == 0 {
                    return Err(BackupError::NoSpace(target.to_string()));
                }
                tries -= 1;
                warn!(path = %target, tries_left = tries, "zero-byte write, waiting for space");
                std::thread::sleep(RETRY_WAIT);
            }
            Ok(n) => {
                written += n;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if is_no_space(&e) => {
                if tries == 0 {
                    return Err(BackupError::NoSpace(target.to_string()));
                }
                tries -= 1;
                warn!(path = %target, tries_left = tries, "sink full, waiting for space");
                std::thread::sleep(RETRY_WAIT);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
