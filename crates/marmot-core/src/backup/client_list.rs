use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use rand::Rng;
use tracing::debug;

use super::diff::has_change;
use super::download::DownloadScheduler;
use crate::error::Result;
use crate::list::parser::ListParser;
use crate::list::writer::write_entry;

/// Parameters for rewriting the incoming listing into the sealed
/// client list.
pub struct ClientListRewrite<'a> {
    pub downloads: &'a DownloadScheduler,
    /// Lines the walker could not even enqueue (offline), sorted.
    pub download_nok: &'a [usize],
    pub dir_diffs: &'a [usize],
    /// Scramble changed directories' modified times so the next
    /// incremental re-diffs them (set when the run ended offline or
    /// metadata downloads failed).
    pub scramble_changed_dirs: bool,
}

/// Write the final client list: the input listing minus entries whose
/// download failed, with partially transferred entries' modified times
/// multiplied by a per-run random factor.
///
/// The scrambled time makes the entry compare unequal on the next run,
/// forcing a re-diff; for positive times the result is strictly greater
/// than the source value.
pub fn write_client_list(src: &Path, dst: &Path, params: &ClientListRewrite<'_>) -> Result<()> {
    let mut reader = BufReader::new(File::open(src)?);
    let mut writer = BufWriter::new(File::create(dst)?);
    let mut parser = ListParser::new();
    let mut buf = [0u8; 4096];
    let mut line = 0usize;

    // One factor per run, like the original; at least 2 so scrambled
    // times actually move.
    let factor: i64 = rand::thread_rng().gen_range(2..=i64::from(i32::MAX));
    let mut dropped = 0usize;

    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        for &b in &buf[..read] {
            let Some(mut entry) = parser.feed(b) else {
                continue;
            };

            if entry.is_dir_up() {
                write_entry(&mut writer, &entry)?;
                continue;
            }

            if entry.is_dir {
                if params.scramble_changed_dirs && has_change(line, params.dir_diffs) {
                    entry.last_modified = entry.last_modified.saturating_mul(factor);
                }
                write_entry(&mut writer, &entry)?;
            } else if params.downloads.is_download_ok(line)
                && !has_change(line, params.download_nok)
            {
                if params.downloads.is_download_partial(line) {
                    entry.last_modified = entry.last_modified.saturating_mul(factor);
                }
                write_entry(&mut writer, &entry)?;
            } else {
                dropped += 1;
            }
            line += 1;
        }
    }

    writer.flush()?;
    if dropped > 0 {
        debug!(dropped, "omitted not-downloaded entries from client list");
    }
    Ok(())
}
