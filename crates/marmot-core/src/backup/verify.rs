use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use tracing::{error, info};

use super::snapshot::fix_sibling_name;
use super::walker::local_path;
use super::BackupState;
use crate::chunkhash::hasher::{build_chunk_hashes, ChunkHashJob};
use crate::config::ServerSettings;
use crate::error::Result;
use crate::list::parser::ListParser;

/// Re-hash downloaded files and compare against the client-supplied
/// hashes before the client list is promoted.
///
/// Entries without a client hash cannot be checked and are skipped.
/// Returns `false` when any checked file is missing or mismatched.
pub fn verify_backup(
    listing: &Path,
    state: &BackupState,
    settings: &ServerSettings,
    should_verify: &dyn Fn(usize) -> bool,
) -> Result<bool> {
    let mut reader = BufReader::new(File::open(listing)?);
    let mut parser = ListParser::new();
    let mut buf = [0u8; 4096];

    let mut frames: Vec<HashSet<String>> = vec![HashSet::new()];
    let mut curr_os_path = String::new();
    let mut line = 0usize;
    let mut checked = 0u64;
    let mut failed = 0u64;

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
                    error!("unbalanced listing during verification");
                    return Ok(false);
                }
                if let Some(idx) = curr_os_path.rfind('/') {
                    curr_os_path.truncate(idx);
                }
                continue;
            }

            let os_name = fix_sibling_name(&entry.name, frames.last_mut().unwrap());

            if entry.is_dir {
                curr_os_path.push('/');
                curr_os_path.push_str(&os_name);
                frames.push(HashSet::new());
                line += 1;
                continue;
            }

            let verifiable = !entry.extras.contains_key("sym_target")
                && !entry.extras.contains_key("special");
            let client_hash = entry
                .extras
                .get("sha512")
                .and_then(|s| hex::decode(s).ok())
                .and_then(|b| marmot_types::file_hash::FileHash::from_slice(&b));

            if verifiable && should_verify(line) && settings.client_hashes {
                if let Some(expected) = client_hash {
                    let rel = format!("{curr_os_path}/{os_name}");
                    let path = local_path(&state.new_backup_path, &rel);
                    checked += 1;
                    match hash_file(&path) {
                        Ok(Some(actual)) if actual == expected => {}
                        Ok(Some(actual)) => {
                            error!(
                                path = %path.display(),
                                expected = %expected,
                                actual = %actual,
                                "verification hash mismatch"
                            );
                            failed += 1;
                        }
                        Ok(None) | Err(_) => {
                            error!(path = %path.display(), "verification could not hash file");
                            failed += 1;
                        }
                    }
                }
            }
            line += 1;
        }
    }

    info!(checked, failed, "backup verification finished");
    Ok(failed == 0)
}

fn hash_file(path: &Path) -> Result<Option<marmot_types::file_hash::FileHash>> {
    let mut src = File::open(path)?;
    let mut scratch = tempfile::tempfile()?;
    let mut job = ChunkHashJob::new(&mut src, &mut scratch);
    job.want_file_hash = true;
    Ok(build_chunk_hashes(job)?.file_hash)
}
