use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::chunkhash::writer::{write_retry, SpaceCallback};
use crate::error::Result;
use crate::list::ListEntry;
use crate::platform::fs as platform_fs;

/// Name of the per-directory metadata record inside the hashfile tree.
pub const METADATA_DIR_FN: &str = ".dir_metadata";

/// Metadata accompanying a listing entry into the backup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryMetadata {
    /// Path of the entry on the client, in the client's separator.
    pub orig_path: Option<String>,
    pub last_modified: i64,
    pub size: i64,
    /// Accumulated item count, set for directory records only.
    pub item_count: Option<u64>,
}

impl EntryMetadata {
    /// Extract the metadata the listing entry carries inline.
    pub fn from_entry(entry: &ListEntry) -> Self {
        EntryMetadata {
            orig_path: entry.extras.get("orig_path").cloned(),
            last_modified: entry.last_modified,
            size: if entry.is_dir { 0 } else { entry.size },
            item_count: None,
        }
    }

    pub fn has_orig_path(&self) -> bool {
        self.orig_path.is_some()
    }
}

/// Write a metadata record as `key=value` lines.
pub fn write_metadata_file(
    path: &Path,
    metadata: &EntryMetadata,
    cb: Option<&dyn SpaceCallback>,
) -> Result<()> {
    let mut fields = BTreeMap::new();
    if let Some(orig) = &metadata.orig_path {
        fields.insert("orig_path", orig.clone());
    }
    fields.insert("last_modified", metadata.last_modified.to_string());
    fields.insert("size", metadata.size.to_string());
    if let Some(items) = metadata.item_count {
        fields.insert("items", items.to_string());
    }

    let mut buf = Vec::new();
    for (key, value) in &fields {
        writeln!(buf, "{key}={value}")?;
    }

    let mut file = File::create(path)?;
    write_retry(&mut file, &path.display().to_string(), &buf, cb)
}

/// Read a metadata record back. Unknown keys are ignored.
pub fn read_metadata_file(path: &Path) -> Result<EntryMetadata> {
    let reader = BufReader::new(File::open(path)?);
    let mut metadata = EntryMetadata::default();
    for line in reader.lines() {
        let line = line?;
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "orig_path" => metadata.orig_path = Some(value.to_string()),
            "last_modified" => metadata.last_modified = value.parse().unwrap_or(0),
            "size" => metadata.size = value.parse().unwrap_or(0),
            "items" => metadata.item_count = value.parse().ok(),
            _ => {}
        }
    }
    Ok(metadata)
}

/// Carry an unchanged directory's metadata over from the previous backup:
/// hardlink where possible, byte copy otherwise. The copy consults the
/// no-space callback once before giving up.
pub fn carry_over_metadata(
    src: &Path,
    dst: &Path,
    cb: Option<&dyn SpaceCallback>,
) -> Result<()> {
    if platform_fs::create_hardlink(src, dst).is_ok() {
        return Ok(());
    }
    match std::fs::copy(src, dst) {
        Ok(_) => Ok(()),
        Err(e) => {
            if let Some(cb) = cb {
                if cb.handle_no_space(&dst.display().to_string()) {
                    std::fs::copy(src, dst)?;
                    return Ok(());
                }
            }
            Err(e.into())
        }
    }
}
