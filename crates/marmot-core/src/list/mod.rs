pub mod parser;
pub mod writer;

use std::collections::BTreeMap;

/// One decoded entry of a directory-listing stream.
///
/// Directory entries named `..` ascend one level; every other entry is a
/// file or a directory descent at the current level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListEntry {
    pub is_dir: bool,
    pub name: String,
    pub size: i64,
    pub last_modified: i64,
    /// Recognized keys: `sha512`, `sym_target`, `special`, `orig_path`,
    /// `orig_sep`, `sequence_id`, `sequence_next`.
    pub extras: BTreeMap<String, String>,
}

impl ListEntry {
    pub fn dir_up() -> Self {
        ListEntry {
            is_dir: true,
            name: "..".to_string(),
            ..Default::default()
        }
    }

    pub fn is_dir_up(&self) -> bool {
        self.is_dir && self.name == ".."
    }
}
