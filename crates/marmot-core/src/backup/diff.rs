use std::path::Path;

use crate::error::Result;

/// Line-index sets produced by the tree-diff oracle for one pair of
/// listings. Every vector is sorted ascending; lines are the ordinal
/// positions of file-or-directory entries, directory-up entries are not
/// counted.
#[derive(Debug, Clone, Default)]
pub struct TreeDiff {
    /// Entries that changed (content or metadata) since the base listing.
    pub changed: Vec<usize>,
    /// Entries present in the base listing but gone from the current one.
    pub deleted: Vec<usize>,
    /// Changed entries that may be patched in place even when offline.
    pub modified_inplace: Vec<usize>,
    /// Directories whose whole subtree is unchanged and large enough to
    /// link through the directory pool.
    pub large_unchanged_subtrees: Vec<usize>,
    /// Directories whose own metadata changed.
    pub dir_diffs: Vec<usize>,
}

/// Binary search over a sorted line-index set.
pub fn has_change(line: usize, ids: &[usize]) -> bool {
    ids.binary_search(&line).is_ok()
}

/// The tree-diff primitive, treated as an oracle: given the previous and
/// current listing files it returns the classified line-index sets.
pub trait DiffOracle {
    fn diff_trees(
        &self,
        base_listing: &Path,
        curr_listing: &Path,
        want_deleted: bool,
        want_subtrees: bool,
    ) -> Result<TreeDiff>;
}
