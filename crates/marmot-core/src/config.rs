use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How file bodies travel from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Whole files, no per-chunk negotiation.
    Raw,
    /// Chunked differential transfer driven by the hashfile grid.
    Blockhash,
}

impl Default for TransferMode {
    fn default() -> Self {
        TransferMode::Raw
    }
}

/// Backup group a run belongs to. The default and continuous groups get
/// their `current` / `continuous` aliases repointed on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupGroup {
    Default,
    Continuous,
    Other(i32),
}

impl Default for BackupGroup {
    fn default() -> Self {
        BackupGroup::Default
    }
}

impl BackupGroup {
    /// Suffix used in client-list file names; the default group has none.
    pub fn list_suffix(&self) -> String {
        match self {
            BackupGroup::Default => String::new(),
            BackupGroup::Continuous => "_1".to_string(),
            BackupGroup::Other(n) => format!("_{n}"),
        }
    }

    /// Name of the symbolic alias repointed at seal time, if any.
    pub fn alias(&self) -> Option<&'static str> {
        match self {
            BackupGroup::Default => Some("current"),
            BackupGroup::Continuous => Some("continuous"),
            BackupGroup::Other(_) => None,
        }
    }
}

/// Per-server tunables consumed by the incremental backup core.
///
/// Loading these from disk is the frontend's concern; the struct with its
/// serde defaults is the interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Root directory holding one subdirectory per client.
    pub backup_folder: PathBuf,

    /// Transfer mode for incremental runs.
    #[serde(default)]
    pub incr_transfer_mode: TransferMode,

    /// Take filesystem snapshots instead of hard-linking unchanged files.
    #[serde(default)]
    pub use_snapshots: bool,

    /// Use reflinks instead of hard links where the filesystem supports them.
    #[serde(default)]
    pub use_reflinks: bool,

    /// Batch-link large unchanged subtrees through the directory pool.
    #[serde(default = "default_true")]
    pub use_directory_links: bool,

    /// Accept client-computed whole-file hashes without re-hashing.
    #[serde(default)]
    pub trust_client_hashes: bool,

    /// Clients compute whole-file hashes and send them in the listing.
    #[serde(default = "default_true")]
    pub client_hashes: bool,

    /// Re-register large file entries periodically (see `readd_modulo`).
    #[serde(default = "default_true")]
    pub readd_file_entries: bool,

    /// A file re-registers whenever `adler32(path) % readd_modulo` equals
    /// the run's incremental number, bounding index drift.
    #[serde(default = "default_readd_modulo")]
    pub readd_modulo: i64,

    /// Re-hash every downloaded file before sealing the run.
    #[serde(default)]
    pub end_to_end_verification: bool,

    /// Verify downloads against the client-supplied hashes.
    #[serde(default)]
    pub verify_using_client_hashes: bool,
}

fn default_true() -> bool {
    true
}

fn default_readd_modulo() -> i64 {
    30
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            backup_folder: PathBuf::from("/var/backups/marmot"),
            incr_transfer_mode: TransferMode::default(),
            use_snapshots: false,
            use_reflinks: false,
            use_directory_links: true,
            trust_client_hashes: false,
            client_hashes: true,
            readd_file_entries: true,
            readd_modulo: default_readd_modulo(),
            end_to_end_verification: false,
            verify_using_client_hashes: false,
        }
    }
}

impl ServerSettings {
    /// Whether this run uses chunked differential transfers.
    pub fn intra_file_diffs(&self) -> bool {
        self.incr_transfer_mode == TransferMode::Blockhash
    }

    /// Whether verification runs before the client list is promoted.
    pub fn wants_verification(&self, online: bool) -> bool {
        self.end_to_end_verification
            || (online && self.verify_using_client_hashes && self.client_hashes)
    }
}
