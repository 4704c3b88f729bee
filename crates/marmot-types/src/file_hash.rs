use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A 64-byte whole-file content hash (SHA-512).
///
/// Used as the lookup key for hash-based file reuse; equality means the
/// file bodies (including their sparse layout) are interchangeable.
/// Serializes as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHash(pub [u8; 64]);

impl FileHash {
    pub const LEN: usize = 64;

    /// Build a hash from a raw digest slice. Returns `None` if the slice
    /// is not exactly 64 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::LEN {
            return None;
        }
        let mut out = [0u8; Self::LEN];
        out.copy_from_slice(bytes);
        Some(FileHash(out))
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// Hex-encode the full digest.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        hex::decode(s).ok().and_then(|b| Self::from_slice(&b))
    }
}

impl Serialize for FileHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for FileHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        FileHash::from_hex(&s)
            .ok_or_else(|| D::Error::custom("expected 128 hex characters of SHA-512 digest"))
    }
}

impl fmt::Debug for FileHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for FileHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}
