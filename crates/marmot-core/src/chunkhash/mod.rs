pub mod hasher;
pub mod sparse;
pub mod writer;

use std::fs::File;
use std::io::Read;

use crate::error::{BackupError, Result};

/// Size of one small chunk, identified by its adler-32 hash.
pub const SMALL_CHUNK_SIZE: usize = 512;

/// Size of one big chunk, identified by its MD5 hash.
pub const BIG_CHUNK_SIZE: u64 = 512 * 1024;

/// Number of small-hash slots in one hashfile record.
pub const SMALL_HASHES_PER_BIG: usize = (BIG_CHUNK_SIZE / SMALL_CHUNK_SIZE as u64) as usize;

pub const BIG_HASH_SIZE: usize = 16;
pub const SMALL_HASH_SIZE: usize = 4;

/// One full hashfile record: `[ MD5(16) | adler(4) x 1024 ]`.
pub const CHUNKHASH_RECORD_SIZE: usize = BIG_HASH_SIZE + SMALL_HASHES_PER_BIG * SMALL_HASH_SIZE;

/// The hashfile starts with the source file size as a little-endian u64.
pub const HASHFILE_PREFIX_SIZE: usize = 8;

/// Expected size of a hashfile covering `file_size` source bytes.
///
/// The final record is truncated to the small-hash slots actually covered
/// by the tail partial big chunk.
pub fn hashfile_size(file_size: u64) -> u64 {
    let full_records = file_size / BIG_CHUNK_SIZE;
    let tail = file_size % BIG_CHUNK_SIZE;
    let mut size = HASHFILE_PREFIX_SIZE as u64 + full_records * CHUNKHASH_RECORD_SIZE as u64;
    if tail > 0 {
        let tail_smalls = tail.div_ceil(SMALL_CHUNK_SIZE as u64);
        size += BIG_HASH_SIZE as u64 + tail_smalls * SMALL_HASH_SIZE as u64;
    }
    size
}

/// Read the authoritative source-size prefix from an open hashfile.
///
/// The prefix is authoritative; readers must not infer the source size
/// from the hashfile length.
pub fn read_size_prefix(hashfile: &mut File) -> Result<u64> {
    let mut buf = [0u8; HASHFILE_PREFIX_SIZE];
    hashfile
        .read_exact(&mut buf)
        .map_err(|e| BackupError::InvalidHashfile(format!("short size prefix: {e}")))?;
    Ok(u64::from_le_bytes(buf))
}
