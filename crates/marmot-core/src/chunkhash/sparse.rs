use std::sync::LazyLock;

use adler32::RollingAdler32;
use md5::{Digest, Md5};

use super::{CHUNKHASH_RECORD_SIZE, SMALL_CHUNK_SIZE, SMALL_HASHES_PER_BIG};

/// A byte range of the source file known to be all zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseExtent {
    pub offset: u64,
    pub size: u64,
}

impl SparseExtent {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Ordered stream of known-sparse regions in a source file, as reported
/// by the filesystem or the client. Extents must be yielded in ascending
/// offset order.
pub trait ExtentIterator {
    fn next_extent(&mut self) -> Option<SparseExtent>;
}

/// Any ascending iterator of extents works as an extent source.
impl<I> ExtentIterator for I
where
    I: Iterator<Item = SparseExtent>,
{
    fn next_extent(&mut self) -> Option<SparseExtent> {
        self.next()
    }
}

static SPARSE_RECORD: LazyLock<Vec<u8>> = LazyLock::new(build_sparse_record);

/// The hashfile record of an all-zero big chunk.
///
/// Computed once per process and emitted bit-identically for every
/// known-sparse or detected-sparse big chunk.
pub fn sparse_chunk_record() -> &'static [u8] {
    &SPARSE_RECORD
}

fn build_sparse_record() -> Vec<u8> {
    let zeros = [0u8; SMALL_CHUNK_SIZE];
    let small_hash = RollingAdler32::from_buffer(&zeros).hash().to_le_bytes();

    let mut big_hash = Md5::new();
    for _ in 0..SMALL_HASHES_PER_BIG {
        big_hash.update(zeros);
    }

    let mut record = Vec::with_capacity(CHUNKHASH_RECORD_SIZE);
    record.extend_from_slice(&big_hash.finalize());
    for _ in 0..SMALL_HASHES_PER_BIG {
        record.extend_from_slice(&small_hash);
    }
    record
}
