use std::fs::{File, OpenOptions};
use std::path::Path;

use adler32::RollingAdler32;
use md5::{Digest, Md5};
use sha2::Sha512;

use marmot_types::file_hash::FileHash;

use crate::chunkhash::hasher::{build_chunk_hashes, ChunkHashJob, ChunkHashOutcome};
use crate::chunkhash::sparse::{sparse_chunk_record, SparseExtent};
use crate::chunkhash::{
    hashfile_size, BIG_CHUNK_SIZE, CHUNKHASH_RECORD_SIZE, SMALL_CHUNK_SIZE,
};

const MIB: usize = 1024 * 1024;

fn rw(path: &Path) -> File {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .unwrap()
}

fn hash_to_file(src_path: &Path, hash_path: &Path, want_file_hash: bool) -> ChunkHashOutcome {
    let mut src = File::open(src_path).unwrap();
    let mut hash_out = rw(hash_path);
    let mut job = ChunkHashJob::new(&mut src, &mut hash_out);
    job.want_file_hash = want_file_hash;
    build_chunk_hashes(job).unwrap()
}

/// Expected whole-file digest of a file that is one single sparse run.
fn all_sparse_digest(len: i64) -> FileHash {
    let mut extent_ctx = Sha512::new();
    extent_ctx.update(0i64.to_le_bytes());
    extent_ctx.update(len.to_le_bytes());
    let mut ctx = Sha512::new();
    ctx.update(extent_ctx.finalize());
    FileHash::from_slice(ctx.finalize().as_slice()).unwrap()
}

#[test]
fn all_zero_one_mib_file() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("zeros");
    std::fs::write(&src, vec![0u8; MIB]).unwrap();
    let hash_path = dir.path().join("zeros.hash");

    let outcome = hash_to_file(&src, &hash_path, true);

    let bytes = std::fs::read(&hash_path).unwrap();
    assert_eq!(bytes.len(), 8232);
    assert_eq!(
        u64::from_le_bytes(bytes[..8].try_into().unwrap()),
        MIB as u64
    );

    // Both big-chunk records must be bit-identical to the sparse template,
    // even though they were produced by the normal scan path.
    let record = sparse_chunk_record();
    assert_eq!(&bytes[8..8 + CHUNKHASH_RECORD_SIZE], record);
    assert_eq!(&bytes[8 + CHUNKHASH_RECORD_SIZE..], record);

    assert_eq!(outcome.file_hash.unwrap(), all_sparse_digest(MIB as i64));
}

#[test]
fn one_byte_file() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("one");
    std::fs::write(&src, b"A").unwrap();
    let hash_path = dir.path().join("one.hash");

    hash_to_file(&src, &hash_path, false);

    let bytes = std::fs::read(&hash_path).unwrap();
    assert_eq!(bytes.len(), 28);

    let mut expected = Vec::new();
    expected.extend_from_slice(&1u64.to_le_bytes());
    expected.extend_from_slice(Md5::digest(b"A").as_slice());
    expected.extend_from_slice(&RollingAdler32::from_buffer(b"A").hash().to_le_bytes());
    assert_eq!(bytes, expected);
}

#[test]
fn empty_file_is_just_the_size_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("empty");
    std::fs::write(&src, b"").unwrap();
    let hash_path = dir.path().join("empty.hash");

    let outcome = hash_to_file(&src, &hash_path, true);

    let bytes = std::fs::read(&hash_path).unwrap();
    assert_eq!(bytes, 0u64.to_le_bytes());
    assert_eq!(
        outcome.file_hash.unwrap(),
        FileHash::from_slice(Sha512::digest(b"").as_slice()).unwrap()
    );
}

#[test]
fn size_prefix_and_adler_coverage() {
    let dir = tempfile::tempdir().unwrap();
    let data: Vec<u8> = (0..700 * 1024).map(|i| (i % 251) as u8).collect();
    let src = dir.path().join("patterned");
    std::fs::write(&src, &data).unwrap();
    let hash_path = dir.path().join("patterned.hash");

    hash_to_file(&src, &hash_path, false);

    let bytes = std::fs::read(&hash_path).unwrap();
    assert_eq!(bytes.len() as u64, hashfile_size(data.len() as u64));
    assert_eq!(
        u64::from_le_bytes(bytes[..8].try_into().unwrap()),
        data.len() as u64
    );

    // Record count: ceil(700 KiB / 512 KiB) = 2.
    let big = BIG_CHUNK_SIZE as usize;
    assert_eq!(
        &bytes[8..8 + 16],
        Md5::digest(&data[..big]).as_slice(),
        "first record MD5"
    );
    let second_record = 8 + CHUNKHASH_RECORD_SIZE;
    assert_eq!(
        &bytes[second_record..second_record + 16],
        Md5::digest(&data[big..]).as_slice(),
        "tail record MD5"
    );

    // Spot-check adler slots in both records.
    for &slot in &[0usize, 1, 511, 1023] {
        let off = 8 + 16 + slot * 4;
        let chunk = &data[slot * SMALL_CHUNK_SIZE..(slot + 1) * SMALL_CHUNK_SIZE];
        assert_eq!(
            bytes[off..off + 4],
            RollingAdler32::from_buffer(chunk).hash().to_le_bytes(),
            "record 0 slot {slot}"
        );
    }
    let tail = &data[big..];
    for &slot in &[0usize, 100, 375] {
        let off = second_record + 16 + slot * 4;
        let start = slot * SMALL_CHUNK_SIZE;
        let end = (start + SMALL_CHUNK_SIZE).min(tail.len());
        assert_eq!(
            bytes[off..off + 4],
            RollingAdler32::from_buffer(&tail[start..end]).hash().to_le_bytes(),
            "tail record slot {slot}"
        );
    }
}

#[test]
fn known_sparse_extent_writes_template_and_zeroed_replica() {
    let dir = tempfile::tempdir().unwrap();
    let src_path = dir.path().join("sparse_src");
    std::fs::write(&src_path, vec![0u8; MIB]).unwrap();
    let hash_path = dir.path().join("sparse.hash");
    let replica_path = dir.path().join("replica");

    let mut src = File::open(&src_path).unwrap();
    let mut hash_out = rw(&hash_path);
    let mut replica = rw(&replica_path);
    let extents = vec![SparseExtent {
        offset: 0,
        size: MIB as u64,
    }];
    let mut extent_iter = extents.into_iter();

    let mut job = ChunkHashJob::new(&mut src, &mut hash_out);
    job.want_file_hash = true;
    job.replica = Some(&mut replica);
    job.extents = Some(&mut extent_iter);
    let outcome = build_chunk_hashes(job).unwrap();

    let bytes = std::fs::read(&hash_path).unwrap();
    let record = sparse_chunk_record();
    assert_eq!(bytes.len(), 8232);
    assert_eq!(&bytes[8..8 + CHUNKHASH_RECORD_SIZE], record);
    assert_eq!(&bytes[8 + CHUNKHASH_RECORD_SIZE..], record);

    // Punched or zero-filled, the replica must read back as 1 MiB of
    // zeros; the sparse watermark restores the size after punching.
    let replica_bytes = std::fs::read(&replica_path).unwrap();
    assert_eq!(replica_bytes.len(), MIB);
    assert!(replica_bytes.iter().all(|&b| b == 0));

    assert_eq!(outcome.file_hash.unwrap(), all_sparse_digest(MIB as i64));
}

#[test]
fn sparse_layout_changes_the_file_hash() {
    let dir = tempfile::tempdir().unwrap();
    let window = 32 * 1024;
    let data = vec![0x5Au8; window];
    let zeros = vec![0u8; window];

    let a_path = dir.path().join("a");
    let b_path = dir.path().join("b");
    std::fs::write(&a_path, [data.clone(), zeros.clone()].concat()).unwrap();
    std::fs::write(&b_path, [zeros, data].concat()).unwrap();

    let a = hash_to_file(&a_path, &dir.path().join("a.hash"), true);
    let b = hash_to_file(&b_path, &dir.path().join("b.hash"), true);

    // Identical non-sparse content, different sparse placement.
    assert_ne!(a.file_hash.unwrap(), b.file_hash.unwrap());
}

/// Two 512-byte chunks with equal adler-32 sums but different bytes:
/// `[0,1,1,0,...]` and `[1,0,0,1,...]` have the same byte sum and the
/// same weighted sum, hence the same checksum.
fn colliding_chunks() -> (Vec<u8>, Vec<u8>) {
    let mut old = vec![0u8; SMALL_CHUNK_SIZE];
    old[1] = 1;
    old[2] = 1;
    let mut new = vec![0u8; SMALL_CHUNK_SIZE];
    new[0] = 1;
    new[3] = 1;
    (old, new)
}

#[test]
fn inplace_rewrite_recovers_from_adler_collision() {
    let (old_c1, new_c1) = colliding_chunks();
    assert_eq!(
        RollingAdler32::from_buffer(&old_c1).hash(),
        RollingAdler32::from_buffer(&new_c1).hash(),
        "chunks must collide for this test"
    );
    assert_ne!(old_c1, new_c1);

    let dir = tempfile::tempdir().unwrap();
    let c0 = vec![0xAAu8; SMALL_CHUNK_SIZE];

    let old_path = dir.path().join("old");
    std::fs::write(&old_path, [c0.clone(), old_c1].concat()).unwrap();
    let new_path = dir.path().join("new");
    let new_content = [c0, new_c1.clone()].concat();
    std::fs::write(&new_path, &new_content).unwrap();

    // Previous hashfile from the old content.
    let prev_hash_path = dir.path().join("old.hash");
    hash_to_file(&old_path, &prev_hash_path, false);

    // The replica starts as the old content and gets patched in place.
    let replica_path = dir.path().join("replica");
    std::fs::copy(&old_path, &replica_path).unwrap();

    let mut src = File::open(&new_path).unwrap();
    let mut hash_out = rw(&dir.path().join("new.hash"));
    let mut prev_hashes = File::open(&prev_hash_path).unwrap();
    let mut replica = rw(&replica_path);

    let mut job = ChunkHashJob::new(&mut src, &mut hash_out);
    job.prev_hashes = Some(&mut prev_hashes);
    job.replica = Some(&mut replica);
    job.modify_inplace = true;
    let outcome = build_chunk_hashes(job).unwrap();

    // The optimistic per-small matching was unsound; the whole big chunk
    // must have been re-copied byte for byte.
    assert_eq!(std::fs::read(&replica_path).unwrap(), new_content);
    assert_eq!(outcome.inplace_written, new_content.len() as u64);

    // The new hashfile still describes the new content.
    let bytes = std::fs::read(dir.path().join("new.hash")).unwrap();
    assert_eq!(&bytes[8..24], Md5::digest(&new_content).as_slice());
    assert_eq!(
        bytes[24 + 4..24 + 8],
        RollingAdler32::from_buffer(&new_c1).hash().to_le_bytes()
    );
}

#[test]
fn inplace_rewrite_patches_only_changed_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let c0 = vec![0x11u8; SMALL_CHUNK_SIZE];
    let old_c1 = vec![0x22u8; SMALL_CHUNK_SIZE];
    let new_c1 = vec![0x33u8; SMALL_CHUNK_SIZE];

    let old_path = dir.path().join("old");
    std::fs::write(&old_path, [c0.clone(), old_c1].concat()).unwrap();
    let new_path = dir.path().join("new");
    let new_content = [c0, new_c1].concat();
    std::fs::write(&new_path, &new_content).unwrap();

    let prev_hash_path = dir.path().join("old.hash");
    hash_to_file(&old_path, &prev_hash_path, false);

    let replica_path = dir.path().join("replica");
    std::fs::copy(&old_path, &replica_path).unwrap();

    let mut src = File::open(&new_path).unwrap();
    let mut hash_out = rw(&dir.path().join("new.hash"));
    let mut prev_hashes = File::open(&prev_hash_path).unwrap();
    let mut replica = rw(&replica_path);

    let mut job = ChunkHashJob::new(&mut src, &mut hash_out);
    job.prev_hashes = Some(&mut prev_hashes);
    job.replica = Some(&mut replica);
    job.modify_inplace = true;
    let outcome = build_chunk_hashes(job).unwrap();

    assert_eq!(std::fs::read(&replica_path).unwrap(), new_content);
    // Only the second small chunk differed.
    assert_eq!(outcome.inplace_written, SMALL_CHUNK_SIZE as u64);
}

#[test]
fn inplace_without_previous_hashes_compares_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let content = vec![0x44u8; 3 * SMALL_CHUNK_SIZE];

    let src_path = dir.path().join("src");
    std::fs::write(&src_path, &content).unwrap();
    let replica_path = dir.path().join("replica");
    std::fs::copy(&src_path, &replica_path).unwrap();

    let mut src = File::open(&src_path).unwrap();
    let mut hash_out = rw(&dir.path().join("src.hash"));
    let mut replica = rw(&replica_path);

    let mut job = ChunkHashJob::new(&mut src, &mut hash_out);
    job.replica = Some(&mut replica);
    job.modify_inplace = true;
    let outcome = build_chunk_hashes(job).unwrap();

    // Identical replica: nothing rewritten.
    assert_eq!(outcome.inplace_written, 0);
    assert_eq!(std::fs::read(&replica_path).unwrap(), content);
}

#[test]
fn full_copy_replicates_every_byte() {
    let dir = tempfile::tempdir().unwrap();
    let content: Vec<u8> = (0..2000).map(|i| (i % 256) as u8).collect();

    let src_path = dir.path().join("src");
    std::fs::write(&src_path, &content).unwrap();
    let replica_path = dir.path().join("replica");

    let mut src = File::open(&src_path).unwrap();
    let mut hash_out = rw(&dir.path().join("src.hash"));
    let mut replica = rw(&replica_path);

    let mut job = ChunkHashJob::new(&mut src, &mut hash_out);
    job.replica = Some(&mut replica);
    let _ = build_chunk_hashes(job).unwrap();

    assert_eq!(std::fs::read(&replica_path).unwrap(), content);
}
