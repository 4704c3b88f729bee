use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};

use adler32::RollingAdler32;
use md5::{Digest, Md5};
use sha2::Sha512;
use tracing::debug;

use marmot_types::file_hash::FileHash;

use super::sparse::{sparse_chunk_record, ExtentIterator, SparseExtent};
use super::writer::{write_retry, SpaceCallback};
use super::{
    BIG_CHUNK_SIZE, BIG_HASH_SIZE, CHUNKHASH_RECORD_SIZE, SMALL_CHUNK_SIZE, SMALL_HASH_SIZE,
};
use crate::error::Result;
use crate::platform::fs as platform_fs;

/// Window over which the whole-file hash accumulates and sparse runs are
/// detected a posteriori.
const FILE_HASH_WINDOW: usize = 32 * 1024;

/// Inputs for one chunk-hashing pass over a source file.
///
/// Disabled features are absent, not null: no replica means no replica
/// reconciliation, no extent iterator means no known-sparse fast path,
/// no previous hashfile means no small-hash reuse in inplace mode.
pub struct ChunkHashJob<'a> {
    pub src: &'a mut File,
    pub hash_out: &'a mut File,
    /// Hashfile of the previous version of this file, for inplace reuse.
    pub prev_hashes: Option<&'a mut File>,
    /// Out-of-date replica to patch into a copy of `src`.
    pub replica: Option<&'a mut File>,
    /// Patch the replica per small chunk instead of rewriting every byte.
    pub modify_inplace: bool,
    /// Compute the whole-file SHA-512 alongside the grid.
    pub want_file_hash: bool,
    pub extents: Option<&'a mut dyn ExtentIterator>,
    pub space_cb: Option<&'a dyn SpaceCallback>,
    /// Scan progress in percent.
    pub progress: Option<&'a mut dyn FnMut(u8)>,
}

impl<'a> ChunkHashJob<'a> {
    /// Hash `src` into `hash_out` with every optional feature disabled.
    pub fn new(src: &'a mut File, hash_out: &'a mut File) -> Self {
        Self {
            src,
            hash_out,
            prev_hashes: None,
            replica: None,
            modify_inplace: false,
            want_file_hash: false,
            extents: None,
            space_cb: None,
            progress: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHashOutcome {
    /// Present iff the job requested the whole-file hash.
    pub file_hash: Option<FileHash>,
    /// Bytes physically rewritten in the replica.
    pub inplace_written: u64,
}

/// Read until `buf` is full or EOF; returns the number of bytes read.
fn read_up_to(f: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match f.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(m) => n += m,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}

fn add_extent(extent_ctx: &mut Sha512, start: u64, size: u64) {
    extent_ctx.update((start as i64).to_le_bytes());
    extent_ctx.update((size as i64).to_le_bytes());
}

/// Scan `src` and produce its hashfile grid, optionally computing the
/// whole-file hash and patching a replica in place.
///
/// The hashfile layout is `u64le(file_size)` followed by one record per
/// big chunk in ascending order; the final record covers only the bytes
/// present in the tail. On failure the partially written hashfile is left
/// behind as-is.
pub fn build_chunk_hashes(job: ChunkHashJob<'_>) -> Result<ChunkHashOutcome> {
    let ChunkHashJob {
        src,
        hash_out,
        mut prev_hashes,
        mut replica,
        modify_inplace,
        want_file_hash,
        mut extents,
        space_cb,
        mut progress,
    } = job;

    src.seek(SeekFrom::Start(0))?;
    hash_out.seek(SeekFrom::Start(0))?;
    let fsize = src.metadata()?.len();

    write_retry(hash_out, "hashfile", &fsize.to_le_bytes(), space_cb)?;

    let mut prev_active = prev_hashes.is_some();
    let mut prev_input_size = 0u64;
    if let Some(prev) = prev_hashes.as_deref_mut() {
        prev.seek(SeekFrom::Start(0))?;
        prev_input_size = super::read_size_prefix(prev)?;
    }

    // Whole-file hash state. The contexts are cheap; only `want_file_hash`
    // decides whether they are fed.
    let mut ctx = Sha512::new();
    let mut extent_ctx = Sha512::new();
    let mut sha_window = vec![0u8; FILE_HASH_WINDOW];
    let mut has_sparse_extent = false;
    let mut sparse_extent_start: Option<u64> = None;

    let mut buf = [0u8; SMALL_CHUNK_SIZE];
    let mut copy_buf = [0u8; SMALL_CHUNK_SIZE];
    let mut copy_write_pos = 0u64;
    let mut copy_read_eof = false;
    let mut copy_sparse_start: Option<u64> = None;
    let mut copy_max_sparse: Option<u64> = None;
    let mut inplace_written = 0u64;
    let mut hash_out_pos = super::HASHFILE_PREFIX_SIZE as u64;

    let mut prev_record = [0u8; CHUNKHASH_RECORD_SIZE];

    let mut curr_extent: Option<SparseExtent> =
        extents.as_deref_mut().and_then(|it| it.next_extent());

    let mut last_pc = 0u8;
    let mut pos = 0u64;

    while pos < fsize {
        // Refresh the previous-hashfile record for this big chunk. The
        // record sits at the same offset as the one being written.
        let mut prev_record_len = 0usize;
        if prev_active {
            if let Some(prev) = prev_hashes.as_deref_mut() {
                if pos < prev_input_size {
                    prev.seek(SeekFrom::Start(hash_out_pos))?;
                    let n = read_up_to(prev, &mut prev_record)?;
                    if n == 0 {
                        prev_active = false;
                    } else {
                        prev_record_len = n;
                    }
                } else {
                    prev_active = false;
                }
            }
        }

        // Drop extents that end before the cursor.
        while let Some(e) = curr_extent {
            if e.end() < pos {
                curr_extent = extents.as_deref_mut().and_then(|it| it.next_extent());
            } else {
                break;
            }
        }

        if let Some(cb) = progress.as_deref_mut() {
            let pc = ((100 * pos + fsize / 2) / fsize) as u8;
            if pc != last_pc {
                last_pc = pc;
                cb(pc);
            }
        }

        let epos = pos + BIG_CHUNK_SIZE;

        // Known-sparse fast path: the whole big chunk lies inside a
        // reported extent.
        let covering = curr_extent
            .filter(|e| e.offset <= pos && e.end() >= epos && epos <= fsize);
        if let Some(extent) = covering {
            let record = sparse_chunk_record();
            write_retry(hash_out, "hashfile", record, space_cb)?;
            hash_out_pos += record.len() as u64;

            if want_file_hash && sparse_extent_start.is_none() {
                sparse_extent_start = Some(pos);
            }

            if copy_sparse_start.is_none() {
                copy_sparse_start = Some(pos);
                let mut punched = true;
                if let Some(rep) = replica.as_deref_mut() {
                    if platform_fs::punch_hole(rep, extent.offset, extent.size).is_err() {
                        punched = false;
                        rep.seek(SeekFrom::Start(extent.offset))?;
                        let zeros = [0u8; FILE_HASH_WINDOW];
                        let mut written = 0u64;
                        while written < extent.size {
                            let n = zeros.len().min((extent.size - written) as usize);
                            write_retry(rep, "replica", &zeros[..n], space_cb)?;
                            written += n as u64;
                        }
                    }
                }
                if punched {
                    copy_max_sparse = Some(extent.end());
                }
            }

            copy_write_pos += BIG_CHUNK_SIZE;
            pos = epos;
            src.seek(SeekFrom::Start(pos))?;
            continue;
        }
        copy_sparse_start = None;

        // Normal big-chunk path: reserve the MD5 slot, stream the small
        // chunks, then come back and fill the slot in.
        let mut big_hash = Md5::new();
        let mut control_hash = Md5::new();
        let record_start = hash_out_pos;
        write_retry(hash_out, "hashfile", &[0u8; BIG_HASH_SIZE], space_cb)?;
        hash_out_pos += BIG_HASH_SIZE as u64;

        let chunk_prev_active = prev_active && prev_record_len >= BIG_HASH_SIZE;
        let copy_write_start = copy_write_pos;
        let mut chunk_idx = 0usize;

        while pos < epos && pos < fsize {
            let r = read_up_to(src, &mut buf)?;

            let small_hash = RollingAdler32::from_buffer(&buf[..r]).hash().to_le_bytes();
            big_hash.update(&buf[..r]);
            write_retry(hash_out, "hashfile", &small_hash, space_cb)?;
            hash_out_pos += SMALL_HASH_SIZE as u64;

            if want_file_hash {
                let window = FILE_HASH_WINDOW as u64;
                let buf_offset = (pos % window) as usize;
                sha_window[buf_offset..buf_offset + r].copy_from_slice(&buf[..r]);

                if (pos + r as u64) % window == 0 {
                    if sha_window.iter().all(|&b| b == 0) {
                        if sparse_extent_start.is_none() {
                            sparse_extent_start = Some((pos / window) * window);
                        }
                    } else {
                        if let Some(start) = sparse_extent_start.take() {
                            has_sparse_extent = true;
                            let end = (pos / window) * window;
                            add_extent(&mut extent_ctx, start, end - start);
                        }
                        ctx.update(&sha_window);
                    }
                } else if r < SMALL_CHUNK_SIZE || pos + r as u64 == fsize {
                    if let Some(start) = sparse_extent_start.take() {
                        has_sparse_extent = true;
                        let end = (pos / window) * window;
                        add_extent(&mut extent_ctx, start, end - start);
                    }
                    ctx.update(&sha_window[..buf_offset + r]);
                }
            }

            if let Some(rep) = replica.as_deref_mut() {
                if modify_inplace {
                    let prev_small_avail = chunk_prev_active
                        && prev_record_len
                            >= BIG_HASH_SIZE + (chunk_idx + 1) * SMALL_HASH_SIZE;
                    if chunk_prev_active {
                        let off = BIG_HASH_SIZE + chunk_idx * SMALL_HASH_SIZE;
                        if prev_small_avail
                            && prev_record[off..off + SMALL_HASH_SIZE] == small_hash
                        {
                            // Old bytes equal new bytes by hash; the control
                            // hash sees the new bytes.
                            control_hash.update(&buf[..r]);
                        } else {
                            rep.seek(SeekFrom::Start(copy_write_pos))?;
                            let copy_r = read_up_to(rep, &mut copy_buf)?;
                            if copy_r < SMALL_CHUNK_SIZE {
                                copy_read_eof = true;
                            }
                            // The control hash reconstructs what was
                            // physically in the replica.
                            control_hash.update(&copy_buf[..copy_r]);

                            rep.seek(SeekFrom::Start(copy_write_pos))?;
                            write_retry(rep, "replica", &buf[..r], space_cb)?;
                            inplace_written += r as u64;
                        }
                        copy_write_pos += r as u64;
                    } else {
                        let copy_r = if copy_read_eof {
                            0
                        } else {
                            rep.seek(SeekFrom::Start(copy_write_pos))?;
                            let n = read_up_to(rep, &mut copy_buf)?;
                            if n < SMALL_CHUNK_SIZE {
                                copy_read_eof = true;
                            }
                            n
                        };
                        if copy_read_eof || copy_r != r || copy_buf[..r] != buf[..r] {
                            rep.seek(SeekFrom::Start(copy_write_pos))?;
                            write_retry(rep, "replica", &buf[..r], space_cb)?;
                            inplace_written += r as u64;
                        }
                        copy_write_pos += r as u64;
                    }
                } else {
                    rep.seek(SeekFrom::Start(copy_write_pos))?;
                    write_retry(rep, "replica", &buf[..r], space_cb)?;
                    copy_write_pos += r as u64;
                }
            }

            pos += SMALL_CHUNK_SIZE as u64;
            chunk_idx += 1;
        }

        // Fill in the reserved MD5 slot.
        hash_out.seek(SeekFrom::Start(record_start))?;
        let digest = big_hash.finalize();
        write_retry(hash_out, "hashfile", digest.as_slice(), space_cb)?;

        // Small-hash collision recovery: if the control hash disagrees
        // with the previous big hash, the optimistic per-small matching
        // was unsound. Re-copy the whole big chunk byte for byte.
        if modify_inplace && chunk_prev_active {
            if let Some(rep) = replica.as_deref_mut() {
                let control = control_hash.finalize();
                if control.as_slice() != &prev_record[..BIG_HASH_SIZE] {
                    debug!(chunk_start = epos - BIG_CHUNK_SIZE, "small hash collision, recopying big chunk");
                    copy_write_pos = copy_write_start;
                    pos = epos - BIG_CHUNK_SIZE;
                    src.seek(SeekFrom::Start(pos))?;
                    while pos < epos && pos < fsize {
                        let r = read_up_to(src, &mut buf)?;
                        rep.seek(SeekFrom::Start(copy_write_pos))?;
                        write_retry(rep, "replica", &buf[..r], space_cb)?;
                        inplace_written += r as u64;
                        copy_write_pos += r as u64;
                        pos += SMALL_CHUNK_SIZE as u64;
                    }
                }
            }
        }

        hash_out.seek(SeekFrom::Start(hash_out_pos))?;
    }

    // A sparse run still open at EOF ends exactly at the file size.
    if let Some(start) = sparse_extent_start.take() {
        has_sparse_extent = true;
        add_extent(&mut extent_ctx, start, fsize - start);
    }

    // Punched extents may reach past the last write; restore the size.
    if let Some(rep) = replica.as_deref_mut() {
        if let Some(max_sparse) = copy_max_sparse {
            if max_sparse > rep.metadata()?.len() {
                rep.set_len(max_sparse)?;
            }
        }
    }

    let file_hash = if want_file_hash {
        if has_sparse_extent {
            let extent_digest = extent_ctx.finalize();
            ctx.update(extent_digest);
        }
        FileHash::from_slice(ctx.finalize().as_slice())
    } else {
        None
    };

    Ok(ChunkHashOutcome {
        file_hash,
        inplace_written,
    })
}
