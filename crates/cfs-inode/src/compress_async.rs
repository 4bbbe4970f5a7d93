//! Asynchronous compressed writeback.
//!
//! A delalloc range is cut into 512 KiB chunks. Each chunk's pages are
//! captured on the flushing thread and compressed on the compression pool
//! in pieces of at most 128 KiB. The flusher then drains the chunk results
//! in submission order, so extents are allocated and IO is issued in file
//! order regardless of which worker finished first.
//!
//! A piece is kept compressed only if it saves at least one sector against
//! its sector-aligned input. Rejected pieces are written through the plain
//! COW path, and unless compression is forced the inode is flagged
//! `NOCOMPRESS` so later writes skip the codec.

use crate::inode::{Inode, InodeFlags};
use crate::ordered::{NewOrdered, OrderedKind};
use cfs_compress::looks_compressible;
use cfs_error::{CfsError, Result};
use cfs_extent::{BlockStart, ExtentMap, ExtentMapFlags};
use cfs_types::{ASYNC_CHUNK_SIZE, CompressionType, MAX_UNCOMPRESSED, SectorSize};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Codec verdict for one piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PieceOutcome {
    Compressed(Vec<u8>),
    /// The codec or the heuristic found nothing to save.
    Incompressible,
    /// One sector or less; compression can never save a sector.
    TooSmall,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub start: u64,
    pub len: u64,
    pub outcome: PieceOutcome,
}

/// Decide how one piece of at most 128 KiB is stored.
pub fn decide_piece(
    kind: CompressionType,
    level: u32,
    force: bool,
    ss: SectorSize,
    input: &[u8],
) -> Result<PieceOutcome> {
    let aligned = ss.round_up(input.len() as u64);
    if aligned <= ss.bytes() {
        return Ok(PieceOutcome::TooSmall);
    }
    if !force && !looks_compressible(input) {
        return Ok(PieceOutcome::Incompressible);
    }
    let max_out = usize::try_from(aligned - ss.bytes()).unwrap_or(usize::MAX);
    Ok(match cfs_compress::compress(kind, level, input, max_out)? {
        Some(out) => PieceOutcome::Compressed(out),
        None => PieceOutcome::Incompressible,
    })
}

/// Split one chunk into pieces and run the codec on each.
fn compress_chunk(
    kind: CompressionType,
    level: u32,
    force: bool,
    ss: SectorSize,
    start: u64,
    data: &[u8],
) -> Result<Vec<Piece>> {
    let piece_len = usize::try_from(MAX_UNCOMPRESSED).unwrap_or(usize::MAX);
    let mut pieces = Vec::new();
    let mut offset = start;
    for input in data.chunks(piece_len) {
        let len = input.len() as u64;
        pieces.push(Piece {
            start: offset,
            len,
            outcome: decide_piece(kind, level, force, ss, input)?,
        });
        offset += len;
    }
    Ok(pieces)
}

impl Inode {
    fn compress_wanted(&self) -> bool {
        let flags = self.flags();
        let config = self.fs.config();
        // Relocation targets must keep every extent at its source size.
        if flags.intersects(
            InodeFlags::NODATACOW | InodeFlags::NODATASUM | InodeFlags::RELOC_TARGET,
        ) {
            return false;
        }
        if config.compress_force {
            return true;
        }
        if flags.contains(InodeFlags::NOCOMPRESS) {
            return false;
        }
        config.compression.is_compressed() || flags.contains(InodeFlags::COMPRESS)
    }

    /// Codec and level for this inode's compressed writes.
    pub(crate) fn compression_params(&self) -> (CompressionType, u32) {
        let config = self.fs.config();
        let kind = if config.compression.is_compressed() {
            config.compression
        } else {
            CompressionType::Zlib
        };
        (kind, config.compress_level)
    }

    /// Codec for an inline extent, if the inode compresses at all.
    pub(crate) fn inline_compression(&self) -> Option<(CompressionType, u32)> {
        self.compress_wanted().then(|| self.compression_params())
    }

    pub(crate) fn should_compress(&self, start: u64, end: u64) -> bool {
        let ss = self.fs.sectorsize();
        if end - start <= ss.bytes() && end < self.size() {
            return false;
        }
        self.compress_wanted()
    }

    /// Compressed writeback of the locked range `[start, end)`.
    pub(crate) fn compress_range(self: &Arc<Self>, start: u64, end: u64) -> Result<()> {
        if start == 0 {
            match self.try_inline(end) {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(err) => {
                    self.fail_delalloc(start, end, &err);
                    return Err(err);
                }
            }
        }
        let (kind, level) = self.compression_params();
        let force = self.fs.config().compress_force;
        let ss = self.fs.sectorsize();

        let mut jobs = Vec::new();
        let mut chunk = start;
        while chunk < end {
            let chunk_end = chunk.saturating_add(ASYNC_CHUNK_SIZE).min(end);
            let data = self.pages.capture_for_writeback(chunk, chunk_end);
            let handle = self
                .fs
                .compress_pool()
                .submit(move || compress_chunk(kind, level, force, ss, chunk, &data));
            jobs.push((chunk, chunk_end, handle));
            chunk = chunk_end;
        }
        trace!(
            target: "cfs::compress",
            ino = self.ino().0,
            start,
            end,
            chunks = jobs.len(),
            "compression queued"
        );

        let mut first_err = None;
        let mut rejected = false;
        let mut compressed = 0_u32;
        let mut cow_run: Option<(u64, u64)> = None;
        for (chunk_start, chunk_end, handle) in jobs {
            let pieces = match handle.join().and_then(|res| res) {
                Ok(pieces) => pieces,
                Err(err) => {
                    self.flush_cow_run(&mut cow_run, &mut first_err);
                    self.fail_delalloc(chunk_start, chunk_end, &err);
                    first_err.get_or_insert(err);
                    continue;
                }
            };
            for piece in pieces {
                let out = match piece.outcome {
                    PieceOutcome::Compressed(out) => out,
                    outcome => {
                        rejected |= outcome == PieceOutcome::Incompressible;
                        match &mut cow_run {
                            Some((_, run_end)) if *run_end == piece.start => {
                                *run_end = piece.start + piece.len;
                            }
                            _ => {
                                self.flush_cow_run(&mut cow_run, &mut first_err);
                                cow_run = Some((piece.start, piece.start + piece.len));
                            }
                        }
                        continue;
                    }
                };
                self.flush_cow_run(&mut cow_run, &mut first_err);
                let piece_end = piece.start + piece.len;
                match self.submit_compressed(piece.start, piece.len, kind, out) {
                    Ok(()) => compressed += 1,
                    Err(CfsError::NoSpace) => {
                        warn!(
                            target: "cfs::compress",
                            ino = self.ino().0,
                            start = piece.start,
                            "no space for compressed extent, writing uncompressed"
                        );
                        if let Err(err) = self.cow_file_range(piece.start, piece_end) {
                            first_err.get_or_insert(err);
                        }
                    }
                    Err(err) => {
                        self.fail_delalloc(piece.start, piece_end, &err);
                        first_err.get_or_insert(err);
                    }
                }
            }
        }
        self.flush_cow_run(&mut cow_run, &mut first_err);

        if rejected && !force {
            self.insert_flags(InodeFlags::NOCOMPRESS);
            warn!(
                target: "cfs::compress",
                ino = self.ino().0,
                algo = kind.name(),
                "data did not compress, disabling compression for inode"
            );
        }
        debug!(
            target: "cfs::compress",
            ino = self.ino().0,
            start,
            end,
            compressed,
            rejected,
            "compressed writeback done"
        );
        first_err.map_or(Ok(()), Err)
    }

    fn flush_cow_run(self: &Arc<Self>, run: &mut Option<(u64, u64)>, first_err: &mut Option<CfsError>) {
        if let Some((s, e)) = run.take() {
            if let Err(err) = self.cow_file_range(s, e) {
                first_err.get_or_insert(err);
            }
        }
    }

    fn submit_compressed(
        self: &Arc<Self>,
        start: u64,
        len: u64,
        kind: CompressionType,
        mut out: Vec<u8>,
    ) -> Result<()> {
        let ss = self.fs.sectorsize();
        let end = start + len;
        let disk_len = ss.round_up(out.len() as u64);
        let alloc = Arc::clone(self.fs.alloc());
        let ext = alloc.reserve_extent(disk_len, disk_len, self.alloc_hint(start))?;
        let em = ExtentMap {
            start,
            len,
            block_start: BlockStart::Disk(ext.start),
            block_len: ext.len,
            orig_start: start,
            orig_block_len: ext.len,
            ram_bytes: len,
            compression: kind,
            generation: 0,
            flags: ExtentMapFlags::PINNED | ExtentMapFlags::COMPRESSED,
        };
        let registered = self.em_tree.add_with_retry(em, true).map_err(CfsError::from).and_then(|_| {
            self.add_ordered(NewOrdered {
                file_offset: start,
                num_bytes: len,
                ram_bytes: len,
                disk_bytenr: ext.start,
                disk_num_bytes: ext.len,
                compression: kind,
                kind: OrderedKind::Compressed,
            })
        });
        alloc.dec_reservations(ext.start);
        let oe = match registered {
            Ok(oe) => oe,
            Err(err) => {
                self.em_tree.drop_range(start, end, false);
                if let Err(free_err) = alloc.free_reserved(ext.start, ext.len) {
                    error!(target: "cfs::alloc", start = ext.start, error = %free_err, "reservation leak");
                }
                return Err(err);
            }
        };
        self.hand_off_reservation(start, end);
        out.resize(usize::try_from(ext.len).unwrap_or(usize::MAX), 0);
        trace!(
            target: "cfs::compress",
            ino = self.ino().0,
            start,
            len,
            disk_bytenr = ext.start,
            disk_len = ext.len,
            "compressed extent"
        );
        self.ops().submitter().submit(self, &oe, out);
        Ok(())
    }
}
