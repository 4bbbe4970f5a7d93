//! Ordered extent submission and completion.
//!
//! Submission computes data checksums, cuts the payload into bios and
//! reports every bio's file range back to its ordered extent. The report
//! that completes the extent schedules the finish on the endio pool, so
//! metadata work never runs on an IO thread.
//!
//! Finishing takes the IO tree range lock, writes the file extent item,
//! backref and checksums in one transaction handle, and only then removes
//! the ordered extent. A handle failure aborts the transaction.

use crate::file_extents::{drop_file_extents, mark_extent_written};
use crate::inode::Inode;
use crate::ordered::{OrderedExtent, OrderedFlags, OrderedKind, OrderedState, OrderedSums};
use cfs_block::WriteBio;
use cfs_btree::TransHandle;
use cfs_btree::backref::add_extent_ref;
use cfs_btree::csum::{delete_csums, insert_csums};
use cfs_btree::fs_tree::file_extent_key;
use cfs_btree::items::{DiskRef, FileExtentItem, FileExtentKind};
use cfs_btree::TreeId;
use cfs_error::{CfsError, Result};
use cfs_extent::ExtentBits;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, error, trace, warn};

impl Inode {
    // ── Submission ──────────────────────────────────────────────────────────

    /// Checksum `data` and submit it for `oe`. `data` is laid out for the
    /// device: sector aligned, compressed if the extent is.
    pub(crate) fn submit_ordered(self: &Arc<Self>, oe: &Arc<OrderedExtent>, data: Vec<u8>) {
        let ss = self.fs.sectorsize();
        if self.datasum() {
            let sector = usize::try_from(ss.bytes()).unwrap_or(usize::MAX);
            oe.add_sums(OrderedSums {
                bytenr: oe.disk_bytenr,
                sums: data.chunks(sector).map(crc32c::crc32c).collect(),
            });
        }
        let bio_len = usize::try_from(self.fs.config().max_bio_size.max(ss.bytes()))
            .unwrap_or(usize::MAX);
        let engine = Arc::clone(self.fs.engine());
        let chunks: Vec<Vec<u8>> = data.chunks(bio_len).map(<[u8]>::to_vec).collect();
        trace!(
            target: "cfs::bio",
            ino = self.ino().0,
            file_offset = oe.file_offset,
            disk_bytenr = oe.disk_bytenr,
            bios = chunks.len(),
            "submitting ordered extent"
        );
        if chunks.is_empty() {
            self.report_io(oe, oe.file_offset, oe.num_bytes, true);
            return;
        }

        if oe.kind == OrderedKind::Compressed {
            // Compressed bytes do not map to file offsets; the whole range
            // is reported once every bio finished.
            let remaining = Arc::new(AtomicUsize::new(chunks.len()));
            let failed = Arc::new(AtomicBool::new(false));
            let mut physical = oe.disk_bytenr;
            for chunk in chunks {
                let len = chunk.len() as u64;
                let (inode, oe) = (Arc::clone(self), Arc::clone(oe));
                let (remaining, failed) = (Arc::clone(&remaining), Arc::clone(&failed));
                engine.submit_write(
                    WriteBio {
                        physical,
                        data: chunk,
                    },
                    Box::new(move |res| {
                        if let Err(err) = res {
                            warn!(target: "cfs::bio", ino = inode.ino().0, error = %err, "compressed bio failed");
                            failed.store(true, Ordering::SeqCst);
                        }
                        if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                            let ok = !failed.load(Ordering::SeqCst);
                            inode.report_io(&oe, oe.file_offset, oe.num_bytes, ok);
                        }
                    }),
                );
                physical += len;
            }
            return;
        }

        let mut offset = 0_u64;
        for chunk in chunks {
            let len = chunk.len() as u64;
            let file_offset = oe.file_offset + offset;
            let (inode, oe) = (Arc::clone(self), Arc::clone(oe));
            engine.submit_write(
                WriteBio {
                    physical: oe.disk_bytenr + offset,
                    data: chunk,
                },
                Box::new(move |res| {
                    if let Err(err) = &res {
                        warn!(
                            target: "cfs::bio",
                            ino = inode.ino().0,
                            file_offset,
                            error = %err,
                            "bio failed"
                        );
                    }
                    inode.report_io(&oe, file_offset, len, res.is_ok());
                }),
            );
            offset += len;
        }
    }

    /// Account a finished piece of `oe`. The report that completes the
    /// extent queues its finish on the endio pool.
    pub fn report_io(self: &Arc<Self>, oe: &Arc<OrderedExtent>, offset: u64, len: u64, ok: bool) {
        if !oe.dec_test_pending(offset, len, ok) {
            return;
        }
        let (inode, oe) = (Arc::clone(self), Arc::clone(oe));
        self.fs.endio_pool().spawn(move || {
            inode.ops().end_io_hook().end_io(&inode, &oe);
        });
    }

    // ── Completion ──────────────────────────────────────────────────────────

    /// Commit the metadata of a completed ordered extent and retire it.
    pub(crate) fn finish_ordered_io(self: &Arc<Self>, oe: &Arc<OrderedExtent>) {
        let (start, end) = (oe.file_offset, oe.end());
        self.io_tree.lock_range(start, end);
        let res = self.finish_locked(oe);
        self.io_tree.unlock_range(start, end);

        self.pages.end_writeback(start, end, res.is_ok());
        match res {
            Ok(()) => debug!(
                target: "cfs::ordered",
                ino = self.ino().0,
                start,
                len = oe.committed_len(),
                kind = ?oe.kind,
                "ordered extent finished"
            ),
            Err(err) => {
                error!(
                    target: "cfs::ordered",
                    ino = self.ino().0,
                    start,
                    end,
                    error = %err,
                    "ordered extent failed"
                );
                // Waiters must observe the error once the extent is gone.
                self.mapping_error.set(err);
            }
        }
        oe.set_state(OrderedState::Committed);
        self.acct.ordered_removed();
        self.ordered.remove(oe);
    }

    fn release_reserved(&self, oe: &OrderedExtent, start: u64, len: u64) {
        if oe.is_in_place() || len == 0 {
            return;
        }
        if let Err(err) = self.fs.alloc().free_reserved(start, len) {
            error!(target: "cfs::alloc", start, len, error = %err, "reservation leak");
        }
    }

    fn finish_locked(self: &Arc<Self>, oe: &Arc<OrderedExtent>) -> Result<()> {
        let (start, end) = (oe.file_offset, oe.end());
        if oe.flags().contains(OrderedFlags::IOERR) {
            self.release_reserved(oe, oe.disk_bytenr, oe.disk_num_bytes);
            self.io_tree
                .clear_and_set(start, end, ExtentBits::UPTODATE, ExtentBits::IOERR);
            self.em_tree.drop_range(start, end, false);
            return Err(CfsError::WriteFailed {
                ino: self.ino().0,
                start,
                end,
            });
        }
        if oe.committed_len() == 0 {
            self.release_reserved(oe, oe.disk_bytenr, oe.disk_num_bytes);
            self.em_tree.drop_range(start, end, false);
            trace!(target: "cfs::ordered", ino = self.ino().0, start, "fully truncated");
            return Ok(());
        }
        match oe.kind {
            OrderedKind::Nocow => self.finish_nocow(oe),
            OrderedKind::Prealloc => self.finish_prealloc(oe),
            OrderedKind::Regular | OrderedKind::Compressed | OrderedKind::Direct => {
                self.finish_cow(oe)
            }
        }
    }

    /// Store the submission checksums that fall below `limit`.
    fn write_sums(&self, h: &mut TransHandle, oe: &OrderedExtent, limit: u64) -> Result<()> {
        let ss = self.fs.sectorsize();
        for sums in oe.take_sums() {
            let keep = usize::try_from(ss.sectors(limit.saturating_sub(sums.bytenr)))
                .unwrap_or(usize::MAX)
                .min(sums.sums.len());
            insert_csums(h, ss, sums.bytenr, &sums.sums[..keep])?;
        }
        Ok(())
    }

    fn finish_nocow(self: &Arc<Self>, oe: &Arc<OrderedExtent>) -> Result<()> {
        let ss = self.fs.sectorsize();
        let len = ss.round_up(oe.committed_len());
        let mut h = self.fs.txn().start()?;
        let staged = (|| -> Result<()> {
            delete_csums(&mut h, ss, oe.disk_bytenr, len)?;
            self.write_sums(&mut h, oe, oe.disk_bytenr + len)?;
            self.settle_range(oe.file_offset, oe.file_offset + len);
            self.update_inode_item(&mut h)
        })();
        if let Err(err) = staged {
            return Err(h.abort(&format!("nocow completion for inode {}: {err}", self.ino().0)));
        }
        h.end()
    }

    fn finish_prealloc(self: &Arc<Self>, oe: &Arc<OrderedExtent>) -> Result<()> {
        let ss = self.fs.sectorsize();
        let len = ss.round_up(oe.committed_len());
        let (start, end) = (oe.file_offset, oe.file_offset + len);
        let mut h = self.fs.txn().start()?;
        let transid = h.transid().0;
        let staged = (|| -> Result<()> {
            mark_extent_written(&mut h, self.root.id(), self.ino(), start, end, transid)?;
            self.write_sums(&mut h, oe, oe.disk_bytenr + len)?;
            self.settle_range(start, end);
            self.update_inode_item(&mut h)
        })();
        if let Err(err) = staged {
            return Err(h.abort(&format!("prealloc completion for inode {}: {err}", self.ino().0)));
        }
        h.end()?;
        // The cached prealloc mapping is stale; the next lookup reloads
        // the written extent.
        self.em_tree.drop_range(start, oe.end(), false);
        Ok(())
    }

    fn finish_cow(self: &Arc<Self>, oe: &Arc<OrderedExtent>) -> Result<()> {
        let ss = self.fs.sectorsize();
        let root = self.root.id();
        let ino = self.ino();
        let compressed = oe.kind == OrderedKind::Compressed;
        let len = ss.round_up(oe.committed_len()).min(oe.num_bytes);
        let (start, end) = (oe.file_offset, oe.file_offset + len);
        let disk_len = if compressed {
            oe.disk_num_bytes
        } else {
            len.min(oe.disk_num_bytes)
        };
        let mut h = self.fs.txn().start()?;
        let transid = h.transid().0;
        let item = FileExtentItem {
            generation: transid,
            ram_bytes: if compressed { oe.ram_bytes } else { len },
            compression: oe.compression,
            encryption: 0,
            other_encoding: 0,
            kind: FileExtentKind::Regular(DiskRef {
                disk_bytenr: oe.disk_bytenr,
                disk_num_bytes: disk_len,
                offset: 0,
                num_bytes: len,
            }),
        };
        let staged = (|| -> Result<Vec<(u64, u64)>> {
            let dropped = drop_file_extents(&mut h, root, ino, ss, start, end)?;
            h.insert(TreeId::Fs(root), file_extent_key(ino, start), item.encode())?;
            add_extent_ref(&mut h, oe.disk_bytenr, disk_len, root.0, ino.0, start)?;
            self.write_sums(&mut h, oe, oe.disk_bytenr + disk_len)?;
            self.adjust_nbytes(len, dropped.removed_bytes);
            self.settle_range(start, end);
            self.update_inode_item(&mut h)?;
            Ok(dropped.freed)
        })();
        let freed = match staged {
            Ok(freed) => freed,
            Err(err) => {
                self.release_reserved(oe, oe.disk_bytenr, oe.disk_num_bytes);
                return Err(h.abort(&format!("cow completion for inode {}: {err}", ino.0)));
            }
        };
        h.end()?;

        let alloc = self.fs.alloc();
        alloc.convert_reserved_to_used(disk_len);
        self.release_reserved(oe, oe.disk_bytenr + disk_len, oe.disk_num_bytes - disk_len);
        self.fs.queue_pinned_frees(freed);
        self.fs.queue_unpin(self, start, len);
        if end < oe.end() {
            self.em_tree.drop_range(end, oe.end(), false);
        }
        trace!(
            target: "cfs::ordered",
            ino = ino.0,
            start,
            len,
            disk_bytenr = oe.disk_bytenr,
            disk_len,
            transid,
            "file extent committed"
        );
        Ok(())
    }
}
