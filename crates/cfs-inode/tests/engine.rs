#![forbid(unsafe_code)]
//! End-to-end tests of the data engine against in-memory devices.

use cfs_alloc::{AllocatorGeometry, DataAllocator};
use cfs_block::{ByteDevice, FaultPlan, FaultyDevice, InlineEngine, MemByteDevice, MirrorSet};
use cfs_btree::csum::lookup_csums;
use cfs_btree::fs_tree::{file_extents_in_range, lookup_file_extent};
use cfs_btree::items::{FileExtentItem, FileExtentKind, mode};
use cfs_btree::{MetadataStore, TransactionManager};
use cfs_error::CfsError;
use cfs_inode::{
    DEFAULT_DEFRAG_THRESH, FileHandle, FsConfig, FsInfo, Inode, InodeFlags, PieceOutcome, Root,
    decide_piece,
};
use cfs_types::{CompressionType, RootId, SectorSize};
use std::sync::Arc;

const MIB: u64 = 1024 * 1024;
const DEVICE_LEN: u64 = 64 * MIB;
const SS: u64 = 4096;

struct Fixture {
    fs: Arc<FsInfo>,
    root: Arc<Root>,
    plan: Arc<FaultPlan>,
    copies: Vec<Arc<MemByteDevice>>,
}

/// Shares one `MemByteDevice` between the mirror set and the test.
struct SharedDevice(Arc<MemByteDevice>);

impl ByteDevice for SharedDevice {
    fn len_bytes(&self) -> u64 {
        self.0.len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> cfs_error::Result<()> {
        self.0.read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> cfs_error::Result<()> {
        self.0.write_all_at(offset, buf)
    }

    fn sync(&self) -> cfs_error::Result<()> {
        self.0.sync()
    }
}

fn fixture_with(config: FsConfig, mirrors: usize) -> Fixture {
    let plan = FaultPlan::new();
    let copies: Vec<Arc<MemByteDevice>> = (0..mirrors)
        .map(|_| Arc::new(MemByteDevice::new(DEVICE_LEN as usize)))
        .collect();
    let devices: Vec<Arc<dyn ByteDevice>> = copies
        .iter()
        .enumerate()
        .map(|(i, dev)| {
            let shared = SharedDevice(Arc::clone(dev));
            if i == 0 {
                Arc::new(FaultyDevice::new(shared, Arc::clone(&plan))) as Arc<dyn ByteDevice>
            } else {
                Arc::new(shared) as Arc<dyn ByteDevice>
            }
        })
        .collect();
    let engine = Arc::new(InlineEngine::new(MirrorSet::new(devices).expect("mirrors")));
    let alloc = DataAllocator::new(AllocatorGeometry {
        sectorsize: config.sectorsize,
        data_start: MIB,
        data_len: DEVICE_LEN - MIB,
        block_group_size: 16 * MIB,
    })
    .expect("allocator");
    let txn = TransactionManager::new(Arc::new(MetadataStore::new()));
    let fs = FsInfo::new(config, txn, Arc::new(alloc), engine).expect("fs");
    let root = fs.ensure_root(RootId::FS_TREE).expect("root");
    Fixture {
        fs,
        root,
        plan,
        copies,
    }
}

fn fixture() -> Fixture {
    fixture_with(
        FsConfig {
            thread_pool: 2,
            ..FsConfig::default()
        },
        1,
    )
}

impl Fixture {
    fn file(&self) -> Arc<Inode> {
        self.fs
            .create_inode(
                &self.root,
                mode::S_IFREG | 0o644,
                self.fs.config().default_inode_flags(),
            )
            .expect("create")
    }

    fn settle(&self, inode: &Arc<Inode>) {
        inode.flush().expect("flush");
        inode.wait_ordered(0, u64::MAX);
        self.fs.commit().expect("commit");
    }

    fn items(&self, inode: &Inode) -> Vec<(u64, FileExtentItem)> {
        file_extents_in_range(
            &**self.fs.txn().store(),
            self.root.id(),
            inode.ino(),
            0,
            u64::MAX,
        )
        .expect("items")
    }

    fn item_at(&self, inode: &Inode, offset: u64) -> (u64, FileExtentItem) {
        lookup_file_extent(&**self.fs.txn().store(), self.root.id(), inode.ino(), offset)
            .expect("lookup")
            .expect("item present")
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn noise(len: usize, mut state: u64) -> Vec<u8> {
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

fn disk_of(item: &FileExtentItem) -> u64 {
    item.kind.disk().expect("disk extent").disk_bytenr
}

fn drop_caches(inode: &Inode) {
    inode.page_cache().drop_clean();
    inode.extent_maps().drop_range(0, u64::MAX, true);
}

// ── COW ─────────────────────────────────────────────────────────────────────

#[test]
fn cow_write_round_trips_and_drains_accounting() {
    let fx = fixture();
    let inode = fx.file();
    let data = pattern(3 * SS as usize + 700, 1);
    assert_eq!(inode.write(100, &data).expect("write"), data.len());
    assert_eq!(inode.size(), 100 + data.len() as u64);
    assert!(inode.accounting().delalloc_bytes() > 0);

    fx.settle(&inode);
    let acct = inode.accounting().snapshot();
    assert_eq!(acct.outstanding_extents, 0);
    assert_eq!(acct.delalloc_bytes, 0);
    assert_eq!(acct.meta_reserved, 0);
    assert_eq!(fx.fs.data_space().bytes_may_use(), 0);
    assert_eq!(inode.disk_i_size(), inode.size());

    let (key, item) = fx.item_at(&inode, 0);
    assert_eq!(key, 0);
    assert!(matches!(item.kind, FileExtentKind::Regular(_)));
    let sums = lookup_csums(
        &**fx.fs.txn().store(),
        SectorSize::default(),
        disk_of(&item),
        4 * SS,
    )
    .expect("csums");
    assert!(sums.iter().all(Option::is_some));

    drop_caches(&inode);
    let back = inode.read(100, data.len() as u64).expect("read");
    assert_eq!(back, data);
    let head = inode.read(0, 100).expect("read head");
    assert!(head.iter().all(|&b| b == 0));
}

#[test]
fn overwritten_extent_is_freed_after_commit() {
    let fx = fixture();
    let inode = fx.file();
    let free0 = fx.fs.alloc().free_bytes();
    inode.write(0, &pattern(2 * SS as usize, 2)).expect("write");
    fx.settle(&inode);
    assert_eq!(fx.fs.alloc().free_bytes(), free0 - 2 * SS);
    let (_, first) = fx.item_at(&inode, 0);

    inode.write(0, &pattern(2 * SS as usize, 3)).expect("overwrite");
    inode.flush().expect("flush");
    inode.wait_ordered(0, u64::MAX);
    let (_, second) = fx.item_at(&inode, 0);
    assert_ne!(disk_of(&first), disk_of(&second));
    assert_eq!(fx.fs.alloc().free_bytes(), free0 - 4 * SS);

    fx.fs.commit().expect("commit");
    assert_eq!(fx.fs.alloc().free_bytes(), free0 - 2 * SS);
    drop_caches(&inode);
    assert_eq!(inode.read(0, 2 * SS).expect("read"), pattern(2 * SS as usize, 3));
}

#[test]
fn small_file_is_stored_inline() {
    let fx = fixture();
    let inode = fx.file();
    let free0 = fx.fs.alloc().free_bytes();
    inode.write(0, b"fifty bytes of inline data, give or take a few..").expect("write");
    fx.settle(&inode);

    let (_, item) = fx.item_at(&inode, 0);
    assert!(matches!(item.kind, FileExtentKind::Inline(_)));
    assert_eq!(fx.fs.alloc().free_bytes(), free0);
    drop_caches(&inode);
    assert_eq!(
        inode.read(0, SS).expect("read"),
        b"fifty bytes of inline data, give or take a few..".to_vec()
    );
}

// ── No-COW ──────────────────────────────────────────────────────────────────

fn nocow_file(fx: &Fixture) -> Arc<Inode> {
    let inode = fx.file();
    inode
        .set_flags(inode.flags() | InodeFlags::NODATACOW)
        .expect("nodatacow");
    inode
}

#[test]
fn nocow_overwrite_stays_in_place_and_rewrites_csums() {
    let fx = fixture();
    let inode = nocow_file(&fx);
    inode.write(0, &pattern(4 * SS as usize, 4)).expect("write");
    fx.settle(&inode);
    let (_, before) = fx.item_at(&inode, 0);
    let free = fx.fs.alloc().free_bytes();

    let fresh = pattern(SS as usize, 9);
    inode.write(SS, &fresh).expect("overwrite");
    fx.settle(&inode);

    assert_eq!(fx.fs.alloc().free_bytes(), free);
    let (_, after) = fx.item_at(&inode, SS);
    assert_eq!(disk_of(&after), disk_of(&before));
    let sums = lookup_csums(
        &**fx.fs.txn().store(),
        SectorSize::default(),
        disk_of(&before) + SS,
        SS,
    )
    .expect("csums");
    assert_eq!(sums, vec![Some(crc32c::crc32c(&fresh))]);

    drop_caches(&inode);
    assert_eq!(inode.read(SS, SS).expect("read"), fresh);
}

#[test]
fn snapshot_forces_cow_of_shared_extent() {
    let fx = fixture();
    let inode = nocow_file(&fx);
    let original = pattern(2 * SS as usize, 5);
    inode.write(0, &original).expect("write");
    fx.settle(&inode);
    let (_, before) = fx.item_at(&inode, 0);

    let snap = fx.fs.snapshot(fx.root.id()).expect("snapshot");
    inode.write(0, &pattern(SS as usize, 6)).expect("overwrite");
    fx.settle(&inode);

    let (_, after) = fx.item_at(&inode, 0);
    assert_ne!(disk_of(&after), disk_of(&before));

    let snap_root = fx.fs.open_root(snap).expect("snapshot root");
    let copy = fx.fs.iget(&snap_root, inode.ino()).expect("snapshot inode");
    assert_eq!(copy.read(0, 2 * SS).expect("read snapshot"), original);
}

// ── Compression ─────────────────────────────────────────────────────────────

fn compressing(kind: CompressionType, force: bool) -> FsConfig {
    FsConfig {
        compression: kind,
        compress_force: force,
        thread_pool: 2,
        ..FsConfig::default()
    }
}

#[test]
fn compressible_data_is_stored_compressed() {
    let fx = fixture_with(compressing(CompressionType::Zstd, false), 1);
    let inode = fx.file();
    let data: Vec<u8> = b"abcd".iter().copied().cycle().take(200_000).collect();
    inode.write(0, &data).expect("write");
    fx.settle(&inode);

    let items = fx.items(&inode);
    assert!(!items.is_empty());
    for (_, item) in &items {
        assert_eq!(item.compression, CompressionType::Zstd);
        let disk = item.kind.disk().expect("disk");
        assert!(disk.disk_num_bytes < disk.num_bytes);
    }
    assert_eq!(inode.size(), 200_000);
    drop_caches(&inode);
    assert_eq!(inode.read(0, 200_000).expect("read"), data);
}

#[test]
fn incompressible_data_marks_inode_nocompress() {
    let fx = fixture_with(compressing(CompressionType::Zlib, false), 1);
    let inode = fx.file();
    let data = noise(256 * 1024, 0x9e37_79b9_7f4a_7c15);
    inode.write(0, &data).expect("write");
    fx.settle(&inode);

    assert!(inode.flags().contains(InodeFlags::NOCOMPRESS));
    for (_, item) in fx.items(&inode) {
        assert_eq!(item.compression, CompressionType::None);
    }
    drop_caches(&inode);
    assert_eq!(inode.read(0, data.len() as u64).expect("read"), data);
}

#[test]
fn relocation_target_is_never_compressed() {
    let fx = fixture_with(compressing(CompressionType::Zstd, true), 1);
    let flags = fx.fs.config().default_inode_flags() | InodeFlags::RELOC_TARGET;
    let inode = fx
        .fs
        .create_inode(&fx.root, mode::S_IFREG | 0o644, flags)
        .expect("create");
    let data: Vec<u8> = b"abcd".iter().copied().cycle().take(64 * 1024).collect();
    inode.write(0, &data).expect("write");
    fx.settle(&inode);

    let items = fx.items(&inode);
    assert_eq!(items.len(), 1);
    let (_, item) = &items[0];
    assert_eq!(item.compression, CompressionType::None);
    assert_eq!(item.kind.disk().map(|d| d.disk_num_bytes), Some(64 * 1024));
}

// ── Allocation pressure ─────────────────────────────────────────────────────

/// Reserve the whole data space, then hand back `holes` isolated sectors.
fn fragment(fx: &Fixture, holes: u64) {
    let alloc = fx.fs.alloc();
    let mut held = Vec::new();
    while let Ok(ext) = alloc.reserve_extent(16 * MIB, SS, 0) {
        alloc.dec_reservations(ext.start);
        held.push(ext);
    }
    assert_eq!(alloc.free_bytes(), 0);
    let first = held[0];
    assert!(first.len >= 2 * holes * SS);
    for i in 0..holes {
        alloc
            .free_reserved(first.start + 2 * i * SS, SS)
            .expect("free sector");
    }
    assert_eq!(alloc.free_bytes(), holes * SS);
}

/// Random bytes limited to sixteen values: compress to about half.
fn nibbles(len: usize, seed: u64) -> Vec<u8> {
    noise(len, seed).into_iter().map(|b| b & 0x0f).collect()
}

#[test]
fn compressed_extent_without_room_falls_back_to_cow() {
    let fx = fixture_with(compressing(CompressionType::Zstd, false), 1);
    let inode = fx.file();
    let len = 128 * 1024;
    let data = nibbles(len, 0x51ed);
    let level = fx.fs.config().compress_level;
    match decide_piece(CompressionType::Zstd, level, false, SectorSize::default(), &data)
        .expect("codec")
    {
        PieceOutcome::Compressed(out) => assert!(out.len() as u64 > SS),
        other => panic!("expected a multi-sector compressed piece, got {other:?}"),
    }
    fragment(&fx, 64);

    inode.write(0, &data).expect("write");
    fx.settle(&inode);

    let items = fx.items(&inode);
    assert_eq!(items.len() as u64, len as u64 / SS);
    for (offset, item) in &items {
        assert_eq!(item.compression, CompressionType::None, "item at {offset}");
    }
    assert_eq!(items.iter().map(|(_, i)| i.num_bytes()).sum::<u64>(), len as u64);
    assert!(!inode.flags().contains(InodeFlags::NOCOMPRESS));
    assert_eq!(fx.fs.data_space().bytes_may_use(), 0);

    drop_caches(&inode);
    assert_eq!(inode.read(0, len as u64).expect("read"), data);
}

#[test]
fn allocation_failure_unwinds_delalloc_and_reports_once() {
    let fx = fixture();
    let inode = fx.file();
    let mut handle = FileHandle::new(Arc::clone(&inode));
    handle
        .write(0, &pattern(16 * SS as usize, 21))
        .expect("buffered write");
    assert!(inode.accounting().outstanding_extents() > 0);
    fragment(&fx, 0);

    assert!(matches!(inode.flush(), Err(CfsError::NoSpace)));
    let acct = inode.accounting().snapshot();
    assert_eq!(acct.outstanding_extents, 0);
    assert_eq!(acct.delalloc_bytes, 0);
    assert_eq!(acct.meta_reserved, 0);
    assert_eq!(fx.fs.data_space().bytes_may_use(), 0);
    assert!(inode.ordered_extents().is_empty());
    assert!(fx.items(&inode).is_empty());

    assert!(matches!(handle.fsync(), Err(CfsError::NoSpace)));
    handle.fsync().expect("error already reported");

    assert!(matches!(
        inode.write(0, &pattern(SS as usize, 22)),
        Err(CfsError::NoSpace)
    ));
    assert_eq!(inode.accounting().delalloc_bytes(), 0);
    assert_eq!(fx.fs.data_space().bytes_may_use(), 0);
}

#[test]
fn relocation_target_needs_an_exact_size_extent() {
    let fx = fixture();
    let flags = fx.fs.config().default_inode_flags() | InodeFlags::RELOC_TARGET;
    let reloc = fx
        .fs
        .create_inode(&fx.root, mode::S_IFREG | 0o644, flags)
        .expect("create");
    assert!(reloc.flags().contains(InodeFlags::RELOC_TARGET));
    let plain = fx.file();
    fragment(&fx, 16);
    let data = pattern(4 * SS as usize, 23);

    reloc.write(0, &data).expect("buffered write");
    assert!(matches!(reloc.flush(), Err(CfsError::NoSpace)));
    let acct = reloc.accounting().snapshot();
    assert_eq!((acct.outstanding_extents, acct.delalloc_bytes), (0, 0));
    assert_eq!(fx.fs.data_space().bytes_may_use(), 0);
    assert!(fx.items(&reloc).is_empty());
    assert_eq!(fx.fs.alloc().free_bytes(), 16 * SS);

    plain.write(0, &data).expect("write");
    fx.settle(&plain);
    let items = fx.items(&plain);
    assert_eq!(items.len(), 4);
    assert!(
        items
            .iter()
            .all(|(_, i)| i.kind.disk().is_some_and(|d| d.disk_num_bytes == SS))
    );
    drop_caches(&plain);
    assert_eq!(plain.read(0, 4 * SS).expect("read"), data);
}

// ── Errors and repair ───────────────────────────────────────────────────────

#[test]
fn write_error_reaches_each_handle_once() {
    let fx = fixture();
    let inode = fx.file();
    let mut first = FileHandle::new(Arc::clone(&inode));
    let mut second = FileHandle::new(Arc::clone(&inode));
    fx.plan.fail_writes_in(0..DEVICE_LEN);

    first.write(0, &pattern(4 * SS as usize, 7)).expect("buffered write");
    assert!(matches!(first.fsync(), Err(CfsError::WriteFailed { .. })));
    first.fsync().expect("error already reported");
    assert!(matches!(second.fsync(), Err(CfsError::WriteFailed { .. })));
    assert!(fx.plan.writes_failed() > 0);

    assert!(fx.items(&inode).is_empty());
    assert!(matches!(
        inode.read(0, SS),
        Err(CfsError::WriteFailed { .. })
    ));
    let acct = inode.accounting().snapshot();
    assert_eq!(acct.outstanding_extents, 0);
    assert_eq!(fx.fs.data_space().bytes_may_use(), 0);

    fx.plan.clear();
    inode.write(0, &pattern(SS as usize, 8)).expect("rewrite");
    first.fsync().expect("clean fsync");
    drop_caches(&inode);
    assert_eq!(inode.read(0, SS).expect("read"), pattern(SS as usize, 8));
}

#[test]
fn bad_copy_is_repaired_from_mirror() {
    let fx = fixture_with(FsConfig::default(), 2);
    let inode = fx.file();
    let data = pattern(2 * SS as usize, 10);
    inode.write(0, &data).expect("write");
    fx.settle(&inode);
    let bytenr = disk_of(&fx.item_at(&inode, 0).1);

    fx.copies[0]
        .write_all_at(bytenr, &[0xee; 512])
        .expect("corrupt");
    drop_caches(&inode);
    assert_eq!(inode.read(0, 2 * SS).expect("read"), data);
    assert_eq!(fx.fs.diagnostics().repaired_sectors(), 1);

    let mut healed = vec![0_u8; SS as usize];
    fx.copies[0]
        .read_exact_at(bytenr, &mut healed)
        .expect("read copy");
    assert_eq!(healed, data[..SS as usize]);
}

#[test]
fn all_copies_bad_is_data_corruption() {
    let fx = fixture_with(FsConfig::default(), 2);
    let inode = fx.file();
    inode.write(0, &pattern(SS as usize * 2, 11)).expect("write");
    fx.settle(&inode);
    let bytenr = disk_of(&fx.item_at(&inode, 0).1);
    for copy in &fx.copies {
        copy.write_all_at(bytenr + SS, &[0x55; 64]).expect("corrupt");
    }
    drop_caches(&inode);
    let err = inode.read(0, 2 * SS).expect_err("corrupt read");
    assert!(matches!(err, CfsError::DataCorruption { offset, .. } if offset == SS));
    let records = fx.fs.diagnostics().corruptions();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].logical, bytenr + SS);
    assert_eq!(records[0].ino, inode.ino().0);
}

// ── File operations ─────────────────────────────────────────────────────────

#[test]
fn truncate_drops_tail_extents() {
    let fx = fixture();
    let inode = fx.file();
    let data = pattern(5 * SS as usize, 12);
    inode.write(0, &data).expect("write");
    fx.settle(&inode);

    inode.truncate(5000).expect("truncate");
    fx.settle(&inode);
    assert_eq!(inode.size(), 5000);
    assert!(
        file_extents_in_range(
            &**fx.fs.txn().store(),
            fx.root.id(),
            inode.ino(),
            2 * SS,
            u64::MAX
        )
        .expect("items")
        .is_empty()
    );
    drop_caches(&inode);
    assert_eq!(inode.read(0, SS * 5).expect("read"), data[..5000]);

    inode.truncate(3 * SS).expect("extend");
    let grown = inode.read(0, 3 * SS).expect("read grown");
    assert_eq!(grown[..5000], data[..5000]);
    assert!(grown[5000..].iter().all(|&b| b == 0));
}

#[test]
fn write_into_preallocated_range_splits_it() {
    let fx = fixture();
    let inode = fx.file();
    inode.fallocate(0, 16 * SS).expect("fallocate");
    assert_eq!(inode.size(), 16 * SS);
    assert!(inode.flags().contains(InodeFlags::PREALLOC));
    let (_, prealloc) = fx.item_at(&inode, 0);
    assert!(matches!(prealloc.kind, FileExtentKind::Prealloc(_)));
    let bytenr = disk_of(&prealloc);

    let data = pattern(2 * SS as usize, 13);
    inode.write(4 * SS, &data).expect("write");
    fx.settle(&inode);

    let items = fx.items(&inode);
    let kinds: Vec<(u64, u8)> = items.iter().map(|(k, i)| (*k, i.kind.raw_type())).collect();
    assert_eq!(kinds, vec![(0, 2), (4 * SS, 1), (6 * SS, 2)]);
    assert!(items.iter().all(|(_, i)| disk_of(i) == bytenr));

    drop_caches(&inode);
    let back = inode.read(0, 16 * SS).expect("read");
    assert!(back[..4 * SS as usize].iter().all(|&b| b == 0));
    assert_eq!(back[4 * SS as usize..6 * SS as usize], data[..]);
}

#[test]
fn punch_hole_zeroes_range_and_keeps_size() {
    let fx = fixture();
    let inode = fx.file();
    let data = pattern(8 * SS as usize, 14);
    inode.write(0, &data).expect("write");
    fx.settle(&inode);

    let (start, len) = (SS + 100, 4 * SS);
    inode.punch_hole(start, len).expect("punch");
    fx.settle(&inode);
    assert_eq!(inode.size(), 8 * SS);
    assert!(
        lookup_file_extent(&**fx.fs.txn().store(), fx.root.id(), inode.ino(), 3 * SS)
            .expect("lookup")
            .is_none()
    );

    drop_caches(&inode);
    let back = inode.read(0, 8 * SS).expect("read");
    let (s, e) = (start as usize, (start + len) as usize);
    assert_eq!(back[..s], data[..s]);
    assert!(back[s..e].iter().all(|&b| b == 0));
    assert_eq!(back[e..], data[e..]);
}

#[test]
fn defrag_merges_small_extents() {
    let fx = fixture();
    let inode = fx.file();
    let data = pattern(4 * SS as usize, 15);
    for i in 0..4 {
        let off = i * SS as usize;
        inode.write(off as u64, &data[off..off + SS as usize]).expect("write");
        inode.flush().expect("flush");
    }
    inode.wait_ordered(0, u64::MAX);
    fx.fs.commit().expect("commit");
    assert_eq!(fx.items(&inode).len(), 4);

    drop_caches(&inode);
    let runs = inode
        .defrag_range(0, 4 * SS, DEFAULT_DEFRAG_THRESH)
        .expect("defrag");
    assert_eq!(runs, 1);
    fx.settle(&inode);
    assert_eq!(fx.items(&inode).len(), 1);
    drop_caches(&inode);
    assert_eq!(inode.read(0, 4 * SS).expect("read"), data);
}

#[test]
fn special_files_reject_data_io() {
    let fx = fixture();
    let fifo = fx
        .fs
        .create_inode(&fx.root, mode::S_IFIFO | 0o600, InodeFlags::empty())
        .expect("fifo");
    assert!(fifo.write(0, b"x").is_err());
    assert!(fifo.truncate(10).is_err());

    let link = fx
        .fs
        .create_inode(&fx.root, mode::S_IFLNK | 0o777, InodeFlags::empty())
        .expect("symlink");
    link.set_symlink_target(b"../target").expect("target");
    assert!(link.set_symlink_target(b"again").is_err());
    assert_eq!(link.read(0, 64).expect("read link"), b"../target".to_vec());
}
