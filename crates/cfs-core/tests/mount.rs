#![forbid(unsafe_code)]
//! Mount, remount and crash behaviour of the filesystem facade.

use cfs_block::{ByteDevice, MemByteDevice};
use cfs_btree::{ItemReader, Key, MetadataStore, TransactionManager, TreeId};
use cfs_core::{CfsError, EngineKind, Filesystem, Inconsistency, MountOptions, RootId};
use cfs_types::SectorSize;
use std::sync::Arc;

const MIB: usize = 1024 * 1024;

fn devices(n: usize) -> Vec<Arc<dyn ByteDevice>> {
    (0..n)
        .map(|_| Arc::new(MemByteDevice::new(32 * MIB)) as Arc<dyn ByteDevice>)
        .collect()
}

fn options(extra: &str) -> MountOptions {
    let mut opts = MountOptions {
        block_group_size: 8 * MIB as u64,
        thread_pool: 2,
        ..MountOptions::default()
    };
    if !extra.is_empty() {
        opts.apply_option_string(extra).expect("options");
    }
    opts
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
}

#[test]
fn fresh_mount_commits_default_tree() {
    let fs = Filesystem::mount(devices(1), options("")).expect("mount");
    assert_eq!(fs.generation().0, 1);
    assert_eq!(fs.roots(), vec![RootId::FS_TREE]);
    assert!(fs.list_files(RootId::FS_TREE).expect("list").is_empty());
    assert!(fs.check().expect("check").is_clean());
}

#[test]
fn mirror_count_must_match_devices() {
    let err = Filesystem::mount(devices(1), options("mirrors=2")).expect_err("mismatch");
    assert!(matches!(err, CfsError::InvalidArgument(_)), "{err}");
}

#[test]
fn unknown_option_is_rejected_before_mount() {
    let mut opts = MountOptions::default();
    let err = opts.apply_option_string("autodefrag").expect_err("unknown");
    assert!(matches!(err, CfsError::InvalidArgument(_)));
}

#[test]
fn data_survives_unmount_and_remount() {
    let devs = devices(2);
    let fs = Filesystem::mount(devs.clone(), options("mirrors=2,io_engine=inline"))
        .expect("mount");
    let ino = fs.create_file(RootId::FS_TREE).expect("create");
    let data = pattern(300_000, 3);
    let file = fs.open(RootId::FS_TREE, ino).expect("open");
    assert_eq!(file.write(0, &data).expect("write"), data.len());
    file.close().expect("close");
    let link = fs.create_symlink(RootId::FS_TREE, "target").expect("symlink");
    let image = fs.unmount().expect("unmount");

    let fs = Filesystem::mount_image(devs, options("mirrors=2,io_engine=inline"), image)
        .expect("remount");
    assert_eq!(fs.list_files(RootId::FS_TREE).expect("list"), vec![ino]);
    let file = fs.open(RootId::FS_TREE, ino).expect("reopen");
    assert_eq!(file.inode().size(), data.len() as u64);
    assert_eq!(file.read(0, data.len() as u64).expect("read"), data);
    assert!(fs.open(RootId::FS_TREE, link).is_err());
    assert!(fs.check().expect("check").is_clean());

    let usage = fs.usage();
    assert!(usage.data.bytes_used >= data.len() as u64);
    assert_eq!(usage.engine, "inline");
}

#[test]
fn failed_commit_leaves_previous_generation_after_crash() {
    let devs = devices(1);
    let fs = Filesystem::mount(devs.clone(), options("")).expect("mount");
    let ino = fs.create_file(RootId::FS_TREE).expect("create");
    let old = pattern(64 * 1024, 1);
    let mut file = fs.open(RootId::FS_TREE, ino).expect("open");
    file.write(0, &old).expect("write");
    file.fsync().expect("fsync");
    let committed = fs.sync().expect("sync");

    file.write(0, &pattern(64 * 1024, 9)).expect("overwrite");
    fs.start_delalloc_roots().expect("flush");
    file.inode().wait_ordered(0, u64::MAX);
    fs.store().faults().fail_next_commit();
    let err = fs.commit().expect_err("commit fails");
    assert!(matches!(err, CfsError::TransactionAborted { .. }), "{err}");
    drop(file);

    let image = fs.crash();
    assert_eq!(image.generation, committed.0);
    let fs = Filesystem::mount_image(devs, options(""), image).expect("remount");
    let file = fs.open(RootId::FS_TREE, ino).expect("reopen");
    assert_eq!(file.read(0, old.len() as u64).expect("read"), old);
    assert!(fs.check().expect("check").is_clean());
}

#[test]
fn snapshot_and_subvolume_survive_remount() {
    let devs = devices(1);
    let fs = Filesystem::mount(devs.clone(), options("compress=zlib:6")).expect("mount");
    let sub = fs.create_subvolume().expect("subvolume");
    let ino = fs.create_file(sub).expect("create");
    let data = vec![b'z'; 128 * 1024];
    let file = fs.open(sub, ino).expect("open");
    file.write(0, &data).expect("write");
    file.close().expect("close");
    let snap = fs.snapshot(sub).expect("snapshot");
    assert_ne!(snap, sub);

    let image = fs.unmount().expect("unmount");
    let fs = Filesystem::mount_image(devs, options(""), image).expect("remount");
    let mut roots = fs.roots();
    roots.sort();
    assert_eq!(roots, vec![RootId::FS_TREE, sub, snap]);
    let copy = fs.open(snap, ino).expect("open snapshot copy");
    assert_eq!(copy.read(0, data.len() as u64).expect("read"), data);
    let report = fs.check().expect("check");
    assert!(report.is_clean(), "{:?}", report.problems);
    assert_eq!(report.roots, 3);
}

#[test]
fn check_reports_missing_checksums() {
    let fs = Filesystem::mount(devices(1), options("io_engine=inline")).expect("mount");
    let ino = fs.create_file(RootId::FS_TREE).expect("create");
    let file = fs.open(RootId::FS_TREE, ino).expect("open");
    file.write(0, &pattern(16 * 1024, 5)).expect("write");
    file.close().expect("close");
    fs.sync().expect("sync");

    let image = fs.unmount().expect("unmount");
    let store = Arc::new(MetadataStore::from_image(image));
    let txn = TransactionManager::new(Arc::clone(&store));
    let mut h = txn.start().expect("start");
    for (key, _) in store.range_items(TreeId::Csum, &Key::MIN, &Key::MAX) {
        h.delete(TreeId::Csum, key).expect("delete csum");
    }
    h.end().expect("end");
    let report = cfs_core::check_metadata(&*store, SectorSize::default()).expect("check");
    assert!(!report.is_clean());
    assert!(
        report
            .problems
            .iter()
            .any(|p| matches!(p, Inconsistency::MissingCsum { ino: i, .. } if *i == ino.0))
    );
}

#[test]
fn engine_kind_follows_options() {
    let fs = Filesystem::mount(devices(1), options("")).expect("mount");
    assert_eq!(fs.options().engine, EngineKind::Threaded);
    assert_eq!(fs.usage().engine, fs.fs_info().engine().name());
}
