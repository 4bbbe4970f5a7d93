//! The end-to-end write path scenarios.
//!
//! | id | what it drives |
//! |----|----------------|
//! | A | compressed COW writeback of a 200,000 byte file |
//! | B | a 50 byte file stored inline |
//! | C | in-place overwrite of an exclusively owned extent |
//! | D | an IO error on the write backing an ordered extent |
//! | E | truncate into a write whose IO is still in flight |

use crate::{Rig, ScenarioReport, SuiteReport, noise, pattern, repeating};
use anyhow::{Result, bail};
use cfs::{CfsError, RootId};
use cfs_btree::csum::lookup_csums;
use cfs_btree::items::FileExtentKind;
use cfs_btree::{ItemReader, Key, TreeId, item_type};
use cfs_extent::ExtentBits;
use cfs_inode::{InodeFlags, OrderedExtent, OrderedFlags, OrderedKind};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

pub const ALL: [&str; 5] = ["a", "b", "c", "d", "e"];

/// Run one scenario by id.
pub fn run(id: &str) -> Result<ScenarioReport> {
    let report = match id.to_ascii_lowercase().as_str() {
        "a" => scenario_a()?,
        "b" => scenario_b()?,
        "c" => scenario_c()?,
        "d" => scenario_d()?,
        "e" => scenario_e()?,
        other => bail!("unknown scenario: {other}"),
    };
    info!(
        target: "cfs::harness",
        scenario = %report.scenario,
        passed = report.passed,
        steps = report.steps.len(),
        "scenario finished"
    );
    Ok(report)
}

pub fn run_all() -> Result<SuiteReport> {
    let reports = ALL.iter().map(|id| run(id)).collect::<Result<Vec<_>>>()?;
    Ok(SuiteReport::from_reports(reports))
}

fn describe(oes: &[Arc<OrderedExtent>]) -> serde_json::Value {
    oes.iter()
        .map(|oe| {
            json!({
                "file_offset": oe.file_offset,
                "num_bytes": oe.num_bytes,
                "disk_bytenr": oe.disk_bytenr,
                "disk_num_bytes": oe.disk_num_bytes,
                "kind": format!("{:?}", oe.kind),
                "flags": format!("{:?}", oe.flags()),
            })
        })
        .collect()
}

fn extent_items(rig: &Rig) -> usize {
    rig.fs
        .store()
        .range_items(TreeId::Extent, &Key::MIN, &Key::MAX)
        .iter()
        .filter(|(k, _)| k.item_type == item_type::EXTENT_ITEM)
        .count()
}

// ── A: compressed write ─────────────────────────────────────────────────────

pub fn scenario_a() -> Result<ScenarioReport> {
    let mut report = ScenarioReport::new("A", "200,000 byte compressed write round trip");
    let rig = Rig::new("compress=zstd")?;
    let inode = rig.new_file()?;
    let data = repeating(200_000);

    let t = Instant::now();
    let written = inode.write(0, &data)?;
    inode.flush()?;
    let oes = inode.ordered_extents().in_range(0, u64::MAX);
    report.step("write_and_flush", t, json!({ "written": written, "ordered": describe(&oes) }));
    report.expect(!oes.is_empty(), "no ordered extent created");
    for oe in &oes {
        report.expect(
            oe.kind == OrderedKind::Compressed && oe.flags().contains(OrderedFlags::COMPRESSED),
            format!("ordered extent at {} is not compressed", oe.file_offset),
        );
        report.expect(
            oe.disk_num_bytes < 200_000 && oe.disk_num_bytes < oe.num_bytes,
            format!("ordered extent at {} does not shrink on disk", oe.file_offset),
        );
    }

    let t = Instant::now();
    let bios = rig.complete_io(&inode);
    let generation = rig.fs.commit()?;
    let items = rig.items(&inode)?;
    report.step(
        "complete",
        t,
        json!({ "bios": bios, "generation": generation.0, "items": items.len() }),
    );
    report.expect(inode.size() == 200_000, format!("size {} != 200000", inode.size()));
    report.expect(items.len() == oes.len(), "one file extent item per ordered extent");
    for (offset, item) in &items {
        let on_disk = item.kind.disk().map_or(u64::MAX, |d| d.disk_num_bytes);
        report.expect(
            item.compression.is_compressed() && on_disk < item.num_bytes(),
            format!("item at {offset} is stored uncompressed"),
        );
    }

    let t = Instant::now();
    Rig::drop_caches(&inode);
    let back = inode.read(0, 200_000)?;
    report.step("read_back", t, json!({ "bytes": back.len() }));
    report.expect(back == data, "read back differs from input");
    Ok(report)
}

// ── B: inline ───────────────────────────────────────────────────────────────

pub fn scenario_b() -> Result<ScenarioReport> {
    let mut report = ScenarioReport::new("B", "50 byte file stored as an inline extent");
    let rig = Rig::new("")?;
    let ss = rig.sectorsize();
    let inode = rig.new_file()?;
    let data = pattern(50, 3);
    let free_before = rig.fs.fs_info().alloc().free_bytes();

    let t = Instant::now();
    inode.write(0, &data)?;
    rig.settle(&inode)?;
    let items = rig.items(&inode)?;
    let free_after = rig.fs.fs_info().alloc().free_bytes();
    report.step(
        "write_and_settle",
        t,
        json!({
            "items": items.iter().map(|(o, i)| json!({"offset": o, "type": i.kind.raw_type()})).collect::<Vec<_>>(),
            "extent_items": extent_items(&rig),
            "free_before": free_before,
            "free_after": free_after,
        }),
    );
    report.expect(
        matches!(items.as_slice(), [(0, item)] if matches!(&item.kind, FileExtentKind::Inline(p) if p.len() == 50)),
        "expected a single 50 byte inline item",
    );
    report.expect(extent_items(&rig) == 0, "a device extent was allocated");
    report.expect(free_after == free_before, "free space changed");

    let t = Instant::now();
    Rig::drop_caches(&inode);
    let back = inode.read(0, ss)?;
    inode.truncate(ss)?;
    Rig::drop_caches(&inode);
    let block = inode.read(0, ss)?;
    report.step("read_back", t, json!({ "read": back.len(), "block": block.len() }));
    report.expect(back == data, "read back differs from the 50 written bytes");
    report.expect(
        block.len() as u64 == ss && block[..50] == data[..] && block[50..].iter().all(|&b| b == 0),
        "bytes past the inline data are not zero",
    );
    Ok(report)
}

// ── C: No-COW overwrite ─────────────────────────────────────────────────────

pub fn scenario_c() -> Result<ScenarioReport> {
    let mut report = ScenarioReport::new("C", "4K overwrite inside an exclusively owned extent");
    let rig = Rig::new("")?;
    let ss = rig.sectorsize();
    let sector = usize::try_from(ss)?;
    let fs_info = rig.fs.fs_info();
    let inode = rig.new_file()?;
    inode.set_flags(inode.flags() | InodeFlags::NODATACOW)?;
    let original = pattern(4 * sector, 1);

    let t = Instant::now();
    inode.write(0, &original)?;
    rig.settle(&inode)?;
    let items = rig.items(&inode)?;
    let Some(disk) = items.first().and_then(|(_, item)| item.kind.disk()) else {
        bail!("no extent backs the file");
    };
    let bytenr = disk.disk_bytenr + disk.offset;
    let before = lookup_csums(&**rig.fs.store(), fs_info.sectorsize(), bytenr, 4 * ss)?;
    report.step("seed", t, json!({ "bytenr": bytenr, "csums": before }));

    let t = Instant::now();
    let free_before = fs_info.alloc().free_bytes();
    let reserved_before = fs_info.data_space().bytes_reserved();
    let update = pattern(sector, 200);
    inode.write(ss, &update)?;
    inode.flush()?;
    let oes = inode.ordered_extents().in_range(0, u64::MAX);
    report.step(
        "overwrite",
        t,
        json!({
            "ordered": describe(&oes),
            "free_delta": free_before.abs_diff(fs_info.alloc().free_bytes()),
        }),
    );
    report.expect(
        matches!(oes.as_slice(), [oe] if oe.kind == OrderedKind::Nocow
            && oe.flags().contains(OrderedFlags::NOCOW)
            && oe.disk_bytenr == bytenr + ss
            && oe.num_bytes == ss),
        "expected one NOCOW ordered extent over the overwritten sector",
    );
    report.expect(
        fs_info.alloc().free_bytes() == free_before
            && fs_info.data_space().bytes_reserved() == reserved_before,
        "the overwrite reserved new space",
    );

    let t = Instant::now();
    rig.complete_io(&inode);
    rig.fs.commit()?;
    let after = lookup_csums(&**rig.fs.store(), fs_info.sectorsize(), bytenr, 4 * ss)?;
    let changed: Vec<usize> = (0..4).filter(|&i| before[i] != after[i]).collect();
    report.step("complete", t, json!({ "csums": after, "changed": changed }));
    report.expect(changed == [1], format!("checksums changed at {changed:?}"));
    report.expect(
        after[1] == Some(crc32c::crc32c(&update)),
        "checksum of the overwritten sector is stale",
    );
    let still = rig.items(&inode)?;
    report.expect(
        still.len() == 1 && still[0].1.kind.disk().map(|d| d.disk_bytenr) == Some(disk.disk_bytenr),
        "the file extent moved",
    );

    Rig::drop_caches(&inode);
    let mut expected = original;
    expected[sector..2 * sector].copy_from_slice(&update);
    report.expect(inode.read(0, 4 * ss)? == expected, "read back differs");
    Ok(report)
}

// ── D: write error ──────────────────────────────────────────────────────────

pub fn scenario_d() -> Result<ScenarioReport> {
    let mut report = ScenarioReport::new("D", "IO error on an ordered extent's write");
    let rig = Rig::new("")?;
    let ss = rig.sectorsize();
    let inode = rig.new_file()?;
    let mut handle = rig.fs.open(RootId::FS_TREE, inode.ino())?;
    let len = 4 * ss;

    let t = Instant::now();
    handle.write(0, &pattern(usize::try_from(len)?, 9))?;
    inode.flush()?;
    let oes = inode.ordered_extents().in_range(0, u64::MAX);
    rig.plan.fail_writes_in(0..crate::DEVICE_LEN);
    let bios = rig.complete_io(&inode);
    report.step(
        "failed_writeback",
        t,
        json!({ "bios": bios, "writes_failed": rig.plan.writes_failed(), "ordered": describe(&oes) }),
    );
    report.expect(!oes.is_empty(), "no ordered extent created");
    report.expect(
        oes.iter().all(|oe| oe.flags().contains(OrderedFlags::IOERR)),
        "ordered extent not flagged IOERR",
    );
    report.expect(inode.ordered_extents().is_empty(), "ordered extent not retired");

    let t = Instant::now();
    let items = rig.items(&inode)?;
    let uptodate = inode.io_tree().test_range(0, len, ExtentBits::UPTODATE, false);
    let ioerr = inode.io_tree().test_range(0, len, ExtentBits::IOERR, true);
    Rig::drop_caches(&inode);
    let read = inode.read(0, ss);
    let fsync = handle.fsync();
    report.step(
        "observe",
        t,
        json!({
            "items": items.len(),
            "uptodate": uptodate,
            "ioerr": ioerr,
            "read": read.as_ref().map(Vec::len).map_err(ToString::to_string),
            "fsync": fsync.as_ref().map_err(ToString::to_string).err(),
        }),
    );
    report.expect(items.is_empty(), "a file extent item was inserted");
    report.expect(!uptodate && ioerr, "range still marked up to date");
    report.expect(
        matches!(read, Err(CfsError::WriteFailed { .. })),
        "read did not report the write error",
    );
    report.expect(
        matches!(fsync, Err(CfsError::WriteFailed { .. })),
        "fsync did not report the write error",
    );
    report.expect(handle.fsync().is_ok(), "the error was reported twice to one handle");
    rig.plan.clear();
    Ok(report)
}

// ── E: truncate during IO ───────────────────────────────────────────────────

pub fn scenario_e() -> Result<ScenarioReport> {
    let mut report = ScenarioReport::new("E", "truncate into an in-flight write");
    let rig = Rig::new("")?;
    let ss = rig.sectorsize();
    let fs_info = rig.fs.fs_info();
    let inode = rig.new_file()?;
    let data = noise(usize::try_from(8 * ss)?, 0x5eed);
    let keep = 3 * ss;

    let t = Instant::now();
    inode.write(0, &data)?;
    inode.flush()?;
    let oes = inode.ordered_extents().in_range(0, u64::MAX);
    report.step("write_and_flush", t, json!({ "ordered": describe(&oes) }));
    let [oe] = oes.as_slice() else {
        bail!("expected one ordered extent, found {}", oes.len());
    };

    let t = Instant::now();
    inode.truncate(keep)?;
    report.step("truncate", t, json!({ "flags": format!("{:?}", oe.flags()), "size": inode.size() }));
    report.expect(oe.flags().contains(OrderedFlags::TRUNCATED), "ordered extent not TRUNCATED");

    let t = Instant::now();
    rig.complete_io(&inode);
    rig.fs.commit()?;
    let items = rig.items(&inode)?;
    let space = fs_info.data_space().snapshot();
    let acct = inode.accounting().snapshot();
    let free = fs_info.alloc().free_bytes();
    report.step(
        "complete",
        t,
        json!({ "committed_len": oe.committed_len(), "space": space, "accounting": acct, "free": free }),
    );
    report.expect(oe.committed_len() == keep, format!("committed {} bytes", oe.committed_len()));
    report.expect(
        matches!(items.as_slice(), [(0, item)] if item.kind.disk().is_some_and(|d| d.num_bytes == keep && d.disk_num_bytes == keep)),
        "file extent item does not stop at the truncation point",
    );
    report.expect(
        space.bytes_reserved == 0 && space.bytes_may_use == 0,
        "reservations leaked",
    );
    report.expect(space.bytes_used == keep, format!("{} bytes used", space.bytes_used));
    report.expect(free == space.total_bytes - keep, "tail freed more or less than once");
    report.expect(acct.outstanding_extents == 0, "outstanding extents left");

    Rig::drop_caches(&inode);
    let back = inode.read(0, 8 * ss)?;
    report.expect(back[..] == data[..usize::try_from(keep)?], "surviving bytes differ");
    Ok(report)
}
