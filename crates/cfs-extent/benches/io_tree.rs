//! Benchmark: extent IO tree set/clear churn.
//!
//! Models a writer dirtying 4 KiB pages in random-ish order followed by a
//! flusher clearing the whole range, which exercises split and merge.

use cfs_extent::{ExtentBits, ExtentIoTree};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

const PAGE: u64 = 4096;
const PAGES: u64 = 4096;

fn scattered_order() -> Vec<u64> {
    // Stride coprime with PAGES visits every page once.
    (0..PAGES).map(|i| (i * 1031) % PAGES).collect()
}

fn bench_dirty_then_flush(c: &mut Criterion) {
    let order = scattered_order();
    let mut group = c.benchmark_group("io_tree");

    group.bench_function("set_scattered_pages", |b| {
        b.iter(|| {
            let tree = ExtentIoTree::default();
            for &p in &order {
                tree.set_bits(p * PAGE, (p + 1) * PAGE, ExtentBits::DELALLOC);
            }
            black_box(tree.state_count())
        });
    });

    group.bench_function("set_then_clear_all", |b| {
        b.iter(|| {
            let tree = ExtentIoTree::default();
            for &p in &order {
                tree.set_bits(p * PAGE, (p + 1) * PAGE, ExtentBits::DELALLOC);
            }
            black_box(tree.clear_bits(0, PAGES * PAGE, ExtentBits::DELALLOC))
        });
    });

    group.bench_function("find_first_delalloc", |b| {
        let tree = ExtentIoTree::default();
        for p in (0..PAGES).step_by(2) {
            tree.set_bits(p * PAGE, (p + 1) * PAGE, ExtentBits::DELALLOC);
        }
        b.iter(|| black_box(tree.find_first(black_box(PAGES / 2 * PAGE), ExtentBits::DELALLOC)));
    });

    group.finish();
}

criterion_group!(benches, bench_dirty_then_flush);
criterion_main!(benches);
