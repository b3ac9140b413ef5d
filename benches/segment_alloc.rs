use std::sync::Arc;

use arbokv::config::SyncMode;
use arbokv::segment::heap::SegmentHeap;
use arbokv::segment::log::SegmentWriter;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use arbokv::cbt::NodeType;
use arbokv::compactor::eligibility::SegmentMetaTable;
use arbokv::epoch::EpochTracker;

fn fresh_writer(sync_mode: SyncMode) -> SegmentWriter {
    let heap = Arc::new(SegmentHeap::anon(8).unwrap());
    let meta = Arc::new(SegmentMetaTable::default());
    let epoch = Arc::new(EpochTracker::new());
    SegmentWriter::new(heap, epoch, meta, sync_mode).unwrap()
}

fn bench_alloc_data(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment_writer_alloc_data");

    for payload_len in [32usize, 128, 512, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(payload_len), &payload_len, |b, &len| {
            let mut writer = fresh_writer(SyncMode::None);
            let payload = vec![0xABu8; len];
            let mut next_addr = 1u32;
            b.iter(|| {
                let (location, ptr) = writer.alloc_data(payload.len(), NodeType::Leaf, next_addr).unwrap();
                unsafe {
                    std::ptr::copy_nonoverlapping(payload.as_ptr(), ptr, payload.len());
                    writer.finalize(location, payload.len());
                }
                next_addr = next_addr.wrapping_add(1);
            });
        });
    }
    group.finish();
}

fn bench_sync_modes(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment_writer_sync_now");
    group.sample_size(20);

    for sync_mode in [SyncMode::None, SyncMode::Mprotect, SyncMode::MsyncAsync, SyncMode::MsyncSync] {
        group.bench_with_input(BenchmarkId::from_parameter(format!("{sync_mode:?}")), &sync_mode, |b, &mode| {
            let payload = vec![0u8; 256];
            b.iter(|| {
                let mut writer = fresh_writer(mode);
                for addr in 1..=64u32 {
                    let (location, ptr) = writer.alloc_data(payload.len(), NodeType::Leaf, addr).unwrap();
                    unsafe {
                        std::ptr::copy_nonoverlapping(payload.as_ptr(), ptr, payload.len());
                        writer.finalize(location, payload.len());
                    }
                }
                writer.sync_now().unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_alloc_data, bench_sync_modes);
criterion_main!(benches);
