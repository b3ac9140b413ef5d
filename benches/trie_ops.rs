use std::sync::Arc;

use arbokv::cbt::ControlBlockTable;
use arbokv::compactor::eligibility::SegmentMetaTable;
use arbokv::config::SyncMode;
use arbokv::epoch::EpochTracker;
use arbokv::node::{LeafNode, NodeBody};
use arbokv::segment::heap::SegmentHeap;
use arbokv::segment::log::SegmentWriter;
use arbokv::trie::{apply, get, NodeStore, Op};
use arbokv::Address;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

fn fresh_store() -> (NodeStore, SegmentWriter, Address) {
    let heap = Arc::new(SegmentHeap::anon(16).unwrap());
    let cbt = Arc::new(ControlBlockTable::new());
    let meta = Arc::new(SegmentMetaTable::default());
    let epoch = Arc::new(EpochTracker::new());
    let mut writer = SegmentWriter::new(heap.clone(), epoch, meta, SyncMode::None).unwrap();
    let store = NodeStore::new(heap, cbt);
    let root = store.allocate(&mut writer, &NodeBody::Leaf(LeafNode::default())).unwrap();
    (store, writer, root)
}

fn bench_sequential_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("trie_sequential_insert");

    for count in [100usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let (store, mut writer, mut root) = fresh_store();
                for i in 0..count {
                    let key = format!("key-{i:08}");
                    let result = apply(&store, &mut writer, root, key.as_bytes(), Op::Insert(b"value")).unwrap();
                    root = result.new_root;
                }
            });
        });
    }
    group.finish();
}

fn bench_upsert_same_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("trie_repeated_upsert");

    group.bench_function("1000_upserts_same_key", |b| {
        b.iter(|| {
            let (store, mut writer, mut root) = fresh_store();
            for i in 0..1000u32 {
                let value = i.to_le_bytes();
                let result = apply(&store, &mut writer, root, b"hot-key", Op::Upsert(&value)).unwrap();
                root = result.new_root;
            }
        });
    });
    group.finish();
}

fn bench_point_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("trie_point_lookup");

    for count in [100usize, 1_000, 10_000] {
        let (store, mut writer, mut root) = fresh_store();
        let keys: Vec<String> = (0..count).map(|i| format!("key-{i:08}")).collect();
        for key in &keys {
            let result = apply(&store, &mut writer, root, key.as_bytes(), Op::Insert(b"value")).unwrap();
            root = result.new_root;
        }

        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                for key in &keys {
                    get(&store, root, key.as_bytes()).unwrap();
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_sequential_insert, bench_upsert_same_key, bench_point_lookup);
criterion_main!(benches);
