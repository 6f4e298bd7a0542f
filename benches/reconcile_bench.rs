use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use drivesync_lib::core::conflict::ConflictStrategy;
use drivesync_lib::core::delta::{RemoteChanges, RemoteEntry};
use drivesync_lib::core::scanner::{LocalEntry, LocalScan};
use drivesync_lib::core::state::ItemRecord;
use drivesync_lib::core::{reconcile, ReconcileInput};

const NOW: i64 = 1_700_000_000;

fn record(i: usize) -> ItemRecord {
    ItemRecord::converged(
        &format!("id-{}", i),
        Some("root"),
        &format!("file{}.txt", i),
        false,
        Some(format!("fp-{}", i)),
        1000,
        100,
        Some("v1".into()),
        10,
        NOW,
    )
}

fn local(i: usize, fp: String) -> LocalEntry {
    LocalEntry {
        path: format!("file{}.txt", i),
        size: 1000,
        mtime: 100,
        fingerprint: Some(fp),
        is_folder: false,
        folder_state: None,
    }
}

fn remote(i: usize, hash: String) -> RemoteEntry {
    RemoteEntry {
        id: format!("id-{}", i),
        parent_id: Some("root".into()),
        name: format!("file{}.txt", i),
        path: format!("file{}.txt", i),
        is_folder: false,
        deleted: false,
        size: 1000,
        mtime: 10,
        content_hash: Some(hash),
        version: Some("v2".into()),
    }
}

fn bench_steady_state(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconcile_steady_state");

    for count in [100usize, 1000, 10000].iter() {
        let records: Vec<ItemRecord> = (0..*count).map(record).collect();
        let mut scan = LocalScan::default();
        for i in 0..*count {
            let entry = local(i, format!("fp-{}", i));
            scan.entries.insert(entry.path.clone(), entry);
        }
        let changes = RemoteChanges::default();

        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| {
                reconcile(black_box(&ReconcileInput {
                    records: &records,
                    tombstones: &[],
                    local: &scan,
                    remote: &changes,
                    strategy: ConflictStrategy::KeepBoth,
                    now: NOW,
                }))
            });
        });
    }
    group.finish();
}

fn bench_mixed_changes(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconcile_mixed_changes");

    for count in [100usize, 1000, 10000].iter() {
        let records: Vec<ItemRecord> = (0..*count).map(record).collect();
        let mut scan = LocalScan::default();
        let mut changes = RemoteChanges::default();
        for i in 0..*count {
            // 每 4 个改一次本地，每 3 个改一次远端，重叠的成为冲突
            let local_fp = if i % 4 == 0 { format!("local-{}", i) } else { format!("fp-{}", i) };
            let entry = local(i, local_fp);
            scan.entries.insert(entry.path.clone(), entry);
            if i % 3 == 0 {
                changes.entries.push(remote(i, format!("remote-{}", i)));
            }
        }
        for i in *count..count + count / 10 {
            changes.entries.push(remote(i, format!("new-{}", i)));
        }

        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| {
                reconcile(black_box(&ReconcileInput {
                    records: &records,
                    tombstones: &[],
                    local: &scan,
                    remote: &changes,
                    strategy: ConflictStrategy::KeepBoth,
                    now: NOW,
                }))
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_steady_state, bench_mixed_changes);
criterion_main!(benches);
