// WAL append/fsync path benchmarks: group-commit batching under varying
// record sizes and group fan-out, since the node-wide WAL writer is the
// single hard serialization point every hosted group passes through.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use raft_core::config::WalConfig;
use raft_core::types::{GroupId, LogIndex, Term};
use raft_core::wal::record::RecordKind;
use raft_core::wal::WalWriter;
use tempfile::TempDir;

fn make_writer(cfg: WalConfig) -> (std::sync::Arc<WalWriter>, TempDir) {
    let dir = TempDir::new().unwrap();
    let (writer, _sealed_rx, _recovered) = WalWriter::open(dir.path(), cfg).unwrap();
    (writer, dir)
}

fn bench_single_group_append_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_single_group_append_flush");

    for payload_len in [64usize, 1024, 16384] {
        group.bench_with_input(BenchmarkId::from_parameter(payload_len), &payload_len, |b, &payload_len| {
            let (writer, _dir) = make_writer(WalConfig::default());
            let gid = GroupId::new(1);
            let mut index = 1u64;
            b.iter(|| {
                let payload = vec![0xAB; payload_len];
                writer.append(gid, LogIndex(index), Term(1), RecordKind::UserCommand, black_box(payload)).unwrap();
                writer.flush().unwrap();
                index += 1;
            });
        });
    }

    group.finish();
}

fn bench_fanned_out_groups_append_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_fanned_out_groups_append_flush");

    for group_count in [1usize, 16, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(group_count), &group_count, |b, &group_count| {
            let (writer, _dir) = make_writer(WalConfig::default());
            let groups: Vec<GroupId> = (0..group_count as u64).map(GroupId::new).collect();
            let mut index = 1u64;
            b.iter(|| {
                for gid in &groups {
                    writer.append(*gid, LogIndex(index), Term(1), RecordKind::Noop, vec![]).unwrap();
                }
                writer.flush().unwrap();
                index += 1;
            });
        });
    }

    group.finish();
}

fn bench_group_commit_batching(c: &mut Criterion) {
    c.bench_function("wal_group_commit_batch_of_256", |b| {
        let mut cfg = WalConfig::default();
        cfg.max_batch_records = 256;
        let (writer, _dir) = make_writer(cfg);
        let gid = GroupId::new(1);
        let mut index = 1u64;
        b.iter(|| {
            for _ in 0..256 {
                writer.append(gid, LogIndex(index), Term(1), RecordKind::Noop, vec![]).unwrap();
                index += 1;
            }
            writer.flush().unwrap();
        });
    });
}

criterion_group!(benches, bench_single_group_append_flush, bench_fanned_out_groups_append_flush, bench_group_commit_batching);
criterion_main!(benches);
