//! Performance benchmarks for meridian-files' blob scheduler and checksums.
//!
//! Run with: `cargo bench -p meridian-files`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use meridian_core::Connection;
use meridian_crypto::x25519::PrivateKey;
use meridian_files::hasher::{hash_chunk, hash_file};
use meridian_files::scheduler::{BlobScheduler, DrainMode, MemorySource};
use meridian_wire::control::Role;
use rand_core::OsRng;

const EVENT_SIZE: usize = 256;

fn handshaken_client() -> Connection {
    let psk = b"files bench psk";
    let mut client =
        Connection::new_client(psk, PrivateKey::generate(&mut OsRng), EVENT_SIZE, Role::Sink).unwrap();
    let mut server = Connection::new_server(psk, PrivateKey::generate(&mut OsRng), EVENT_SIZE, Role::Source);

    server.feed(&client.flush());
    server.poll().unwrap();
    client.feed(&server.flush());
    client.poll().unwrap();
    server.feed(&client.flush());
    server.poll().unwrap();
    client.feed(&server.flush());
    client.poll().unwrap();

    client
}

fn bench_append_blob(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_blob");
    for size in [64usize * 1024, 256 * 1024, 4 * 1024 * 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let conn = handshaken_client();
                    let mut scheduler = BlobScheduler::new();
                    scheduler.enqueue(0, Box::new(MemorySource::new(vec![0xABu8; size])), size as u64, None);
                    (conn, scheduler)
                },
                |(mut conn, mut scheduler)| {
                    loop {
                        match scheduler
                            .append_blob(&mut conn, black_box(DrainMode::All), 0)
                            .unwrap()
                        {
                            meridian_files::scheduler::AppendOutcome::Sent { complete: true, .. } => break,
                            meridian_files::scheduler::AppendOutcome::Sent { .. } => continue,
                            other => panic!("unexpected outcome: {other:?}"),
                        }
                    }
                    black_box(conn.flush().len())
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_hash_chunk(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_chunk");
    for size in [1024usize, 64 * 1024, 1024 * 1024] {
        let data = vec![0x11u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| black_box(hash_chunk(black_box(data))));
        });
    }
    group.finish();
}

fn bench_hash_file(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_file");
    for size in [1_000_000usize, 10_000_000] {
        let data = vec![0x22u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| black_box(hash_file(black_box(data))));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_append_blob, bench_hash_chunk, bench_hash_file);
criterion_main!(benches);
