//! Buffer pool benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use strata_buffer::{BufferPool, BufferPoolConfig};
use strata_common::types::ChunkKey;

fn create_benchmark(c: &mut Criterion) {
    c.bench_function("create_1000_chunks", |b| {
        b.iter(|| {
            let pool = BufferPool::cpu(BufferPoolConfig::new(1 << 20)).unwrap();
            for i in 0..1000 {
                pool.create_buffer(&ChunkKey::new(&[1, i]), 0, 512).unwrap();
            }
            black_box(pool.num_chunks())
        })
    });
}

fn get_benchmark(c: &mut Criterion) {
    let pool = BufferPool::cpu(BufferPoolConfig::new(1 << 20)).unwrap();
    let keys: Vec<ChunkKey> = (0..512).map(|i| ChunkKey::new(&[1, i])).collect();
    for key in &keys {
        pool.create_buffer(key, 0, 512).unwrap();
    }

    c.bench_function("get_hot_512", |b| {
        b.iter(|| {
            for key in &keys {
                black_box(pool.get_buffer(key, 0).unwrap().size());
            }
        })
    });
}

fn churn_benchmark(c: &mut Criterion) {
    // 64-page pool: every create past the 64th evicts the oldest chunk.
    let config = BufferPoolConfig::new(64 * 512).with_page_size(512);
    let pool = BufferPool::cpu(config).unwrap();
    let mut next = 0i32;

    c.bench_function("create_evict_64_page_pool", |b| {
        b.iter(|| {
            let key = ChunkKey::new(&[7, next]);
            next = next.wrapping_add(1);
            let buf = pool.create_buffer(&key, 0, 512).unwrap();
            black_box(buf.allocated_size())
        })
    });
}

fn write_read_benchmark(c: &mut Criterion) {
    let pool = BufferPool::cpu(BufferPoolConfig::new(1 << 20)).unwrap();
    let buf = pool.create_buffer(&ChunkKey::new(&[3, 1]), 0, 64 * 1024).unwrap();
    let payload = vec![42u8; 64 * 1024];
    let mut out = vec![0u8; 64 * 1024];

    c.bench_function("write_read_64k", |b| {
        b.iter(|| {
            buf.write(&payload, 0).unwrap();
            buf.read(&mut out, 0).unwrap();
            black_box(out[0])
        })
    });
}

criterion_group!(
    benches,
    create_benchmark,
    get_benchmark,
    churn_benchmark,
    write_read_benchmark,
);
criterion_main!(benches);
