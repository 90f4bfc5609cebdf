//! 哈希缓存性能测试
//!
//! 运行: cargo bench --bench hash_cache

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use photolib_lib::core::{Blake3Hasher, HashCache};
use photolib_lib::db::open_state;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::Runtime;

async fn setup(size: usize) -> (TempDir, Arc<HashCache>, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("photo.jpg");
    std::fs::write(&path, vec![0x5au8; size]).unwrap();
    let state = Arc::new(open_state(&dir.path().join("state.db")).await.unwrap());
    let cache = Arc::new(HashCache::new(state, Arc::new(Blake3Hasher::default()), 1024));
    (dir, cache, path)
}

fn bench_get_or_compute(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("hash_cache");

    for size in [64 * 1024, 4 * 1024 * 1024] {
        let (_dir, cache, path) = rt.block_on(setup(size));
        rt.block_on(cache.get_or_compute(&path)).unwrap();

        group.bench_with_input(BenchmarkId::new("memory_hit", size), &size, |b, _| {
            b.to_async(&rt)
                .iter(|| async { black_box(cache.get_or_compute(&path).await.unwrap()) });
        });

        group.bench_with_input(BenchmarkId::new("persistent_hit", size), &size, |b, _| {
            b.to_async(&rt).iter(|| async {
                cache.clear_memory().await;
                black_box(cache.get_or_compute(&path).await.unwrap())
            });
        });

        group.bench_with_input(BenchmarkId::new("miss", size), &size, |b, _| {
            b.to_async(&rt).iter(|| async {
                cache.invalidate(&path).await.unwrap();
                black_box(cache.get_or_compute(&path).await.unwrap())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_get_or_compute);
criterion_main!(benches);
