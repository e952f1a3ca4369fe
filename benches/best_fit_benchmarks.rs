//! Lookup and synthesis benchmarks for the favicon cache
//!
//! These measure the hot read path (exact hits), the scaling path and the
//! cost of culling under a tight byte budget.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use favicon_cache::{FaviconCache, ImageScaler, ScaleFilter};
use image::{DynamicImage, Rgba, RgbaImage};
use std::hint::black_box;

fn icon(edge: u32) -> DynamicImage {
    DynamicImage::ImageRgba8(RgbaImage::from_pixel(edge, edge, Rgba([30, 144, 255, 255])))
}

fn populated_cache(keys: usize, capacity_bytes: usize) -> FaviconCache {
    let cache = FaviconCache::builder()
        .capacity_bytes(capacity_bytes)
        .scaler(ImageScaler::new(ScaleFilter::Triangle))
        .build();
    for index in 0..keys {
        cache.put_primaries(&format!("https://site-{index}.example/favicon.ico"), [icon(16), icon(32), icon(64)]);
    }
    cache
}

// =============================================================================
// READ PATH
// =============================================================================

fn bench_exact_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("best_fit_exact_hit");
    for keys in [16usize, 256, 4096] {
        let cache = populated_cache(keys, usize::MAX);
        let key = format!("https://site-{}.example/favicon.ico", keys / 2);
        group.bench_with_input(BenchmarkId::from_parameter(keys), &keys, |b, _| {
            b.iter(|| black_box(cache.get_best_fit(black_box(&key), 32)))
        });
    }
    group.finish();
}

// =============================================================================
// SYNTHESIS PATH
// =============================================================================

fn bench_synthesis(c: &mut Criterion) {
    let mut group = c.benchmark_group("best_fit_synthesis");
    for target in [20u32, 48, 100] {
        group.bench_with_input(BenchmarkId::from_parameter(target), &target, |b, &target| {
            b.iter_batched(
                || populated_cache(1, usize::MAX),
                |cache| black_box(cache.get_best_fit("https://site-0.example/favicon.ico", target)),
                criterion::BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn bench_cull_under_pressure(c: &mut Criterion) {
    // Budget for roughly eight keys' worth of primaries.
    let budget = 8 * (16 * 16 + 32 * 32 + 64 * 64) * 4;
    let cache = populated_cache(8, budget);
    let mut next = 8usize;
    c.bench_function("put_primaries_with_cull", |b| {
        b.iter(|| {
            cache.put_primaries(&format!("https://site-{next}.example/favicon.ico"), [icon(16), icon(32), icon(64)]);
            next += 1;
        })
    });
}

criterion_group!(benches, bench_exact_hit, bench_synthesis, bench_cull_under_pressure);
criterion_main!(benches);
