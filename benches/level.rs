//! Benchmarks for block level estimation

use chrono::{DateTime, Duration};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use train_detector::{Block, DetectionConfig, LevelEstimator};

fn generate_blocks(sample_rate: u32, block_size: usize, count: usize) -> Vec<Block> {
    let base = DateTime::parse_from_rfc3339("2026-03-01T06:00:00+00:00").unwrap();
    let block_ms = (block_size as f64 * 1000.0 / sample_rate as f64) as i64;
    (0..count)
        .map(|n| {
            let samples = (0..block_size)
                .map(|i| {
                    let t = (n * block_size + i) as f32 / sample_rate as f32;
                    0.3 * (2.0 * std::f32::consts::PI * 120.0 * t).sin()
                })
                .collect();
            Block {
                samples,
                sample_rate,
                timestamp: base + Duration::milliseconds(block_ms * n as i64),
            }
        })
        .collect()
}

fn bench_level_estimator(c: &mut Criterion) {
    let mut group = c.benchmark_group("level_estimator");
    let config = DetectionConfig::default();

    for block_size in [512usize, 2048, 4410] {
        let blocks = generate_blocks(44100, block_size, 100);
        group.bench_with_input(
            BenchmarkId::new("block_size", block_size),
            &blocks,
            |b, blocks| {
                b.iter_with_setup(
                    || LevelEstimator::new(&config).unwrap(),
                    |mut estimator| {
                        for block in blocks {
                            black_box(estimator.process(block));
                        }
                    },
                )
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_level_estimator);
criterion_main!(benches);
