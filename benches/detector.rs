//! Benchmarks for the event detector

use chrono::{DateTime, Duration};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use train_detector::{DetectionConfig, EventDetector, LevelSample, Timestamp};

fn base_time() -> Timestamp {
    DateTime::parse_from_rfc3339("2026-03-01T06:00:00+00:00").unwrap()
}

/// One hour of 50 ms levels with a five-minute train every fifteen minutes
fn generate_hour_of_levels() -> Vec<LevelSample> {
    (0..72_000i64)
        .map(|i| {
            let secs = i as f64 * 0.05;
            let in_train = (secs % 900.0) < 300.0;
            let wobble = 3.0 * (secs * 0.7).sin();
            let level = if in_train { -10.0 + wobble } else { -35.0 + wobble };
            LevelSample {
                timestamp: base_time() + Duration::milliseconds(50 * i),
                level_dbfs: level,
                block_dbfs: level,
            }
        })
        .collect()
}

fn bench_detector(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_detector");
    let levels = generate_hour_of_levels();
    let config = DetectionConfig::default();

    group.bench_function("one_hour_50ms_blocks", |b| {
        b.iter_with_setup(
            || EventDetector::new(&config).unwrap(),
            |mut detector| {
                let mut events = 0;
                for sample in &levels {
                    if detector.feed(black_box(sample)).is_some() {
                        events += 1;
                    }
                }
                black_box(events)
            },
        )
    });

    group.finish();
}

fn bench_hysteresis(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_detector_hysteresis");
    let levels = generate_hour_of_levels();

    for hysteresis in [0.0, 2.0, 6.0] {
        let config = DetectionConfig {
            hysteresis_db: hysteresis,
            ..Default::default()
        };

        group.bench_with_input(
            BenchmarkId::new("hysteresis_db", format!("{:.1}", hysteresis)),
            &levels,
            |b, levels| {
                b.iter_with_setup(
                    || EventDetector::new(&config).unwrap(),
                    |mut detector| {
                        for sample in levels {
                            black_box(detector.feed(sample));
                        }
                    },
                )
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_detector, bench_hysteresis);
criterion_main!(benches);
