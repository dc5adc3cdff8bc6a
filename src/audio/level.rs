//! Block level estimation: RMS to dBFS with exponential smoothing

use tracing::trace;

use super::{Block, Timestamp};
use crate::config::DetectionConfig;
use crate::error::ConfigError;

/// One smoothed level measurement per block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelSample {
    /// Arrival time of the block
    pub timestamp: Timestamp,
    /// Smoothed level (dBFS); this is what the detector thresholds
    pub level_dbfs: f64,
    /// Unsmoothed level of this block alone (dBFS)
    pub block_dbfs: f64,
}

/// Converts raw sample blocks into a smoothed dBFS level.
///
/// The smoothing window is expressed in seconds, so the same configuration
/// behaves identically for any block size or sample rate.
pub struct LevelEstimator {
    /// EMA accumulator, `None` until the first block
    smoothed: Option<f64>,
    /// Smoothing window (seconds)
    window_secs: f64,
    /// Value substituted for silence
    floor_dbfs: f64,
}

impl LevelEstimator {
    /// Create an estimator from validated detection settings
    pub fn new(config: &DetectionConfig) -> Result<Self, ConfigError> {
        if !config.smooth_sec.is_finite() || config.smooth_sec < 0.0 {
            return Err(ConfigError::invalid("detection.smooth_sec", config.smooth_sec));
        }
        if !config.silence_floor_dbfs.is_finite() {
            return Err(ConfigError::invalid(
                "detection.silence_floor_dbfs",
                config.silence_floor_dbfs,
            ));
        }

        Ok(Self {
            smoothed: None,
            window_secs: config.smooth_sec,
            floor_dbfs: config.silence_floor_dbfs,
        })
    }

    /// Measure one block and fold it into the running average
    pub fn process(&mut self, block: &Block) -> LevelSample {
        let block_dbfs = self.block_dbfs(&block.samples);
        let alpha = self.alpha(block.duration_secs());

        let level_dbfs = match self.smoothed {
            None => block_dbfs,
            Some(prev) => prev + alpha * (block_dbfs - prev),
        };
        self.smoothed = Some(level_dbfs);

        trace!(
            "Level: block {:.1} dBFS, smoothed {:.1} dBFS (alpha {:.4})",
            block_dbfs,
            level_dbfs,
            alpha
        );

        LevelSample {
            timestamp: block.timestamp,
            level_dbfs,
            block_dbfs,
        }
    }

    /// Unsmoothed dBFS level of a block, clamped at the silence floor
    pub fn block_dbfs(&self, samples: &[f32]) -> f64 {
        dbfs_from_rms(rms(samples), self.floor_dbfs)
    }

    /// Blend factor for a block of the given duration
    fn alpha(&self, block_secs: f64) -> f64 {
        if block_secs <= 0.0 || !block_secs.is_finite() {
            return 0.0;
        }
        if self.window_secs == 0.0 {
            return 1.0;
        }
        1.0 - (-block_secs / self.window_secs).exp()
    }

    /// Last smoothed level, if any block has been seen
    pub fn current(&self) -> Option<f64> {
        self.smoothed
    }

    /// Forget the running average
    pub fn reset(&mut self) {
        self.smoothed = None;
    }
}

/// Root mean square of a block; non-finite samples count as silence
pub fn rms(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&s| if s.is_finite() { s as f64 * s as f64 } else { 0.0 })
        .sum();
    (sum_squares / samples.len() as f64).sqrt()
}

/// `20 * log10(rms)`, never below `floor_dbfs`
pub fn dbfs_from_rms(rms: f64, floor_dbfs: f64) -> f64 {
    if rms <= 0.0 || !rms.is_finite() {
        return floor_dbfs;
    }
    (20.0 * rms.log10()).max(floor_dbfs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration};

    fn base_time() -> Timestamp {
        DateTime::parse_from_rfc3339("2026-03-01T06:00:00+01:00").unwrap()
    }

    fn block(samples: Vec<f32>, sample_rate: u32, offset_ms: i64) -> Block {
        Block {
            samples,
            sample_rate,
            timestamp: base_time() + Duration::milliseconds(offset_ms),
        }
    }

    fn estimator(smooth_sec: f64) -> LevelEstimator {
        let config = DetectionConfig {
            smooth_sec,
            ..Default::default()
        };
        LevelEstimator::new(&config).unwrap()
    }

    #[test]
    fn test_full_scale_square_wave_is_zero_dbfs() {
        let est = estimator(3.0);
        let level = est.block_dbfs(&[1.0, -1.0, 1.0, -1.0]);
        assert!(level.abs() < 1e-9);
    }

    #[test]
    fn test_half_amplitude_is_minus_six() {
        let est = estimator(3.0);
        let level = est.block_dbfs(&[0.5, -0.5, 0.5, -0.5]);
        assert!((level - (-6.0206)).abs() < 1e-3);
    }

    #[test]
    fn test_silence_hits_floor() {
        let est = estimator(3.0);
        assert_eq!(est.block_dbfs(&[0.0; 512]), -120.0);
        assert_eq!(est.block_dbfs(&[]), -120.0);
    }

    #[test]
    fn test_non_finite_samples_are_silence() {
        let est = estimator(3.0);
        assert_eq!(est.block_dbfs(&[f32::NAN, f32::INFINITY, 0.0]), -120.0);

        let mixed = est.block_dbfs(&[f32::NAN, 1.0]);
        // One full-scale sample out of two
        assert!((mixed - (-3.0103)).abs() < 1e-3);
    }

    #[test]
    fn test_first_block_initializes_without_bias() {
        let mut est = estimator(3.0);
        let sample = est.process(&block(vec![0.5; 4410], 44100, 0));
        assert_eq!(sample.level_dbfs, sample.block_dbfs);
        assert_eq!(sample.timestamp, base_time());
    }

    #[test]
    fn test_smoothing_follows_time_constant() {
        let mut est = estimator(1.0);
        est.process(&block(vec![0.0; 100], 100, 0));

        // One 1 s block with a 1 s window moves 1 - e^-1 of the way
        let sample = est.process(&block(vec![1.0; 100], 100, 1000));
        let expected = -120.0 + (1.0 - (-1.0f64).exp()) * 120.0;
        assert!((sample.level_dbfs - expected).abs() < 1e-9);
    }

    #[test]
    fn test_smoothing_independent_of_block_size() {
        let mut coarse = estimator(2.0);
        let mut fine = estimator(2.0);
        coarse.process(&block(vec![0.0; 10], 100, 0));
        fine.process(&block(vec![0.0; 10], 100, 0));

        coarse.process(&block(vec![0.25; 100], 100, 1000));
        for i in 0..10 {
            fine.process(&block(vec![0.25; 10], 100, 100 * (i + 1)));
        }

        let a = coarse.current().unwrap();
        let b = fine.current().unwrap();
        assert!((a - b).abs() < 1e-9, "coarse {a} vs fine {b}");
    }

    #[test]
    fn test_silence_converges_to_floor() {
        let mut est = estimator(3.0);
        est.process(&block(vec![0.9; 441], 44100, 0));

        // 10 ms blocks, 3 s window: ten time constants in 30 s
        let mut last = 0.0;
        for i in 1..=3000 {
            let sample = est.process(&block(vec![0.0; 441], 44100, 10 * i));
            assert!(sample.level_dbfs.is_finite());
            last = sample.level_dbfs;
        }
        assert!((last - (-120.0)).abs() < 0.01, "level {last}");
    }

    #[test]
    fn test_zero_window_disables_smoothing() {
        let mut est = estimator(0.0);
        est.process(&block(vec![0.0; 100], 100, 0));
        let sample = est.process(&block(vec![1.0; 100], 100, 1000));
        assert!(sample.level_dbfs.abs() < 1e-9);
    }

    #[test]
    fn test_empty_block_keeps_level() {
        let mut est = estimator(3.0);
        est.process(&block(vec![0.5; 100], 100, 0));
        let before = est.current().unwrap();
        let sample = est.process(&block(Vec::new(), 100, 1000));
        assert_eq!(sample.level_dbfs, before);
    }

    #[test]
    fn test_reset() {
        let mut est = estimator(3.0);
        est.process(&block(vec![0.5; 100], 100, 0));
        est.reset();
        assert!(est.current().is_none());
    }
}
