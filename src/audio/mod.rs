//! Audio capture and level estimation

pub mod capture;
pub mod level;

use chrono::{DateTime, FixedOffset};

pub use capture::{AudioCapture, CaptureStats, NextBlock};
pub use level::{LevelEstimator, LevelSample};

/// Wall-clock instant with its UTC offset
pub type Timestamp = DateTime<FixedOffset>;

/// One fixed-size chunk of mono samples as delivered by the capture callback
#[derive(Debug, Clone)]
pub struct Block {
    /// Amplitudes normalised to [-1, 1]
    pub samples: Vec<f32>,
    /// Sample rate the block was captured at (Hz)
    pub sample_rate: u32,
    /// Arrival time of the block
    pub timestamp: Timestamp,
}

impl Block {
    /// Duration covered by the block (seconds)
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}
