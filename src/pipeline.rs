//! Per-block processing: level estimation followed by event detection

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::audio::{Block, LevelEstimator, Timestamp};
use crate::config::DetectionConfig;
use crate::detector::{EventDetector, EventRecord, Phase};
use crate::error::ConfigError;

/// One row of the optional level log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelRecord {
    pub timestamp: Timestamp,
    /// Unsmoothed block level
    pub block_dbfs: f64,
    /// Smoothed level seen by the detector
    pub smoothed_dbfs: f64,
    pub threshold_dbfs: f64,
    /// Detector phase after this block
    pub status: Phase,
}

/// Everything produced by one block
#[derive(Debug, Clone)]
pub struct BlockOutput {
    pub level: LevelRecord,
    pub event: Option<EventRecord>,
}

/// Owns the per-stream state of one sensor: smoothing plus detection
pub struct Pipeline {
    estimator: LevelEstimator,
    detector: EventDetector,
    threshold_dbfs: f64,
    blocks: u64,
    events: u64,
}

impl Pipeline {
    pub fn new(config: &DetectionConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            estimator: LevelEstimator::new(config)?,
            detector: EventDetector::new(config)?,
            threshold_dbfs: config.threshold_dbfs,
            blocks: 0,
            events: 0,
        })
    }

    /// Run one block through the estimator and the detector
    pub fn process_block(&mut self, block: &Block) -> BlockOutput {
        let sample = self.estimator.process(block);
        let event = self.detector.feed(&sample);

        self.blocks += 1;
        if event.is_some() {
            self.events += 1;
        }

        BlockOutput {
            level: LevelRecord {
                timestamp: sample.timestamp,
                block_dbfs: sample.block_dbfs,
                smoothed_dbfs: sample.level_dbfs,
                threshold_dbfs: self.threshold_dbfs,
                status: self.detector.phase(),
            },
            event,
        }
    }

    /// Force-finalize any in-progress event
    pub fn finish(&mut self) -> Option<EventRecord> {
        let event = self.detector.finish();
        if event.is_some() {
            self.events += 1;
        }
        event
    }

    pub fn phase(&self) -> Phase {
        self.detector.phase()
    }

    pub fn detector(&self) -> &EventDetector {
        &self.detector
    }

    /// Blocks processed so far
    pub fn blocks_processed(&self) -> u64 {
        self.blocks
    }

    /// Events emitted so far, including force-finalized ones
    pub fn events_emitted(&self) -> u64 {
        self.events
    }
}

/// Pipeline handle that can be fed from several threads.
///
/// Blocks are serialised through a single lock; ordering between threads is
/// whatever order they acquire it in.
#[derive(Clone)]
pub struct SharedPipeline {
    inner: Arc<Mutex<Pipeline>>,
}

impl SharedPipeline {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            inner: Arc::new(Mutex::new(pipeline)),
        }
    }

    pub fn process_block(&self, block: &Block) -> BlockOutput {
        self.inner.lock().process_block(block)
    }

    pub fn finish(&self) -> Option<EventRecord> {
        self.inner.lock().finish()
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock().phase()
    }

    pub fn events_emitted(&self) -> u64 {
        self.inner.lock().events_emitted()
    }
}
