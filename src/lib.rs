//! Train Detector
//!
//! Listens to a microphone and records sustained loud events (passing
//! trains) as rows in an append-only CSV log.
//!
//! # Architecture
//!
//! - `audio`: cpal capture and per-block level estimation (RMS → dBFS → EMA)
//! - `detector`: hysteresis state machine with minimum-duration and
//!   stop-hold guards, producing [`EventRecord`]s
//! - `pipeline`: runs estimator and detector once per block
//! - `output`: CSV/JSON row formats, crash-safe appenders and the background
//!   persistence worker
//! - `config`: configuration structures
//! - `error`: error types
//!
//! # Example
//!
//! ```no_run
//! use train_detector::{AudioCapture, Config, OutputWriter, PersistenceWorker, Pipeline};
//!
//! let config = Config::default();
//! config.validate().unwrap();
//!
//! let mut capture = AudioCapture::new(config.audio.clone()).unwrap();
//! capture.init().unwrap();
//!
//! let pipeline = Pipeline::new(&config.detection).unwrap();
//! let writer = OutputWriter::new(config.output.clone()).unwrap();
//! let worker = PersistenceWorker::spawn(writer, config.output.queue_capacity, 1).unwrap();
//! ```

pub mod audio;
pub mod config;
pub mod detector;
pub mod error;
pub mod output;
pub mod pipeline;

// Re-exports for convenience
pub use audio::{AudioCapture, Block, LevelEstimator, LevelSample, Timestamp};
pub use config::{AudioConfig, Config, DetectionConfig, OutputConfig, OutputFormat};
pub use detector::{EventDetector, EventRecord, Phase};
pub use error::{AudioError, ConfigError, DetectorError, Result, StorageError};
pub use output::{OutputWriter, PersistenceWorker, RecordSink};
pub use pipeline::{BlockOutput, LevelRecord, Pipeline, SharedPipeline};
