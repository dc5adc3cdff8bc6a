//! Sustained-level event detection
//!
//! [`EventDetector`] consumes one smoothed level per block and runs a
//! hysteresis state machine with two timing guards:
//!
//! ```text
//! Idle ──level ≥ trigger──▶ Candidate ──elapsed ≥ min duration──▶ Active
//!   ▲                          │ level < release                 │  ▲
//!   └──────────────────────────┘                   level < release│  │level ≥ release
//!   ▲                                                              ▼  │
//!   └──────────── now − last above ≥ stop hold (emit) ─────────── Holding
//! ```
//!
//! A candidate that drops below the release threshold before the minimum
//! duration is discarded. A dip shorter than the stop hold does not split an
//! event. The emitted record ends at the last block that was at or above the
//! release threshold, so the trailing hold window is never counted.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::audio::{LevelSample, Timestamp};
use crate::config::DetectionConfig;
use crate::error::ConfigError;

/// Detector phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// No sustained elevation suspected
    Idle,
    /// Above the trigger threshold, minimum duration not yet met
    Candidate,
    /// A real event is ongoing
    Active,
    /// Below the release threshold, inside the stop-hold grace window
    Holding,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Candidate => "candidate",
            Phase::Active => "active",
            Phase::Holding => "holding",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Phase::Idle),
            "candidate" => Ok(Phase::Candidate),
            "active" => Ok(Phase::Active),
            "holding" => Ok(Phase::Holding),
            other => Err(format!("unknown phase '{other}'")),
        }
    }
}

/// A completed detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// First block at or above the trigger threshold
    pub start_time: Timestamp,
    /// Last block at or above the release threshold
    pub end_time: Timestamp,
    /// `end_time - start_time` in seconds
    pub duration_seconds: f64,
    /// Mean smoothed level over the event
    pub avg_level_dbfs: f64,
    /// Highest smoothed level over the event
    pub peak_level_dbfs: f64,
    /// Trigger threshold in force
    pub threshold_dbfs: f64,
    /// Blocks at or above the release threshold
    pub block_count: u64,
}

/// Running sum/peak of levels
#[derive(Debug, Clone, Copy)]
struct LevelStats {
    sum: f64,
    samples: u64,
    peak: f64,
}

impl Default for LevelStats {
    fn default() -> Self {
        Self {
            sum: 0.0,
            samples: 0,
            peak: f64::NEG_INFINITY,
        }
    }
}

impl LevelStats {
    fn add(&mut self, level: f64) {
        self.sum += level;
        self.samples += 1;
        self.peak = self.peak.max(level);
    }

    fn merge(&mut self, other: &LevelStats) {
        self.sum += other.sum;
        self.samples += other.samples;
        self.peak = self.peak.max(other.peak);
    }

    fn mean(&self) -> f64 {
        if self.samples == 0 {
            return self.peak;
        }
        // Rounding must not push the mean past the peak
        (self.sum / self.samples as f64).min(self.peak)
    }
}

/// Accumulators for a candidate or ongoing event
#[derive(Debug, Clone)]
struct EventState {
    start: Timestamp,
    last_above: Timestamp,
    stats: LevelStats,
    /// Samples below release seen while holding; committed only on resume
    pending: LevelStats,
    above_blocks: u64,
}

impl EventState {
    fn begin(now: Timestamp, level: f64) -> Self {
        let mut state = Self {
            start: now,
            last_above: now,
            stats: LevelStats::default(),
            pending: LevelStats::default(),
            above_blocks: 0,
        };
        state.accumulate_above(now, level);
        state
    }

    fn accumulate_above(&mut self, now: Timestamp, level: f64) {
        self.stats.add(level);
        self.above_blocks += 1;
        self.last_above = now;
    }

    fn stage(&mut self, level: f64) {
        self.pending.add(level);
    }

    fn commit_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        self.stats.merge(&pending);
    }
}

#[derive(Debug)]
enum State {
    Idle,
    Candidate(EventState),
    Active(EventState),
    Holding(EventState),
}

impl State {
    fn phase(&self) -> Phase {
        match self {
            State::Idle => Phase::Idle,
            State::Candidate(_) => Phase::Candidate,
            State::Active(_) => Phase::Active,
            State::Holding(_) => Phase::Holding,
        }
    }
}

/// Hysteresis + timing state machine over a stream of level samples
pub struct EventDetector {
    trigger_dbfs: f64,
    release_dbfs: f64,
    min_duration_s: f64,
    stop_hold_s: f64,
    floor_dbfs: f64,
    state: State,
    /// Timestamp of the last accepted sample
    last_timestamp: Option<Timestamp>,
    /// Samples rejected for non-increasing timestamps
    dropped_samples: u64,
}

impl EventDetector {
    /// Create a detector; invalid settings are rejected here, never mid-stream
    pub fn new(config: &DetectionConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            trigger_dbfs: config.trigger_threshold(),
            release_dbfs: config.release_threshold(),
            min_duration_s: config.min_duration_s,
            stop_hold_s: config.stop_hold_s,
            floor_dbfs: config.silence_floor_dbfs,
            state: State::Idle,
            last_timestamp: None,
            dropped_samples: 0,
        })
    }

    /// Feed one level sample; returns a record when an event completes
    pub fn feed(&mut self, sample: &LevelSample) -> Option<EventRecord> {
        let now = sample.timestamp;
        if let Some(prev) = self.last_timestamp {
            if now <= prev {
                self.dropped_samples += 1;
                debug!(
                    "Dropping level sample at {} (not after previous sample at {})",
                    now, prev
                );
                return None;
            }
        }
        self.last_timestamp = Some(now);

        // NaN and -inf collapse to the floor
        let level = sample.level_dbfs.max(self.floor_dbfs);

        let state = std::mem::replace(&mut self.state, State::Idle);
        let before = state.phase();
        let (next, record) = self.step(state, now, level);
        let after = next.phase();
        self.state = next;

        if before != after {
            debug!("Detector: {} -> {} at {} ({:.1} dBFS)", before, after, now, level);
        }

        record
    }

    fn step(&self, state: State, now: Timestamp, level: f64) -> (State, Option<EventRecord>) {
        let above_release = level >= self.release_dbfs;

        match state {
            State::Idle => {
                if level >= self.trigger_dbfs {
                    (State::Candidate(EventState::begin(now, level)), None)
                } else {
                    (State::Idle, None)
                }
            }
            State::Candidate(mut event) => {
                if !above_release {
                    debug!(
                        "Discarding candidate after {:.1}s",
                        seconds_between(event.start, now)
                    );
                    return (State::Idle, None);
                }
                event.accumulate_above(now, level);
                if seconds_between(event.start, now) >= self.min_duration_s {
                    info!("Event started at {}", event.start);
                    (State::Active(event), None)
                } else {
                    (State::Candidate(event), None)
                }
            }
            State::Active(mut event) => {
                if above_release {
                    event.accumulate_above(now, level);
                    (State::Active(event), None)
                } else {
                    event.stage(level);
                    (State::Holding(event), None)
                }
            }
            State::Holding(mut event) => {
                if above_release {
                    event.commit_pending();
                    event.accumulate_above(now, level);
                    (State::Active(event), None)
                } else if seconds_between(event.last_above, now) < self.stop_hold_s {
                    event.stage(level);
                    (State::Holding(event), None)
                } else {
                    (State::Idle, Some(self.finalize(event)))
                }
            }
        }
    }

    /// Force-finalize on shutdown.
    ///
    /// An active or holding event is emitted ending at its last block above
    /// the release threshold; a pending candidate is discarded.
    pub fn finish(&mut self) -> Option<EventRecord> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Active(event) | State::Holding(event) => {
                info!("Finalizing in-progress event on shutdown");
                Some(self.finalize(event))
            }
            State::Candidate(event) => {
                debug!("Discarding candidate started at {} on shutdown", event.start);
                None
            }
            State::Idle => None,
        }
    }

    fn finalize(&self, event: EventState) -> EventRecord {
        let record = EventRecord {
            start_time: event.start,
            end_time: event.last_above,
            duration_seconds: seconds_between(event.start, event.last_above),
            avg_level_dbfs: event.stats.mean(),
            peak_level_dbfs: event.stats.peak,
            threshold_dbfs: self.trigger_dbfs,
            block_count: event.above_blocks,
        };

        info!(
            "Event: {} -> {}, {:.1}s, avg {:.1} dBFS, peak {:.1} dBFS, {} blocks",
            record.start_time,
            record.end_time,
            record.duration_seconds,
            record.avg_level_dbfs,
            record.peak_level_dbfs,
            record.block_count
        );
        record
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// `(trigger, release)` thresholds in dBFS
    pub fn thresholds(&self) -> (f64, f64) {
        (self.trigger_dbfs, self.release_dbfs)
    }

    /// Samples dropped for non-increasing timestamps
    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples
    }

    /// Return to idle, discarding any candidate or event
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.last_timestamp = None;
    }
}

/// Seconds from `earlier` to `later`, never negative
pub fn seconds_between(earlier: Timestamp, later: Timestamp) -> f64 {
    let delta = later.signed_duration_since(earlier);
    let secs = match delta.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => delta.num_milliseconds() as f64 / 1000.0,
    };
    secs.max(0.0)
}
