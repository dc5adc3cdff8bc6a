//! Configuration structures for the train detector

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub audio: AudioConfig,
    pub detection: DetectionConfig,
    pub output: OutputConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path.display().to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Check every section; called once before any audio is processed
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.audio.validate()?;
        self.detection.validate()?;
        self.output.validate()
    }
}

/// Audio capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Requested sample rate (Hz)
    pub sample_rate: u32,
    /// Number of input channels; more than one is down-mixed to mono
    pub channels: u16,
    /// Callback buffer size in frames (None = let the host choose)
    pub buffer_size: Option<u32>,
    /// Substring of the input device name (None = default device)
    pub device: Option<String>,
    /// Blocks queued between the capture callback and the processing loop
    pub queue_capacity: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 1,
            buffer_size: None,
            device: None,
            queue_capacity: 1000,
        }
    }
}

impl AudioConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::invalid("audio.sample_rate", self.sample_rate));
        }
        if self.channels == 0 {
            return Err(ConfigError::invalid("audio.channels", self.channels));
        }
        if self.buffer_size == Some(0) {
            return Err(ConfigError::invalid("audio.buffer_size", 0));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid("audio.queue_capacity", 0));
        }
        Ok(())
    }
}

/// Level smoothing and event detection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Trigger threshold (dBFS)
    pub threshold_dbfs: f64,
    /// Gap between trigger and release thresholds (dB)
    pub hysteresis_db: f64,
    /// Time the level must stay elevated before an event is real (seconds)
    pub min_duration_s: f64,
    /// Grace period after the level drops before the event ends (seconds)
    pub stop_hold_s: f64,
    /// EMA smoothing window (seconds); 0 disables smoothing
    pub smooth_sec: f64,
    /// Level reported for silent blocks (dBFS)
    pub silence_floor_dbfs: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold_dbfs: -15.0,
            hysteresis_db: 2.0,
            min_duration_s: 30.0,
            stop_hold_s: 5.0,
            smooth_sec: 3.0,
            silence_floor_dbfs: -120.0,
        }
    }
}

impl DetectionConfig {
    /// Level at or above which a candidate event starts
    pub fn trigger_threshold(&self) -> f64 {
        self.threshold_dbfs
    }

    /// Level below which an ongoing event starts to end
    pub fn release_threshold(&self) -> f64 {
        self.threshold_dbfs - self.hysteresis_db
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let finite = [
            ("detection.threshold_dbfs", self.threshold_dbfs),
            ("detection.hysteresis_db", self.hysteresis_db),
            ("detection.min_duration_s", self.min_duration_s),
            ("detection.stop_hold_s", self.stop_hold_s),
            ("detection.smooth_sec", self.smooth_sec),
            ("detection.silence_floor_dbfs", self.silence_floor_dbfs),
        ];
        for (field, value) in finite {
            if !value.is_finite() {
                return Err(ConfigError::invalid(field, value));
            }
        }

        if self.hysteresis_db < 0.0 {
            return Err(ConfigError::invalid("detection.hysteresis_db", self.hysteresis_db));
        }
        if self.min_duration_s <= 0.0 {
            return Err(ConfigError::invalid("detection.min_duration_s", self.min_duration_s));
        }
        if self.stop_hold_s < 0.0 {
            return Err(ConfigError::invalid("detection.stop_hold_s", self.stop_hold_s));
        }
        if self.smooth_sec < 0.0 {
            return Err(ConfigError::invalid("detection.smooth_sec", self.smooth_sec));
        }
        // Silence must never keep an event alive
        if self.silence_floor_dbfs >= self.release_threshold() {
            return Err(ConfigError::invalid(
                "detection.silence_floor_dbfs",
                self.silence_floor_dbfs,
            ));
        }
        Ok(())
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Event store path
    pub events_path: PathBuf,
    /// Row format for both stores
    pub format: OutputFormat,
    /// Append every block's level to `levels_path`
    pub write_levels: bool,
    /// Level store path
    pub levels_path: PathBuf,
    /// Echo completed events to stdout
    pub enable_console: bool,
    /// Records queued between the processing loop and the writer thread
    pub queue_capacity: usize,
    /// Extra attempts for a failed append before the row is dropped
    pub write_retries: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            events_path: PathBuf::from("train_events.csv"),
            format: OutputFormat::Csv,
            write_levels: false,
            levels_path: PathBuf::from("noise_levels.csv"),
            enable_console: true,
            queue_capacity: 1024,
            write_retries: 1,
        }
    }
}

impl OutputConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid("output.queue_capacity", 0));
        }
        if self.write_levels && self.levels_path == self.events_path {
            return Err(ConfigError::invalid(
                "output.levels_path",
                self.levels_path.display(),
            ));
        }
        Ok(())
    }
}

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Comma-separated rows with a header line
    Csv,
    /// One JSON object per line
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Csv => write!(f, "csv"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(OutputFormat::Csv),
            "json" => Ok(OutputFormat::Json),
            other => Err(ConfigError::invalid("output.format", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.audio.sample_rate, 44100);
        assert_eq!(config.audio.channels, 1);
        assert_eq!(config.detection.threshold_dbfs, -15.0);
        assert_eq!(config.detection.release_threshold(), -17.0);
        assert!(!config.output.write_levels);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
            [audio]
            sample_rate = 48000
            device = "USB"

            [detection]
            threshold_dbfs = -20.0
            min_duration_s = 10.0

            [output]
            format = "json"
            write_levels = true
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.audio.sample_rate, 48000);
        assert_eq!(config.audio.device.as_deref(), Some("USB"));
        assert_eq!(config.detection.threshold_dbfs, -20.0);
        assert_eq!(config.detection.min_duration_s, 10.0);
        assert_eq!(config.detection.hysteresis_db, 2.0);
        assert_eq!(config.output.format, OutputFormat::Json);
        assert!(config.output.write_levels);
    }

    #[test]
    fn test_rejects_negative_hysteresis() {
        let config = DetectionConfig {
            hysteresis_db: -1.0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("hysteresis_db"));
    }

    #[test]
    fn test_rejects_non_positive_min_duration() {
        for value in [0.0, -5.0, f64::NAN] {
            let config = DetectionConfig {
                min_duration_s: value,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "accepted min_duration_s = {value}");
        }
    }

    #[test]
    fn test_rejects_floor_above_release() {
        let config = DetectionConfig {
            silence_floor_dbfs: -10.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_hysteresis_and_hold_are_valid() {
        let config = DetectionConfig {
            hysteresis_db: 0.0,
            stop_hold_s: 0.0,
            smooth_sec: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_sample_rate() {
        let config = AudioConfig {
            sample_rate: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!("CSV".parse::<OutputFormat>().unwrap(), OutputFormat::Csv);
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("srt".parse::<OutputFormat>().is_err());
    }
}
