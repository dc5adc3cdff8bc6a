//! Persistence of event and level records

pub mod formats;
pub mod worker;

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::config::{OutputConfig, OutputFormat};
use crate::detector::EventRecord;
use crate::error::StorageError;
use crate::pipeline::LevelRecord;

pub use formats::{format_timestamp, EVENTS_CSV_HEADER, LEVELS_CSV_HEADER};
pub use worker::{OutputMessage, PersistenceWorker, WorkerStats};

/// Destination for completed records
pub trait RecordSink: Send {
    fn write_event(&mut self, record: &EventRecord) -> Result<(), StorageError>;

    fn write_level(&mut self, record: &LevelRecord) -> Result<(), StorageError>;

    fn flush(&mut self) -> Result<(), StorageError>;
}

/// Append-only writer for the event store and the optional level store.
///
/// Every row is written with a single `write_all` and flushed immediately, so
/// an interrupted process loses at most the row being written. The console
/// echo never decides whether a row was stored.
pub struct OutputWriter {
    config: OutputConfig,
    events: File,
    levels: Option<File>,
    console: Option<Box<dyn Write + Send>>,
}

impl OutputWriter {
    /// Open (or create) the stores, writing CSV headers to new files
    pub fn new(config: OutputConfig) -> Result<Self, StorageError> {
        let csv = config.format == OutputFormat::Csv;

        let events = open_store(&config.events_path, csv.then_some(EVENTS_CSV_HEADER))?;
        let levels = if config.write_levels {
            Some(open_store(
                &config.levels_path,
                csv.then_some(LEVELS_CSV_HEADER),
            )?)
        } else {
            None
        };

        let console: Option<Box<dyn Write + Send>> = if config.enable_console {
            Some(Box::new(io::stdout()))
        } else {
            None
        };

        Ok(Self {
            config,
            events,
            levels,
            console,
        })
    }

    /// Echo events to `console` instead of stdout
    pub fn with_console(mut self, console: impl Write + Send + 'static) -> Self {
        self.console = Some(Box::new(console));
        self
    }

    pub fn events_path(&self) -> &PathBuf {
        &self.config.events_path
    }

    pub fn levels_path(&self) -> Option<&PathBuf> {
        self.levels.as_ref().map(|_| &self.config.levels_path)
    }

    fn echo(&mut self, text: &str) {
        let Some(console) = self.console.as_mut() else {
            return;
        };
        let result = writeln!(console, "{}", text).and_then(|_| console.flush());
        if let Err(e) = result {
            warn!("Console echo failed: {}", e);
        }
    }
}

impl RecordSink for OutputWriter {
    fn write_event(&mut self, record: &EventRecord) -> Result<(), StorageError> {
        let line = match self.config.format {
            OutputFormat::Csv => record.to_csv_row(),
            OutputFormat::Json => record.to_json_line()?,
        };
        append_line(&mut self.events, &line)?;
        self.echo(&record.to_console_line());
        Ok(())
    }

    fn write_level(&mut self, record: &LevelRecord) -> Result<(), StorageError> {
        let format = self.config.format;
        let Some(file) = self.levels.as_mut() else {
            return Ok(());
        };

        let line = match format {
            OutputFormat::Csv => record.to_csv_row(),
            OutputFormat::Json => record.to_json_line()?,
        };
        append_line(file, &line)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        self.events.flush()?;
        if let Some(ref mut file) = self.levels {
            file.flush()?;
        }
        Ok(())
    }
}

/// Open a store for appending; a new or empty file gets `header` first
fn open_store(path: &Path, header: Option<&str>) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if let Some(header) = header {
        if file.metadata()?.len() == 0 {
            append_line(&mut file, header)?;
        }
    }
    Ok(file)
}

fn append_line(file: &mut File, line: &str) -> io::Result<()> {
    let mut buf = String::with_capacity(line.len() + 1);
    buf.push_str(line);
    buf.push('\n');
    file.write_all(buf.as_bytes())?;
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::Phase;
    use chrono::DateTime;

    fn make_config(dir: &Path, format: OutputFormat, write_levels: bool) -> OutputConfig {
        OutputConfig {
            events_path: dir.join("events.csv"),
            levels_path: dir.join("levels.csv"),
            format,
            write_levels,
            enable_console: false,
            ..Default::default()
        }
    }

    fn make_event() -> EventRecord {
        EventRecord {
            start_time: DateTime::parse_from_rfc3339("2026-03-01T06:00:00+01:00").unwrap(),
            end_time: DateTime::parse_from_rfc3339("2026-03-01T06:00:45+01:00").unwrap(),
            duration_seconds: 45.0,
            avg_level_dbfs: -11.0,
            peak_level_dbfs: -9.5,
            threshold_dbfs: -15.0,
            block_count: 45,
        }
    }

    fn make_level() -> LevelRecord {
        LevelRecord {
            timestamp: DateTime::parse_from_rfc3339("2026-03-01T06:00:00+01:00").unwrap(),
            block_dbfs: -40.0,
            smoothed_dbfs: -38.0,
            threshold_dbfs: -15.0,
            status: Phase::Idle,
        }
    }

    #[test]
    fn test_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = make_config(dir.path(), OutputFormat::Csv, false);

        let mut writer = OutputWriter::new(config.clone()).unwrap();
        writer.write_event(&make_event()).unwrap();
        drop(writer);

        let mut writer = OutputWriter::new(config).unwrap();
        writer.write_event(&make_event()).unwrap();

        let content = std::fs::read_to_string(dir.path().join("events.csv")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], EVENTS_CSV_HEADER);
        assert_eq!(EventRecord::from_csv_row(lines[2]).unwrap().block_count, 45);
    }

    #[test]
    fn test_levels_only_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            OutputWriter::new(make_config(dir.path(), OutputFormat::Csv, false)).unwrap();
        writer.write_level(&make_level()).unwrap();
        assert!(writer.levels_path().is_none());
        assert!(!dir.path().join("levels.csv").exists());

        let mut writer =
            OutputWriter::new(make_config(dir.path(), OutputFormat::Csv, true)).unwrap();
        writer.write_level(&make_level()).unwrap();
        let content = std::fs::read_to_string(dir.path().join("levels.csv")).unwrap();
        assert_eq!(content.lines().next(), Some(LEVELS_CSV_HEADER));
        assert!(content.contains("-40.00,-38.00,-15.00,idle"));
    }

    #[test]
    fn test_json_format_has_no_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            OutputWriter::new(make_config(dir.path(), OutputFormat::Json, false)).unwrap();
        writer.write_event(&make_event()).unwrap();

        let content = std::fs::read_to_string(dir.path().join("events.csv")).unwrap();
        let first = content.lines().next().unwrap();
        let value: serde_json::Value = serde_json::from_str(first).unwrap();
        assert_eq!(value["block_count"], 45);
    }

    #[test]
    fn test_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let config = OutputConfig {
            events_path: dir.path().join("logs/2026/events.csv"),
            enable_console: false,
            ..Default::default()
        };
        let writer = OutputWriter::new(config).unwrap();
        assert!(writer.events_path().exists());
    }

    /// Console that rejects every write, like a closed pipe
    struct ClosedConsole;

    impl Write for ClosedConsole {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }
    }

    #[test]
    fn test_console_failure_does_not_fail_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = OutputWriter::new(make_config(dir.path(), OutputFormat::Csv, false))
            .unwrap()
            .with_console(ClosedConsole);

        assert!(writer.write_event(&make_event()).is_ok());
    }

    #[test]
    fn test_event_stored_once_when_console_fails() {
        let dir = tempfile::tempdir().unwrap();
        let writer = OutputWriter::new(make_config(dir.path(), OutputFormat::Csv, false))
            .unwrap()
            .with_console(ClosedConsole);

        let worker = PersistenceWorker::spawn(writer, 4, 1).unwrap();
        assert!(worker.submit_event(make_event()));
        let stats = worker.shutdown().unwrap();

        assert_eq!(stats.events_written, 1);
        assert_eq!(stats.rows_failed, 0);
        let content = std::fs::read_to_string(dir.path().join("events.csv")).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
