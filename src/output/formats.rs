//! Row formats for the event and level stores

use chrono::{DateTime, SecondsFormat};

use crate::audio::Timestamp;
use crate::detector::EventRecord;
use crate::error::StorageError;
use crate::pipeline::LevelRecord;

pub const EVENTS_CSV_HEADER: &str =
    "start_time_local,end_time_local,duration_s,avg_dbfs,peak_dbfs,threshold_dbfs,blocks";

pub const LEVELS_CSV_HEADER: &str = "time_local,dbfs_block,dbfs_smooth,threshold_dbfs,status";

/// Format a timestamp as RFC 3339 with UTC offset, keeping every
/// fractional digit the timestamp carries
pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, false)
}

impl EventRecord {
    /// Encode as one events CSV row (no trailing newline)
    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{},{:.3},{:.2},{:.2},{:.2},{}",
            format_timestamp(&self.start_time),
            format_timestamp(&self.end_time),
            self.duration_seconds,
            self.avg_level_dbfs,
            self.peak_level_dbfs,
            self.threshold_dbfs,
            self.block_count
        )
    }

    /// Decode an events CSV row produced by [`EventRecord::to_csv_row`]
    pub fn from_csv_row(row: &str) -> Result<Self, StorageError> {
        let fields = split_row(row, 7)?;
        Ok(Self {
            start_time: parse_timestamp(row, fields[0])?,
            end_time: parse_timestamp(row, fields[1])?,
            duration_seconds: parse_number(row, "duration_s", fields[2])?,
            avg_level_dbfs: parse_number(row, "avg_dbfs", fields[3])?,
            peak_level_dbfs: parse_number(row, "peak_dbfs", fields[4])?,
            threshold_dbfs: parse_number(row, "threshold_dbfs", fields[5])?,
            block_count: parse_number(row, "blocks", fields[6])?,
        })
    }

    /// Encode as one JSON line
    pub fn to_json_line(&self) -> Result<String, StorageError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Human-readable summary for the console
    pub fn to_console_line(&self) -> String {
        format!(
            "[EVENT] Train: {} -> {}, {:.1}s, avg {:.1} dBFS, peak {:.1} dBFS",
            self.start_time.to_rfc3339_opts(SecondsFormat::Secs, false),
            self.end_time.to_rfc3339_opts(SecondsFormat::Secs, false),
            self.duration_seconds,
            self.avg_level_dbfs,
            self.peak_level_dbfs
        )
    }
}

impl LevelRecord {
    /// Encode as one levels CSV row (no trailing newline)
    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{:.2},{:.2},{:.2},{}",
            format_timestamp(&self.timestamp),
            self.block_dbfs,
            self.smoothed_dbfs,
            self.threshold_dbfs,
            self.status
        )
    }

    /// Decode a levels CSV row produced by [`LevelRecord::to_csv_row`]
    pub fn from_csv_row(row: &str) -> Result<Self, StorageError> {
        let fields = split_row(row, 5)?;
        Ok(Self {
            timestamp: parse_timestamp(row, fields[0])?,
            block_dbfs: parse_number(row, "dbfs_block", fields[1])?,
            smoothed_dbfs: parse_number(row, "dbfs_smooth", fields[2])?,
            threshold_dbfs: parse_number(row, "threshold_dbfs", fields[3])?,
            status: fields[4].parse().map_err(|reason| malformed(row, reason))?,
        })
    }

    /// Encode as one JSON line
    pub fn to_json_line(&self) -> Result<String, StorageError> {
        Ok(serde_json::to_string(self)?)
    }
}

fn split_row(row: &str, expected: usize) -> Result<Vec<&str>, StorageError> {
    let fields: Vec<&str> = row.trim_end_matches(['\r', '\n']).split(',').collect();
    if fields.len() != expected {
        return Err(malformed(
            row,
            format!("expected {} fields, found {}", expected, fields.len()),
        ));
    }
    Ok(fields)
}

fn parse_timestamp(row: &str, field: &str) -> Result<Timestamp, StorageError> {
    DateTime::parse_from_rfc3339(field.trim())
        .map_err(|e| malformed(row, format!("bad timestamp '{}': {}", field, e)))
}

fn parse_number<T: std::str::FromStr>(
    row: &str,
    name: &str,
    field: &str,
) -> Result<T, StorageError> {
    field
        .trim()
        .parse()
        .map_err(|_| malformed(row, format!("bad {} '{}'", name, field)))
}

fn malformed(row: &str, reason: impl Into<String>) -> StorageError {
    StorageError::MalformedRow {
        row: row.to_string(),
        reason: reason.into(),
    }
}
