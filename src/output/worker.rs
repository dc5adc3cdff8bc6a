//! Background persistence thread
//!
//! The processing loop hands records over a bounded channel and never waits
//! on disk I/O. Rows are written in the order they were submitted.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::RecordSink;
use crate::detector::EventRecord;
use crate::error::{DetectorError, Result};
use crate::pipeline::LevelRecord;

const RETRY_DELAY: Duration = Duration::from_millis(50);

/// A record on its way to storage
#[derive(Debug, Clone)]
pub enum OutputMessage {
    Event(EventRecord),
    Level(LevelRecord),
}

/// Totals reported when the worker shuts down
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub events_written: u64,
    pub levels_written: u64,
    /// Rows abandoned after exhausting retries
    pub rows_failed: u64,
    /// Rows rejected because the queue was full
    pub rows_dropped: u64,
}

/// Owns the persistence thread and the sending side of its queue
pub struct PersistenceWorker {
    sender: Option<Sender<OutputMessage>>,
    handle: Option<JoinHandle<WorkerStats>>,
    queue_drops: Arc<AtomicU64>,
}

impl PersistenceWorker {
    /// Start the worker thread around `sink`
    pub fn spawn<S>(sink: S, capacity: usize, write_retries: u32) -> Result<Self>
    where
        S: RecordSink + 'static,
    {
        let (sender, receiver) = bounded(capacity.max(1));
        let handle = std::thread::Builder::new()
            .name("persistence".to_string())
            .spawn(move || run(sink, receiver, write_retries))?;

        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
            queue_drops: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Queue a record without blocking.
    ///
    /// Returns `false` if the record was dropped.
    pub fn submit(&self, message: OutputMessage) -> bool {
        let Some(sender) = self.sender.as_ref() else {
            return false;
        };

        match sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                self.queue_drops.fetch_add(1, Ordering::Relaxed);
                match message {
                    OutputMessage::Event(record) => {
                        error!("Persistence queue full, event not stored: {}", record.to_csv_row())
                    }
                    OutputMessage::Level(_) => warn!("Persistence queue full, dropping level row"),
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                error!("Persistence worker has stopped, dropping record");
                false
            }
        }
    }

    pub fn submit_event(&self, record: EventRecord) -> bool {
        self.submit(OutputMessage::Event(record))
    }

    pub fn submit_level(&self, record: LevelRecord) -> bool {
        self.submit(OutputMessage::Level(record))
    }

    /// Close the queue, let the worker drain it, and wait for it to exit
    pub fn shutdown(mut self) -> Result<WorkerStats> {
        self.close()
    }

    fn close(&mut self) -> Result<WorkerStats> {
        drop(self.sender.take());

        let Some(handle) = self.handle.take() else {
            return Ok(WorkerStats::default());
        };

        let mut stats = handle
            .join()
            .map_err(|_| DetectorError::Channel("persistence thread panicked".to_string()))?;
        stats.rows_dropped = self.queue_drops.load(Ordering::Relaxed);
        Ok(stats)
    }
}

impl Drop for PersistenceWorker {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Persistence worker shutdown failed: {}", e);
        }
    }
}

fn run<S: RecordSink>(mut sink: S, receiver: Receiver<OutputMessage>, retries: u32) -> WorkerStats {
    debug!("Persistence worker started");
    let mut stats = WorkerStats::default();

    for message in receiver.iter() {
        if write_with_retry(&mut sink, &message, retries) {
            match message {
                OutputMessage::Event(_) => stats.events_written += 1,
                OutputMessage::Level(_) => stats.levels_written += 1,
            }
        } else {
            stats.rows_failed += 1;
        }
    }

    if let Err(e) = sink.flush() {
        warn!("Final flush failed: {}", e);
    }

    info!(
        "Persistence worker stopped: {} events, {} level rows, {} failed",
        stats.events_written, stats.levels_written, stats.rows_failed
    );
    stats
}

fn write_with_retry<S: RecordSink>(sink: &mut S, message: &OutputMessage, retries: u32) -> bool {
    let attempts = retries + 1;
    for attempt in 1..=attempts {
        let result = match message {
            OutputMessage::Event(record) => sink.write_event(record),
            OutputMessage::Level(record) => sink.write_level(record),
        };

        match result {
            Ok(()) => return true,
            Err(e) if attempt < attempts => {
                warn!("Write failed (attempt {}/{}): {}", attempt, attempts, e);
                std::thread::sleep(RETRY_DELAY);
            }
            Err(e) => {
                error!("Write failed after {} attempts, dropping row: {}", attempts, e);
            }
        }
    }
    false
}
