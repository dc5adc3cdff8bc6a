//! Audio capture module using cpal

use chrono::Local;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, SampleRate, Stream, StreamConfig};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use super::{Block, Timestamp};
use crate::config::AudioConfig;
use crate::error::{AudioError, Result};

/// Counters shared with the capture callback
#[derive(Debug, Default)]
pub struct CaptureStats {
    /// Blocks dropped because the processing queue was full
    overflows: AtomicU64,
    /// Set by the stream error callback
    failed: AtomicBool,
}

impl CaptureStats {
    /// Overflows since the last call
    pub fn take_overflows(&self) -> u64 {
        self.overflows.swap(0, Ordering::Relaxed)
    }

    /// Whether the stream reported an error
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Wall clock derived from a monotonic anchor, so block timestamps never go
/// backwards even if the system clock is adjusted mid-run
#[derive(Debug, Clone, Copy)]
struct BlockClock {
    wall: Timestamp,
    mono: Instant,
}

impl BlockClock {
    fn start() -> Self {
        Self {
            wall: Local::now().fixed_offset(),
            mono: Instant::now(),
        }
    }

    fn now(&self) -> Timestamp {
        let elapsed = chrono::Duration::from_std(self.mono.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall + elapsed
    }
}

/// Result of waiting for the next block
#[derive(Debug)]
pub enum NextBlock {
    Block(Block),
    Timeout,
    /// Stream stopped or failed; no more blocks will arrive
    Closed,
}

/// Audio capture handle
pub struct AudioCapture {
    config: AudioConfig,
    host: Host,
    device: Option<Device>,
    stream: Option<Stream>,
    block_sender: Sender<Block>,
    block_receiver: Receiver<Block>,
    is_running: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
    actual_sample_rate: u32,
    actual_channels: u16,
}

impl AudioCapture {
    /// Create a new audio capture instance
    pub fn new(config: AudioConfig) -> Result<Self> {
        let host = cpal::default_host();
        let (sender, receiver) = bounded(config.queue_capacity.max(1));

        Ok(Self {
            config,
            host,
            device: None,
            stream: None,
            block_sender: sender,
            block_receiver: receiver,
            is_running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(CaptureStats::default()),
            actual_sample_rate: 0,
            actual_channels: 0,
        })
    }

    /// List available audio input devices
    pub fn list_devices(&self) -> Result<Vec<String>> {
        let devices = self
            .host
            .input_devices()
            .map_err(|e| AudioError::DeviceConfig(e.to_string()))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Initialize the audio capture device
    pub fn init(&mut self) -> Result<()> {
        let device = if let Some(ref device_name) = self.config.device {
            self.find_device_by_name(device_name)?
        } else {
            self.host
                .default_input_device()
                .ok_or(AudioError::NoInputDevice)?
        };

        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        info!("Using audio input device: {}", device_name);

        let supported_configs = device
            .supported_input_configs()
            .map_err(|e| AudioError::DeviceConfig(e.to_string()))?;

        let target_rate = SampleRate(self.config.sample_rate);
        let mut best_config = None;
        for cfg in supported_configs {
            debug!(
                "Supported config: channels={}, sample_rate={:?}-{:?}, format={:?}",
                cfg.channels(),
                cfg.min_sample_rate(),
                cfg.max_sample_rate(),
                cfg.sample_format()
            );

            if cfg.sample_format() != cpal::SampleFormat::F32 {
                continue;
            }

            let rate_ok =
                cfg.min_sample_rate() <= target_rate && target_rate <= cfg.max_sample_rate();
            if cfg.channels() == self.config.channels {
                best_config = Some(if rate_ok {
                    cfg.with_sample_rate(target_rate)
                } else {
                    cfg.with_max_sample_rate()
                });
                break;
            }
            if best_config.is_none() {
                best_config = Some(if rate_ok {
                    cfg.with_sample_rate(target_rate)
                } else {
                    cfg.with_max_sample_rate()
                });
            }
        }

        let supported_config = best_config.ok_or_else(|| {
            AudioError::DeviceConfig("No f32 input configuration found".to_string())
        })?;

        self.actual_sample_rate = supported_config.sample_rate().0;
        self.actual_channels = supported_config.channels();
        info!(
            "Audio config: {} channels @ {} Hz (requested: {} channels @ {} Hz)",
            self.actual_channels,
            self.actual_sample_rate,
            self.config.channels,
            self.config.sample_rate
        );

        self.device = Some(device);
        Ok(())
    }

    /// Get the actual sample rate of the capture device
    pub fn actual_sample_rate(&self) -> u32 {
        self.actual_sample_rate
    }

    /// Start capturing audio
    pub fn start(&mut self) -> Result<()> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| AudioError::DeviceConfig("Device not initialized".to_string()))?;

        let buffer_size = match self.config.buffer_size {
            Some(frames) => cpal::BufferSize::Fixed(frames),
            None => cpal::BufferSize::Default,
        };
        let config = StreamConfig {
            channels: self.actual_channels,
            sample_rate: SampleRate(self.actual_sample_rate),
            buffer_size,
        };

        let sender = self.block_sender.clone();
        let is_running = self.is_running.clone();
        let data_stats = self.stats.clone();
        let error_stats = self.stats.clone();
        let channels = self.actual_channels as usize;
        let sample_rate = self.actual_sample_rate;
        let clock = BlockClock::start();

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if !is_running.load(Ordering::Relaxed) || data.is_empty() {
                        return;
                    }

                    let block = Block {
                        samples: downmix(data, channels),
                        sample_rate,
                        timestamp: clock.now(),
                    };

                    // Never block the audio thread; the main loop reports drops
                    if sender.try_send(block).is_err() {
                        data_stats.overflows.fetch_add(1, Ordering::Relaxed);
                    }
                },
                move |err| {
                    error!("Audio stream error: {}", err);
                    error_stats.failed.store(true, Ordering::Relaxed);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuild(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlay(e.to_string()))?;

        self.is_running.store(true, Ordering::Relaxed);
        self.stream = Some(stream);

        info!("Audio capture started");
        Ok(())
    }

    /// Stop capturing audio
    pub fn stop(&mut self) {
        self.is_running.store(false, Ordering::Relaxed);
        if self.stream.take().is_some() {
            info!("Audio capture stopped");
        }
    }

    /// Shared overflow/failure counters
    pub fn stats(&self) -> Arc<CaptureStats> {
        self.stats.clone()
    }

    /// Receive the next block (blocking with timeout)
    pub fn next_block(&self, timeout: Duration) -> NextBlock {
        if self.stats.has_failed() {
            return NextBlock::Closed;
        }
        match self.block_receiver.recv_timeout(timeout) {
            Ok(block) => NextBlock::Block(block),
            Err(RecvTimeoutError::Timeout) => NextBlock::Timeout,
            Err(RecvTimeoutError::Disconnected) => NextBlock::Closed,
        }
    }

    /// Drain blocks still queued after the stream stopped
    pub fn drain(&self) -> Vec<Block> {
        self.block_receiver.try_iter().collect()
    }

    fn find_device_by_name(&self, name: &str) -> Result<Device> {
        let devices = self
            .host
            .input_devices()
            .map_err(|e| AudioError::DeviceConfig(e.to_string()))?;

        let needle = name.to_lowercase();
        for device in devices {
            if let Ok(device_name) = device.name() {
                if device_name.to_lowercase().contains(&needle) {
                    return Ok(device);
                }
            }
        }

        Err(AudioError::DeviceNotFound(name.to_string()).into())
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Average interleaved frames down to mono
pub(crate) fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels > 1 {
        data.chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    } else {
        data.to_vec()
    }
}
