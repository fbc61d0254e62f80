//! Microphone capture through cpal
//!
//! The cpal stream is not `Send`, so it lives on a dedicated capture
//! thread for its whole lifetime. Every driver callback is downmixed to
//! mono, converted to `i16` and handed to the registered batch callback.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::find_input_device;
use crate::audio::source::{BatchCallback, CallbackSlot, SampleSource};
use crate::error::AudioError;

/// How long `start` waits for the capture thread to open the stream
const STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Sample source backed by an input device
pub struct CpalSource {
    /// Device name, `None` for the default input
    device_name: Option<String>,

    sample_rate: u32,

    batch_period_ms: u32,

    callback: CallbackSlot,

    running: Arc<AtomicBool>,

    thread_handle: Option<JoinHandle<()>>,

    /// Channel for stream errors
    error_rx: Option<Receiver<AudioError>>,

    /// Total mono samples captured
    samples_captured: Arc<AtomicU64>,
}

impl CpalSource {
    pub fn new(device_name: Option<&str>, sample_rate: u32, batch_period_ms: u32) -> Self {
        Self {
            device_name: device_name.map(str::to_string),
            sample_rate,
            batch_period_ms,
            callback: CallbackSlot::new(),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            error_rx: None,
            samples_captured: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Check if capture is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get total samples captured
    pub fn samples_captured(&self) -> u64 {
        self.samples_captured.load(Ordering::Relaxed)
    }

    /// Check for errors reported by the driver
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl SampleSource for CpalSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn batch_period_ms(&self) -> u32 {
        self.batch_period_ms
    }

    fn register_callback(&mut self, callback: Option<BatchCallback>) {
        self.callback.set(callback);
    }

    fn start(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(AudioError::AlreadyRunning);
        }

        let device = find_input_device(self.device_name.as_deref())?;
        let default_config = device
            .default_input_config()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
        let channels = default_config.channels().max(1);
        let frames_per_batch = self.batch_size() as u32;

        let config = StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: match frames_per_batch {
                0 => cpal::BufferSize::Default,
                n => cpal::BufferSize::Fixed(n),
            },
        };

        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        self.error_rx = Some(error_rx);

        let running = self.running.clone();
        let callback = self.callback.clone();
        let samples_captured = self.samples_captured.clone();
        let channel_count = channels as usize;

        self.samples_captured.store(0, Ordering::SeqCst);
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let mut mono: Vec<i16> = Vec::with_capacity(frames_per_batch as usize);
                let running_cb = running.clone();

                let stream = device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if !running_cb.load(Ordering::Relaxed) {
                            return;
                        }

                        mono.clear();
                        mono.extend(data.chunks(channel_count).map(|frame| {
                            let sum: f32 = frame.iter().sum();
                            to_i16(sum / frame.len() as f32)
                        }));

                        samples_captured.fetch_add(mono.len() as u64, Ordering::Relaxed);
                        callback.deliver(&mono);
                    },
                    move |err| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Keep the stream alive while running
                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);

        let opened = ready_rx.recv_timeout(STREAM_OPEN_TIMEOUT).unwrap_or_else(|_| {
            Err(AudioError::StreamError(
                "capture thread did not report".into(),
            ))
        });
        if let Err(e) = opened {
            self.stop();
            return Err(e);
        }

        tracing::info!(
            "Capturing {} Hz from {} ({} channel(s) downmixed to mono)",
            self.sample_rate,
            self.device_name.as_deref().unwrap_or("default input"),
            channels
        );
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Convert a normalized sample to 16-bit PCM
fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}
