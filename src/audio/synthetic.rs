//! Timer-driven synthetic sample source
//!
//! Generates a sine tone in fixed batches on a dedicated thread, paced by a
//! periodic tick. Used when no capture device is configured and by tests.

use crossbeam_channel::tick;
use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::source::{BatchCallback, CallbackSlot, SampleSource};
use crate::error::AudioError;

/// Sine tone generator
#[derive(Debug, Clone)]
pub struct ToneGenerator {
    sample_rate: u32,
    frequency: f32,
    amplitude: f32,
    phase: f32,
}

impl ToneGenerator {
    /// `amplitude` is a fraction of full scale and is clamped to [0, 1]
    pub fn new(sample_rate: u32, frequency: f32, amplitude: f32) -> Self {
        Self {
            sample_rate,
            frequency,
            amplitude: amplitude.clamp(0.0, 1.0),
            phase: 0.0,
        }
    }

    /// Fill `out` with the next samples of the tone
    pub fn fill(&mut self, out: &mut [i16]) {
        let step = TAU * self.frequency / self.sample_rate as f32;
        for sample in out.iter_mut() {
            *sample = (self.phase.sin() * self.amplitude * i16::MAX as f32) as i16;
            self.phase = (self.phase + step) % TAU;
        }
    }
}

/// Sample source delivering a synthetic tone at a fixed cadence
pub struct ToneSource {
    generator: Option<ToneGenerator>,
    sample_rate: u32,
    batch_period_ms: u32,
    callback: CallbackSlot,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<ToneGenerator>>,
    batches_delivered: Arc<AtomicU64>,
}

impl ToneSource {
    pub fn new(sample_rate: u32, batch_period_ms: u32, frequency: f32) -> Self {
        Self {
            generator: Some(ToneGenerator::new(sample_rate, frequency, 0.5)),
            sample_rate,
            batch_period_ms,
            callback: CallbackSlot::new(),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            batches_delivered: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Check if the source is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of batches handed to the callback
    pub fn batches_delivered(&self) -> u64 {
        self.batches_delivered.load(Ordering::Relaxed)
    }
}

impl SampleSource for ToneSource {
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
        if self.batch_period_ms == 0 || self.sample_rate == 0 {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} Hz with {} ms batches",
                self.sample_rate, self.batch_period_ms
            )));
        }

        let mut generator = self
            .generator
            .take()
            .unwrap_or_else(|| ToneGenerator::new(self.sample_rate, 440.0, 0.5));
        let running = self.running.clone();
        let callback = self.callback.clone();
        let delivered = self.batches_delivered.clone();
        let period = Duration::from_millis(self.batch_period_ms as u64);
        let batch_size = self.batch_size().max(1);

        running.store(true, Ordering::SeqCst);

        let spawned = thread::Builder::new()
            .name("tone-source".to_string())
            .spawn(move || {
                let ticker = tick(period);
                let mut batch = vec![0i16; batch_size];

                while running.load(Ordering::Relaxed) {
                    if ticker.recv().is_err() {
                        break;
                    }
                    generator.fill(&mut batch);
                    if callback.deliver(&batch) {
                        delivered.fetch_add(1, Ordering::Relaxed);
                    }
                }

                generator
            });

        match spawned {
            Ok(handle) => {
                self.thread_handle = Some(handle);
                tracing::debug!(
                    "Tone source started: {} Hz, {} samples every {} ms",
                    self.sample_rate,
                    batch_size,
                    self.batch_period_ms
                );
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(AudioError::StreamError(e.to_string()))
            }
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            match handle.join() {
                Ok(generator) => self.generator = Some(generator),
                Err(_) => tracing::error!("Tone source thread panicked"),
            }
        }
    }
}

impl Drop for ToneSource {
    fn drop(&mut self) {
        self.stop();
    }
}
