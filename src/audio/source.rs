//! Producer side of the pipeline
//!
//! A [`SampleSource`] periodically delivers a batch of mono `i16` samples
//! to a registered callback. The callback runs in the source's own capture
//! context and must return quickly.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::AudioError;

/// Callback invoked with every captured batch
pub type BatchCallback = Box<dyn FnMut(&[i16]) + Send + 'static>;

/// Periodic producer of PCM sample batches
pub trait SampleSource: Send {
    /// Sample rate of delivered batches in Hz
    fn sample_rate(&self) -> u32;

    /// Nominal period between two batches
    fn batch_period_ms(&self) -> u32;

    /// Install (or clear, with `None`) the batch callback
    fn register_callback(&mut self, callback: Option<BatchCallback>);

    /// Start delivering batches
    fn start(&mut self) -> Result<(), AudioError>;

    /// Stop delivering batches. Idempotent.
    fn stop(&mut self);

    /// Expected samples per batch
    fn batch_size(&self) -> usize {
        (self.sample_rate() as usize * self.batch_period_ms() as usize) / 1000
    }
}

/// Shared slot holding the current callback
///
/// The mutex only guards the callback itself and is held for the duration
/// of one delivery. Registration from another thread waits at most one
/// batch.
#[derive(Clone, Default)]
pub struct CallbackSlot {
    inner: Arc<Mutex<Option<BatchCallback>>>,
}

impl CallbackSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current callback
    pub fn set(&self, callback: Option<BatchCallback>) {
        *self.inner.lock() = callback;
    }

    /// Deliver a batch. Returns false if no callback is registered.
    pub fn deliver(&self, samples: &[i16]) -> bool {
        match self.inner.lock().as_mut() {
            Some(callback) => {
                callback(samples);
                true
            }
            None => false,
        }
    }

    pub fn is_set(&self) -> bool {
        self.inner.lock().is_some()
    }
}
