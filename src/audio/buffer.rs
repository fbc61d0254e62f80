//! Circular buffer for captured PCM samples
//!
//! A fixed-capacity ring of `i16` samples with two independent cursors:
//! the write cursor, advanced by the capture context, and the send cursor,
//! advanced by the flush context once samples have been handed to the
//! network. The producer never waits: when it outruns the consumer by more
//! than the capacity, the oldest unsent samples are overwritten.
//!
//! Both cursors are derived from monotonic 64-bit counters so that a full
//! ring (exactly `capacity` unsent samples) is distinguishable from an
//! empty one. [`CircularAudioBuffer::split`] hands each counter to a single
//! owner, which is what makes the ring safe without a lock.

use std::sync::atomic::{AtomicI16, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::AudioError;

/// Shared storage behind the writer and reader handles
struct Ring {
    slots: Box<[AtomicI16]>,
    capacity: usize,
    /// Total samples ever written (writer-owned)
    written: AtomicU64,
    /// Total samples handed off, before overrun correction (reader-owned)
    sent: AtomicU64,
    /// Unsent samples lost to overwrite (reader-owned)
    dropped: AtomicU64,
}

impl Ring {
    fn allocate(capacity: usize) -> Result<Self, AudioError> {
        if capacity == 0 {
            return Err(AudioError::InvalidBufferCapacity(capacity));
        }

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| AudioError::BufferAllocation(capacity))?;
        slots.extend((0..capacity).map(|_| AtomicI16::new(0)));

        Ok(Self {
            slots: slots.into_boxed_slice(),
            capacity,
            written: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    fn slot_index(&self, position: u64) -> usize {
        (position % self.capacity as u64) as usize
    }

    fn write(&self, samples: &[i16]) {
        if samples.is_empty() {
            return;
        }

        let written = self.written.load(Ordering::Relaxed);

        // Only the last `capacity` samples of an oversized batch can survive
        let skip = samples.len().saturating_sub(self.capacity);
        let tail = &samples[skip..];
        let start = self.slot_index(written + skip as u64);

        let first_part = tail.len().min(self.capacity - start);
        for (slot, &sample) in self.slots[start..start + first_part].iter().zip(tail) {
            slot.store(sample, Ordering::Relaxed);
        }
        for (slot, &sample) in self.slots.iter().zip(&tail[first_part..]) {
            slot.store(sample, Ordering::Relaxed);
        }

        self.written
            .store(written + samples.len() as u64, Ordering::Release);
    }

    /// Position of the oldest valid unsent sample, and the write position
    fn unsent_window(&self) -> (u64, u64) {
        let written = self.written.load(Ordering::Acquire);
        let sent = self.sent.load(Ordering::Relaxed);
        let oldest_valid = written.saturating_sub(self.capacity as u64);
        (sent.max(oldest_valid), written)
    }

    fn unsent_count(&self) -> usize {
        let (start, written) = self.unsent_window();
        (written - start) as usize
    }

    fn read_unsent_from(&self, offset: usize, out: &mut [i16]) -> usize {
        let (start, written) = self.unsent_window();
        let available = ((written - start) as usize).saturating_sub(offset);
        let count = out.len().min(available);
        if count == 0 {
            return 0;
        }

        let read_pos = self.slot_index(start + offset as u64);
        let first_part = count.min(self.capacity - read_pos);
        for (dst, slot) in out[..first_part]
            .iter_mut()
            .zip(&self.slots[read_pos..read_pos + first_part])
        {
            *dst = slot.load(Ordering::Relaxed);
        }
        for (dst, slot) in out[first_part..count].iter_mut().zip(self.slots.iter()) {
            *dst = slot.load(Ordering::Relaxed);
        }

        count
    }

    fn advance_send_cursor(&self, count: usize) -> usize {
        let sent = self.sent.load(Ordering::Relaxed);
        let (start, written) = self.unsent_window();
        if start > sent {
            self.dropped.fetch_add(start - sent, Ordering::Relaxed);
        }

        let advanced = (count as u64).min(written - start);
        self.sent.store(start + advanced, Ordering::Release);
        advanced as usize
    }

    fn write_cursor(&self) -> usize {
        self.slot_index(self.written.load(Ordering::Acquire))
    }

    fn send_cursor(&self) -> usize {
        self.slot_index(self.unsent_window().0)
    }

    fn stats(&self) -> BufferStats {
        let (start, written) = self.unsent_window();
        BufferStats {
            capacity: self.capacity,
            unsent: (written - start) as usize,
            total_written: written,
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Fixed-capacity circular buffer of PCM samples
///
/// Usable directly from a single context, or [`split`](Self::split) into a
/// [`SampleWriter`] for the capture context and a [`SampleReader`] for the
/// flush context.
pub struct CircularAudioBuffer {
    ring: Arc<Ring>,
}

impl CircularAudioBuffer {
    /// Create a buffer holding `capacity` samples
    pub fn new(capacity: usize) -> Result<Self, AudioError> {
        Ok(Self {
            ring: Arc::new(Ring::allocate(capacity)?),
        })
    }

    /// Create a buffer holding `seconds` of audio at `sample_rate`
    pub fn with_duration(sample_rate: u32, seconds: f32) -> Result<Self, AudioError> {
        let capacity = (sample_rate as f64 * seconds as f64) as usize;
        Self::new(capacity)
    }

    /// Append samples, overwriting unsent data if the ring is full
    pub fn write(&mut self, samples: &[i16]) {
        self.ring.write(samples);
    }

    /// Number of valid samples not yet sent
    pub fn unsent_count(&self) -> usize {
        self.ring.unsent_count()
    }

    /// Copy up to `max_count` unsent samples without advancing the send cursor
    pub fn read_unsent(&self, max_count: usize) -> Vec<i16> {
        let mut out = vec![0; max_count.min(self.unsent_count())];
        let read = self.ring.read_unsent_from(0, &mut out);
        out.truncate(read);
        out
    }

    /// Mark `count` samples as handed off. Returns how far the cursor moved.
    pub fn advance_send_cursor(&mut self, count: usize) -> usize {
        self.ring.advance_send_cursor(count)
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }

    pub fn write_cursor(&self) -> usize {
        self.ring.write_cursor()
    }

    pub fn send_cursor(&self) -> usize {
        self.ring.send_cursor()
    }

    /// Unsent samples lost to overwrite so far
    pub fn dropped_samples(&self) -> u64 {
        self.ring.dropped.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> BufferStats {
        self.ring.stats()
    }

    /// Split into the capture-side and flush-side handles
    pub fn split(self) -> (SampleWriter, SampleReader) {
        (
            SampleWriter {
                ring: self.ring.clone(),
            },
            SampleReader { ring: self.ring },
        )
    }
}

/// Capture-side handle; the only owner of the write cursor
pub struct SampleWriter {
    ring: Arc<Ring>,
}

impl SampleWriter {
    /// Append samples. Never blocks and never fails.
    pub fn write(&mut self, samples: &[i16]) {
        self.ring.write(samples);
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }

    pub fn write_cursor(&self) -> usize {
        self.ring.write_cursor()
    }

    /// Total samples written since allocation
    pub fn total_written(&self) -> u64 {
        self.ring.written.load(Ordering::Relaxed)
    }
}

/// Flush-side handle; the only owner of the send cursor
pub struct SampleReader {
    ring: Arc<Ring>,
}

impl SampleReader {
    pub fn unsent_count(&self) -> usize {
        self.ring.unsent_count()
    }

    /// Copy up to `max_count` unsent samples without advancing the send cursor
    pub fn read_unsent(&self, max_count: usize) -> Vec<i16> {
        let mut out = vec![0; max_count.min(self.unsent_count())];
        let read = self.ring.read_unsent_from(0, &mut out);
        out.truncate(read);
        out
    }

    /// Copy unsent samples into `out`, returning how many were copied
    pub fn read_unsent_into(&self, out: &mut [i16]) -> usize {
        self.ring.read_unsent_from(0, out)
    }

    /// Like [`read_unsent_into`](Self::read_unsent_into), skipping the first
    /// `offset` unsent samples
    pub fn read_unsent_from(&self, offset: usize, out: &mut [i16]) -> usize {
        self.ring.read_unsent_from(offset, out)
    }

    /// Mark `count` samples as handed off. Returns how far the cursor moved.
    pub fn advance_send_cursor(&mut self, count: usize) -> usize {
        self.ring.advance_send_cursor(count)
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }

    pub fn send_cursor(&self) -> usize {
        self.ring.send_cursor()
    }

    pub fn dropped_samples(&self) -> u64 {
        self.ring.dropped.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> BufferStats {
        self.ring.stats()
    }
}

/// Buffer statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct BufferStats {
    pub capacity: usize,
    pub unsent: usize,
    pub total_written: u64,
    pub dropped: u64,
}

impl BufferStats {
    /// Get fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        self.unsent as f32 / self.capacity as f32
    }
}
