//! Periodic flush of buffered audio to the network
//!
//! Every flush drains what is unsent in the ring, slices it into packets of
//! bounded size and broadcasts them in order. A slice that keeps failing is
//! eventually skipped: a live stream with gaps is preferred over a stream
//! that stalls behind one bad packet.

use crossbeam_channel::{bounded, select, tick, Sender};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::SampleReader;
use crate::config::StreamConfig;
use crate::error::Result;
use crate::network::channel::Broadcaster;
use crate::protocol;

/// Packetization settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushConfig {
    pub max_samples_per_packet: usize,
    pub max_consecutive_failures: usize,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            max_samples_per_packet: crate::constants::MAX_SAMPLES_PER_PACKET,
            max_consecutive_failures: crate::constants::MAX_CONSECUTIVE_FAILURES,
        }
    }
}

impl From<&StreamConfig> for FlushConfig {
    fn from(config: &StreamConfig) -> Self {
        Self {
            max_samples_per_packet: config.max_samples_per_packet.max(1),
            max_consecutive_failures: config.max_consecutive_failures.max(1),
        }
    }
}

/// Outcome of one flush
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Samples delivered in successful broadcasts
    pub samples_sent: usize,
    /// Samples given up on after repeated failures
    pub samples_skipped: usize,
    /// Samples left for the next flush
    pub samples_pending: usize,
    pub packets_sent: usize,
    pub failed_attempts: usize,
}

impl FlushReport {
    /// Samples the send cursor moved past
    pub fn samples_accounted(&self) -> usize {
        self.samples_sent + self.samples_skipped
    }
}

#[derive(Default)]
struct FlushCounters {
    flushes: AtomicU64,
    samples_sent: AtomicU64,
    samples_skipped: AtomicU64,
    packets_sent: AtomicU64,
    failed_attempts: AtomicU64,
    samples_unsent: AtomicU64,
    samples_dropped: AtomicU64,
}

/// Totals over every flush
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlushStats {
    /// Flushes that had something to send
    pub flushes: u64,
    pub samples_sent: u64,
    pub samples_skipped: u64,
    pub packets_sent: u64,
    pub failed_attempts: u64,
    /// Unsent samples left in the ring after the last flush
    pub samples_unsent: u64,
    /// Unsent samples overwritten by the producer
    pub samples_dropped: u64,
}

/// Consumer side of the ring buffer
pub struct StreamFlusher<B: Broadcaster> {
    reader: SampleReader,
    broadcaster: Arc<B>,
    config: FlushConfig,
    /// Reused slice buffer
    scratch: Vec<i16>,
    cancel: Arc<AtomicBool>,
    counters: Arc<FlushCounters>,
}

impl<B: Broadcaster> StreamFlusher<B> {
    pub fn new(reader: SampleReader, broadcaster: Arc<B>, config: FlushConfig) -> Self {
        Self {
            reader,
            broadcaster,
            scratch: vec![0; config.max_samples_per_packet.max(1)],
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(FlushCounters::default()),
        }
    }

    /// Send everything currently unsent
    pub fn flush_once(&mut self) -> FlushReport {
        let unsent = self.reader.unsent_count();
        if unsent == 0 || !self.broadcaster.has_clients() {
            return FlushReport::default();
        }

        let mut report = FlushReport::default();
        let mut accounted = 0;
        let mut consecutive_failures = 0;

        tracing::trace!(
            "Sending {} samples from pos {}",
            unsent,
            self.reader.send_cursor()
        );

        while accounted < unsent {
            if self.cancel.load(Ordering::Relaxed) || !self.broadcaster.has_clients() {
                break;
            }

            let want = self.config.max_samples_per_packet.min(unsent - accounted);
            let read = self
                .reader
                .read_unsent_from(accounted, &mut self.scratch[..want]);
            if read == 0 {
                // The producer overran the window we were draining
                break;
            }

            let payload = protocol::samples_to_bytes(&self.scratch[..read]);
            if self.broadcaster.broadcast(&payload) {
                consecutive_failures = 0;
                accounted += read;
                report.samples_sent += read;
                report.packets_sent += 1;
                continue;
            }

            report.failed_attempts += 1;
            consecutive_failures += 1;
            tracing::warn!("Failed to send packet at offset {}", accounted);

            if consecutive_failures >= self.config.max_consecutive_failures {
                tracing::error!(
                    "Too many consecutive send failures ({}), skipping {} samples",
                    consecutive_failures,
                    read
                );
                accounted += read;
                report.samples_skipped += read;
            }
        }

        if accounted > 0 {
            self.reader.advance_send_cursor(accounted);
        }
        report.samples_pending = self.reader.unsent_count();

        if report.samples_accounted() < unsent {
            tracing::warn!(
                "Only sent {} samples out of {} ({} packets)",
                report.samples_sent,
                unsent,
                report.packets_sent
            );
        } else {
            tracing::debug!(
                "Sent {} samples in {} packets",
                report.samples_sent,
                report.packets_sent
            );
        }

        self.record(&report);
        report
    }

    /// Flag checked between packets; set it to abandon a flush in progress
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn config(&self) -> FlushConfig {
        self.config
    }

    pub fn stats(&self) -> FlushStats {
        read_stats(&self.counters)
    }

    fn record(&self, report: &FlushReport) {
        let c = &self.counters;
        c.flushes.fetch_add(1, Ordering::Relaxed);
        c.samples_sent
            .fetch_add(report.samples_sent as u64, Ordering::Relaxed);
        c.samples_skipped
            .fetch_add(report.samples_skipped as u64, Ordering::Relaxed);
        c.packets_sent
            .fetch_add(report.packets_sent as u64, Ordering::Relaxed);
        c.failed_attempts
            .fetch_add(report.failed_attempts as u64, Ordering::Relaxed);
        c.samples_unsent
            .store(report.samples_pending as u64, Ordering::Relaxed);
        c.samples_dropped
            .store(self.reader.dropped_samples(), Ordering::Relaxed);
    }
}

fn read_stats(c: &FlushCounters) -> FlushStats {
    FlushStats {
        flushes: c.flushes.load(Ordering::Relaxed),
        samples_sent: c.samples_sent.load(Ordering::Relaxed),
        samples_skipped: c.samples_skipped.load(Ordering::Relaxed),
        packets_sent: c.packets_sent.load(Ordering::Relaxed),
        failed_attempts: c.failed_attempts.load(Ordering::Relaxed),
        samples_unsent: c.samples_unsent.load(Ordering::Relaxed),
        samples_dropped: c.samples_dropped.load(Ordering::Relaxed),
    }
}

/// Handle to a flusher running on its own thread
pub struct FlusherHandle {
    stop_tx: Option<Sender<()>>,
    cancel: Arc<AtomicBool>,
    counters: Arc<FlushCounters>,
    thread_handle: Option<JoinHandle<()>>,
}

impl FlusherHandle {
    pub fn is_running(&self) -> bool {
        self.thread_handle.is_some()
    }

    pub fn stats(&self) -> FlushStats {
        read_stats(&self.counters)
    }

    /// Stop the flush thread, abandoning a flush in progress
    pub fn stop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        // Dropping the sender wakes the thread
        self.stop_tx.take();

        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                tracing::error!("Flusher thread panicked");
            }
        }
    }
}

impl Drop for FlusherHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run `flusher` every `interval` on a dedicated thread
pub fn spawn_flusher<B: Broadcaster + 'static>(
    mut flusher: StreamFlusher<B>,
    interval: Duration,
) -> Result<FlusherHandle> {
    let (stop_tx, stop_rx) = bounded::<()>(0);
    let cancel = flusher.cancel_flag();
    let counters = flusher.counters.clone();

    let handle = thread::Builder::new()
        .name("stream-flusher".to_string())
        .spawn(move || {
            let ticker = tick(interval);
            loop {
                select! {
                    recv(ticker) -> _ => {
                        flusher.flush_once();
                    }
                    recv(stop_rx) -> _ => break,
                }
            }
        })?;

    Ok(FlusherHandle {
        stop_tx: Some(stop_tx),
        cancel,
        counters,
        thread_handle: Some(handle),
    })
}
