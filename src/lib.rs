//! # LAN Microphone Streamer
//!
//! Continuous low-latency capture of a mono 16-bit microphone stream,
//! fanned out to any number of listeners on the LAN over UDP.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               STREAMER                                  │
//! │                                                                         │
//! │  ┌──────────────┐  batch   ┌──────────────────────────────────────┐    │
//! │  │ SampleSource │ ───────▶ │ CircularAudioBuffer (audio::buffer)  │    │
//! │  │ (capture     │  write   │  SampleWriter ─┐    ┌─ SampleReader  │    │
//! │  │  thread)     │          │   write_cursor │    │  send_cursor   │    │
//! │  └──────────────┘          └────────────────┴────┴────────────────┘    │
//! │                                                   │ read_unsent        │
//! │                                                   ▼                    │
//! │                            ┌──────────────────────────────────────┐    │
//! │                            │ StreamFlusher (stream::flusher)      │    │
//! │                            │ flush thread, ≤480 samples / packet  │    │
//! │                            └──────────────────┬───────────────────┘    │
//! │                                               │ broadcast              │
//! │                                               ▼                        │
//! │  ┌─────────────────┐  mutate   ┌──────────────────────────────────┐    │
//! │  │ udp-listener    │ ────────▶ │ PacketChannel (network::channel) │    │
//! │  │ thread          │           │  ClientRegistry (DashMap)        │    │
//! │  └────────▲────────┘           └──────────────────┬───────────────┘    │
//! └───────────┼───────────────────────────────────────┼────────────────────┘
//!             │ join / DISCONNECT                     │ [type|pad|PCM]
//!             │                                       ▼
//!        ┌──────────────────────────────────────────────────┐
//!        │ Listeners (network::client::StreamClient)        │
//!        └──────────────────────────────────────────────────┘
//! ```
//!
//! Capture and flush never share a lock: each buffer cursor is owned by a
//! single context. Only the client registry is shared between the flush
//! thread and the receive thread.

pub mod audio;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod stream;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default microphone sample rate
    pub const DEFAULT_SAMPLE_RATE: u32 = 16000;

    /// Default ring buffer length in seconds
    pub const DEFAULT_BUFFER_SECONDS: f32 = 4.0;

    /// Default period between two capture batches
    pub const DEFAULT_BATCH_PERIOD_MS: u32 = 30;

    /// Default period between two network flushes
    pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 30;

    /// Default UDP port for audio streaming
    pub const DEFAULT_UDP_PORT: u16 = 5001;

    /// Samples per DATA packet (480 samples = 1920 bytes = 30ms at 16kHz)
    pub const MAX_SAMPLES_PER_PACKET: usize = 480;

    /// Consecutive failed sends tolerated before a slice is skipped
    pub const MAX_CONSECUTIVE_FAILURES: usize = 3;

    /// Receive timeout of the listener loop
    pub const DEFAULT_RECV_TIMEOUT_MS: u64 = 100;

    /// Size of the inbound datagram buffer
    pub const RECV_BUFFER_SIZE: usize = 2048;

    /// Maximum UDP payload (65535 - IP/UDP headers)
    pub const MAX_DATAGRAM_SIZE: usize = 65_507;

    /// Capacity of the inbound data channel
    pub const DATA_CHANNEL_CAPACITY: usize = 256;
}
