//! Stream subsystem: periodic flushing and pipeline assembly

pub mod flusher;
pub mod pipeline;

pub use flusher::{
    spawn_flusher, FlushConfig, FlushReport, FlushStats, FlusherHandle, StreamFlusher,
};
pub use pipeline::StreamPipeline;
