//! Error types for the microphone streamer

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Invalid buffer capacity: {0} samples")]
    InvalidBufferCapacity(usize),

    #[error("Failed to allocate audio buffer of {0} samples")]
    BufferAllocation(usize),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Sample source is already running")]
    AlreadyRunning,
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Socket creation failed: {0}")]
    SocketFailed(String),

    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),

    #[error("Invalid packet format")]
    InvalidPacket,

    #[error("Failed to spawn thread: {0}")]
    ThreadSpawn(String),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
