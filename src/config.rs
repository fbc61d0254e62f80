//! Application configuration
//!
//! Loaded from a TOML file; every field has a default so a partial (or
//! missing) file is valid.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, NetworkError, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub audio: AudioConfig,
    pub stream: StreamConfig,
}

/// UDP server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local address to bind
    pub bind_address: String,
    /// Listen port; 0 picks an ephemeral port
    pub udp_port: u16,
    /// Receive timeout of the listener loop
    pub recv_timeout_ms: u64,
    /// Size of the inbound datagram buffer
    pub recv_buffer_size: usize,
    /// Kernel send buffer size (SO_SNDBUF)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_send_buffer: Option<usize>,
    /// Kernel receive buffer size (SO_RCVBUF)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_recv_buffer: Option<usize>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            udp_port: DEFAULT_UDP_PORT,
            recv_timeout_ms: DEFAULT_RECV_TIMEOUT_MS,
            recv_buffer_size: RECV_BUFFER_SIZE,
            socket_send_buffer: None,
            socket_recv_buffer: None,
        }
    }
}

impl NetworkConfig {
    /// Socket address the server binds to
    pub fn bind_addr(&self) -> std::result::Result<SocketAddr, NetworkError> {
        let ip: IpAddr = self
            .bind_address
            .parse()
            .map_err(|_| NetworkError::InvalidAddress(self.bind_address.clone()))?;
        Ok(SocketAddr::new(ip, self.udp_port))
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }
}

/// Capture settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Ring buffer length in seconds
    pub buffer_seconds: f32,
    /// Period between two captured batches
    pub batch_period_ms: u32,
    /// Input device name; `None` selects the default device
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// Frequency of the synthetic tone used without a capture device
    pub tone_frequency_hz: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            buffer_seconds: DEFAULT_BUFFER_SECONDS,
            batch_period_ms: DEFAULT_BATCH_PERIOD_MS,
            device: None,
            tone_frequency_hz: 440.0,
        }
    }
}

impl AudioConfig {
    /// Ring buffer capacity in samples
    pub fn buffer_capacity(&self) -> usize {
        (self.sample_rate as f64 * self.buffer_seconds as f64) as usize
    }
}

/// Flush and packetization settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Period between two network flushes
    pub flush_interval_ms: u64,
    /// Samples per DATA packet
    pub max_samples_per_packet: usize,
    /// Failed sends in a row before a slice is skipped
    pub max_consecutive_failures: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            max_samples_per_packet: MAX_SAMPLES_PER_PACKET,
            max_consecutive_failures: MAX_CONSECUTIVE_FAILURES,
        }
    }
}

impl StreamConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl AppConfig {
    /// Default location of the configuration file
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "lan-mic-streamer")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file, falling back to defaults if it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Write the configuration as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        self.network.bind_addr()?;

        if self.network.recv_timeout_ms == 0 {
            return Err(Error::Config("recv_timeout_ms must be positive".into()));
        }
        if self.network.recv_buffer_size < crate::protocol::HEADER_SIZE {
            return Err(Error::Config(format!(
                "recv_buffer_size must hold at least a packet header, got {}",
                self.network.recv_buffer_size
            )));
        }
        if self.audio.sample_rate == 0 {
            return Err(Error::Config("sample_rate must be positive".into()));
        }
        if !(self.audio.buffer_seconds > 0.0) {
            return Err(Error::Config(format!(
                "buffer_seconds must be positive, got {}",
                self.audio.buffer_seconds
            )));
        }
        if self.audio.buffer_capacity() == 0 {
            return Err(Error::Config("buffer holds no samples".into()));
        }
        if self.audio.batch_period_ms == 0 {
            return Err(Error::Config("batch_period_ms must be positive".into()));
        }
        if self.stream.flush_interval_ms == 0 {
            return Err(Error::Config("flush_interval_ms must be positive".into()));
        }
        // A DATA packet must fit in one datagram
        let max_samples = crate::protocol::max_payload_size() / 2;
        if self.stream.max_samples_per_packet == 0
            || self.stream.max_samples_per_packet > max_samples
        {
            return Err(Error::Config(format!(
                "max_samples_per_packet must be in 1..={}, got {}",
                max_samples, self.stream.max_samples_per_packet
            )));
        }
        if self.stream.max_consecutive_failures == 0 {
            return Err(Error::Config("max_consecutive_failures must be positive".into()));
        }

        Ok(())
    }
}
