//! Microphone Streamer Application
//!
//! Captures the microphone (or a test tone) and streams it to every
//! listener that joins over UDP.

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_mic_streamer::{
    audio::SampleSource,
    config::AppConfig,
    constants::DATA_CHANNEL_CAPACITY,
    network::InboundData,
    stream::StreamPipeline,
};

/// Period of the stats log line
const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting LAN Mic Streamer");

    // Config path from args, else the per-user default
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(AppConfig::default_path);

    let config = match &config_path {
        Some(path) => {
            tracing::info!("Loading config from {}", path.display());
            AppConfig::load_or_default(path)
                .with_context(|| format!("Invalid config file {}", path.display()))?
        }
        None => AppConfig::default(),
    };

    let source = open_source(&config)?;
    let (data_tx, data_rx) = bounded::<InboundData>(DATA_CHANNEL_CAPACITY);
    let mut pipeline = StreamPipeline::start_with_data_channel(&config, source, Some(data_tx))
        .context("Failed to start streamer")?;
    let consumer = spawn_data_consumer(data_rx)?;

    tracing::info!(
        "Listeners join by sending any datagram to {} - press Ctrl+C to stop",
        pipeline.local_addr()
    );

    let mut stats_timer = tokio::time::interval(STATS_INTERVAL);
    stats_timer.tick().await;

    loop {
        tokio::select! {
            _ = stats_timer.tick() => log_stats(&pipeline),
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for Ctrl+C: {}", e);
                }
                break;
            }
        }
    }

    tracing::info!("Shutting down");
    pipeline.shutdown();
    log_stats(&pipeline);

    // Shutdown dropped the sender, so the consumer drains and exits
    if consumer.join().is_err() {
        tracing::error!("Data consumer thread panicked");
    }

    Ok(())
}

#[cfg(feature = "device-capture")]
fn open_source(config: &AppConfig) -> Result<Box<dyn SampleSource>> {
    use lan_mic_streamer::audio::{list_input_devices, CpalSource};

    println!("\n=== Available Input Devices ===");
    for device in list_input_devices() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}:", device.name, default_marker);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    Ok(Box::new(CpalSource::new(
        config.audio.device.as_deref(),
        config.audio.sample_rate,
        config.audio.batch_period_ms,
    )))
}

#[cfg(not(feature = "device-capture"))]
fn open_source(config: &AppConfig) -> Result<Box<dyn SampleSource>> {
    use lan_mic_streamer::audio::ToneSource;

    tracing::warn!(
        "Built without device-capture, streaming a {} Hz test tone",
        config.audio.tone_frequency_hz
    );

    Ok(Box::new(ToneSource::new(
        config.audio.sample_rate,
        config.audio.batch_period_ms,
        config.audio.tone_frequency_hz,
    )))
}

/// Log every payload listeners send to the streamer
fn spawn_data_consumer(data_rx: Receiver<InboundData>) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("data-consumer".to_string())
        .spawn(move || {
            for data in data_rx {
                tracing::info!(
                    "Received {} bytes from {}",
                    data.payload.len(),
                    data.source
                );
            }
        })
        .context("Failed to spawn data consumer")?;
    Ok(handle)
}

fn log_stats(pipeline: &StreamPipeline) {
    let flush = pipeline.flush_stats();
    let channel = pipeline.channel().stats();

    tracing::info!(
        "Stats: {} clients, {} packets, {:.1} KB sent, {} skipped, {} dropped, {} unsent",
        channel.clients,
        channel.packets_sent,
        channel.bytes_sent as f64 / 1024.0,
        flush.samples_skipped,
        flush.samples_dropped,
        flush.samples_unsent
    );

    let clients = pipeline.channel().registry().snapshot();
    if !clients.is_empty() {
        match serde_json::to_string(&clients) {
            Ok(json) => tracing::info!("Clients: {}", json),
            Err(e) => tracing::warn!("Failed to serialize client list: {}", e),
        }
    }
}
