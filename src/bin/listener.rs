//! Stream Listener Application
//!
//! Joins a streamer, records what it receives to a WAV file and leaves
//! cleanly on Ctrl+C.
//!
//! Usage: `listener [server-addr] [output.wav] [sample-rate]`. The sample rate
//! must match the streamer's `audio.sample_rate`.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_mic_streamer::{
    constants::{DEFAULT_RECV_TIMEOUT_MS, DEFAULT_SAMPLE_RATE, DEFAULT_UDP_PORT},
    network::StreamClient,
};

/// Rejoin if the streamer stays silent this long
const REJOIN_AFTER: Duration = Duration::from_secs(2);

/// Period of the throughput log line
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

    tracing::info!("Starting LAN Mic Listener");

    let server: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| format!("127.0.0.1:{}", DEFAULT_UDP_PORT))
        .parse()
        .context("Invalid streamer address")?;
    let output = std::env::args()
        .nth(2)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("capture.wav"));
    let sample_rate = parse_sample_rate(std::env::args().nth(3).as_deref())?;

    let running = Arc::new(AtomicBool::new(true));
    let running_for_signal = running.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            running_for_signal.store(false, Ordering::SeqCst);
        }
    });

    // The receive loop blocks on the socket, keep it off the runtime
    let recorded = tokio::task::spawn_blocking(move || record(server, output, sample_rate, running))
        .await
        .context("Receive loop panicked")??;

    tracing::info!(
        "Recorded {:.1} s of audio",
        recorded as f64 / sample_rate as f64
    );
    Ok(())
}

/// Receive until `running` is cleared; returns the number of samples written
fn record(
    server: SocketAddr,
    output: PathBuf,
    sample_rate: u32,
    running: Arc<AtomicBool>,
) -> Result<u64> {
    let mut writer = hound::WavWriter::create(&output, wav_spec(sample_rate))
        .with_context(|| format!("Failed to create {}", output.display()))?;

    let recv_timeout = Duration::from_millis(DEFAULT_RECV_TIMEOUT_MS);
    let mut client = StreamClient::connect(server, recv_timeout)?;
    tracing::info!(
        "Recording {} at {} Hz to {} - press Ctrl+C to stop",
        server,
        sample_rate,
        output.display()
    );

    let mut last_packet = Instant::now();
    let mut last_stats = Instant::now();
    let mut packets_at_last_stats = 0u64;

    while running.load(Ordering::SeqCst) {
        match client.recv_audio() {
            Ok(Some(audio)) => {
                for sample in audio.samples {
                    writer.write_sample(sample)?;
                }
                last_packet = Instant::now();
            }
            Ok(None) => {
                if last_packet.elapsed() >= REJOIN_AFTER {
                    tracing::warn!("No audio from {} for {:?}, rejoining", server, REJOIN_AFTER);
                    client.join()?;
                    last_packet = Instant::now();
                }
            }
            Err(e) => tracing::warn!("Receive failed: {}", e),
        }

        if last_stats.elapsed() >= STATS_INTERVAL {
            let packets = client.packets_received();
            let elapsed = last_stats.elapsed().as_secs_f64();
            let rate = (packets - packets_at_last_stats) as f64 / elapsed;
            tracing::info!(
                "Stats: {} packets ({:.1}/s), {} samples received",
                packets,
                rate,
                client.samples_received()
            );
            packets_at_last_stats = packets;
            last_stats = Instant::now();
        }
    }

    let samples = client.samples_received();
    if let Err(e) = client.disconnect() {
        tracing::warn!("Failed to send DISCONNECT: {}", e);
    }
    writer.finalize()?;

    Ok(samples)
}

/// Sample rate from the command line, defaulting to the streamer's default
fn parse_sample_rate(arg: Option<&str>) -> Result<u32> {
    let rate = match arg {
        Some(rate) => rate
            .parse()
            .with_context(|| format!("Invalid sample rate {:?}", rate))?,
        None => DEFAULT_SAMPLE_RATE,
    };
    anyhow::ensure!(rate > 0, "Sample rate must be positive");
    Ok(rate)
}

/// 16-bit mono PCM, as sent by the streamer
fn wav_spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}
