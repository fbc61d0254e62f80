//! End-to-end streaming over the loopback interface

use std::time::{Duration, Instant};

use lan_mic_streamer::{
    audio::ToneSource,
    config::AppConfig,
    constants::{DATA_CHANNEL_CAPACITY, MAX_SAMPLES_PER_PACKET},
    network::{Broadcaster, StreamClient},
    stream::StreamPipeline,
};

fn loopback_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.network.bind_address = "127.0.0.1".to_string();
    config.network.udp_port = 0;
    config.network.recv_timeout_ms = 20;
    config.stream.flush_interval_ms = 10;
    config
}

fn start_pipeline() -> StreamPipeline {
    let config = loopback_config();
    let source = ToneSource::new(config.audio.sample_rate, 10, 440.0);
    StreamPipeline::start(&config, Box::new(source)).unwrap()
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn join_registers_client() {
    let pipeline = start_pipeline();
    let client = StreamClient::connect(pipeline.local_addr(), Duration::from_millis(50)).unwrap();
    let client_addr = client.local_addr().unwrap();

    let registry = pipeline.channel().registry();
    assert!(wait_until(Duration::from_secs(2), || registry.len() == 1));
    assert!(pipeline.channel().has_clients());

    // Wildcard bind, so compare ports only
    let endpoints = registry.endpoints();
    assert_eq!(endpoints[0].port(), client_addr.port());
}

#[test]
fn client_receives_audio_then_leaves() {
    let pipeline = start_pipeline();
    let mut client =
        StreamClient::connect(pipeline.local_addr(), Duration::from_millis(100)).unwrap();

    let mut packets = 0;
    let deadline = Instant::now() + Duration::from_secs(5);
    while packets < 10 && Instant::now() < deadline {
        if let Some(audio) = client.recv_audio().unwrap() {
            assert!(!audio.samples.is_empty());
            assert!(audio.samples.len() <= MAX_SAMPLES_PER_PACKET);
            assert_eq!(audio.source, pipeline.local_addr());
            packets += 1;
        }
    }
    assert_eq!(packets, 10);
    assert!(pipeline.flush_stats().packets_sent >= 10);

    client.disconnect().unwrap();

    let registry = pipeline.channel().registry();
    assert!(wait_until(Duration::from_secs(2), || registry.is_empty()));
}

#[test]
fn no_packets_without_clients() {
    let pipeline = start_pipeline();
    std::thread::sleep(Duration::from_millis(100));

    let stats = pipeline.flush_stats();
    assert_eq!(stats.packets_sent, 0);
    // Flushes without listeners return before touching the buffer
    assert_eq!(stats.flushes, 0);
    assert_eq!(pipeline.channel().stats().packets_sent, 0);
}

#[test]
fn listener_payload_reaches_consumer() {
    let config = loopback_config();
    let source = ToneSource::new(config.audio.sample_rate, 10, 440.0);
    let (data_tx, data_rx) = crossbeam_channel::bounded(DATA_CHANNEL_CAPACITY);
    let mut pipeline =
        StreamPipeline::start_with_data_channel(&config, Box::new(source), Some(data_tx))
            .unwrap();

    let client = StreamClient::connect(pipeline.local_addr(), Duration::from_millis(50)).unwrap();
    client.send_data(b"payload from listener").unwrap();

    // The join packet carries a payload too
    let join = data_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(&join.payload[..], b"hello");

    let data = data_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(&data.payload[..], b"payload from listener");
    assert_eq!(data.source.port(), client.local_addr().unwrap().port());
    assert_eq!(pipeline.channel().stats().data_dropped, 0);

    pipeline.shutdown();
    assert!(data_rx.recv_timeout(Duration::from_secs(1)).is_err());
}
