//! Streamer assembly
//!
//! Wires a [`SampleSource`] into the ring buffer, the ring buffer into a
//! [`StreamFlusher`] and the flusher into a [`PacketChannel`] whose listener
//! thread maintains the client registry.

use crossbeam_channel::Sender;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::audio::buffer::CircularAudioBuffer;
use crate::audio::source::SampleSource;
use crate::config::AppConfig;
use crate::error::Result;
use crate::network::channel::{start_listener, InboundData, ListenerHandle, PacketChannel};
use crate::stream::flusher::{
    spawn_flusher, FlushConfig, FlushStats, FlusherHandle, StreamFlusher,
};

/// A running streamer
pub struct StreamPipeline {
    source: Box<dyn SampleSource>,
    channel: Arc<PacketChannel>,
    flusher: Option<FlusherHandle>,
    listener: Option<ListenerHandle>,
    local_addr: SocketAddr,
}

impl StreamPipeline {
    /// Start capture, flushing and listening
    pub fn start(config: &AppConfig, source: Box<dyn SampleSource>) -> Result<Self> {
        Self::start_with_data_channel(config, source, None)
    }

    /// Like [`StreamPipeline::start`], forwarding listener DATA payloads to `data_tx`
    pub fn start_with_data_channel(
        config: &AppConfig,
        mut source: Box<dyn SampleSource>,
        data_tx: Option<Sender<InboundData>>,
    ) -> Result<Self> {
        config.validate()?;

        if source.sample_rate() != config.audio.sample_rate {
            tracing::warn!(
                "Source delivers {} Hz, configured rate is {} Hz",
                source.sample_rate(),
                config.audio.sample_rate
            );
        }

        let capacity = config.audio.buffer_capacity();
        let (mut writer, reader) = CircularAudioBuffer::new(capacity)?.split();

        let channel = Arc::new(PacketChannel::bind(&config.network)?);
        channel.set_data_channel(data_tx);
        let local_addr = channel.local_addr()?;

        source.register_callback(Some(Box::new(move |samples: &[i16]| {
            writer.write(samples);
        })));

        // Nothing below may leave a half-started pipeline behind
        if let Err(e) = source.start() {
            source.register_callback(None);
            return Err(e.into());
        }

        let listener = match start_listener(channel.clone()) {
            Ok(listener) => listener,
            Err(e) => {
                stop_source(source.as_mut());
                return Err(e.into());
            }
        };

        let flush_config = FlushConfig::from(&config.stream);
        let flusher = StreamFlusher::new(reader, channel.clone(), flush_config);
        let flusher = match spawn_flusher(flusher, config.stream.flush_interval()) {
            Ok(flusher) => flusher,
            Err(e) => {
                stop_source(source.as_mut());
                drop(listener);
                return Err(e);
            }
        };

        tracing::info!(
            "Streaming {} Hz mono on {} ({} sample buffer, flush every {} ms)",
            config.audio.sample_rate,
            local_addr,
            capacity,
            config.stream.flush_interval_ms
        );

        Ok(Self {
            source,
            channel,
            flusher: Some(flusher),
            listener: Some(listener),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Channel holding the socket and the client registry
    pub fn channel(&self) -> &Arc<PacketChannel> {
        &self.channel
    }

    pub fn flush_stats(&self) -> FlushStats {
        self.flusher
            .as_ref()
            .map(FlusherHandle::stats)
            .unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.flusher.is_some()
    }

    /// Stop capture first, then the flush and receive threads. Idempotent.
    ///
    /// Afterwards the registry is empty and the data consumer, if any, sees
    /// its channel disconnect.
    pub fn shutdown(&mut self) {
        if self.flusher.is_none() && self.listener.is_none() {
            return;
        }

        stop_source(self.source.as_mut());

        if let Some(mut flusher) = self.flusher.take() {
            flusher.stop();
        }
        if let Some(mut listener) = self.listener.take() {
            listener.stop();
        }

        self.channel.registry().clear();
        self.channel.set_data_channel(None);

        tracing::info!("Streamer on {} stopped", self.local_addr);
    }
}

impl Drop for StreamPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn stop_source(source: &mut dyn SampleSource) {
    source.stop();
    source.register_callback(None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::source::BatchCallback;
    use crate::audio::synthetic::ToneSource;
    use crate::error::{AudioError, Error};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn loopback_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.network.bind_address = "127.0.0.1".to_string();
        config.network.udp_port = 0;
        config.network.recv_timeout_ms = 20;
        config
    }

    /// Source that refuses to start and records whether its callback was cleared
    struct BrokenSource {
        callback_set: Arc<AtomicBool>,
    }

    impl SampleSource for BrokenSource {
        fn sample_rate(&self) -> u32 {
            16000
        }

        fn batch_period_ms(&self) -> u32 {
            30
        }

        fn register_callback(&mut self, callback: Option<BatchCallback>) {
            self.callback_set.store(callback.is_some(), Ordering::SeqCst);
        }

        fn start(&mut self) -> std::result::Result<(), AudioError> {
            Err(AudioError::DeviceNotFound("test device".into()))
        }

        fn stop(&mut self) {}
    }

    #[test]
    fn test_start_and_shutdown() {
        let source = ToneSource::new(16000, 10, 440.0);
        let mut pipeline = StreamPipeline::start(&loopback_config(), Box::new(source)).unwrap();

        assert!(pipeline.is_running());
        assert_ne!(pipeline.local_addr().port(), 0);
        assert!(pipeline.channel().registry().is_empty());

        pipeline.shutdown();
        assert!(!pipeline.is_running());
        // Second call is a no-op
        pipeline.shutdown();
    }

    #[test]
    fn test_shutdown_releases_clients_and_consumer() {
        let (tx, rx) = crossbeam_channel::bounded(4);
        let config = loopback_config();
        let source = Box::new(ToneSource::new(16000, 10, 440.0));
        let mut pipeline =
            StreamPipeline::start_with_data_channel(&config, source, Some(tx)).unwrap();

        let listener: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let datagram = crate::protocol::frame(crate::protocol::MessageType::Data, b"ping");
        pipeline.channel().handle_inbound(&datagram, listener);

        let data = rx.try_recv().unwrap();
        assert_eq!(data.source, listener);
        assert_eq!(&data.payload[..], b"ping");
        assert_eq!(pipeline.channel().registry().len(), 1);

        pipeline.shutdown();
        assert!(pipeline.channel().registry().is_empty());
        assert!(matches!(
            rx.try_recv(),
            Err(crossbeam_channel::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_failed_source_start() {
        let callback_set = Arc::new(AtomicBool::new(false));
        let source = BrokenSource {
            callback_set: callback_set.clone(),
        };

        let result = StreamPipeline::start(&loopback_config(), Box::new(source));
        assert!(matches!(result, Err(Error::Audio(AudioError::DeviceNotFound(_)))));
        assert!(!callback_set.load(Ordering::SeqCst));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = loopback_config();
        config.stream.flush_interval_ms = 0;

        let source = ToneSource::new(16000, 10, 440.0);
        assert!(matches!(
            StreamPipeline::start(&config, Box::new(source)),
            Err(Error::Config(_))
        ));
    }
}
