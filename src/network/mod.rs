//! Network subsystem for UDP audio fan-out

pub mod channel;
pub mod client;
pub mod registry;
pub mod udp;

pub use channel::{
    start_listener, Broadcaster, InboundData, InboundEvent, ListenerHandle, PacketChannel,
};
pub use client::{ReceivedAudio, StreamClient};
pub use registry::{ClientInfo, ClientRegistry, Endpoint};
pub use udp::{create_socket, DatagramSocket};
