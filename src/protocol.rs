//! Wire protocol shared by the streamer and its listeners
//!
//! Every datagram starts with a 4-byte header:
//!
//! ```text
//! ┌──────────┬────────────────────────┬──────────────────────────┐
//! │ type: u8 │ reserved: [u8; 3] (=0) │ payload (variable)       │
//! └──────────┴────────────────────────┴──────────────────────────┘
//! ```
//!
//! `DATA` payloads carry little-endian `i16` mono PCM. `DISCONNECT` has no
//! payload. There are no sequence numbers or checksums.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::NetworkError;

/// Size of the packet header in bytes
pub const HEADER_SIZE: usize = 4;

/// Packet type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Audio (server to client) or arbitrary data (client to server)
    Data = 0,
    /// Sender asks to be removed from the broadcast set
    Disconnect = 1,
}

impl TryFrom<u8> for MessageType {
    type Error = NetworkError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Data),
            1 => Ok(MessageType::Disconnect),
            _ => Err(NetworkError::InvalidPacket),
        }
    }
}

/// Decoded datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data(Bytes),
    Disconnect,
}

impl Packet {
    /// Get the type tag of this packet
    pub fn message_type(&self) -> MessageType {
        match self {
            Packet::Data(_) => MessageType::Data,
            Packet::Disconnect => MessageType::Disconnect,
        }
    }

    /// Parse a datagram
    ///
    /// Datagrams shorter than the header and unknown type tags are rejected
    /// with [`NetworkError::InvalidPacket`].
    pub fn decode(datagram: &[u8]) -> Result<Self, NetworkError> {
        if datagram.len() < HEADER_SIZE {
            return Err(NetworkError::InvalidPacket);
        }

        match MessageType::try_from(datagram[0])? {
            MessageType::Data => Ok(Packet::Data(Bytes::copy_from_slice(
                &datagram[HEADER_SIZE..],
            ))),
            MessageType::Disconnect => Ok(Packet::Disconnect),
        }
    }

    /// Serialize header and payload into a single datagram
    pub fn encode(&self) -> Bytes {
        match self {
            Packet::Data(payload) => frame(MessageType::Data, payload),
            Packet::Disconnect => frame(MessageType::Disconnect, &[]),
        }
    }
}

/// Prefix `payload` with a header of the given type
pub fn frame(message_type: MessageType, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u8(message_type as u8);
    buf.put_bytes(0, HEADER_SIZE - 1);
    buf.put_slice(payload);
    buf.freeze()
}

/// Serialize PCM samples for a `DATA` payload
pub fn samples_to_bytes(samples: &[i16]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * 2);
    for &sample in samples {
        buf.put_i16_le(sample);
    }
    buf.freeze()
}

/// Deserialize a `DATA` payload into PCM samples
///
/// A trailing odd byte is ignored.
pub fn bytes_to_samples(payload: &[u8]) -> Vec<i16> {
    payload
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Largest payload that fits in one UDP datagram together with the header
pub const fn max_payload_size() -> usize {
    crate::constants::MAX_DATAGRAM_SIZE - HEADER_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let packet = Packet::Data(Bytes::from_static(&[0xAA, 0xBB]));
        let encoded = packet.encode();

        assert_eq!(&encoded[..], &[0, 0, 0, 0, 0xAA, 0xBB]);
        assert_eq!(&Packet::Disconnect.encode()[..], &[1, 0, 0, 0]);
    }

    #[test]
    fn test_decode_short_datagram() {
        assert!(matches!(
            Packet::decode(&[0, 0, 0]),
            Err(NetworkError::InvalidPacket)
        ));
        assert!(Packet::decode(&[]).is_err());
    }

    #[test]
    fn test_decode_unknown_type() {
        // The reference client bootstraps with a plain "hello"
        assert!(Packet::decode(b"hello").is_err());
    }

    #[test]
    fn test_decode_header_only_data() {
        let packet = Packet::decode(&[0, 0, 0, 0]).unwrap();
        assert_eq!(packet, Packet::Data(Bytes::new()));
    }

    #[test]
    fn test_disconnect_ignores_trailing_bytes() {
        let packet = Packet::decode(&[1, 0, 0, 0, 9, 9]).unwrap();
        assert_eq!(packet.message_type(), MessageType::Disconnect);
    }

    #[test]
    fn test_sample_encoding_is_little_endian() {
        let bytes = samples_to_bytes(&[1, -2, 0x1234]);
        assert_eq!(&bytes[..], &[0x01, 0x00, 0xFE, 0xFF, 0x34, 0x12]);
        assert_eq!(bytes_to_samples(&bytes), vec![1, -2, 0x1234]);
    }

    #[test]
    fn test_odd_payload_byte_ignored() {
        assert_eq!(bytes_to_samples(&[0x01, 0x00, 0x07]), vec![1]);
    }
}
