//! Wire format for the multiplexed tunnel (spec.md §4.A).
//!
//! Every frame is an 8-byte big-endian header followed by an opaque
//! payload; the payload length comes from the surrounding transport frame
//! (one WebSocket binary message == one tunnel frame), not from the header.
//!
//! ```text
//! offset 0  1 byte   message type
//! offset 1  1 byte   protocol (1=TCP, 2=UDP)
//! offset 2  4 bytes  client id
//! offset 6  2 bytes  port (target port inside container for CONNECT; 0 otherwise)
//! ```

use std::convert::TryFrom;

pub const HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Connect = 1,
    Connected = 2,
    Data = 3,
    Close = 4,
    Error = 5,
    Ping = 6,
    Pong = 7,
}

impl TryFrom<u8> for MessageType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => MessageType::Connect,
            2 => MessageType::Connected,
            3 => MessageType::Data,
            4 => MessageType::Close,
            5 => MessageType::Error,
            6 => MessageType::Ping,
            7 => MessageType::Pong,
            other => return Err(FrameError::UnknownMessageType(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Protocol {
    Tcp = 1,
    Udp = 2,
}

impl TryFrom<u8> for Protocol {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Protocol::Tcp,
            2 => Protocol::Udp,
            other => return Err(FrameError::UnknownProtocol(other)),
        })
    }
}

pub type ClientId = u32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: MessageType,
    pub protocol: Protocol,
    pub client_id: ClientId,
    /// Target port inside the container for `CONNECT`; `0` for every other
    /// message type.
    pub port: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame shorter than the {HEADER_SIZE}-byte header (got {0} bytes)")]
    TooShort(usize),
    #[error("unknown message type byte {0}")]
    UnknownMessageType(u8),
    #[error("unknown protocol byte {0}")]
    UnknownProtocol(u8),
}

impl Frame {
    pub fn new(
        message_type: MessageType,
        protocol: Protocol,
        client_id: ClientId,
        port: u16,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            message_type,
            protocol,
            client_id,
            port,
            payload,
        }
    }

    pub fn connect(protocol: Protocol, client_id: ClientId, port: u16) -> Self {
        Self::new(MessageType::Connect, protocol, client_id, port, Vec::new())
    }

    pub fn connected(protocol: Protocol, client_id: ClientId) -> Self {
        Self::new(MessageType::Connected, protocol, client_id, 0, Vec::new())
    }

    pub fn data(protocol: Protocol, client_id: ClientId, payload: Vec<u8>) -> Self {
        Self::new(MessageType::Data, protocol, client_id, 0, payload)
    }

    pub fn close(protocol: Protocol, client_id: ClientId) -> Self {
        Self::new(MessageType::Close, protocol, client_id, 0, Vec::new())
    }

    pub fn error(protocol: Protocol, client_id: ClientId, message: impl Into<String>) -> Self {
        Self::new(
            MessageType::Error,
            protocol,
            client_id,
            0,
            message.into().into_bytes(),
        )
    }

    pub fn ping() -> Self {
        Self::new(MessageType::Ping, Protocol::Tcp, 0, 0, Vec::new())
    }

    pub fn pong() -> Self {
        Self::new(MessageType::Pong, Protocol::Tcp, 0, 0, Vec::new())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.push(self.message_type as u8);
        buf.push(self.protocol as u8);
        buf.extend_from_slice(&self.client_id.to_be_bytes());
        buf.extend_from_slice(&self.port.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::TooShort(bytes.len()));
        }
        let message_type = MessageType::try_from(bytes[0])?;
        let protocol = Protocol::try_from(bytes[1])?;
        let client_id = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        let port = u16::from_be_bytes([bytes[6], bytes[7]]);
        let payload = bytes[HEADER_SIZE..].to_vec();
        Ok(Self {
            message_type,
            protocol,
            client_id,
            port,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_message_type_and_protocol() {
        let cases = [
            Frame::connect(Protocol::Tcp, 42, 8080),
            Frame::connect(Protocol::Udp, 7, 53),
            Frame::connected(Protocol::Tcp, 42),
            Frame::data(Protocol::Tcp, 42, b"hello world".to_vec()),
            Frame::data(Protocol::Udp, 7, vec![]),
            Frame::close(Protocol::Tcp, 42),
            Frame::error(Protocol::Tcp, 99, "no such client"),
            Frame::ping(),
            Frame::pong(),
        ];
        for frame in cases {
            let encoded = frame.encode();
            let decoded = Frame::decode(&encoded).expect("decode");
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn header_is_exactly_eight_bytes_before_payload() {
        let frame = Frame::data(Protocol::Tcp, 1, vec![1, 2, 3]);
        let encoded = frame.encode();
        assert_eq!(encoded.len(), HEADER_SIZE + 3);
    }

    #[test]
    fn rejects_truncated_frames() {
        let bytes = [0u8; 4];
        assert!(matches!(Frame::decode(&bytes), Err(FrameError::TooShort(4))));
    }

    #[test]
    fn rejects_unknown_message_type() {
        let mut bytes = Frame::ping().encode();
        bytes[0] = 200;
        assert!(matches!(
            Frame::decode(&bytes),
            Err(FrameError::UnknownMessageType(200))
        ));
    }
}
