//! Broker wire format.
//!
//! One WebSocket binary message carries exactly one frame:
//! `[opcode:1][topic_len:2 BE][topic][payload]`. The payload is opaque to
//! the broker; the security layer above treats the whole bus as hostile
//! anyway, so the broker neither authenticates nor inspects anything.

use std::fmt;

/// Frame opcodes. SUB/UNSUB/PUB flow client to broker, MSG broker to client.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusOpcode {
    /// Register for a topic.
    Subscribe = 0x01,
    /// Drop a topic registration.
    Unsubscribe = 0x02,
    /// Publish a payload to a topic.
    Publish = 0x03,
    /// Delivery of a published payload to a subscriber.
    Deliver = 0x04,
}

impl BusOpcode {
    /// Parse an opcode byte. Unknown values are an error, no fallback.
    pub fn from_byte(byte: u8) -> Result<Self, WireError> {
        match byte {
            0x01 => Ok(Self::Subscribe),
            0x02 => Ok(Self::Unsubscribe),
            0x03 => Ok(Self::Publish),
            0x04 => Ok(Self::Deliver),
            _ => Err(WireError::UnknownOpcode(byte)),
        }
    }
}

/// A parsed broker frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusFrame {
    /// What to do.
    pub opcode: BusOpcode,
    /// Which topic.
    pub topic: String,
    /// Payload bytes; empty for SUB/UNSUB.
    pub payload: Vec<u8>,
}

/// Broker framing errors. Any of these disconnects the offending peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Frame shorter than its header.
    Truncated,
    /// Opcode byte not in the table.
    UnknownOpcode(u8),
    /// Topic is empty or not valid UTF-8.
    BadTopic,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated frame"),
            Self::UnknownOpcode(byte) => write!(f, "unknown opcode 0x{:02x}", byte),
            Self::BadTopic => write!(f, "bad topic"),
        }
    }
}

impl std::error::Error for WireError {}

/// Serialize a frame.
pub fn encode_frame(opcode: BusOpcode, topic: &str, payload: &[u8]) -> Vec<u8> {
    debug_assert!(topic.len() <= u16::MAX as usize);
    let mut out = Vec::with_capacity(3 + topic.len() + payload.len());
    out.push(opcode as u8);
    out.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    out.extend_from_slice(topic.as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Parse a frame.
pub fn parse_frame(data: &[u8]) -> Result<BusFrame, WireError> {
    if data.len() < 3 {
        return Err(WireError::Truncated);
    }
    let opcode = BusOpcode::from_byte(data[0])?;
    let topic_len = u16::from_be_bytes([data[1], data[2]]) as usize;
    if data.len() < 3 + topic_len {
        return Err(WireError::Truncated);
    }
    let topic = std::str::from_utf8(&data[3..3 + topic_len]).map_err(|_| WireError::BadTopic)?;
    if topic.is_empty() {
        return Err(WireError::BadTopic);
    }
    Ok(BusFrame {
        opcode,
        topic: topic.to_string(),
        payload: data[3 + topic_len..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let wire = encode_frame(BusOpcode::Publish, "bedroom/inbox", b"payload");
        let frame = parse_frame(&wire).unwrap();
        assert_eq!(frame.opcode, BusOpcode::Publish);
        assert_eq!(frame.topic, "bedroom/inbox");
        assert_eq!(frame.payload, b"payload");
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let wire = encode_frame(BusOpcode::Subscribe, "t", &[]);
        let frame = parse_frame(&wire).unwrap();
        assert_eq!(frame.opcode, BusOpcode::Subscribe);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_malformed_frames_are_rejected() {
        assert_eq!(parse_frame(&[]), Err(WireError::Truncated));
        assert_eq!(parse_frame(&[0x01, 0x00]), Err(WireError::Truncated));
        // Topic length runs past the end.
        assert_eq!(parse_frame(&[0x01, 0x00, 0x05, b'a']), Err(WireError::Truncated));
        assert_eq!(parse_frame(&[0x09, 0x00, 0x01, b'a']), Err(WireError::UnknownOpcode(0x09)));
        assert_eq!(parse_frame(&[0x01, 0x00, 0x00]), Err(WireError::BadTopic));
        assert_eq!(parse_frame(&[0x01, 0x00, 0x01, 0xFF]), Err(WireError::BadTopic));
    }
}
