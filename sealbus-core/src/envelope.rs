//! Session handshake envelopes.
//!
//! The session request carries only the requester's plaintext address and
//! the session envelope only `addr_len | addr | id`. Neither is encrypted
//! or MACed on purpose: the 16-byte session ID itself is the secret, and
//! only a holder of the partner key can produce the command datagram that
//! embeds it. Authenticating the envelope would change the handshake, not
//! strengthen it.

use crate::datagram::MAX_ADDRESS_LEN;
use crate::error::CodecError;

/// Session ID length in bytes.
pub const SESSION_ID_LEN: usize = 16;

/// A parsed session envelope: the issuer's address and the one-time ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEnvelope {
    /// Address of the partner that issued the ID.
    pub address: String,

    /// The one-time session ID.
    pub session_id: [u8; SESSION_ID_LEN],
}

fn validate_address(address: &str) -> Result<(), CodecError> {
    if address.is_empty() || address.len() > MAX_ADDRESS_LEN || !address.is_ascii() {
        return Err(CodecError::Malformed);
    }
    Ok(())
}

/// Encode a session request payload (the requester's bare address).
pub fn encode_session_request(address: &str) -> Vec<u8> {
    address.as_bytes().to_vec()
}

/// Parse a session request payload.
pub fn parse_session_request(data: &[u8]) -> Result<String, CodecError> {
    let address = std::str::from_utf8(data).map_err(|_| CodecError::Malformed)?;
    validate_address(address)?;
    Ok(address.to_string())
}

/// Encode a session envelope.
pub fn encode_session_envelope(address: &str, session_id: &[u8; SESSION_ID_LEN]) -> Vec<u8> {
    assert!(
        !address.is_empty() && address.len() <= MAX_ADDRESS_LEN && address.is_ascii(),
        "address length out of range"
    );
    let mut out = Vec::with_capacity(1 + address.len() + SESSION_ID_LEN);
    out.push(address.len() as u8);
    out.extend_from_slice(address.as_bytes());
    out.extend_from_slice(session_id);
    out
}

/// Parse a session envelope. The total length must be exact.
pub fn parse_session_envelope(data: &[u8]) -> Result<SessionEnvelope, CodecError> {
    let (&addr_len, rest) = data.split_first().ok_or(CodecError::Malformed)?;
    let addr_len = addr_len as usize;
    if addr_len == 0 || rest.len() != addr_len + SESSION_ID_LEN {
        return Err(CodecError::Malformed);
    }
    let address = std::str::from_utf8(&rest[..addr_len]).map_err(|_| CodecError::Malformed)?;
    validate_address(address)?;
    let mut session_id = [0u8; SESSION_ID_LEN];
    session_id.copy_from_slice(&rest[addr_len..]);
    Ok(SessionEnvelope {
        address: address.to_string(),
        session_id,
    })
}
