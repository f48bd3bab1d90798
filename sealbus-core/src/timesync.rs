//! Time-sync frames.
//!
//! Request:
//! ```text
//! +--------------+------+-----------+----------+
//! | addr_len (1) | addr | nonce (8) | mac (32) |
//! +--------------+------+-----------+----------+
//! ```
//!
//! Response:
//! ```text
//! +--------------+------+----------------+-----------+----------+
//! | addr_len (1) | addr | timestamp (8B) | nonce (8) | mac (32) |
//! +--------------+------+----------------+-----------+----------+
//! ```
//!
//! The timestamp is a big-endian i64; the MAC covers everything before it.
//! Both frames have an exact total length for a given address, anything
//! else is rejected. These frames are authenticated but not encrypted: the
//! time is public, its freshness is what the nonce protects.

use crate::datagram::{check_mac, hmac_sha256, MAC_LEN, MAX_ADDRESS_LEN};
use crate::error::CodecError;
use hmac::Mac;

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 8;

/// A verified time request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeRequest {
    /// Address of the requester.
    pub address: String,

    /// Nonce to echo in the response.
    pub nonce: [u8; NONCE_LEN],
}

/// A verified time response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeResponse {
    /// Address of the responding server.
    pub address: String,

    /// The server's current time in Unix seconds.
    pub timestamp: i64,

    /// Echo of the request nonce.
    pub nonce: [u8; NONCE_LEN],
}

/// Read the length-prefixed address at the start of a frame.
///
/// Used by receivers to find the partner record before any MAC check is
/// possible.
pub fn extract_address(data: &[u8]) -> Result<&str, CodecError> {
    let (&len, rest) = data.split_first().ok_or(CodecError::Malformed)?;
    let len = len as usize;
    if len == 0 || rest.len() < len {
        return Err(CodecError::Malformed);
    }
    let address = std::str::from_utf8(&rest[..len]).map_err(|_| CodecError::Malformed)?;
    if !address.is_ascii() {
        return Err(CodecError::Malformed);
    }
    Ok(address)
}

fn encode_address(out: &mut Vec<u8>, address: &str) {
    assert!(
        !address.is_empty() && address.len() <= MAX_ADDRESS_LEN,
        "address length out of range"
    );
    assert!(address.is_ascii(), "address must be ascii");
    out.push(address.len() as u8);
    out.extend_from_slice(address.as_bytes());
}

fn append_mac(out: &mut Vec<u8>, passphrase: &str) {
    let mut mac = hmac_sha256(passphrase);
    mac.update(out);
    out.extend_from_slice(&mac.finalize().into_bytes());
}

/// Build an authenticated time request.
pub fn assemble_time_request(
    address: &str,
    nonce: &[u8; NONCE_LEN],
    passphrase: &str,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + address.len() + NONCE_LEN + MAC_LEN);
    encode_address(&mut out, address);
    out.extend_from_slice(nonce);
    append_mac(&mut out, passphrase);
    out
}

/// Verify and parse a time request.
pub fn disassemble_time_request(data: &[u8], passphrase: &str) -> Result<TimeRequest, CodecError> {
    let address = extract_address(data)?;
    if data.len() != 1 + address.len() + NONCE_LEN + MAC_LEN {
        return Err(CodecError::Malformed);
    }
    if !check_mac(data, passphrase) {
        return Err(CodecError::BadMac);
    }
    let nonce_start = 1 + address.len();
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&data[nonce_start..nonce_start + NONCE_LEN]);
    Ok(TimeRequest {
        address: address.to_string(),
        nonce,
    })
}

/// Build an authenticated time response.
pub fn assemble_time_response(
    address: &str,
    timestamp: i64,
    nonce: &[u8; NONCE_LEN],
    passphrase: &str,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + address.len() + 8 + NONCE_LEN + MAC_LEN);
    encode_address(&mut out, address);
    out.extend_from_slice(&timestamp.to_be_bytes());
    out.extend_from_slice(nonce);
    append_mac(&mut out, passphrase);
    out
}

/// Verify and parse a time response.
pub fn disassemble_time_response(
    data: &[u8],
    passphrase: &str,
) -> Result<TimeResponse, CodecError> {
    let address = extract_address(data)?;
    if data.len() != 1 + address.len() + 8 + NONCE_LEN + MAC_LEN {
        return Err(CodecError::Malformed);
    }
    if !check_mac(data, passphrase) {
        return Err(CodecError::BadMac);
    }
    let rest = &data[1 + address.len()..];
    let timestamp = i64::from_be_bytes(rest[..8].try_into().map_err(|_| CodecError::Malformed)?);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&rest[8..8 + NONCE_LEN]);
    Ok(TimeResponse {
        address: address.to_string(),
        timestamp,
        nonce,
    })
}
