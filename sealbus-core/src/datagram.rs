//! Datagram codec.
//!
//! Wire format (all integers big-endian):
//! ```text
//! +---------------+---------------+---------+---------------+------------+----------+
//! | public header | hmac_len (2B) | iv (16) | aes_len (2B)  | ciphertext | mac (32) |
//! +---------------+---------------+---------+---------------+------------+----------+
//! ```
//!
//! Public header:
//! ```text
//! +----------+-------------+--------------+--------------+------------+
//! | type (1) | version (1) | encoding (1) | addr_len (1) | addr bytes |
//! +----------+-------------+--------------+--------------+------------+
//! ```
//!
//! The AES plaintext is `public_header || fixed_payload || variable_payload`
//! plus PKCS#7 padding; the MAC covers `iv || aes_len || ciphertext`.
//! Verification is MAC first, decrypt second, padding third.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::CodecError;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// AES-128 key length in bytes.
pub const KEY_LEN: usize = 16;

/// AES-CBC initialization vector length in bytes.
pub const IV_LEN: usize = 16;

/// HMAC-SHA-256 tag length in bytes.
pub const MAC_LEN: usize = 32;

/// Maximum peer address length in bytes (must fit in one byte).
pub const MAX_ADDRESS_LEN: usize = 255;

/// The only wire format version this implementation speaks.
pub const VERSION_BYTE: u8 = b'0';

const BLOCK_LEN: usize = 16;

/// Datagram kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramType {
    /// Timestamp-bound message (4-byte fixed payload).
    Message,

    /// Session-bound command (16-byte fixed payload).
    Command,
}

impl DatagramType {
    /// Parse the type tag. Unknown tags are rejected, no fallback.
    pub fn from_byte(byte: u8) -> Result<Self, CodecError> {
        match byte {
            b'M' => Ok(Self::Message),
            b'C' => Ok(Self::Command),
            _ => Err(CodecError::Malformed),
        }
    }

    /// Convert to the wire tag.
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Message => b'M',
            Self::Command => b'C',
        }
    }
}

/// Payload encoding discriminator.
///
/// The tag travels in the clear so receivers can route payloads without
/// decrypting first; it is also part of the authenticated plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadEncoding {
    /// Raw bytes.
    Binary,

    /// JSON document.
    Json,

    /// UTF-8 text.
    Utf8,
}

impl PayloadEncoding {
    /// Parse the encoding tag. Unknown tags are rejected.
    pub fn from_byte(byte: u8) -> Result<Self, CodecError> {
        match byte {
            b'B' => Ok(Self::Binary),
            b'J' => Ok(Self::Json),
            b'U' => Ok(Self::Utf8),
            _ => Err(CodecError::Malformed),
        }
    }

    /// Convert to the wire tag.
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Binary => b'B',
            Self::Json => b'J',
            Self::Utf8 => b'U',
        }
    }
}

/// The plaintext prefix of every datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatagramHeader {
    /// Message or command.
    pub datagram_type: DatagramType,

    /// How the variable payload is encoded.
    pub encoding: PayloadEncoding,

    /// Address of the sender.
    pub source_address: String,
}

impl DatagramHeader {
    /// Create a header.
    ///
    /// The address must be 1..=255 bytes of ASCII; anything else is a
    /// caller bug and aborts.
    pub fn new(
        datagram_type: DatagramType,
        encoding: PayloadEncoding,
        source_address: impl Into<String>,
    ) -> Self {
        let source_address = source_address.into();
        assert!(
            !source_address.is_empty() && source_address.len() <= MAX_ADDRESS_LEN,
            "address length out of range"
        );
        assert!(source_address.is_ascii(), "address must be ascii");
        Self {
            datagram_type,
            encoding,
            source_address,
        }
    }

    /// Length in bytes of the encoded header.
    pub fn encoded_len(&self) -> usize {
        // type, version, encoding, addr_len, address
        3 + 1 + self.source_address.len()
    }

    /// Serialize the header.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(self.datagram_type.to_byte());
        out.push(VERSION_BYTE);
        out.push(self.encoding.to_byte());
        out.push(self.source_address.len() as u8);
        out.extend_from_slice(self.source_address.as_bytes());
        out
    }
}

/// Parse the unencrypted prefix of a datagram.
///
/// Reads exactly the 4 fixed bytes and the address; the rest of the buffer
/// is untouched. Unknown tags, a version other than `'0'`, and truncated
/// input all fail.
pub fn extract_public_header(datagram: &[u8]) -> Result<DatagramHeader, CodecError> {
    if datagram.len() < 4 {
        return Err(CodecError::Malformed);
    }

    let datagram_type = DatagramType::from_byte(datagram[0])?;

    if datagram[1] != VERSION_BYTE {
        return Err(CodecError::Malformed);
    }

    let encoding = PayloadEncoding::from_byte(datagram[2])?;

    let addr_len = datagram[3] as usize;
    if addr_len == 0 || datagram.len() < 4 + addr_len {
        return Err(CodecError::Malformed);
    }
    let source_address = std::str::from_utf8(&datagram[4..4 + addr_len])
        .map_err(|_| CodecError::Malformed)?;
    if !source_address.is_ascii() {
        return Err(CodecError::Malformed);
    }

    Ok(DatagramHeader {
        datagram_type,
        encoding,
        source_address: source_address.to_string(),
    })
}

/// Whether a datagram with the given payload sizes fits the u16 length
/// budget of the HMAC-covered region.
pub fn payload_fits(header: &DatagramHeader, fixed_len: usize, variable_len: usize) -> bool {
    let plaintext_len = header.encoded_len() + fixed_len + variable_len;
    let padded_len = plaintext_len + (BLOCK_LEN - plaintext_len % BLOCK_LEN);
    IV_LEN + 2 + padded_len <= u16::MAX as usize
}

/// Encrypt and authenticate a datagram.
///
/// The fixed payload length must be deducible from the header type so the
/// receiver can split the plaintext again (4 bytes for messages, 16 for
/// commands). Fails with [`CodecError::TooLong`] when the HMAC-covered
/// region would exceed 65535 bytes.
pub fn assemble_datagram(
    header: &DatagramHeader,
    fixed_payload: &[u8],
    variable_payload: &[u8],
    key: &[u8; KEY_LEN],
    iv: &[u8; IV_LEN],
    passphrase: &str,
) -> Result<Vec<u8>, CodecError> {
    if !payload_fits(header, fixed_payload.len(), variable_payload.len()) {
        return Err(CodecError::TooLong);
    }

    let header_bytes = header.encode();

    let mut aes_buffer = Zeroizing::new(Vec::with_capacity(
        header_bytes.len() + fixed_payload.len() + variable_payload.len() + BLOCK_LEN,
    ));
    aes_buffer.extend_from_slice(&header_bytes);
    aes_buffer.extend_from_slice(fixed_payload);
    aes_buffer.extend_from_slice(variable_payload);

    // PKCS#7: always at least one padding byte.
    let padding = BLOCK_LEN - aes_buffer.len() % BLOCK_LEN;
    aes_buffer.extend(std::iter::repeat(padding as u8).take(padding));

    let mut cipher = Aes128CbcEnc::new(key.into(), iv.into());
    for block in aes_buffer.chunks_exact_mut(BLOCK_LEN) {
        cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }

    let aes_len = aes_buffer.len() as u16;
    let hmac_len = (IV_LEN + 2 + aes_buffer.len()) as u16;

    let mut mac = hmac_sha256(passphrase);
    mac.update(iv);
    mac.update(&aes_len.to_be_bytes());
    mac.update(&aes_buffer);
    let tag = mac.finalize().into_bytes();

    let mut datagram =
        Vec::with_capacity(header_bytes.len() + 2 + hmac_len as usize + MAC_LEN);
    datagram.extend_from_slice(&header_bytes);
    datagram.extend_from_slice(&hmac_len.to_be_bytes());
    datagram.extend_from_slice(iv);
    datagram.extend_from_slice(&aes_len.to_be_bytes());
    datagram.extend_from_slice(&aes_buffer);
    datagram.extend_from_slice(&tag);

    Ok(datagram)
}

/// Verify and decrypt a datagram.
///
/// `header` must be the result of [`extract_public_header`] on the same
/// buffer. Returns the fixed and variable payloads.
///
/// The verification order is security critical: the MAC over the advertised
/// region is checked before the ciphertext is parsed or decrypted, padding
/// is validated byte-for-byte afterwards, and finally the decrypted header
/// copy must equal the public one.
pub fn disassemble_datagram(
    datagram: &[u8],
    header: &DatagramHeader,
    fixed_payload_len: usize,
    key: &[u8; KEY_LEN],
    passphrase: &str,
) -> Result<(Vec<u8>, Vec<u8>), CodecError> {
    let header_len = header.encoded_len();
    if datagram.len() < header_len + 2 {
        return Err(CodecError::Malformed);
    }
    let remainder = &datagram[header_len..];

    let hmac_len = u16::from_be_bytes([remainder[0], remainder[1]]) as usize;
    let remainder = &remainder[2..];

    // The buffer must hold exactly the advertised region plus the tag.
    if remainder.len() != hmac_len + MAC_LEN {
        return Err(CodecError::Malformed);
    }
    let (hmac_content, tag) = remainder.split_at(hmac_len);

    let mut mac = hmac_sha256(passphrase);
    mac.update(hmac_content);
    if mac.verify_slice(tag).is_err() {
        return Err(CodecError::BadMac);
    }

    // Only now touch the ciphertext.
    if hmac_content.len() < IV_LEN + 2 {
        return Err(CodecError::Malformed);
    }
    let (iv, rest) = hmac_content.split_at(IV_LEN);
    let aes_len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
    let ciphertext = &rest[2..];

    // At least one block because of padding, whole blocks only, and the
    // advertised length must fill the region exactly.
    if aes_len < BLOCK_LEN || aes_len % BLOCK_LEN != 0 || ciphertext.len() != aes_len {
        return Err(CodecError::Malformed);
    }

    let mut plaintext = Zeroizing::new(ciphertext.to_vec());
    let iv_arr: &[u8; IV_LEN] = iv.try_into().map_err(|_| CodecError::Malformed)?;
    let mut cipher = Aes128CbcDec::new(key.into(), iv_arr.into());
    for block in plaintext.chunks_exact_mut(BLOCK_LEN) {
        cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }

    // Validate every padding byte.
    let padding = plaintext[aes_len - 1] as usize;
    if padding == 0 || padding > BLOCK_LEN {
        return Err(CodecError::BadPadding);
    }
    if plaintext[aes_len - padding..].iter().any(|&b| b != padding as u8) {
        return Err(CodecError::BadPadding);
    }
    let unpadded_len = aes_len - padding;

    if unpadded_len < header_len + fixed_payload_len {
        return Err(CodecError::Malformed);
    }

    // The header is not covered by the MAC, so confirm the decrypted copy
    // matches what was parsed.
    if plaintext[..header_len] != datagram[..header_len] {
        return Err(CodecError::HeaderMismatch);
    }

    let fixed = plaintext[header_len..header_len + fixed_payload_len].to_vec();
    let variable = plaintext[header_len + fixed_payload_len..unpadded_len].to_vec();
    Ok((fixed, variable))
}

/// Verify the trailing HMAC-SHA-256 tag of a buffer.
///
/// The tag covers everything before it. Returns false for buffers shorter
/// than one tag.
pub fn check_mac(message: &[u8], passphrase: &str) -> bool {
    if message.len() < MAC_LEN {
        return false;
    }
    let (content, tag) = message.split_at(message.len() - MAC_LEN);
    let mut mac = hmac_sha256(passphrase);
    mac.update(content);
    mac.verify_slice(tag).is_ok()
}

pub(crate) fn hmac_sha256(passphrase: &str) -> HmacSha256 {
    match HmacSha256::new_from_slice(passphrase.as_bytes()) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length.
        Err(_) => unreachable!(),
    }
}
