//! Codec errors.
//!
//! Every variant means the offending frame must be dropped. The caller
//! decides how loudly to log it; a `BadMac` or `HeaderMismatch` on a live
//! bus is a potential attack, the rest is usually line noise.

use std::fmt;

/// Errors produced while parsing or verifying wire frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// Structural problem: truncated buffer, bad length field, unknown
    /// type/version/encoding tag, or a payload shorter than the layout
    /// requires.
    Malformed,

    /// The HMAC-covered region would exceed the u16 length budget.
    TooLong,

    /// HMAC verification failed.
    BadMac,

    /// PKCS#7 padding is invalid after decryption.
    BadPadding,

    /// The decrypted header copy does not match the public header.
    HeaderMismatch,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Deliberately terse. Do not leak details.
        match self {
            Self::Malformed => write!(f, "malformed frame"),
            Self::TooLong => write!(f, "payload too long"),
            Self::BadMac => write!(f, "mac verification failed"),
            Self::BadPadding => write!(f, "invalid padding"),
            Self::HeaderMismatch => write!(f, "header mismatch"),
        }
    }
}

impl std::error::Error for CodecError {}
