//! SealBus Protocol Core
//!
//! Codec and configuration model for an authenticated, confidential
//! messaging layer that rides on an untrusted publish/subscribe fabric.
//!
//! This crate provides:
//! - The layered datagram format: AES-128-CBC + HMAC-SHA-256 with PKCS#7
//!   padding and a plaintext public header
//! - Time-request / time-response frames for the clock-sync sub-protocol
//! - The unencrypted session envelope used by the command handshake
//! - The typed configuration model (host identity, partner table, time role)
//!
//! # Security Invariants
//!
//! - The MAC is verified before any ciphertext byte is touched
//! - MAC comparison is constant time
//! - PKCS#7 padding is validated byte-for-byte after decryption
//! - The decrypted copy of the public header must equal the plaintext one
//! - Bytes supplied by the transport never cause a panic; wrong-sized keys
//!   and IVs are caller bugs and abort
//! - Partner keys and decrypted scratch buffers are zeroized on drop

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

pub mod config;
pub mod datagram;
pub mod envelope;
pub mod error;
pub mod timesync;

pub use config::{ClientConfig, ConfigError, Partner, PartnerKey, TimeConfig};
pub use datagram::{DatagramHeader, DatagramType, PayloadEncoding};
pub use envelope::SessionEnvelope;
pub use error::CodecError;
pub use timesync::{TimeRequest, TimeResponse};
