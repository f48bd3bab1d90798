//! SealBus Protocol Engine
//!
//! Wires the datagram codec to a publish/subscribe fabric and coordinates
//! the moving parts on top of it: the time-sync client and server, the
//! session server for the command handshake, and the per-partner queues of
//! commands waiting for a session ID.
//!
//! The fabric is assumed hostile. Any bytes on any channel can come from
//! anywhere; everything that reaches a user callback has passed the MAC,
//! the partner lookup, and either the timestamp window (messages) or a
//! live one-time session ID (commands).
//!
//! # Concurrency Invariants
//!
//! - Every inbound frame is handled on its own task; handlers never assume
//!   the caller's identity
//! - Locks are held only across map reads and writes, never across a
//!   publish and never while user callbacks run
//! - User callbacks are registered before [`ProtocolEngine::start`] and the
//!   registry is read-only afterwards
//! - IVs, nonces, and session IDs come from the OS random source; failure
//!   to draw randomness is an error, not a weaker random

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

pub mod channels;
mod engine;
mod error;
mod pubsub;
mod session;
mod time;

pub use engine::{MessageCallback, ProtocolEngine};
pub use error::SendError;
pub use pubsub::{Callback, MemoryBus, PubSub};
