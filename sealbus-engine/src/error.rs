//! Engine errors.

use std::fmt;

/// Failures surfaced to callers of [`crate::ProtocolEngine::send`].
///
/// Everything that goes wrong on the receive side is local to the handler
/// that hit it: the frame is dropped and logged, nothing propagates here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The receiver is not in the partner table.
    UnknownReceiver(String),

    /// A time client is configured but has not completed its first sync.
    NoTimeServerConnection,

    /// The payload does not fit the datagram length budget.
    PayloadTooLong,

    /// The OS random source failed.
    RandomFailure,

    /// The engine has been stopped.
    EngineStopped,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownReceiver(addr) => write!(f, "unknown receiver '{}'", addr),
            Self::NoTimeServerConnection => write!(f, "no time server connection"),
            Self::PayloadTooLong => write!(f, "payload too long"),
            Self::RandomFailure => write!(f, "random source failure"),
            Self::EngineStopped => write!(f, "engine stopped"),
        }
    }
}

impl std::error::Error for SendError {}
