//! Channel naming scheme.
//!
//! Every peer owns the channel namespace under its own address. Transports
//! and tests build channel names through these helpers so the literals
//! exist in exactly one place.

/// Data datagrams (messages and commands) addressed to `addr`.
pub fn inbox(addr: &str) -> String {
    format!("{}/inbox", addr)
}

/// Session envelopes issued to `addr` for commands it wants to send.
pub fn session(addr: &str) -> String {
    format!("{}/session", addr)
}

/// Session requests addressed to the session server at `addr`.
pub fn session_request(addr: &str) -> String {
    format!("{}/session/request", addr)
}

/// Time responses addressed to the time client at `addr`.
pub fn time(addr: &str) -> String {
    format!("{}/time", addr)
}

/// Time requests addressed to the time server at `addr`.
pub fn time_request(addr: &str) -> String {
    format!("{}/time/request", addr)
}
