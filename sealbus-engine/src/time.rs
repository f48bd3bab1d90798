//! Time synchronization.
//!
//! A peer without a trustworthy wall clock tracks the clock of a
//! designated time server: it sends an authenticated request carrying a
//! fresh nonce, and on a fresh response records `(server_timestamp,
//! local_instant)` as its time base. Protocol time is then the base
//! timestamp plus the locally elapsed seconds.
//!
//! Freshness is the nonce (must be the last one issued) paired with a
//! tight round-trip bound. The RTT cap both bounds the clock error and
//! stops replays of old time announcements cold.

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;

use sealbus_core::error::CodecError;
use sealbus_core::timesync::{assemble_time_request, disassemble_time_response, NONCE_LEN};
use sealbus_core::TimeConfig;

use crate::error::SendError;

/// How often an uninitialized client re-requests the time.
pub(crate) const TIME_REQUEST_INTERVAL: Duration = Duration::from_secs(1);

/// Responses older than this are useless for bounding the clock offset.
pub(crate) const MAX_ROUND_TRIP: Duration = Duration::from_millis(100);

/// Current local wall clock in Unix seconds.
pub(crate) fn local_unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

#[derive(Default)]
struct TimeBase {
    last_nonce: Option<[u8; NONCE_LEN]>,
    last_request_at: Option<Instant>,
    base_timestamp: i64,
    base_local: Option<Instant>,
}

/// Why a time response was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseRejection {
    Codec(CodecError),
    WrongServer,
    NonceMismatch,
    Stale(Duration),
}

impl fmt::Display for ResponseRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(err) => write!(f, "{}", err),
            Self::WrongServer => write!(f, "response from wrong server"),
            Self::NonceMismatch => write!(f, "nonce does not match last request"),
            Self::Stale(rtt) => write!(f, "round trip too long ({:?})", rtt),
        }
    }
}

pub(crate) struct TimeClient {
    server_address: String,
    passphrase: String,
    state: Mutex<TimeBase>,
}

impl TimeClient {
    pub(crate) fn new(config: &TimeConfig) -> Self {
        Self {
            server_address: config.addr.clone(),
            passphrase: config.passphrase.clone(),
            state: Mutex::new(TimeBase::default()),
        }
    }

    pub(crate) fn server_address(&self) -> &str {
        &self.server_address
    }

    pub(crate) fn is_initialized(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.base_local.is_some()
    }

    /// Protocol time in Unix seconds, or None before the first sync.
    pub(crate) fn now(&self) -> Option<i64> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let base_local = state.base_local?;
        Some(state.base_timestamp + base_local.elapsed().as_secs() as i64)
    }

    /// Build the next time request and arm the freshness state for it.
    pub(crate) fn make_request(&self, own_address: &str) -> Result<Vec<u8>, SendError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|_| SendError::RandomFailure)?;
        let frame = assemble_time_request(own_address, &nonce, &self.passphrase);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.last_nonce = Some(nonce);
        state.last_request_at = Some(Instant::now());
        Ok(frame)
    }

    /// Verify a response and, if fresh, adopt it as the new time base.
    pub(crate) fn handle_response(&self, data: &[u8]) -> Result<(), ResponseRejection> {
        let response = disassemble_time_response(data, &self.passphrase)
            .map_err(ResponseRejection::Codec)?;
        if response.address != self.server_address {
            return Err(ResponseRejection::WrongServer);
        }

        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        match state.last_nonce {
            Some(nonce) if nonce == response.nonce => {}
            _ => return Err(ResponseRejection::NonceMismatch),
        }
        let requested_at = state.last_request_at.ok_or(ResponseRejection::NonceMismatch)?;
        let round_trip = now.duration_since(requested_at);
        if round_trip > MAX_ROUND_TRIP {
            return Err(ResponseRejection::Stale(round_trip));
        }

        state.base_timestamp = response.timestamp;
        state.base_local = Some(now);
        state.last_nonce = None;
        Ok(())
    }
}
