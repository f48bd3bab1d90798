//! Session server.
//!
//! Issues one-time 16-byte session IDs for the command handshake. At most
//! one ID is outstanding per partner; issuing again overwrites. An ID is
//! consumed by its first successful validation, so a replayed command
//! datagram finds nothing to match.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use rand::rngs::OsRng;
use rand::RngCore;

use sealbus_core::envelope::SESSION_ID_LEN;

use crate::error::SendError;

pub(crate) struct SessionServer {
    sessions: Mutex<HashMap<String, [u8; SESSION_ID_LEN]>>,
}

impl SessionServer {
    pub(crate) fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a fresh session ID for a partner, replacing any outstanding one.
    pub(crate) fn issue(&self, partner: &str) -> Result<[u8; SESSION_ID_LEN], SendError> {
        let mut id = [0u8; SESSION_ID_LEN];
        OsRng
            .try_fill_bytes(&mut id)
            .map_err(|_| SendError::RandomFailure)?;
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.insert(partner.to_string(), id);
        Ok(id)
    }

    /// Validate and consume a session ID.
    ///
    /// Returns true iff the partner has an outstanding ID equal to `id`;
    /// the entry is removed on success so the ID is single-use.
    pub(crate) fn validate(&self, partner: &str, id: &[u8; SESSION_ID_LEN]) -> bool {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(partner) {
            Some(outstanding) if outstanding == id => {
                sessions.remove(partner);
                true
            }
            _ => false,
        }
    }
}
