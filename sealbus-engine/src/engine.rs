//! The protocol engine.
//!
//! One engine per host. It owns the partner table, the optional session
//! server and time role, and the per-partner queues of commands waiting
//! for their session ID. Engines are independent; nothing here is global.
//!
//! Receive pipeline for `<me>/inbox`:
//! header parse → partner lookup → MAC/decrypt → timestamp window or
//! session validation → user callbacks. Failure at any step drops the
//! frame and logs it; it never aborts the engine or other handlers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use sealbus_core::datagram::{
    assemble_datagram, disassemble_datagram, extract_public_header, payload_fits, IV_LEN,
};
use sealbus_core::envelope::{
    encode_session_envelope, encode_session_request, parse_session_envelope,
    parse_session_request, SESSION_ID_LEN,
};
use sealbus_core::error::CodecError;
use sealbus_core::timesync::{
    assemble_time_response, disassemble_time_request, extract_address,
};
use sealbus_core::{ClientConfig, DatagramHeader, DatagramType, Partner, PayloadEncoding};

use crate::channels;
use crate::error::SendError;
use crate::pubsub::PubSub;
use crate::session::SessionServer;
use crate::time::{local_unix_now, TimeClient, TIME_REQUEST_INTERVAL};

/// Accepted clock skew between sender and receiver, in seconds.
const MAX_CLOCK_DELTA: u32 = 1;

/// A delivered datagram: `(sender, type, encoding, payload)`.
pub type MessageCallback =
    Arc<dyn Fn(&str, DatagramType, PayloadEncoding, &[u8]) + Send + Sync>;

struct PendingCommand {
    encoding: PayloadEncoding,
    data: Vec<u8>,
}

/// The protocol engine. See the crate docs for the overall picture.
///
/// Construct with [`ProtocolEngine::new`], register callbacks, then call
/// [`ProtocolEngine::start`]. Dropping the engine without calling
/// [`ProtocolEngine::stop`] leaves the pub/sub subscriptions (and their
/// references to the engine) alive.
pub struct ProtocolEngine {
    config: ClientConfig,
    pubsub: Arc<dyn PubSub>,
    callbacks: RwLock<Vec<MessageCallback>>,
    commands: Mutex<HashMap<String, VecDeque<PendingCommand>>>,
    sessions: Option<SessionServer>,
    time_client: Option<Arc<TimeClient>>,
    started: AtomicBool,
    running: AtomicBool,
    shutdown: Notify,
}

impl ProtocolEngine {
    /// Create an engine for a validated configuration on the given fabric.
    pub fn new(config: ClientConfig, pubsub: Arc<dyn PubSub>) -> Arc<Self> {
        let sessions = config.accepts_commands.then(SessionServer::new);
        let time_client = config
            .time_client
            .as_ref()
            .map(|tc| Arc::new(TimeClient::new(tc)));
        Arc::new(Self {
            config,
            pubsub,
            callbacks: RwLock::new(Vec::new()),
            commands: Mutex::new(HashMap::new()),
            sessions,
            time_client,
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    /// This host's address.
    pub fn host_address(&self) -> &str {
        &self.config.host_address
    }

    /// Register a delivery callback. Must happen before [`Self::start`];
    /// the registry is read-only once the engine runs.
    pub fn register_callback(
        &self,
        callback: impl Fn(&str, DatagramType, PayloadEncoding, &[u8]) + Send + Sync + 'static,
    ) {
        assert!(
            !self.started.load(Ordering::SeqCst),
            "callbacks must be registered before start"
        );
        let mut callbacks = self
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        callbacks.push(Arc::new(callback));
    }

    /// Whether protocol time is available, i.e. [`Self::send`] of a message
    /// will not fail with [`SendError::NoTimeServerConnection`].
    pub fn time_synchronized(&self) -> bool {
        match &self.time_client {
            Some(client) => client.is_initialized(),
            None => true,
        }
    }

    /// Subscribe the engine to its channels and start the configured time
    /// role. Idempotent; the second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        let me = self.config.host_address.as_str();

        let engine = Arc::clone(self);
        self.pubsub.subscribe(
            &channels::inbox(me),
            Arc::new(move |channel: &str, data: &[u8]| engine.handle_inbox(channel, data)),
        );

        let engine = Arc::clone(self);
        self.pubsub.subscribe(
            &channels::session(me),
            Arc::new(move |_: &str, data: &[u8]| engine.handle_session(data)),
        );

        if self.sessions.is_some() {
            let engine = Arc::clone(self);
            self.pubsub.subscribe(
                &channels::session_request(me),
                Arc::new(move |_: &str, data: &[u8]| engine.handle_session_request(data)),
            );
        }

        if self.config.time_server.is_some() {
            let engine = Arc::clone(self);
            self.pubsub.subscribe(
                &channels::time_request(me),
                Arc::new(move |_: &str, data: &[u8]| engine.handle_time_request(data)),
            );
        }

        if let Some(client) = &self.time_client {
            let engine = Arc::clone(self);
            self.pubsub.subscribe(
                &channels::time(me),
                Arc::new(move |_: &str, data: &[u8]| engine.handle_time_response(data)),
            );
            let engine = Arc::clone(self);
            let client = Arc::clone(client);
            tokio::spawn(async move {
                engine.time_request_loop(client).await;
            });
        }
    }

    /// Close all subscriptions and stop the time-request loop. In-flight
    /// handler tasks drain on their own.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();

        let me = self.config.host_address.as_str();
        self.pubsub.unsubscribe(&channels::inbox(me));
        self.pubsub.unsubscribe(&channels::session(me));
        if self.sessions.is_some() {
            self.pubsub.unsubscribe(&channels::session_request(me));
        }
        if self.config.time_server.is_some() {
            self.pubsub.unsubscribe(&channels::time_request(me));
        }
        if self.time_client.is_some() {
            self.pubsub.unsubscribe(&channels::time(me));
        }
    }

    /// Send a datagram to a partner.
    ///
    /// Messages are timestamped and published immediately; commands are
    /// queued until the receiver issues a session ID, which the engine
    /// requests on its own. Queued commands to one partner go out in
    /// enqueue order, one per issued ID. After [`Self::stop`] every send
    /// fails with [`SendError::EngineStopped`].
    pub fn send(
        &self,
        receiver: &str,
        datagram_type: DatagramType,
        encoding: PayloadEncoding,
        data: &[u8],
    ) -> Result<(), SendError> {
        if self.started.load(Ordering::SeqCst) && !self.running.load(Ordering::SeqCst) {
            return Err(SendError::EngineStopped);
        }
        let partner = self
            .config
            .partners
            .get(receiver)
            .ok_or_else(|| SendError::UnknownReceiver(receiver.to_string()))?;

        match datagram_type {
            DatagramType::Message => self.send_message(receiver, partner, encoding, data),
            DatagramType::Command => self.queue_command(receiver, encoding, data),
        }
    }

    fn send_message(
        &self,
        receiver: &str,
        partner: &Partner,
        encoding: PayloadEncoding,
        data: &[u8],
    ) -> Result<(), SendError> {
        let timestamp = self.protocol_time()?;
        let iv = random_iv()?;
        let header = DatagramHeader::new(
            DatagramType::Message,
            encoding,
            self.config.host_address.clone(),
        );
        let datagram = assemble_datagram(
            &header,
            &(timestamp as u32).to_be_bytes(),
            data,
            partner.key.as_bytes(),
            &iv,
            &partner.passphrase,
        )
        .map_err(|_| SendError::PayloadTooLong)?;
        self.pubsub.publish(&channels::inbox(receiver), &datagram);
        Ok(())
    }

    fn queue_command(
        &self,
        receiver: &str,
        encoding: PayloadEncoding,
        data: &[u8],
    ) -> Result<(), SendError> {
        let header = DatagramHeader::new(
            DatagramType::Command,
            encoding,
            self.config.host_address.clone(),
        );
        if !payload_fits(&header, SESSION_ID_LEN, data.len()) {
            return Err(SendError::PayloadTooLong);
        }

        let request_now = {
            let mut commands = self.commands.lock().unwrap_or_else(PoisonError::into_inner);
            let queue = commands.entry(receiver.to_string()).or_default();
            queue.push_back(PendingCommand {
                encoding,
                data: data.to_vec(),
            });
            queue.len() == 1
        };

        // First command in the queue kicks off the handshake; follow-ups
        // are chained by handle_session.
        if request_now {
            self.pubsub.publish(
                &channels::session_request(receiver),
                &encode_session_request(&self.config.host_address),
            );
        }
        Ok(())
    }

    fn protocol_time(&self) -> Result<i64, SendError> {
        match &self.time_client {
            Some(client) => client.now().ok_or(SendError::NoTimeServerConnection),
            None => Ok(local_unix_now()),
        }
    }

    async fn time_request_loop(self: Arc<Self>, client: Arc<TimeClient>) {
        let channel = channels::time_request(client.server_address());
        loop {
            if !self.running.load(Ordering::SeqCst) || client.is_initialized() {
                return;
            }
            match client.make_request(&self.config.host_address) {
                Ok(frame) => self.pubsub.publish(&channel, &frame),
                Err(err) => warn!(error = %err, "cannot build time request"),
            }
            tokio::select! {
                _ = self.shutdown.notified() => return,
                _ = tokio::time::sleep(TIME_REQUEST_INTERVAL) => {}
            }
        }
    }

    /// A session ID arrived for a command this engine wants to send.
    fn handle_session(&self, data: &[u8]) {
        let envelope = match parse_session_envelope(data) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "dropping malformed session envelope");
                return;
            }
        };
        let Some(partner) = self.config.partners.get(&envelope.address) else {
            info!(partner = %envelope.address, "session envelope from unknown partner");
            return;
        };

        let (command, more_queued) = {
            let mut commands = self.commands.lock().unwrap_or_else(PoisonError::into_inner);
            match commands.get_mut(&envelope.address) {
                Some(queue) => {
                    let command = queue.pop_front();
                    if queue.is_empty() {
                        commands.remove(&envelope.address);
                        (command, false)
                    } else {
                        (command, true)
                    }
                }
                None => (None, false),
            }
        };
        let Some(command) = command else {
            debug!(partner = %envelope.address, "spurious session envelope");
            return;
        };

        match self.build_command(partner, &envelope.session_id, &command) {
            Ok(datagram) => {
                self.pubsub
                    .publish(&channels::inbox(&envelope.address), &datagram);
            }
            Err(err) => {
                warn!(partner = %envelope.address, error = %err, "dropping queued command");
            }
        }

        // Chain the next handshake so every queued command gets its own ID.
        if more_queued {
            self.pubsub.publish(
                &channels::session_request(&envelope.address),
                &encode_session_request(&self.config.host_address),
            );
        }
    }

    fn build_command(
        &self,
        partner: &Partner,
        session_id: &[u8; SESSION_ID_LEN],
        command: &PendingCommand,
    ) -> Result<Vec<u8>, SendError> {
        let iv = random_iv()?;
        let header = DatagramHeader::new(
            DatagramType::Command,
            command.encoding,
            self.config.host_address.clone(),
        );
        assemble_datagram(
            &header,
            session_id,
            &command.data,
            partner.key.as_bytes(),
            &iv,
            &partner.passphrase,
        )
        .map_err(|_| SendError::PayloadTooLong)
    }

    /// A data datagram arrived on `<me>/inbox`.
    fn handle_inbox(&self, channel: &str, data: &[u8]) {
        let header = match extract_public_header(data) {
            Ok(header) => header,
            Err(err) => {
                warn!(channel, error = %err, "dropping malformed datagram");
                return;
            }
        };
        let sender = header.source_address.clone();
        let Some(partner) = self.config.partners.get(&sender) else {
            info!(channel, sender = %sender, "dropping datagram from unknown partner");
            return;
        };

        match header.datagram_type {
            DatagramType::Message => {
                let (fixed, variable) = match disassemble_datagram(
                    data,
                    &header,
                    4,
                    partner.key.as_bytes(),
                    &partner.passphrase,
                ) {
                    Ok(payloads) => payloads,
                    Err(err) => {
                        log_disassembly_failure(channel, &sender, err);
                        return;
                    }
                };
                let Ok(timestamp_bytes) = <[u8; 4]>::try_from(fixed.as_slice()) else {
                    return;
                };
                let received = u32::from_be_bytes(timestamp_bytes);
                let now = match self.protocol_time() {
                    Ok(now) => now,
                    Err(_) => {
                        debug!(sender = %sender, "no protocol time yet, dropping message");
                        return;
                    }
                };
                // Wrapping math keeps the window correct across the u32
                // epoch boundary.
                let delta = received.wrapping_sub(now as u32) as i32;
                if delta.unsigned_abs() > MAX_CLOCK_DELTA {
                    warn!(sender = %sender, delta, "dropping message outside freshness window");
                    return;
                }
                self.dispatch(&sender, header.datagram_type, header.encoding, &variable);
            }
            DatagramType::Command => {
                let Some(sessions) = &self.sessions else {
                    debug!(sender = %sender, "command received but commands are not accepted");
                    return;
                };
                let (fixed, variable) = match disassemble_datagram(
                    data,
                    &header,
                    SESSION_ID_LEN,
                    partner.key.as_bytes(),
                    &partner.passphrase,
                ) {
                    Ok(payloads) => payloads,
                    Err(err) => {
                        log_disassembly_failure(channel, &sender, err);
                        return;
                    }
                };
                let Ok(session_id) = <[u8; SESSION_ID_LEN]>::try_from(fixed.as_slice()) else {
                    return;
                };
                if !sessions.validate(&sender, &session_id) {
                    warn!(sender = %sender, "dropping command with stale or unknown session");
                    return;
                }
                self.dispatch(&sender, header.datagram_type, header.encoding, &variable);
            }
        }
    }

    /// A partner asked the session server for a session ID.
    fn handle_session_request(&self, data: &[u8]) {
        let Some(sessions) = &self.sessions else {
            return;
        };
        let requester = match parse_session_request(data) {
            Ok(requester) => requester,
            Err(err) => {
                warn!(error = %err, "dropping malformed session request");
                return;
            }
        };
        if !self.config.partners.contains_key(&requester) {
            info!(requester = %requester, "session request from unknown partner");
            return;
        }
        let session_id = match sessions.issue(&requester) {
            Ok(session_id) => session_id,
            Err(err) => {
                warn!(error = %err, "cannot issue session id");
                return;
            }
        };
        self.pubsub.publish(
            &channels::session(&requester),
            &encode_session_envelope(&self.config.host_address, &session_id),
        );
    }

    /// A partner asked the time server for the current time.
    fn handle_time_request(&self, data: &[u8]) {
        let requester = match extract_address(data) {
            Ok(requester) => requester.to_string(),
            Err(err) => {
                warn!(error = %err, "dropping malformed time request");
                return;
            }
        };
        let Some(partner) = self.config.partners.get(&requester) else {
            info!(requester = %requester, "time request from unknown partner");
            return;
        };
        let request = match disassemble_time_request(data, &partner.passphrase) {
            Ok(request) => request,
            Err(err) => {
                warn!(requester = %requester, error = %err, "dropping invalid time request");
                return;
            }
        };
        let response = assemble_time_response(
            &self.config.host_address,
            local_unix_now(),
            &request.nonce,
            &partner.passphrase,
        );
        self.pubsub.publish(&channels::time(&requester), &response);
    }

    /// The time server answered on `<me>/time`.
    fn handle_time_response(&self, data: &[u8]) {
        let Some(client) = &self.time_client else {
            return;
        };
        match client.handle_response(data) {
            Ok(()) => debug!("time base updated"),
            Err(err) => warn!(error = %err, "dropping time response"),
        }
    }

    /// Invoke every registered callback, holding no locks.
    fn dispatch(
        &self,
        sender: &str,
        datagram_type: DatagramType,
        encoding: PayloadEncoding,
        data: &[u8],
    ) {
        let callbacks: Vec<MessageCallback> = {
            let callbacks = self
                .callbacks
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            callbacks.clone()
        };
        for callback in callbacks {
            callback(sender, datagram_type, encoding, data);
        }
    }
}

fn random_iv() -> Result<[u8; IV_LEN], SendError> {
    let mut iv = [0u8; IV_LEN];
    OsRng
        .try_fill_bytes(&mut iv)
        .map_err(|_| SendError::RandomFailure)?;
    Ok(iv)
}

fn log_disassembly_failure(channel: &str, sender: &str, err: CodecError) {
    match err {
        CodecError::BadMac | CodecError::HeaderMismatch => {
            warn!(channel, sender, error = %err, "dropping unauthentic datagram");
        }
        _ => {
            warn!(channel, sender, error = %err, "dropping malformed datagram");
        }
    }
}
