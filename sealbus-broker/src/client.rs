//! Broker-side implementation of the engine's `PubSub` contract.
//!
//! A `BrokerClient` owns one WebSocket connection: a writer task drains an
//! unbounded queue (so `publish` is fire-and-forget, as the contract
//! requires), and a reader task dispatches every MSG frame to the
//! registered channel callbacks, each delivery on its own task.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};

use sealbus_engine::{Callback, PubSub};

use crate::wire::{encode_frame, parse_frame, BusOpcode};

enum WriterOp {
    Send(Vec<u8>),
    Close,
}

/// A connected broker client. Create with [`BrokerClient::connect`], then
/// hand it to the protocol engine as its pub/sub fabric.
pub struct BrokerClient {
    subscriptions: Mutex<HashMap<String, Vec<Callback>>>,
    writer: mpsc::UnboundedSender<WriterOp>,
}

impl BrokerClient {
    /// Connect to a broker, e.g. `ws://127.0.0.1:1884`.
    pub async fn connect(url: &str) -> Result<Arc<Self>, BrokerError> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|err| BrokerError::Connect(err.to_string()))?;
        let (mut ws_tx, mut ws_rx) = ws.split();

        let (writer, mut writer_rx) = mpsc::unbounded_channel::<WriterOp>();
        let client = Arc::new(Self {
            subscriptions: Mutex::new(HashMap::new()),
            writer,
        });

        tokio::spawn(async move {
            while let Some(op) = writer_rx.recv().await {
                match op {
                    WriterOp::Send(data) => {
                        if ws_tx.send(Message::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    WriterOp::Close => {
                        let _ = ws_tx.close().await;
                        break;
                    }
                }
            }
        });

        let reader = Arc::clone(&client);
        tokio::spawn(async move {
            while let Some(message) = ws_rx.next().await {
                let data = match message {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match parse_frame(&data) {
                    Ok(frame) if frame.opcode == BusOpcode::Deliver => {
                        reader.dispatch(&frame.topic, frame.payload);
                    }
                    Ok(frame) => {
                        debug!(opcode = ?frame.opcode, "ignoring unexpected frame from broker");
                    }
                    Err(err) => {
                        warn!(error = %err, "ignoring malformed frame from broker");
                    }
                }
            }
            debug!("broker connection closed");
        });

        Ok(client)
    }

    fn dispatch(&self, topic: &str, payload: Vec<u8>) {
        let callbacks = {
            let subscriptions = self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match subscriptions.get(topic) {
                Some(callbacks) => callbacks.clone(),
                None => return,
            }
        };
        let payload = Arc::new(payload);
        for callback in callbacks {
            let topic = topic.to_string();
            let payload = Arc::clone(&payload);
            tokio::spawn(async move {
                callback(&topic, &payload);
            });
        }
    }

    fn write(&self, op: WriterOp) {
        // A closed writer means the connection is gone; publish is best
        // effort, so drop silently.
        let _ = self.writer.send(op);
    }
}

impl PubSub for BrokerClient {
    fn subscribe(&self, channel: &str, callback: Callback) {
        let register = {
            let mut subscriptions = self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let callbacks = subscriptions.entry(channel.to_string()).or_default();
            callbacks.push(callback);
            callbacks.len() == 1
        };
        if register {
            self.write(WriterOp::Send(encode_frame(BusOpcode::Subscribe, channel, &[])));
        }
    }

    fn unsubscribe(&self, channel: &str) {
        let registered = {
            let mut subscriptions = self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            subscriptions.remove(channel).is_some()
        };
        if registered {
            self.write(WriterOp::Send(encode_frame(BusOpcode::Unsubscribe, channel, &[])));
        }
    }

    fn publish(&self, channel: &str, data: &[u8]) {
        self.write(WriterOp::Send(encode_frame(BusOpcode::Publish, channel, data)));
    }

    fn disconnect(&self) {
        self.write(WriterOp::Close);
    }
}

/// Broker client failures.
#[derive(Debug)]
pub enum BrokerError {
    /// Could not establish the WebSocket connection.
    Connect(String),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(msg) => write!(f, "cannot connect to broker: {}", msg),
        }
    }
}

impl std::error::Error for BrokerError {}
