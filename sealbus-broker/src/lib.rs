//! Stand-alone topic broker plus the matching [`BrokerClient`].
//!
//! The broker fans every PUB out to the current subscribers of its topic
//! and does nothing else: no retained messages, no QoS, no auth. Peers are
//! expected to run the sealbus protocol layer on top, which assumes a
//! hostile bus in the first place.

mod client;
pub mod wire;

pub use client::{BrokerClient, BrokerError};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use wire::{encode_frame, parse_frame, BusFrame, BusOpcode};

type TopicMap = Arc<DashMap<String, HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>>>;

/// Accept connections forever and relay frames between them.
pub async fn run_broker(listener: TcpListener) {
    let topics: TopicMap = Arc::new(DashMap::new());
    let next_id = AtomicU64::new(0);

    while let Ok((stream, peer_addr)) = listener.accept().await {
        let topics = topics.clone();
        let client_id = next_id.fetch_add(1, Ordering::Relaxed);
        debug!(client_id, %peer_addr, "client connected");
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, topics.clone(), client_id).await {
                debug!(client_id, error = %err, "connection closed");
            }
            remove_client(&topics, client_id);
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    topics: TopicMap,
    client_id: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let ws = accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    // Topics this client is registered for, so cleanup does not have to
    // scan the whole table.
    let mut subscribed: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            Some(outbound) = rx.recv() => {
                if ws_tx.send(Message::Binary(outbound)).await.is_err() {
                    break;
                }
            }
            inbound = ws_rx.next() => {
                let data = match inbound {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // Ping, Pong, Text
                    Some(Err(_)) => break,
                };
                let frame = match parse_frame(&data) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(client_id, error = %err, "disconnecting client on malformed frame");
                        break;
                    }
                };
                match frame.opcode {
                    BusOpcode::Subscribe => {
                        subscribed.insert(frame.topic.clone());
                        topics
                            .entry(frame.topic)
                            .or_default()
                            .insert(client_id, tx.clone());
                    }
                    BusOpcode::Unsubscribe => {
                        subscribed.remove(&frame.topic);
                        unsubscribe(&topics, &frame.topic, client_id);
                    }
                    BusOpcode::Publish => {
                        fan_out(&topics, &frame);
                    }
                    BusOpcode::Deliver => {
                        // Only the broker sends MSG frames.
                        warn!(client_id, "disconnecting client that sent a deliver frame");
                        break;
                    }
                }
            }
        }
    }

    for topic in subscribed {
        unsubscribe(&topics, &topic, client_id);
    }
    info!(client_id, "client disconnected");
    Ok(())
}

fn fan_out(topics: &TopicMap, frame: &BusFrame) {
    let Some(subscribers) = topics.get(&frame.topic) else {
        return;
    };
    let wire = encode_frame(BusOpcode::Deliver, &frame.topic, &frame.payload);
    for sender in subscribers.values() {
        // A full or closed queue means the subscriber is on its way out;
        // its own task handles the cleanup.
        let _ = sender.send(wire.clone());
    }
}

fn unsubscribe(topics: &TopicMap, topic: &str, client_id: u64) {
    if let Some(mut subscribers) = topics.get_mut(topic) {
        subscribers.remove(&client_id);
        if subscribers.is_empty() {
            drop(subscribers);
            topics.remove_if(topic, |_, subscribers| subscribers.is_empty());
        }
    }
}

fn remove_client(topics: &TopicMap, client_id: u64) {
    topics.retain(|_, subscribers| {
        subscribers.remove(&client_id);
        !subscribers.is_empty()
    });
}
