//! Integration tests: clients through a spawned broker, then a full
//! protocol-engine exchange across it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use sealbus_broker::{run_broker, BrokerClient};
use sealbus_core::{ClientConfig, DatagramType, Partner, PartnerKey, PayloadEncoding};
use sealbus_engine::{ProtocolEngine, PubSub};

async fn spawn_broker() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no local addr");
    tokio::spawn(async move {
        run_broker(listener).await;
    });
    format!("ws://{}", addr)
}

#[tokio::test]
async fn test_publish_fans_out_to_subscribers() {
    let url = spawn_broker().await;

    let receiver = BrokerClient::connect(&url).await.expect("connect failed");
    let publisher = BrokerClient::connect(&url).await.expect("connect failed");

    let (tx, mut rx) = mpsc::unbounded_channel();
    receiver.subscribe(
        "greenhouse/inbox",
        Arc::new(move |channel: &str, data: &[u8]| {
            tx.send((channel.to_string(), data.to_vec())).ok();
        }),
    );

    // Give the SUB frame time to reach the broker before publishing.
    tokio::time::sleep(Duration::from_millis(100)).await;
    publisher.publish("greenhouse/inbox", b"payload");

    let (channel, data) = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed");
    assert_eq!(channel, "greenhouse/inbox");
    assert_eq!(data, b"payload");

    // Other topics stay silent.
    publisher.publish("greenhouse/other", b"noise");
    let result = timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(result.is_err(), "received payload for a topic not subscribed");
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let url = spawn_broker().await;

    let receiver = BrokerClient::connect(&url).await.expect("connect failed");
    let publisher = BrokerClient::connect(&url).await.expect("connect failed");

    let (tx, mut rx) = mpsc::unbounded_channel();
    receiver.subscribe(
        "topic",
        Arc::new(move |_: &str, data: &[u8]| {
            tx.send(data.to_vec()).ok();
        }),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    publisher.publish("topic", b"one");
    let data = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed");
    assert_eq!(data, b"one");

    receiver.unsubscribe("topic");
    tokio::time::sleep(Duration::from_millis(100)).await;

    publisher.publish("topic", b"two");
    let result = timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(result.is_err(), "received payload after unsubscribe");
}

#[tokio::test]
async fn test_engines_exchange_messages_across_the_broker() {
    let url = spawn_broker().await;

    let shared = |passphrase: &str| Partner {
        key: PartnerKey::new([0x51; 16]),
        passphrase: passphrase.to_string(),
    };
    let alice_config = ClientConfig {
        host_address: "alice".to_string(),
        accepts_commands: false,
        time_server: None,
        time_client: None,
        partners: HashMap::from([("bob".to_string(), shared("delta"))]),
    };
    let bob_config = ClientConfig {
        host_address: "bob".to_string(),
        accepts_commands: true,
        time_server: None,
        time_client: None,
        partners: HashMap::from([("alice".to_string(), shared("delta"))]),
    };

    let alice_bus = BrokerClient::connect(&url).await.expect("connect failed");
    let bob_bus = BrokerClient::connect(&url).await.expect("connect failed");

    let alice = ProtocolEngine::new(alice_config, alice_bus);
    let bob = ProtocolEngine::new(bob_config, bob_bus);

    let (tx, mut rx) = mpsc::unbounded_channel();
    bob.register_callback(move |sender, datagram_type, _encoding, data| {
        tx.send((sender.to_string(), datagram_type, data.to_vec())).ok();
    });

    alice.start();
    bob.start();
    // Let the subscriptions settle before sending.
    tokio::time::sleep(Duration::from_millis(150)).await;

    alice
        .send("bob", DatagramType::Message, PayloadEncoding::Utf8, b"over the wire")
        .unwrap();
    let (sender, datagram_type, data) = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed");
    assert_eq!(sender, "alice");
    assert_eq!(datagram_type, DatagramType::Message);
    assert_eq!(data, b"over the wire");

    alice
        .send("bob", DatagramType::Command, PayloadEncoding::Binary, b"water the plants")
        .unwrap();
    let (sender, datagram_type, data) = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed");
    assert_eq!(sender, "alice");
    assert_eq!(datagram_type, DatagramType::Command);
    assert_eq!(data, b"water the plants");

    alice.stop();
    bob.stop();
}
