//! End-to-end engine tests over the in-process bus.
//!
//! Two or more engines share a MemoryBus and exchange real datagrams; the
//! hostile-bus cases inject raw frames next to them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use sealbus_core::datagram::{assemble_datagram, DatagramHeader};
use sealbus_core::{ClientConfig, DatagramType, Partner, PartnerKey, PayloadEncoding, TimeConfig};
use sealbus_engine::{channels, MemoryBus, ProtocolEngine, PubSub, SendError};

type Received = (String, DatagramType, PayloadEncoding, Vec<u8>);

fn partner(key_byte: u8, passphrase: &str) -> Partner {
    Partner {
        key: PartnerKey::new([key_byte; 16]),
        passphrase: passphrase.to_string(),
    }
}

fn config(host: &str, accepts_commands: bool, partners: &[(&str, u8, &str)]) -> ClientConfig {
    let partners: HashMap<String, Partner> = partners
        .iter()
        .map(|(address, key_byte, passphrase)| (address.to_string(), partner(*key_byte, passphrase)))
        .collect();
    ClientConfig {
        host_address: host.to_string(),
        accepts_commands,
        time_server: None,
        time_client: None,
        partners,
    }
}

fn collector(engine: &Arc<ProtocolEngine>) -> mpsc::UnboundedReceiver<Received> {
    let (tx, rx) = mpsc::unbounded_channel();
    engine.register_callback(move |sender, datagram_type, encoding, data| {
        tx.send((sender.to_string(), datagram_type, encoding, data.to_vec()))
            .ok();
    });
    rx
}

async fn expect_delivery(rx: &mut mpsc::UnboundedReceiver<Received>) -> Received {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("collector channel closed")
}

async fn expect_silence(rx: &mut mpsc::UnboundedReceiver<Received>) {
    let result = timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(result.is_err(), "unexpected delivery: {:?}", result);
}

fn local_unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

/// Forge a message datagram with an arbitrary timestamp, as an attacker
/// holding the key could after recording one.
fn forge_message(source: &str, timestamp: i64, data: &[u8], key_byte: u8, passphrase: &str) -> Vec<u8> {
    let header = DatagramHeader::new(DatagramType::Message, PayloadEncoding::Utf8, source);
    assemble_datagram(
        &header,
        &(timestamp as u32).to_be_bytes(),
        data,
        &[key_byte; 16],
        &[0x42; 16],
        passphrase,
    )
    .unwrap()
}

#[tokio::test]
async fn test_message_roundtrip_between_engines() {
    let bus = MemoryBus::new();
    let alice = ProtocolEngine::new(config("alice", false, &[("bob", 0x11, "alpha")]), bus.clone());
    let bob = ProtocolEngine::new(config("bob", false, &[("alice", 0x11, "alpha")]), bus.clone());
    let mut inbox = collector(&bob);

    alice.start();
    bob.start();

    alice
        .send("bob", DatagramType::Message, PayloadEncoding::Utf8, b"hello sailor")
        .unwrap();

    let (sender, datagram_type, encoding, data) = expect_delivery(&mut inbox).await;
    assert_eq!(sender, "alice");
    assert_eq!(datagram_type, DatagramType::Message);
    assert_eq!(encoding, PayloadEncoding::Utf8);
    assert_eq!(data, b"hello sailor");

    alice.stop();
    bob.stop();
}

#[tokio::test]
async fn test_send_after_stop_fails() {
    let bus = MemoryBus::new();
    let alice = ProtocolEngine::new(config("alice", false, &[("bob", 0x11, "alpha")]), bus.clone());
    alice.start();
    alice.stop();
    assert_eq!(
        alice.send("bob", DatagramType::Message, PayloadEncoding::Utf8, b"late"),
        Err(SendError::EngineStopped)
    );
    assert_eq!(
        alice.send("bob", DatagramType::Command, PayloadEncoding::Binary, b"late"),
        Err(SendError::EngineStopped)
    );
}

#[tokio::test]
async fn test_send_to_unknown_receiver_fails() {
    let bus = MemoryBus::new();
    let alice = ProtocolEngine::new(config("alice", false, &[]), bus.clone());
    let result = alice.send("stranger", DatagramType::Message, PayloadEncoding::Utf8, b"hi");
    assert_eq!(result, Err(SendError::UnknownReceiver("stranger".to_string())));
}

#[tokio::test]
async fn test_oversized_payloads_are_rejected_at_send() {
    let bus = MemoryBus::new();
    let alice = ProtocolEngine::new(config("alice", false, &[("bob", 0x11, "alpha")]), bus.clone());
    let huge = vec![0u8; 70_000];
    assert_eq!(
        alice.send("bob", DatagramType::Message, PayloadEncoding::Binary, &huge),
        Err(SendError::PayloadTooLong)
    );
    assert_eq!(
        alice.send("bob", DatagramType::Command, PayloadEncoding::Binary, &huge),
        Err(SendError::PayloadTooLong)
    );
}

#[tokio::test]
async fn test_stale_and_future_messages_are_dropped() {
    let bus = MemoryBus::new();
    let bob = ProtocolEngine::new(config("bob", false, &[("alice", 0x11, "alpha")]), bus.clone());
    let mut inbox = collector(&bob);
    bob.start();

    let stale = forge_message("alice", local_unix_now() - 5, b"old news", 0x11, "alpha");
    bus.publish(&channels::inbox("bob"), &stale);
    expect_silence(&mut inbox).await;

    let future = forge_message("alice", local_unix_now() + 5, b"too soon", 0x11, "alpha");
    bus.publish(&channels::inbox("bob"), &future);
    expect_silence(&mut inbox).await;

    // A current timestamp still goes through.
    let fresh = forge_message("alice", local_unix_now(), b"fresh", 0x11, "alpha");
    bus.publish(&channels::inbox("bob"), &fresh);
    let (_, _, _, data) = expect_delivery(&mut inbox).await;
    assert_eq!(data, b"fresh");

    bob.stop();
}

#[tokio::test]
async fn test_unknown_partner_and_garbage_frames_are_dropped() {
    let bus = MemoryBus::new();
    let bob = ProtocolEngine::new(config("bob", false, &[("alice", 0x11, "alpha")]), bus.clone());
    let mut inbox = collector(&bob);
    bob.start();

    bus.publish(&channels::inbox("bob"), b"not a datagram at all");
    // Valid frame, but "mallory" is not in bob's partner table.
    let spoofed = forge_message("mallory", local_unix_now(), b"trust me", 0x66, "evil");
    bus.publish(&channels::inbox("bob"), &spoofed);
    expect_silence(&mut inbox).await;

    // The engine is still alive afterwards.
    let fresh = forge_message("alice", local_unix_now(), b"still here", 0x11, "alpha");
    bus.publish(&channels::inbox("bob"), &fresh);
    let (sender, _, _, data) = expect_delivery(&mut inbox).await;
    assert_eq!(sender, "alice");
    assert_eq!(data, b"still here");

    bob.stop();
}

#[tokio::test]
async fn test_command_handshake_delivers_and_replay_is_rejected() {
    let bus = MemoryBus::new();
    let alice = ProtocolEngine::new(config("alice", false, &[("bob", 0x11, "alpha")]), bus.clone());
    let bob = ProtocolEngine::new(config("bob", true, &[("alice", 0x11, "alpha")]), bus.clone());
    let mut inbox = collector(&bob);

    // Record everything crossing bob's inbox so the command datagram can
    // be replayed byte-for-byte.
    let recorded: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let tap = recorded.clone();
    bus.subscribe(
        &channels::inbox("bob"),
        Arc::new(move |_channel: &str, data: &[u8]| {
            tap.lock().unwrap().push(data.to_vec());
        }),
    );

    alice.start();
    bob.start();

    alice
        .send("bob", DatagramType::Command, PayloadEncoding::Binary, b"reboot")
        .unwrap();

    let (sender, datagram_type, encoding, data) = expect_delivery(&mut inbox).await;
    assert_eq!(sender, "alice");
    assert_eq!(datagram_type, DatagramType::Command);
    assert_eq!(encoding, PayloadEncoding::Binary);
    assert_eq!(data, b"reboot");

    // Replay the exact bytes; the session ID was consumed on delivery.
    let frame = {
        let recorded = recorded.lock().unwrap();
        recorded
            .iter()
            .find(|frame| frame.first() == Some(&b'C'))
            .expect("no command frame recorded")
            .clone()
    };
    bus.publish(&channels::inbox("bob"), &frame);
    expect_silence(&mut inbox).await;

    alice.stop();
    bob.stop();
}

#[tokio::test]
async fn test_queued_commands_arrive_in_order() {
    let bus = MemoryBus::new();
    let alice = ProtocolEngine::new(config("alice", false, &[("bob", 0x11, "alpha")]), bus.clone());
    let bob = ProtocolEngine::new(config("bob", true, &[("alice", 0x11, "alpha")]), bus.clone());
    let mut inbox = collector(&bob);

    alice.start();
    bob.start();

    for index in 0..3u8 {
        alice
            .send("bob", DatagramType::Command, PayloadEncoding::Binary, &[index])
            .unwrap();
    }

    for index in 0..3u8 {
        let (_, datagram_type, _, data) = expect_delivery(&mut inbox).await;
        assert_eq!(datagram_type, DatagramType::Command);
        assert_eq!(data, [index]);
    }

    alice.stop();
    bob.stop();
}

#[tokio::test]
async fn test_commands_to_different_partners_are_independent() {
    let bus = MemoryBus::new();
    let alice = ProtocolEngine::new(
        config("alice", false, &[("bob", 0x11, "alpha"), ("carol", 0x22, "beta")]),
        bus.clone(),
    );
    let bob = ProtocolEngine::new(config("bob", true, &[("alice", 0x11, "alpha")]), bus.clone());
    let carol = ProtocolEngine::new(config("carol", true, &[("alice", 0x22, "beta")]), bus.clone());
    let mut bob_inbox = collector(&bob);
    let mut carol_inbox = collector(&carol);

    alice.start();
    bob.start();
    carol.start();

    alice
        .send("bob", DatagramType::Command, PayloadEncoding::Binary, b"for bob")
        .unwrap();
    alice
        .send("carol", DatagramType::Command, PayloadEncoding::Binary, b"for carol")
        .unwrap();

    let (_, _, _, data) = expect_delivery(&mut bob_inbox).await;
    assert_eq!(data, b"for bob");
    let (_, _, _, data) = expect_delivery(&mut carol_inbox).await;
    assert_eq!(data, b"for carol");

    alice.stop();
    bob.stop();
    carol.stop();
}

#[tokio::test]
async fn test_command_without_live_session_is_dropped() {
    let bus = MemoryBus::new();
    let bob = ProtocolEngine::new(config("bob", true, &[("alice", 0x11, "alpha")]), bus.clone());
    let mut inbox = collector(&bob);
    bob.start();

    // A command datagram whose session ID was never issued.
    let header = DatagramHeader::new(DatagramType::Command, PayloadEncoding::Binary, "alice");
    let forged = assemble_datagram(
        &header,
        &[0xAA; 16],
        b"sneaky",
        &[0x11; 16],
        &[0x42; 16],
        "alpha",
    )
    .unwrap();
    bus.publish(&channels::inbox("bob"), &forged);
    expect_silence(&mut inbox).await;

    bob.stop();
}

#[tokio::test]
async fn test_commands_to_non_accepting_hosts_go_nowhere() {
    let bus = MemoryBus::new();
    let alice = ProtocolEngine::new(config("alice", false, &[("bob", 0x11, "alpha")]), bus.clone());
    let bob = ProtocolEngine::new(config("bob", false, &[("alice", 0x11, "alpha")]), bus.clone());
    let mut inbox = collector(&bob);

    alice.start();
    bob.start();

    // Accepted locally: the command sits in the queue waiting for a
    // session that will never be issued.
    alice
        .send("bob", DatagramType::Command, PayloadEncoding::Binary, b"noop")
        .unwrap();
    expect_silence(&mut inbox).await;

    alice.stop();
    bob.stop();
}

#[tokio::test]
async fn test_time_client_syncs_and_unblocks_send() {
    let bus = MemoryBus::new();

    let kronos_config = ClientConfig {
        host_address: "kronos".to_string(),
        accepts_commands: false,
        time_server: Some(TimeConfig {
            addr: "kronos".to_string(),
            passphrase: "tick".to_string(),
        }),
        time_client: None,
        partners: [("bedroom".to_string(), partner(0x33, "gamma"))].into(),
    };
    let bedroom_config = ClientConfig {
        host_address: "bedroom".to_string(),
        accepts_commands: false,
        time_server: None,
        // The time passphrase is the one kronos has on file for bedroom.
        time_client: Some(TimeConfig {
            addr: "kronos".to_string(),
            passphrase: "gamma".to_string(),
        }),
        partners: [("kronos".to_string(), partner(0x33, "gamma"))].into(),
    };

    let kronos = ProtocolEngine::new(kronos_config, bus.clone());
    let bedroom = ProtocolEngine::new(bedroom_config, bus.clone());
    let mut kronos_inbox = collector(&kronos);

    // Without a sync, messages cannot be timestamped.
    assert!(!bedroom.time_synchronized());
    assert_eq!(
        bedroom.send("kronos", DatagramType::Message, PayloadEncoding::Utf8, b"early"),
        Err(SendError::NoTimeServerConnection)
    );

    kronos.start();
    bedroom.start();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !bedroom.time_synchronized() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "time client never synchronized"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    bedroom
        .send("kronos", DatagramType::Message, PayloadEncoding::Utf8, b"on time")
        .unwrap();
    let (sender, _, _, data) = expect_delivery(&mut kronos_inbox).await;
    assert_eq!(sender, "bedroom");
    assert_eq!(data, b"on time");

    kronos.stop();
    bedroom.stop();
}
