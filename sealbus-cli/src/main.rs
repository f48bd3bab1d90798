//! Interactive sealbus client.
//!
//! Loads a configuration file, connects to a broker, and bridges stdin to
//! the protocol engine:
//!
//! ```text
//! receiver: some text      send a message
//! receiver! some text      send a command
//! exit                     quit
//! ```

use std::process::ExitCode;

use tokio::io::{AsyncBufReadExt, BufReader};

use sealbus_broker::BrokerClient;
use sealbus_core::{ClientConfig, DatagramType, PayloadEncoding};
use sealbus_engine::{ProtocolEngine, PubSub};

const DEFAULT_BROKER: &str = "ws://127.0.0.1:1884";

struct Args {
    config: String,
    broker: String,
    verbose: bool,
}

fn parse_args() -> Result<Args, String> {
    let argv: Vec<String> = std::env::args().collect();
    let mut config = String::new();
    let mut broker = DEFAULT_BROKER.to_string();
    let mut verbose = false;

    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--config" if i + 1 < argv.len() => {
                config = argv[i + 1].clone();
                i += 1;
            }
            "--broker" if i + 1 < argv.len() => {
                broker = argv[i + 1].clone();
                i += 1;
            }
            "--verbose" => verbose = true,
            other => return Err(format!("unknown argument '{}'", other)),
        }
        i += 1;
    }

    if config.is_empty() {
        return Err("please specify a configuration file using the --config flag".to_string());
    }
    Ok(Args {
        config,
        broker,
        verbose,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{}", message);
            eprintln!("usage: sealbus-cli --config <file> [--broker <url>] [--verbose]");
            return ExitCode::FAILURE;
        }
    };

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = match ClientConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    let bus = match BrokerClient::connect(&args.broker).await {
        Ok(bus) => bus,
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    let transport = bus.clone();
    let engine = ProtocolEngine::new(config, bus);
    engine.register_callback(|sender, _datagram_type, encoding, data| {
        match encoding {
            PayloadEncoding::Utf8 | PayloadEncoding::Json => {
                println!("{}: {}", sender, String::from_utf8_lossy(data));
            }
            PayloadEncoding::Binary => {
                println!("{}: <{} bytes of binary data>", sender, data.len());
            }
        }
    });
    engine.start();

    println!("connected as '{}'", engine.host_address());
    println!("use 'receiver: text' to send a message, 'receiver! text' for a command, 'exit' to quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" {
            println!("bye");
            break;
        }

        let Some((receiver, datagram_type, body)) = parse_line(line) else {
            println!("to send messages use the format 'receiver: Text.'");
            continue;
        };

        match engine.send(receiver, datagram_type, PayloadEncoding::Utf8, body.as_bytes()) {
            Ok(()) => println!("ok"),
            Err(err) => println!("error: {}", err),
        }
    }

    engine.stop();
    transport.disconnect();
    ExitCode::SUCCESS
}

/// Split `receiver: body` / `receiver! body` into its parts.
fn parse_line(line: &str) -> Option<(&str, DatagramType, &str)> {
    let split_at = line.find([':', '!'])?;
    let datagram_type = if line.as_bytes()[split_at] == b':' {
        DatagramType::Message
    } else {
        DatagramType::Command
    };
    let receiver = line[..split_at].trim();
    let body = line[split_at + 1..].trim();
    if receiver.is_empty() {
        return None;
    }
    Some((receiver, datagram_type, body))
}
