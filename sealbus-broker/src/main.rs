use sealbus_broker::run_broker;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "0.0.0.0:1884".to_string());
    let listener = TcpListener::bind(&addr).await.expect("failed to bind");
    println!("sealbus broker listening on: {}", addr);
    run_broker(listener).await;
}
