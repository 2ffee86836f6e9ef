use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use objex::{ExchangeSession, JsonCodec};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatusReport {
    host: String,
    load: f64,
    uptime_secs: u64,
}

const ADDR: &str = "127.0.0.1:47801";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let mode = args.get(1).map(|s| s.as_str()).unwrap_or("server");

    match mode {
        "server" => run_server().await?,
        "client" => run_client().await?,
        _ => {
            eprintln!("Usage: cargo run --example exchange -- [server|client]");
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    println!("[Server] Listening on {}", ADDR);

    let addr: SocketAddr = ADDR.parse()?;
    let server = ExchangeSession::create_server(addr).await?;

    let mut states = server.subscribe_state();
    let mut objects = server.subscribe_objects();

    server.start_listening(true)?;

    tokio::spawn(async move {
        while let Ok(change) = states.recv().await {
            println!("[Server] State: {:?}", change.state);
        }
    });

    // Print the first few reports, then shut down.
    for _ in 0..3 {
        let received = objects.recv().await?;
        if received.is_deserialized() {
            let report: StatusReport = received.decode_with(&JsonCodec)?;
            println!(
                "[Server] {} load={:.2} up={}s",
                report.host, report.load, report.uptime_secs
            );
        } else {
            println!(
                "[Server] Discarded frame for type {}",
                received.type_name
            );
        }
    }

    server.close().await;
    println!("[Server] Done");
    Ok(())
}

async fn run_client() -> Result<(), Box<dyn std::error::Error>> {
    println!("[Client] Connecting to {}", ADDR);

    let addr: SocketAddr = ADDR.parse()?;
    let client = ExchangeSession::create_client()?;

    if !client.connect(addr, Duration::from_secs(5)).await? {
        eprintln!("[Client] Connect failed, state: {:?}", client.state());
        std::process::exit(1);
    }

    for i in 0..3u64 {
        let report = StatusReport {
            host: "demo-host".to_string(),
            load: 0.5 + i as f64 / 10.0,
            uptime_secs: 3600 + i,
        };
        if client.send_object(&report).await {
            println!("[Client] Sent report {}", i + 1);
        } else {
            eprintln!("[Client] Send failed");
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    client.close().await;
    println!("[Client] Done");
    Ok(())
}
