//! Two typed channels multiplexed over one server, each with its own
//! derived exchange code: frames for the other type are discarded by the
//! code check alone.

use std::net::SocketAddr;
use std::time::Duration;

use objex::{ExchangeSession, TypedExchange};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Telemetry {
    sensor: String,
    reading: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Command {
    name: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let listener = TcpListener::bind("127.0.0.1:0".parse::<SocketAddr>()?).await?;
    let addr = listener.local_addr()?;

    let connect = tokio::spawn(async move { TcpStream::connect(addr).await });
    let (server_stream, _) = listener.accept().await?;
    let client_stream = connect.await??;

    let telemetry_tx =
        TypedExchange::<Telemetry>::bind(ExchangeSession::from_stream(client_stream, true)?)?;
    let telemetry_rx =
        TypedExchange::<Telemetry>::bind(ExchangeSession::from_stream(server_stream, true)?)?;

    println!(
        "Telemetry channel code: {:#010x}",
        telemetry_tx.exchange_code()
    );

    telemetry_tx
        .send(&Telemetry {
            sensor: "temp0".to_string(),
            reading: 21.5,
        })
        .await;

    let reading = telemetry_rx.receive(true).await?;
    println!("Received on telemetry channel: {:?}", reading);

    // Rebind the receiving side to the Command type: the next telemetry
    // frame fails the code check and is discarded.
    let command_rx = TypedExchange::<Command>::bind(telemetry_rx.into_inner())?;
    println!("Command channel code: {:#010x}", command_rx.exchange_code());

    telemetry_tx
        .send(&Telemetry {
            sensor: "temp0".to_string(),
            reading: 22.0,
        })
        .await;

    let none = tokio::time::timeout(Duration::from_secs(2), command_rx.receive(true)).await??;
    println!("Telemetry frame on command channel: {:?}", none);

    command_rx.session().close().await;
    telemetry_tx.session().close().await;

    Ok(())
}
