//! BACnet/SC Echo Hub Example
//!
//! Listens for node connections on the hub subprotocol and echoes every
//! binary message back to its sender. Useful as a peer for the
//! `bsc_client` example.
//!
//! # Usage
//!
//! ```bash
//! BSC_PORT=4443 \
//! BSC_CERT="certs/hub.crt" \
//! BSC_KEY="certs/hub.key" \
//! BSC_CA_CERT="certs/ca.crt" \
//! RUST_LOG=debug \
//! cargo run --example bsc_echo_hub --features env_logger
//! ```
//!
//! The key must be a PKCS#8 PEM file. Stop with Ctrl-C.

use std::env;
use std::fs;

use bacnet_sc_transport::datalink::bsc::{
    engine::tokio::TokioHost, event_channel, BscServer, ServerConfig, TableLimits,
    TlsCredentials, WebsocketEvent, WebsocketProtocol,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("BACnet/SC Echo Hub");
    println!("==================\n");

    let port: u16 = env::var("BSC_PORT")
        .unwrap_or_else(|_| "4443".to_string())
        .parse()?;
    let cert_path = env::var("BSC_CERT").unwrap_or_else(|_| "certs/hub.crt".to_string());
    let key_path = env::var("BSC_KEY").unwrap_or_else(|_| "certs/hub.key".to_string());
    let ca_path = env::var("BSC_CA_CERT").unwrap_or_else(|_| "certs/ca.crt".to_string());

    println!("Configuration:");
    println!("  Port: {}", port);
    println!("  Certificate: {}", cert_path);
    println!("  Key: {}", key_path);
    println!("  CA Certificate: {}\n", ca_path);

    let credentials =
        TlsCredentials::new(fs::read(ca_path)?, fs::read(cert_path)?, fs::read(key_path)?);
    let mut config = ServerConfig::new(WebsocketProtocol::Hub, port, credentials);
    config.iface = env::var("BSC_IFACE").ok();

    let (events, mut rx) = event_channel();
    let server = BscServer::start(&TokioHost, &config, TableLimits::default(), events)?;
    println!("Listening on {}", server.local_addr());

    let (stop_tx, mut stop_rx) = tokio::sync::mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })?;

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                println!("\nStopping...");
                server.stop()?;
            }
            event = rx.recv() => match event {
                Some(WebsocketEvent::Connected { handle }) => {
                    println!("{} connected from {:?}", handle, server.peer_addr(handle));
                }
                Some(WebsocketEvent::Received { handle, payload }) => {
                    println!("{} sent {} bytes, echoing", handle, payload.len());
                    if let Err(e) = server.send_async(handle, payload).await {
                        println!("{} echo failed: {}", handle, e);
                    }
                }
                Some(WebsocketEvent::Disconnected { handle, reason, description }) => {
                    let description = description.unwrap_or_default();
                    println!("{} disconnected: {} {}", handle, reason, description);
                }
                Some(WebsocketEvent::ServerStopped) | None => break,
                Some(_) => {}
            },
        }
    }

    server.join();
    println!("Hub stopped");
    Ok(())
}
