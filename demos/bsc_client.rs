//! BACnet/SC Client Example
//!
//! Connects to a hub, sends a few test messages and prints the replies.
//! Runs with the blocking API only, so it also works without the `async`
//! feature (the mio engine is used then).
//!
//! # Usage
//!
//! ```bash
//! BSC_HUB_URL="wss://localhost:4443" \
//! BSC_CLIENT_CERT="certs/client.crt" \
//! BSC_CLIENT_KEY="certs/client.key" \
//! BSC_CA_CERT="certs/ca.crt" \
//! cargo run --example bsc_client --features env_logger
//! ```

use std::env;
use std::fs;
use std::time::Duration;

use bacnet_sc_transport::datalink::bsc::{
    event_channel, BscClient, ClientConfig, TlsCredentials, WebsocketError, WebsocketEvent,
    WebsocketProtocol,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("BACnet/SC Client Example");
    println!("========================\n");

    let hub_url = env::var("BSC_HUB_URL").unwrap_or_else(|_| "wss://localhost:4443".to_string());
    let cert_path = env::var("BSC_CLIENT_CERT").unwrap_or_else(|_| "certs/client.crt".to_string());
    let key_path = env::var("BSC_CLIENT_KEY").unwrap_or_else(|_| "certs/client.key".to_string());
    let ca_path = env::var("BSC_CA_CERT").unwrap_or_else(|_| "certs/ca.crt".to_string());

    println!("Configuration:");
    println!("  Hub URL: {}", hub_url);
    println!("  Client Certificate: {}", cert_path);
    println!("  Client Key: {}", key_path);
    println!("  CA Certificate: {}\n", ca_path);

    let credentials =
        TlsCredentials::new(fs::read(ca_path)?, fs::read(cert_path)?, fs::read(key_path)?);
    let config = ClientConfig::new(WebsocketProtocol::Hub, hub_url, credentials);

    let (events, mut rx) = event_channel();
    let client = BscClient::new();
    let handle = client.connect(&config, events)?;
    println!("Connecting ({})...", handle);
    client.wait_connected(handle)?;
    println!("Connected to {:?}\n", client.peer_addr(handle));

    for i in 0u8..3 {
        let message = vec![0x01, 0x00, i];
        client.send(handle, message.clone())?;
        println!("Sent {:02X?}", message);
        match client.recv_message(handle, Duration::from_secs(5)) {
            Ok(reply) => println!("Received {:02X?}", &reply[..]),
            Err(WebsocketError::TimedOut) => println!("No reply"),
            Err(e) => return Err(e.into()),
        }
    }

    client.disconnect(handle)?;
    while let Some(event) = rx.blocking_recv() {
        if let WebsocketEvent::Disconnected {
            reason, description, ..
        } = event
        {
            println!("\nDisconnected: {} {}", reason, description.unwrap_or_default());
            break;
        }
    }
    Ok(())
}
