//! BACnet/SC (Secure Connect) WebSocket connection manager
//!
//! Implements the transport half of ASHRAE 135-2020 Annex AB: TLS-protected
//! WebSocket connections in the client (node) and server (hub function or
//! direct connection acceptor) roles.
//!
//! # Architecture
//!
//! - A **context** owns a fixed-capacity connection table. Each client
//!   connection gets its own context entry and event loop thread; a server
//!   context shares one event loop among all of its connections.
//! - Connections are addressed by [`ConnectionHandle`]s. A handle names a
//!   slot plus the generation of that slot, so a handle kept after its
//!   connection went away is rejected instead of reaching a newer one.
//! - The event loop is the only place that talks to the WebSocket engine.
//!   Caller threads queue operations on the connection record, wake the loop
//!   and block on a per-operation completion.
//! - Lifecycle and unsolicited data are reported as [`WebsocketEvent`]s on
//!   the channel passed at connect or start time.
//!
//! # Locking
//!
//! Each context has its own lock. Engine contexts are created and destroyed
//! under one process-wide lock, which is never held together with a context
//! lock.
//!
//! # Usage
//!
//! ```rust,no_run
//! use bacnet_sc_transport::datalink::bsc::{
//!     event_channel, BscClient, ClientConfig, TlsCredentials, WebsocketEvent, WebsocketProtocol,
//! };
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let credentials = TlsCredentials::new(
//!     std::fs::read("ca.pem")?,
//!     std::fs::read("node.pem")?,
//!     std::fs::read("node.key")?,
//! );
//! let url = "wss://hub.example.com:443";
//! let config = ClientConfig::new(WebsocketProtocol::Hub, url, credentials);
//!
//! let (events, mut rx) = event_channel();
//! let client = BscClient::new();
//! let handle = client.connect(&config, events)?;
//! client.wait_connected(handle)?;
//!
//! client.send(handle, vec![0x01, 0x00])?;
//! let reply = client.recv_message(handle, Duration::from_secs(5))?;
//! println!("{} bytes from the hub", reply.len());
//!
//! client.disconnect(handle)?;
//! while let Some(event) = rx.blocking_recv() {
//!     if let WebsocketEvent::Disconnected { reason, .. } = event {
//!         println!("closed: {}", reason);
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # WebSocket Subprotocols
//!
//! - `hub.bsc.bacnet.org` - For node-to-hub connections
//! - `dc.bsc.bacnet.org` - For direct node-to-node connections
//!
//! # References
//!
//! - ASHRAE 135-2020, Addendum bj (Annex AB): BACnet Secure Connect
//! - RFC 6455: The WebSocket Protocol

pub mod client;
pub mod close_reason;
mod completion;
pub mod config;
mod context;
pub mod dispatch;
pub mod engine;
pub mod error;
mod event_loop;
pub mod handle;
mod mutex;
pub mod net;
mod operation;
pub mod reassembly;
pub mod server;
pub mod state;

pub use client::{BscClient, DefaultFactory};
pub use close_reason::{error_code_for, CloseStatus};
pub use completion::Completion;
pub use config::{
    ClientConfig, ServerConfig, TableLimits, TlsCredentials, WebsocketProtocol,
    DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_RX_BUFFER_SIZE, DEFAULT_TABLE_CAPACITY,
    DEFAULT_WEBSOCKET_TIMEOUT, SUBPROTOCOL_DIRECT, SUBPROTOCOL_HUB,
};
pub use dispatch::{event_channel, EventReceiver, EventSender, WebsocketEvent};
pub use error::{ErrorCode, Result, WebsocketError};
pub use handle::ConnectionHandle;
pub use reassembly::FrameKind;
pub use server::BscServer;
pub use state::ConnectionState;
