//! # bacnet-sc-transport
//!
//! Secure WebSocket connection manager for the BACnet Secure Connect
//! (BACnet/SC) datalink, ASHRAE 135-2020 Annex AB.
//!
//! The crate establishes, multiplexes and tears down TLS-protected WebSocket
//! connections in both the client (node) and server (hub or direct
//! connection acceptor) roles. BVLC-SC encoding, addressing and routing live
//! in the layers above and only see complete binary messages and lifecycle
//! events.
//!
//! See [`datalink::bsc`] for the entry points.

pub mod datalink;

pub use datalink::bsc::{
    BscClient, BscServer, ConnectionHandle, ErrorCode, WebsocketError, WebsocketEvent,
    WebsocketProtocol,
};
