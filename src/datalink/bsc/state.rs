//! Per-connection lifecycle

use std::fmt;

use super::config::WebsocketProtocol;

/// Lifecycle state of one connection
///
/// IDLE is not represented here: an IDLE slot holds no record at all.
/// Engines that perform TCP, TLS and the WebSocket handshake in one step
/// leave the connection in [`ConnectionState::Connecting`]; stepwise engines
/// report the finer substates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Slot reserved, engine session not created yet
    Configuring,
    /// Engine is establishing the connection
    Connecting,
    TcpConnecting,
    TlsConnecting,
    HandshakeConnecting,
    /// Handshake complete, data may flow
    Connected,
    /// Close requested, waiting for the engine to confirm
    Disconnecting,
    /// Network connection gone; slot freed once no caller waits on it
    Disconnected,
}

impl ConnectionState {
    /// Any of the states between a connect request and CONNECTED
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            Self::Configuring
                | Self::Connecting
                | Self::TcpConnecting
                | Self::TlsConnecting
                | Self::HandshakeConnecting
        )
    }

    pub fn is_closing(&self) -> bool {
        matches!(self, Self::Disconnecting | Self::Disconnected)
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Configuring, Connecting | TcpConnecting) => true,
            (Connecting, Connected) => true,
            (TcpConnecting, TlsConnecting) => true,
            (TlsConnecting, HandshakeConnecting) => true,
            (HandshakeConnecting, Connected) => true,
            // substates may be skipped by engines that report coarsely
            (Connecting, TcpConnecting | TlsConnecting | HandshakeConnecting) => true,
            (TcpConnecting, HandshakeConnecting | Connected) => true,
            (TlsConnecting, Connected) => true,
            (s, Disconnecting) => s.is_connecting() || *s == Connected,
            (s, Disconnected) => *s != Disconnected,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Configuring => "CONFIGURING",
            Self::Connecting => "CONNECTING",
            Self::TcpConnecting => "TCP_CONNECTING",
            Self::TlsConnecting => "TLS_CONNECTING",
            Self::HandshakeConnecting => "HANDSHAKE_CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Disconnecting => "DISCONNECTING",
            Self::Disconnected => "DISCONNECTED",
        };
        f.write_str(name)
    }
}

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    Client(WebsocketProtocol),
    Server(WebsocketProtocol),
}

impl ConnectionRole {
    pub fn protocol(&self) -> WebsocketProtocol {
        match self {
            Self::Client(p) | Self::Server(p) => *p,
        }
    }

    pub fn is_server(&self) -> bool {
        matches!(self, Self::Server(_))
    }
}
