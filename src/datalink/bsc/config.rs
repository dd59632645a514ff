//! Connection manager configuration
//!
//! All TLS material is held in memory; nothing here touches the filesystem.

use std::time::Duration;

use url::Url;

use super::error::{Result, WebsocketError};

/// BACnet/SC WebSocket subprotocol for hub connections
pub const SUBPROTOCOL_HUB: &str = "hub.bsc.bacnet.org";

/// BACnet/SC WebSocket subprotocol for direct connections
pub const SUBPROTOCOL_DIRECT: &str = "dc.bsc.bacnet.org";

/// Default handshake and operation timeout (10 seconds)
pub const DEFAULT_WEBSOCKET_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity of each connection table
pub const DEFAULT_TABLE_CAPACITY: usize = 4;

/// Initial capacity of a connection's receive buffer
pub const DEFAULT_RX_BUFFER_SIZE: usize = 4096;

/// Largest reassembled message accepted before the connection is closed
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Subprotocol variant carried by a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WebsocketProtocol {
    /// Node to hub connection
    Hub,
    /// Node to node direct connection
    Direct,
}

impl WebsocketProtocol {
    /// Value of the `Sec-WebSocket-Protocol` header for this variant
    pub fn subprotocol(&self) -> &'static str {
        match self {
            Self::Hub => SUBPROTOCOL_HUB,
            Self::Direct => SUBPROTOCOL_DIRECT,
        }
    }

    /// Variant matching a `Sec-WebSocket-Protocol` token
    pub fn from_subprotocol(token: &str) -> Option<Self> {
        match token.trim() {
            SUBPROTOCOL_HUB => Some(Self::Hub),
            SUBPROTOCOL_DIRECT => Some(Self::Direct),
            _ => None,
        }
    }
}

/// TLS material in PEM form
#[derive(Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TlsCredentials {
    /// CA certificate used to verify the peer
    pub ca_cert: Vec<u8>,
    /// Certificate presented to the peer
    pub cert: Vec<u8>,
    /// PKCS#8 private key matching `cert`
    pub key: Vec<u8>,
}

impl TlsCredentials {
    pub fn new(
        ca_cert: impl Into<Vec<u8>>,
        cert: impl Into<Vec<u8>>,
        key: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            ca_cert: ca_cert.into(),
            cert: cert.into(),
            key: key.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.ca_cert.is_empty() || self.cert.is_empty() || self.key.is_empty() {
            return Err(WebsocketError::BadParam);
        }
        Ok(())
    }
}

// Keys stay out of logs.
impl std::fmt::Debug for TlsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsCredentials")
            .field("ca_cert", &self.ca_cert.len())
            .field("cert", &self.cert.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Outbound connection configuration
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClientConfig {
    /// Subprotocol requested from the peer
    pub protocol: WebsocketProtocol,

    /// Peer URL (e.g., "wss://hub.example.com:443")
    pub url: String,

    /// TLS material
    pub credentials: TlsCredentials,

    /// Connect and handshake timeout
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(
        protocol: WebsocketProtocol,
        url: impl Into<String>,
        credentials: TlsCredentials,
    ) -> Self {
        Self {
            protocol,
            url: url.into(),
            credentials,
            timeout: DEFAULT_WEBSOCKET_TIMEOUT,
        }
    }

    /// Check parameters and return the parsed URL
    pub fn validate(&self) -> Result<Url> {
        let url = Url::parse(&self.url).map_err(|_| WebsocketError::BadParam)?;
        if url.scheme() != "wss" || url.host_str().is_none() {
            return Err(WebsocketError::BadParam);
        }
        self.credentials.validate()?;
        if self.timeout.is_zero() {
            return Err(WebsocketError::BadParam);
        }
        Ok(url)
    }
}

/// Listening context configuration
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServerConfig {
    /// Subprotocol accepted from peers
    pub protocol: WebsocketProtocol,

    /// TCP port to listen on
    pub port: u16,

    /// Interface name ("eth0") or address ("192.168.1.10") to bind; all
    /// interfaces when `None`
    pub iface: Option<String>,

    /// TLS material
    pub credentials: TlsCredentials,

    /// Handshake timeout for incoming connections
    pub timeout: Duration,
}

impl ServerConfig {
    pub fn new(protocol: WebsocketProtocol, port: u16, credentials: TlsCredentials) -> Self {
        Self {
            protocol,
            port,
            iface: None,
            credentials,
            timeout: DEFAULT_WEBSOCKET_TIMEOUT,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 || self.timeout.is_zero() {
            return Err(WebsocketError::BadParam);
        }
        if matches!(&self.iface, Some(iface) if iface.is_empty()) {
            return Err(WebsocketError::BadParam);
        }
        self.credentials.validate()
    }
}

/// Fixed table capacities and buffer limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TableLimits {
    /// Outbound connections
    pub client_connections: usize,
    /// Inbound connections on a hub listener
    pub hub_connections: usize,
    /// Inbound connections on a direct connection listener
    pub direct_connections: usize,
    /// Initial receive buffer capacity per connection
    pub rx_buffer_size: usize,
    /// Upper bound on a reassembled message
    pub max_message_size: usize,
}

impl TableLimits {
    /// Capacity of a listener table for `protocol`
    pub fn server_connections(&self, protocol: WebsocketProtocol) -> usize {
        match protocol {
            WebsocketProtocol::Hub => self.hub_connections,
            WebsocketProtocol::Direct => self.direct_connections,
        }
    }
}

impl Default for TableLimits {
    fn default() -> Self {
        Self {
            client_connections: DEFAULT_TABLE_CAPACITY,
            hub_connections: DEFAULT_TABLE_CAPACITY,
            direct_connections: DEFAULT_TABLE_CAPACITY,
            rx_buffer_size: DEFAULT_RX_BUFFER_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}
