//! WebSocket engine abstraction
//!
//! The event loop drives an [`AsyncWebSocketEngine`] through a small set of
//! non-blocking calls plus one blocking [`AsyncWebSocketEngine::service`]
//! call, and learns about I/O only through the [`EngineEvent`]s that call
//! returns. Two adapters are provided:
//!
//! - [`tokio::TokioEngine`] (feature `async`): tokio-tungstenite on a private
//!   runtime, one task per session.
//! - [`polling::PollingEngine`]: mio sockets driven step by step.
//!
//! Both report each connect stage. Engines never resolve host names; the
//! event loop does that before its first pass and hands over addresses in
//! [`ConnectRequest::addrs`].

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tungstenite::handshake::server::{Callback, ErrorResponse, Request, Response};
use tungstenite::http::{header, HeaderValue, StatusCode};
use url::Url;

use super::close_reason::CloseStatus;
use super::config::{ClientConfig, ServerConfig, TableLimits, WebsocketProtocol};
use super::state::ConnectionState;

pub use super::reassembly::FrameKind;

pub mod polling;
pub(crate) mod tls;
#[cfg(feature = "async")]
pub mod tokio;

#[cfg(test)]
pub(crate) mod scripted;

/// Engine-local identifier of one WebSocket session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {}", self.0)
    }
}

/// I/O outcome reported by [`AsyncWebSocketEngine::service`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A peer connected to the listener; the handshake is still running
    Incoming {
        session: SessionId,
        peer: Option<SocketAddr>,
    },

    /// A stepwise engine advanced to a new connect stage
    Progress {
        session: SessionId,
        stage: ConnectionState,
    },

    /// TLS and WebSocket handshakes completed
    Established { session: SessionId },

    /// One data frame (or fragment of one)
    ///
    /// The tungstenite based engines reassemble internally, so they always
    /// report whole messages with `fin` set.
    Frame {
        session: SessionId,
        kind: FrameKind,
        fin: bool,
        payload: Bytes,
    },

    /// The session can take a write now
    Writable { session: SessionId },

    /// The network connection is gone
    Closed {
        session: SessionId,
        status: Option<CloseStatus>,
        description: Option<String>,
    },
}

/// Wakes an engine blocked in [`AsyncWebSocketEngine::service`]
#[derive(Clone)]
pub struct EngineWaker(Arc<dyn Fn() + Send + Sync>);

impl EngineWaker {
    pub fn new(wake: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(wake))
    }

    pub fn wake(&self) {
        (self.0)()
    }
}

impl fmt::Debug for EngineWaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EngineWaker")
    }
}

/// Outbound connection request handed to [`AsyncWebSocketEngine::connect`]
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub url: Url,
    pub protocol: WebsocketProtocol,
    /// Resolved peer addresses, tried in order
    pub addrs: Vec<SocketAddr>,
}

impl ConnectRequest {
    pub fn new(url: Url, protocol: WebsocketProtocol) -> Self {
        Self {
            url,
            protocol,
            addrs: Vec::new(),
        }
    }

    /// Resolve the URL host into [`ConnectRequest::addrs`]
    ///
    /// May block on DNS. Never call it with a context lock held.
    pub fn resolve(&mut self) -> io::Result<()> {
        let addrs = self.url.socket_addrs(|| Some(443))?;
        if addrs.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "host did not resolve"));
        }
        self.addrs = addrs;
        Ok(())
    }
}

/// Asynchronous WebSocket engine driven by one event loop
///
/// Only `service` may block. Every other call returns immediately and its
/// outcome, if any, is reported by a later `service` call.
pub trait AsyncWebSocketEngine: Send + 'static {
    /// Handle that interrupts a blocking `service` call from any thread
    fn waker(&self) -> EngineWaker;

    /// Start an outbound connection
    fn connect(&mut self, request: &ConnectRequest) -> io::Result<SessionId>;

    /// Report [`EngineEvent::Writable`] once `session` can take a write
    fn request_writable(&mut self, session: SessionId);

    /// Send one binary message; returns the number of bytes accepted
    fn write(&mut self, session: SessionId, payload: &[u8]) -> io::Result<usize>;

    /// Close `session` with `status`, or abort it if still connecting
    ///
    /// The engine reports [`EngineEvent::Closed`] when done.
    fn close(&mut self, session: SessionId, status: CloseStatus);

    fn peer_addr(&self, session: SessionId) -> Option<SocketAddr>;

    /// Wait for I/O, a wake, or `deadline`, and append what happened
    fn service(
        &mut self,
        deadline: Option<Instant>,
        events: &mut Vec<EngineEvent>,
    ) -> io::Result<()>;

    /// Tear down every session and the engine context
    ///
    /// Called once, with the process-wide engine lock held.
    fn shutdown(&mut self);
}

/// Creates engine contexts for clients and listeners
pub trait EngineFactory: Send + Sync + 'static {
    type Engine: AsyncWebSocketEngine;

    /// Engine context for one outbound connection
    fn client(&self, config: &ClientConfig, limits: &TableLimits) -> io::Result<Self::Engine>;

    /// Engine context listening on `addr`
    fn server(
        &self,
        config: &ServerConfig,
        addr: SocketAddr,
        limits: &TableLimits,
    ) -> io::Result<Self::Engine>;
}

/// Close status reported for a tungstenite failure
pub(crate) fn close_status_for(err: &tungstenite::Error) -> Option<CloseStatus> {
    use tungstenite::Error;
    match err {
        Error::Tls(_) => Some(CloseStatus::TLS_FAILURE),
        Error::Capacity(_) => Some(CloseStatus::MESSAGE_TOO_LARGE),
        Error::Protocol(_) => Some(CloseStatus::PROTOCOL_ERROR),
        Error::Utf8 => Some(CloseStatus::INVALID_PAYLOAD),
        _ => None,
    }
}

/// Server handshake callback that only admits the configured subprotocol
pub(crate) struct SubprotocolCheck {
    pub protocol: WebsocketProtocol,
}

impl SubprotocolCheck {
    fn offered(&self, request: &Request) -> bool {
        request
            .headers()
            .get_all(header::SEC_WEBSOCKET_PROTOCOL)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| WebsocketProtocol::from_subprotocol(token) == Some(self.protocol))
    }
}

impl Callback for SubprotocolCheck {
    fn on_request(
        self,
        request: &Request,
        mut response: Response,
    ) -> Result<Response, ErrorResponse> {
        if !self.offered(request) {
            let mut rejection = ErrorResponse::new(Some(format!(
                "subprotocol {} required",
                self.protocol.subprotocol()
            )));
            *rejection.status_mut() = StatusCode::BAD_REQUEST;
            return Err(rejection);
        }
        response.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(self.protocol.subprotocol()),
        );
        Ok(response)
    }
}

/// Handshake request carrying the subprotocol header
pub(crate) fn client_request(
    request: &ConnectRequest,
) -> Result<tungstenite::handshake::client::Request, tungstenite::Error> {
    use tungstenite::client::IntoClientRequest;

    let mut http_request = request.url.as_str().into_client_request()?;
    http_request.headers_mut().insert(
        header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(request.protocol.subprotocol()),
    );
    Ok(http_request)
}

/// WebSocket limits derived from the table configuration
pub(crate) fn websocket_config(limits: &TableLimits) -> tungstenite::protocol::WebSocketConfig {
    tungstenite::protocol::WebSocketConfig {
        max_message_size: Some(limits.max_message_size),
        max_frame_size: Some(limits.max_message_size),
        ..Default::default()
    }
}

/// How long a closing session may linger before it is dropped
pub(crate) const CLOSE_LINGER: Duration = Duration::from_secs(3);
