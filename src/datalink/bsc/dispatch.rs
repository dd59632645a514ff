//! Events delivered to the BACnet/SC layer
//!
//! The event loop never calls into the application. It only posts events on
//! an unbounded channel, so a consumer is free to call any connection
//! manager operation while handling one.

use bytes::Bytes;
use log::trace;
use tokio::sync::mpsc;

use super::error::ErrorCode;
use super::handle::ConnectionHandle;

/// Connection lifecycle and data event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebsocketEvent {
    /// Handshake completed; emitted once per connection
    Connected { handle: ConnectionHandle },

    /// A complete binary message that no `recv` call was waiting for
    Received {
        handle: ConnectionHandle,
        payload: Bytes,
    },

    /// A `send_request` was granted; call `dispatch_send` once
    Sendable { handle: ConnectionHandle },

    /// Connection closed; emitted once per connection
    Disconnected {
        handle: ConnectionHandle,
        reason: ErrorCode,
        description: Option<String>,
    },

    /// Listener is up
    ServerStarted,

    /// Listener stopped and every server connection is gone
    ServerStopped,
}

impl WebsocketEvent {
    /// Connection the event refers to, if any
    pub fn handle(&self) -> Option<ConnectionHandle> {
        match self {
            Self::Connected { handle }
            | Self::Received { handle, .. }
            | Self::Sendable { handle }
            | Self::Disconnected { handle, .. } => Some(*handle),
            Self::ServerStarted | Self::ServerStopped => None,
        }
    }
}

/// Sending half of the event channel
#[derive(Debug, Clone)]
pub struct EventSender {
    inner: mpsc::UnboundedSender<WebsocketEvent>,
}

/// Receiving half of the event channel
pub type EventReceiver = mpsc::UnboundedReceiver<WebsocketEvent>;

/// Create a channel for connection manager events
pub fn event_channel() -> (EventSender, EventReceiver) {
    let (inner, rx) = mpsc::unbounded_channel();
    (EventSender { inner }, rx)
}

impl EventSender {
    /// Post an event; a dropped receiver is not an error
    pub(crate) fn emit(&self, event: WebsocketEvent) {
        if let Err(e) = self.inner.send(event) {
            trace!("event receiver gone, dropping {:?}", e.0);
        }
    }
}
