//! Result taxonomy of the connection manager and the BACnet error codes
//! reported as disconnect reasons.

use std::fmt;

use thiserror::Error;

/// Result type for connection manager operations
pub type Result<T> = std::result::Result<T, WebsocketError>;

/// Errors returned by connection manager operations
///
/// Parameter and state-precondition errors are returned before any engine
/// interaction. Asynchronous failures surface as [`WebsocketError::Closed`]
/// on the in-flight call, with the detailed reason carried by the
/// disconnect event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum WebsocketError {
    /// An argument or handle was invalid
    #[error("bad parameter")]
    BadParam,

    /// Table full, thread or engine could not be created
    #[error("no resources")]
    NoResources,

    /// The operation is not allowed in the current state
    #[error("invalid operation")]
    InvalidOperation,

    /// Another operation of the same kind is already pending on the handle
    #[error("operation in progress")]
    OperationInProgress,

    /// The deadline elapsed before the operation completed
    #[error("operation timed out")]
    TimedOut,

    /// The connection was closed locally, by the peer, or by server shutdown
    #[error("websocket closed")]
    Closed,

    /// The received message did not fit the caller's buffer
    #[error("buffer too small")]
    BufferTooSmall,

    /// The operation was canceled before it completed
    #[error("operation canceled")]
    OperationCanceled,
}

/// BACnet error codes used as disconnect reasons
///
/// A subset of `BACnetErrorCode` covering the WebSocket and TLS failures of
/// Annex AB, plus [`ErrorCode::Success`] for a locally requested disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorCode {
    /// No error; the connection was closed on local request
    Success,
    /// WEBSOCKET_CLOSED_BY_PEER
    ClosedByPeer,
    /// WEBSOCKET_ENDPOINT_LEAVES
    EndpointLeaves,
    /// WEBSOCKET_PROTOCOL_ERROR
    ProtocolError,
    /// WEBSOCKET_DATA_NOT_ACCEPTED
    DataNotAccepted,
    /// WEBSOCKET_DATA_INCONSISTENT
    DataInconsistent,
    /// WEBSOCKET_DATA_AGAINST_POLICY
    DataAgainstPolicy,
    /// WEBSOCKET_FRAME_TOO_LONG
    FrameTooLong,
    /// WEBSOCKET_EXTENSION_MISSING
    ExtensionMissing,
    /// WEBSOCKET_REQUEST_UNAVAILABLE
    RequestUnavailable,
    /// TLS_ERROR
    TlsError,
    /// WEBSOCKET_ERROR, any other transport failure
    WebsocketError,
    /// TIMEOUT, connect or handshake deadline elapsed
    Timeout,
    /// OUT_OF_MEMORY, a reassembly buffer could not grow
    OutOfMemory,
}

impl ErrorCode {
    /// Name used by the BACnet standard for this error code
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ClosedByPeer => "websocket-closed-by-peer",
            Self::EndpointLeaves => "websocket-endpoint-leaves",
            Self::ProtocolError => "websocket-protocol-error",
            Self::DataNotAccepted => "websocket-data-not-accepted",
            Self::DataInconsistent => "websocket-data-inconsistent",
            Self::DataAgainstPolicy => "websocket-data-against-policy",
            Self::FrameTooLong => "websocket-frame-too-long",
            Self::ExtensionMissing => "websocket-extension-missing",
            Self::RequestUnavailable => "websocket-request-unavailable",
            Self::TlsError => "tls-error",
            Self::WebsocketError => "websocket-error",
            Self::Timeout => "timeout",
            Self::OutOfMemory => "out-of-memory",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
