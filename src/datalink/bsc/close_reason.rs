//! WebSocket close status codes (RFC 6455 §7.4) and their translation into
//! BACnet error codes.

use std::fmt;

use super::error::ErrorCode;

/// Status code carried by a WebSocket close frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CloseStatus(pub u16);

impl CloseStatus {
    /// Normal closure
    pub const NORMAL: Self = Self(1000);
    /// Endpoint is going away
    pub const GOING_AWAY: Self = Self(1001);
    /// Protocol error
    pub const PROTOCOL_ERROR: Self = Self(1002);
    /// Received a data type it cannot accept
    pub const UNACCEPTABLE_OPCODE: Self = Self(1003);
    /// Reserved
    pub const RESERVED: Self = Self(1004);
    /// No status code was present
    pub const NO_STATUS: Self = Self(1005);
    /// Connection dropped without a close frame
    pub const ABNORMAL: Self = Self(1006);
    /// Payload inconsistent with the message type
    pub const INVALID_PAYLOAD: Self = Self(1007);
    /// Policy violation
    pub const POLICY_VIOLATION: Self = Self(1008);
    /// Message too big to process
    pub const MESSAGE_TOO_LARGE: Self = Self(1009);
    /// Client expected an extension the server did not negotiate
    pub const EXTENSION_REQUIRED: Self = Self(1010);
    /// Server hit an unexpected condition
    pub const UNEXPECTED_CONDITION: Self = Self(1011);
    /// TLS handshake failure
    pub const TLS_FAILURE: Self = Self(1015);

    /// Raw status code
    pub fn code(&self) -> u16 {
        self.0
    }
}

impl From<u16> for CloseStatus {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

impl fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Map a close status to the BACnet error code reported on disconnect.
///
/// `None` stands for a connection that ended without any status. Every input
/// yields exactly one code; unknown statuses map to
/// [`ErrorCode::WebsocketError`].
pub fn error_code_for(status: Option<CloseStatus>) -> ErrorCode {
    let Some(status) = status else {
        return ErrorCode::WebsocketError;
    };
    match status {
        CloseStatus::NORMAL => ErrorCode::ClosedByPeer,
        CloseStatus::GOING_AWAY => ErrorCode::EndpointLeaves,
        CloseStatus::PROTOCOL_ERROR => ErrorCode::ProtocolError,
        CloseStatus::UNACCEPTABLE_OPCODE => ErrorCode::DataNotAccepted,
        CloseStatus::ABNORMAL => ErrorCode::DataNotAccepted,
        CloseStatus::INVALID_PAYLOAD => ErrorCode::DataInconsistent,
        CloseStatus::POLICY_VIOLATION => ErrorCode::DataAgainstPolicy,
        CloseStatus::MESSAGE_TOO_LARGE => ErrorCode::FrameTooLong,
        CloseStatus::EXTENSION_REQUIRED => ErrorCode::ExtensionMissing,
        CloseStatus::UNEXPECTED_CONDITION => ErrorCode::RequestUnavailable,
        CloseStatus::TLS_FAILURE => ErrorCode::TlsError,
        _ => ErrorCode::WebsocketError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_mapping_table() {
        let table = [
            (CloseStatus::NORMAL, ErrorCode::ClosedByPeer),
            (CloseStatus::GOING_AWAY, ErrorCode::EndpointLeaves),
            (CloseStatus::PROTOCOL_ERROR, ErrorCode::ProtocolError),
            (CloseStatus::UNACCEPTABLE_OPCODE, ErrorCode::DataNotAccepted),
            (CloseStatus::ABNORMAL, ErrorCode::DataNotAccepted),
            (CloseStatus::INVALID_PAYLOAD, ErrorCode::DataInconsistent),
            (CloseStatus::POLICY_VIOLATION, ErrorCode::DataAgainstPolicy),
            (CloseStatus::MESSAGE_TOO_LARGE, ErrorCode::FrameTooLong),
            (CloseStatus::EXTENSION_REQUIRED, ErrorCode::ExtensionMissing),
            (CloseStatus::UNEXPECTED_CONDITION, ErrorCode::RequestUnavailable),
            (CloseStatus::TLS_FAILURE, ErrorCode::TlsError),
        ];
        for (status, code) in table {
            assert_eq!(error_code_for(Some(status)), code, "status {}", status);
        }
    }

    #[test]
    fn test_no_status_and_reserved() {
        assert_eq!(error_code_for(None), ErrorCode::WebsocketError);
        assert_eq!(error_code_for(Some(CloseStatus::NO_STATUS)), ErrorCode::WebsocketError);
        assert_eq!(error_code_for(Some(CloseStatus::RESERVED)), ErrorCode::WebsocketError);
        assert_eq!(error_code_for(Some(CloseStatus(2000))), ErrorCode::WebsocketError);
    }

    proptest! {
        #[test]
        fn mapping_is_total_and_stable(code in any::<u16>()) {
            let first = error_code_for(Some(CloseStatus(code)));
            let second = error_code_for(Some(CloseStatus(code)));
            prop_assert_eq!(first, second);
            prop_assert_ne!(first, ErrorCode::Success);
        }
    }
}
