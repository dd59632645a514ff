//! Inbound fragment reassembly
//!
//! Fragments of one WebSocket message accumulate in a growable buffer until
//! the final fragment arrives; the complete message is then handed out and
//! the buffer length reset. Capacity is kept for the next message.
//!
//! Engines built on tungstenite reassemble messages themselves and always
//! report `fin`; such a whole message passes through [`FragmentBuffer::push_frame`]
//! without being copied.

use bytes::Bytes;
use thiserror::Error;

use super::close_reason::CloseStatus;
use super::error::ErrorCode;

/// WebSocket data frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Binary,
    Text,
}

/// Reasons a fragment is refused; each one closes the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReassemblyError {
    /// Only binary frames carry BVLC-SC messages
    #[error("non-binary frame")]
    NotBinary,

    /// The message would exceed the configured maximum size
    #[error("message of {0} bytes exceeds limit")]
    TooLarge(usize),

    /// The buffer could not grow
    #[error("out of memory")]
    OutOfMemory,
}

impl ReassemblyError {
    /// Close status sent to the peer
    pub fn close_status(&self) -> CloseStatus {
        match self {
            Self::NotBinary => CloseStatus::UNACCEPTABLE_OPCODE,
            Self::TooLarge(_) => CloseStatus::MESSAGE_TOO_LARGE,
            Self::OutOfMemory => CloseStatus::MESSAGE_TOO_LARGE,
        }
    }

    /// Reason reported with the disconnect event
    pub fn reason(&self) -> ErrorCode {
        match self {
            Self::NotBinary => ErrorCode::DataNotAccepted,
            Self::TooLarge(_) => ErrorCode::FrameTooLong,
            Self::OutOfMemory => ErrorCode::OutOfMemory,
        }
    }
}

/// Per-connection reassembly buffer
#[derive(Debug)]
pub struct FragmentBuffer {
    buf: Vec<u8>,
    initial_capacity: usize,
    max_size: usize,
}

impl FragmentBuffer {
    /// Create an empty buffer; memory is reserved on the first fragment
    pub fn new(initial_capacity: usize, max_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            initial_capacity,
            max_size,
        }
    }

    /// Bytes of the message assembled so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Append one fragment
    ///
    /// Returns the complete message when `fin` is set. On error the partial
    /// message is discarded.
    pub fn push(
        &mut self,
        kind: FrameKind,
        fin: bool,
        data: &[u8],
    ) -> Result<Option<Bytes>, ReassemblyError> {
        if kind != FrameKind::Binary {
            self.buf.clear();
            return Err(ReassemblyError::NotBinary);
        }
        let total = self.buf.len() + data.len();
        if total > self.max_size {
            self.buf.clear();
            return Err(ReassemblyError::TooLarge(total));
        }
        if total > self.buf.capacity() {
            let wanted = total.max(self.initial_capacity);
            if self.buf.try_reserve(wanted - self.buf.len()).is_err() {
                self.buf = Vec::new();
                return Err(ReassemblyError::OutOfMemory);
            }
        }
        self.buf.extend_from_slice(data);
        if !fin {
            return Ok(None);
        }
        let message = Bytes::copy_from_slice(&self.buf);
        self.buf.clear();
        Ok(Some(message))
    }

    /// Append one owned frame
    ///
    /// A final frame with nothing buffered before it is handed back as is.
    pub fn push_frame(
        &mut self,
        kind: FrameKind,
        fin: bool,
        payload: Bytes,
    ) -> Result<Option<Bytes>, ReassemblyError> {
        if !(fin && self.buf.is_empty()) {
            return self.push(kind, fin, &payload);
        }
        if kind != FrameKind::Binary {
            return Err(ReassemblyError::NotBinary);
        }
        if payload.len() > self.max_size {
            return Err(ReassemblyError::TooLarge(payload.len()));
        }
        Ok(Some(payload))
    }

    /// Drop any partial message and its memory
    pub fn reset(&mut self) {
        self.buf = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_single_frame() {
        let mut buf = FragmentBuffer::new(16, 1024);
        let msg = buf.push(FrameKind::Binary, true, b"hello").unwrap();
        assert_eq!(msg.as_deref(), Some(&b"hello"[..]));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_never_delivered() {
        let mut buf = FragmentBuffer::new(4, 1024);
        for _ in 0..10 {
            assert_eq!(buf.push(FrameKind::Binary, false, b"abc").unwrap(), None);
        }
        assert_eq!(buf.len(), 30);
    }

    #[test]
    fn test_capacity_retained() {
        let mut buf = FragmentBuffer::new(4096, 64 * 1024);
        buf.push(FrameKind::Binary, true, &[1u8; 100]).unwrap();
        assert!(buf.capacity() >= 4096);
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_grows_past_initial_capacity() {
        let mut buf = FragmentBuffer::new(8, 1024);
        buf.push(FrameKind::Binary, false, &[0u8; 8]).unwrap();
        let msg = buf.push(FrameKind::Binary, true, &[1u8; 8]).unwrap().unwrap();
        assert_eq!(msg.len(), 16);
        assert_eq!(&msg[8..], &[1u8; 8]);
    }

    #[test]
    fn test_whole_frame_passes_through() {
        let mut buf = FragmentBuffer::new(4096, 64);
        let payload = Bytes::from(vec![7u8; 48]);
        let msg = buf.push_frame(FrameKind::Binary, true, payload.clone()).unwrap().unwrap();
        assert_eq!(msg.as_ptr(), payload.as_ptr());
        assert_eq!(buf.capacity(), 0);

        let err = buf
            .push_frame(FrameKind::Binary, true, Bytes::from(vec![0u8; 65]))
            .unwrap_err();
        assert_eq!(err, ReassemblyError::TooLarge(65));
        assert_eq!(
            buf.push_frame(FrameKind::Text, true, Bytes::from_static(b"hi")),
            Err(ReassemblyError::NotBinary)
        );
    }

    #[test]
    fn test_owned_fragments_still_reassemble() {
        let mut buf = FragmentBuffer::new(16, 1024);
        assert_eq!(
            buf.push_frame(FrameKind::Binary, false, Bytes::from_static(b"ab")),
            Ok(None)
        );
        let msg = buf
            .push_frame(FrameKind::Binary, true, Bytes::from_static(b"cd"))
            .unwrap();
        assert_eq!(msg.as_deref(), Some(&b"abcd"[..]));
    }

    #[test]
    fn test_text_rejected() {
        let mut buf = FragmentBuffer::new(16, 1024);
        buf.push(FrameKind::Binary, false, b"partial").unwrap();
        let err = buf.push(FrameKind::Text, true, b"hi").unwrap_err();
        assert_eq!(err, ReassemblyError::NotBinary);
        assert_eq!(err.reason(), ErrorCode::DataNotAccepted);
        assert_eq!(err.close_status(), CloseStatus::UNACCEPTABLE_OPCODE);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_too_large() {
        let mut buf = FragmentBuffer::new(16, 32);
        buf.push(FrameKind::Binary, false, &[0u8; 20]).unwrap();
        let err = buf.push(FrameKind::Binary, true, &[0u8; 20]).unwrap_err();
        assert_eq!(err, ReassemblyError::TooLarge(40));
        assert_eq!(err.reason(), ErrorCode::FrameTooLong);
        assert_eq!(err.close_status(), CloseStatus::MESSAGE_TOO_LARGE);
    }

    proptest! {
        #[test]
        fn reassembled_message_is_concatenation(
            fragments in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..300), 1..12)
        ) {
            let mut buf = FragmentBuffer::new(64, usize::MAX);
            let last = fragments.len() - 1;
            let mut delivered = None;
            for (i, fragment) in fragments.iter().enumerate() {
                let out = buf.push(FrameKind::Binary, i == last, fragment).unwrap();
                if i < last {
                    prop_assert!(out.is_none());
                } else {
                    delivered = out;
                }
            }
            let expected: Vec<u8> = fragments.concat();
            prop_assert_eq!(delivered.unwrap().to_vec(), expected);
        }
    }
}
