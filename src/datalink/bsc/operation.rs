//! Queued operation records
//!
//! An operation is created by the calling thread, parked on its connection
//! (or on the context for accepts) and completed by the event loop. The
//! caller keeps the [`Completion`] half and waits on it.

use std::collections::VecDeque;

use bytes::Bytes;

use super::completion::{self, Completer, Completion};
use super::error::{Result, WebsocketError};

/// Outbound payload waiting for the engine
pub(crate) struct SendOp {
    pub payload: Bytes,
    pub completer: Completer<()>,
}

/// Send side of a connection
///
/// At most one send is in flight per connection. `Requested` and
/// `Permitted` belong to the two-phase path (`send_request` then
/// `dispatch_send`), `Pending` to the one-shot `send`, and `Ready` holds a
/// payload whose write was already permitted.
#[derive(Default)]
pub(crate) enum SendState {
    #[default]
    Idle,
    Requested,
    Permitted,
    Pending(SendOp),
    Ready(SendOp),
}

impl SendState {
    pub(crate) fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Whether the loop must ask the engine for a write-ready notification
    pub(crate) fn wants_writable(&self) -> bool {
        matches!(self, Self::Requested | Self::Pending(_))
    }

    /// Complete any queued payload with `error` and go back to idle
    pub(crate) fn fail(&mut self, error: WebsocketError) {
        if let Self::Pending(op) | Self::Ready(op) = std::mem::take(self) {
            op.completer.complete(Err(error));
        }
    }
}

impl SendOp {
    pub(crate) fn new(payload: Bytes) -> (Self, Completion<()>) {
        let (completer, completion) = completion::channel();
        (Self { payload, completer }, completion)
    }
}

/// FIFO of operations sharing one completion type
///
/// Used for receive requests on a connection, connect waiters, and accept
/// requests on a listening context.
pub(crate) struct OpQueue<T> {
    ops: VecDeque<Completer<T>>,
}

impl<T> Default for OpQueue<T> {
    fn default() -> Self {
        Self {
            ops: VecDeque::new(),
        }
    }
}

impl<T> OpQueue<T> {
    /// Queue a new operation and return the caller's half
    pub(crate) fn enqueue(&mut self) -> Completion<T> {
        let (completer, completion) = completion::channel();
        self.push(completer);
        completion
    }

    pub(crate) fn push(&mut self, completer: Completer<T>) {
        self.ops.retain(|op| !op.is_abandoned());
        self.ops.push_back(completer);
    }

    /// Oldest operation whose caller is still waiting
    pub(crate) fn pop(&mut self) -> Option<Completer<T>> {
        while let Some(op) = self.ops.pop_front() {
            if !op.is_abandoned() {
                return Some(op);
            }
        }
        None
    }

    /// Remove the operation belonging to `completion`
    ///
    /// Returns false if the loop already took it.
    pub(crate) fn cancel(&mut self, completion: &Completion<T>) -> bool {
        let before = self.ops.len();
        self.ops.retain(|op| !op.is_for(completion));
        self.ops.len() != before
    }

    /// Complete every queued operation with `error`
    pub(crate) fn drain(&mut self, error: WebsocketError) {
        for op in self.ops.drain(..) {
            op.complete(Err(error));
        }
    }

    /// Complete every queued operation with a clone of `result`
    pub(crate) fn complete_all(&mut self, result: Result<T>)
    where
        T: Clone,
    {
        for op in self.ops.drain(..) {
            op.complete(result.clone());
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.ops.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_is_fifo_and_skips_abandoned() {
        let mut queue = OpQueue::<u8>::default();
        let (a, a_rx) = completion::channel();
        let (b, b_rx) = completion::channel();
        let (c, c_rx) = completion::channel();
        queue.push(a);
        queue.push(b);
        queue.push(c);
        drop(b_rx);

        queue.pop().unwrap().complete(Ok(1));
        queue.pop().unwrap().complete(Ok(2));
        assert!(queue.pop().is_none());
        assert_eq!(a_rx.try_take(), Some(Ok(1)));
        assert_eq!(c_rx.try_take(), Some(Ok(2)));
    }

    #[test]
    fn test_cancel_and_drain() {
        let mut queue = OpQueue::<()>::default();
        let a_rx = queue.enqueue();
        let b_rx = queue.enqueue();
        assert_eq!(queue.len(), 2);
        assert!(queue.cancel(&a_rx));
        assert!(!queue.cancel(&a_rx));
        queue.drain(WebsocketError::Closed);
        assert!(queue.is_empty());
        assert_eq!(b_rx.try_take(), Some(Err(WebsocketError::Closed)));
    }

    #[test]
    fn test_send_state_fail() {
        let (op, rx) = SendOp::new(Bytes::from_static(b"x"));
        let mut state = SendState::Pending(op);
        assert!(state.wants_writable());
        state.fail(WebsocketError::Closed);
        assert!(state.is_idle());
        assert_eq!(rx.try_take(), Some(Err(WebsocketError::Closed)));
    }
}
