//! Context state shared by caller threads and the event loop
//!
//! Two locks are involved. Every connection record lives in a context and
//! is only touched while that context's lock is held. Engine context
//! creation and teardown are additionally serialized by one process-wide
//! engine lock. The engine lock is only reachable by giving up the context
//! lock first ([`ContextGuard::into_engine_lock`]), so no thread ever holds
//! both in the order context then engine.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::sync::{MutexGuard as StdMutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::debug;

use super::close_reason::CloseStatus;
use super::completion::Completion;
use super::config::TableLimits;
use super::dispatch::EventSender;
use super::engine::{EngineWaker, SessionId, CLOSE_LINGER};
use super::error::{ErrorCode, Result, WebsocketError};
use super::handle::{ConnectionHandle, ConnectionTable};
use super::mutex::{Mutex, MutexGuard};
use super::operation::{OpQueue, SendOp, SendState};
use super::reassembly::FragmentBuffer;
use super::state::{ConnectionRole, ConnectionState};

/// Serializes engine context creation and teardown across all contexts
static ENGINE_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// One connection table slot
pub(crate) struct ConnectionRecord {
    pub role: ConnectionRole,
    pub state: ConnectionState,
    pub session: Option<SessionId>,
    pub peer: Option<SocketAddr>,
    pub send: SendState,
    /// End of an unused SENDABLE permission
    pub permit_deadline: Option<Instant>,
    /// A write-ready notification was requested and not yet reported
    pub writable_armed: bool,
    pub recv_queue: OpQueue<Bytes>,
    pub connect_waiters: OpQueue<()>,
    pub fragment: FragmentBuffer,
    pub events: EventSender,
    pub waker: Option<EngineWaker>,
    /// First recorded disconnect reason
    pub reason: Option<ErrorCode>,
    pub description: Option<String>,
    /// Status sent in our close frame
    pub close_status: CloseStatus,
    pub close_sent: bool,
    /// Connect deadline while connecting, close deadline while disconnecting
    pub deadline: Option<Instant>,
    pub timeout: Duration,
    /// Caller threads blocked on this handle
    pub waiters: usize,
    pub ever_connected: bool,
}

impl ConnectionRecord {
    pub(crate) fn new(
        role: ConnectionRole,
        state: ConnectionState,
        events: EventSender,
        timeout: Duration,
        limits: &TableLimits,
    ) -> Self {
        Self {
            role,
            state,
            session: None,
            peer: None,
            send: SendState::Idle,
            permit_deadline: None,
            writable_armed: false,
            recv_queue: OpQueue::default(),
            connect_waiters: OpQueue::default(),
            fragment: FragmentBuffer::new(limits.rx_buffer_size, limits.max_message_size),
            events,
            waker: None,
            reason: None,
            description: None,
            close_status: CloseStatus::NORMAL,
            close_sent: false,
            deadline: None,
            timeout,
            waiters: 0,
            ever_connected: false,
        }
    }

    pub(crate) fn wake(&self) {
        if let Some(waker) = &self.waker {
            waker.wake();
        }
    }

    /// Record the first disconnect reason
    pub(crate) fn set_reason(&mut self, reason: ErrorCode, description: Option<String>) {
        if self.reason.is_none() {
            self.reason = Some(reason);
        }
        if self.description.is_none() {
            self.description = description;
        }
    }

    /// Complete every queued operation with `error`
    pub(crate) fn drain(&mut self, error: WebsocketError) {
        self.send.fail(error);
        self.recv_queue.drain(error);
        self.connect_waiters.drain(error);
    }

    /// Move to DISCONNECTING
    ///
    /// Queued operations complete with `Closed` right away; the event loop
    /// sends the close frame on its next pass.
    pub(crate) fn begin_disconnect(
        &mut self,
        reason: ErrorCode,
        status: CloseStatus,
        now: Instant,
    ) {
        if self.state.is_closing() {
            return;
        }
        debug!("connection {:?} disconnecting: {}", self.session, reason);
        self.set_reason(reason, None);
        self.close_status = status;
        self.state = ConnectionState::Disconnecting;
        self.deadline = Some(now + CLOSE_LINGER);
        self.writable_armed = false;
        self.fragment.reset();
        self.drain(WebsocketError::Closed);
    }

    /// Gate for operations that need a live connection
    fn check_open(&self) -> Result<()> {
        if self.state.is_closing() {
            return Err(WebsocketError::Closed);
        }
        Ok(())
    }

    fn check_connected(&self) -> Result<()> {
        self.check_open()?;
        if self.state != ConnectionState::Connected {
            return Err(WebsocketError::InvalidOperation);
        }
        Ok(())
    }
}

/// Everything guarded by the context lock
pub(crate) struct ContextState {
    pub table: ConnectionTable<ConnectionRecord>,
    /// Pending accept calls, oldest first
    pub accepts: OpQueue<ConnectionHandle>,
    /// Server connections that reached CONNECTED before anyone accepted them
    pub ready: VecDeque<ConnectionHandle>,
    pub stopping: bool,
    /// Waker of the listening engine
    pub waker: Option<EngineWaker>,
}

impl ContextState {
    /// Record for `handle` if operations are allowed on it
    pub(crate) fn record(&mut self, handle: ConnectionHandle) -> Result<&mut ConnectionRecord> {
        if self.stopping {
            return Err(WebsocketError::InvalidOperation);
        }
        self.table.lookup(handle)
    }

    /// Oldest connection waiting to be accepted
    pub(crate) fn pop_ready(&mut self) -> Option<ConnectionHandle> {
        while let Some(handle) = self.ready.pop_front() {
            if self
                .table
                .get(handle)
                .is_some_and(|r| r.state == ConnectionState::Connected)
            {
                return Some(handle);
            }
        }
        None
    }

    pub(crate) fn push_ready(&mut self, handle: ConnectionHandle) {
        let table = &self.table;
        self.ready.retain(|h| table.get(*h).is_some());
        self.ready.push_back(handle);
    }

    pub(crate) fn wake(&self) {
        if let Some(waker) = &self.waker {
            waker.wake();
        }
    }
}

/// Connection table plus the state shared with its event loop(s)
pub(crate) struct Context {
    state: Mutex<ContextState>,
    limits: TableLimits,
}

impl Context {
    pub(crate) fn new(capacity: usize, limits: TableLimits) -> Self {
        Self {
            state: Mutex::new(ContextState {
                table: ConnectionTable::with_capacity(capacity),
                accepts: OpQueue::default(),
                ready: VecDeque::new(),
                stopping: false,
                waker: None,
            }),
            limits,
        }
    }

    pub(crate) fn limits(&self) -> &TableLimits {
        &self.limits
    }

    pub(crate) fn lock(&self, purpose: &'static str) -> ContextGuard<'_> {
        ContextGuard {
            context: self,
            state: self.state.lock(purpose),
        }
    }

    pub(crate) fn state_of(&self, handle: ConnectionHandle) -> Option<ConnectionState> {
        self.lock("state").table.get(handle).map(|r| r.state)
    }

    pub(crate) fn peer_addr(&self, handle: ConnectionHandle) -> Option<SocketAddr> {
        self.lock("peer address").table.get(handle).and_then(|r| r.peer)
    }

    /// Register the calling thread as blocked on `handle`
    fn enter(&self, record: &mut ConnectionRecord, handle: ConnectionHandle) -> Waiter<'_> {
        record.waiters += 1;
        Waiter {
            context: self,
            handle,
        }
    }

    fn leave(&self, handle: ConnectionHandle) {
        let mut guard = self.lock("leave");
        let Some(record) = guard.table.get_mut(handle) else {
            return;
        };
        record.waiters = record.waiters.saturating_sub(1);
        if record.waiters == 0 && record.state == ConnectionState::Disconnected {
            debug!("connection {} released by last waiter", handle);
            guard.table.release(handle);
        }
    }

    /// Queue `payload` and block until the engine took it
    pub(crate) fn send(&self, handle: ConnectionHandle, payload: Bytes) -> Result<()> {
        let (completion, deadline, _waiter) = {
            let mut guard = self.lock("send");
            let record = guard.record(handle)?;
            record.check_connected()?;
            if !record.send.is_idle() {
                return Err(WebsocketError::OperationInProgress);
            }
            let (op, completion) = SendOp::new(payload);
            record.send = SendState::Pending(op);
            record.wake();
            let deadline = Instant::now() + record.timeout;
            (completion, deadline, self.enter(record, handle))
        };
        self.finish_send(handle, completion, Some(deadline))
    }

    #[cfg(feature = "async")]
    pub(crate) async fn send_async(&self, handle: ConnectionHandle, payload: Bytes) -> Result<()> {
        let (completion, _waiter) = {
            let mut guard = self.lock("send");
            let record = guard.record(handle)?;
            record.check_connected()?;
            if !record.send.is_idle() {
                return Err(WebsocketError::OperationInProgress);
            }
            let (op, completion) = SendOp::new(payload);
            record.send = SendState::Pending(op);
            record.wake();
            (completion, self.enter(record, handle))
        };
        completion.await
    }

    /// Ask for a SENDABLE event
    pub(crate) fn send_request(&self, handle: ConnectionHandle) -> Result<()> {
        let mut guard = self.lock("send request");
        let record = guard.record(handle)?;
        record.check_connected()?;
        if !record.send.is_idle() {
            return Err(WebsocketError::OperationInProgress);
        }
        record.send = SendState::Requested;
        record.wake();
        Ok(())
    }

    /// Write `payload` using the permission granted by a SENDABLE event
    pub(crate) fn dispatch_send(&self, handle: ConnectionHandle, payload: Bytes) -> Result<()> {
        let (completion, deadline, _waiter) = {
            let mut guard = self.lock("dispatch send");
            let record = guard.record(handle)?;
            record.check_connected()?;
            if !matches!(record.send, SendState::Permitted) {
                return Err(WebsocketError::InvalidOperation);
            }
            let (op, completion) = SendOp::new(payload);
            record.send = SendState::Ready(op);
            record.wake();
            let deadline = Instant::now() + record.timeout;
            (completion, deadline, self.enter(record, handle))
        };
        self.finish_send(handle, completion, Some(deadline))
    }

    fn finish_send(
        &self,
        handle: ConnectionHandle,
        completion: Completion<()>,
        deadline: Option<Instant>,
    ) -> Result<()> {
        if let Some(result) = completion.wait(deadline) {
            return result;
        }
        let mut guard = self.lock("send timeout");
        if let Some(record) = guard.table.get_mut(handle) {
            let ours = match &record.send {
                SendState::Pending(op) | SendState::Ready(op) => op.completer.is_for(&completion),
                _ => false,
            };
            if ours {
                record.send = SendState::Idle;
                return Err(WebsocketError::TimedOut);
            }
        }
        completion.try_take().unwrap_or(Err(WebsocketError::TimedOut))
    }

    /// Block until the next complete message on `handle` or `timeout`
    pub(crate) fn recv_message(
        &self,
        handle: ConnectionHandle,
        timeout: Duration,
    ) -> Result<Bytes> {
        let deadline = Instant::now() + timeout;
        let (completion, _waiter) = {
            let mut guard = self.lock("recv");
            let record = guard.record(handle)?;
            record.check_open()?;
            let completion = record.recv_queue.enqueue();
            (completion, self.enter(record, handle))
        };
        if let Some(result) = completion.wait(Some(deadline)) {
            return result;
        }
        let mut guard = self.lock("recv timeout");
        if let Some(record) = guard.table.get_mut(handle) {
            if record.recv_queue.cancel(&completion) {
                return Err(WebsocketError::TimedOut);
            }
        }
        drop(guard);
        completion.try_take().unwrap_or(Err(WebsocketError::TimedOut))
    }

    /// Receive into `buf`; a longer message is truncated
    pub(crate) fn recv(
        &self,
        handle: ConnectionHandle,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let message = self.recv_message(handle, timeout)?;
        let n = message.len().min(buf.len());
        buf[..n].copy_from_slice(&message[..n]);
        if n < message.len() {
            return Err(WebsocketError::BufferTooSmall);
        }
        Ok(n)
    }

    #[cfg(feature = "async")]
    pub(crate) async fn recv_async(&self, handle: ConnectionHandle) -> Result<Bytes> {
        let (completion, _waiter) = {
            let mut guard = self.lock("recv");
            let record = guard.record(handle)?;
            record.check_open()?;
            let completion = record.recv_queue.enqueue();
            (completion, self.enter(record, handle))
        };
        completion.await
    }

    /// Block until `handle` is CONNECTED or the connect deadline passes
    pub(crate) fn wait_connected(&self, handle: ConnectionHandle) -> Result<()> {
        let (completion, deadline, _waiter) = {
            let mut guard = self.lock("wait connected");
            let record = guard.record(handle)?;
            record.check_open()?;
            if record.state == ConnectionState::Connected {
                return Ok(());
            }
            let deadline = record
                .deadline
                .unwrap_or_else(|| Instant::now() + record.timeout);
            let completion = record.connect_waiters.enqueue();
            (completion, deadline, self.enter(record, handle))
        };
        // the event loop closes the connection at the same deadline
        if let Some(result) = completion.wait(Some(deadline + CLOSE_LINGER)) {
            return result;
        }
        let mut guard = self.lock("wait connected timeout");
        if let Some(record) = guard.table.get_mut(handle) {
            if record.connect_waiters.cancel(&completion) {
                return Err(WebsocketError::TimedOut);
            }
        }
        drop(guard);
        completion.try_take().unwrap_or(Err(WebsocketError::TimedOut))
    }

    /// Start closing `handle`; queued operations complete with `Closed`
    pub(crate) fn disconnect(&self, handle: ConnectionHandle) -> Result<()> {
        let mut guard = self.lock("disconnect");
        let record = guard.record(handle)?;
        if record.state.is_closing() {
            return Ok(());
        }
        record.begin_disconnect(ErrorCode::Success, CloseStatus::NORMAL, Instant::now());
        record.wake();
        Ok(())
    }

    /// Block until a server connection reaches CONNECTED
    pub(crate) fn accept(&self, timeout: Option<Duration>) -> Result<ConnectionHandle> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let completion = {
            let mut guard = self.lock("accept");
            if guard.stopping {
                return Err(WebsocketError::InvalidOperation);
            }
            if let Some(handle) = guard.pop_ready() {
                return Ok(handle);
            }
            guard.accepts.enqueue()
        };
        if let Some(result) = completion.wait(deadline) {
            return result;
        }
        let mut guard = self.lock("accept timeout");
        if guard.accepts.cancel(&completion) {
            return Err(WebsocketError::TimedOut);
        }
        drop(guard);
        completion.try_take().unwrap_or(Err(WebsocketError::TimedOut))
    }

    #[cfg(feature = "async")]
    pub(crate) async fn accept_async(&self) -> Result<ConnectionHandle> {
        let completion = {
            let mut guard = self.lock("accept");
            if guard.stopping {
                return Err(WebsocketError::InvalidOperation);
            }
            if let Some(handle) = guard.pop_ready() {
                return Ok(handle);
            }
            guard.accepts.enqueue()
        };
        completion.await
    }

    pub(crate) fn cancel_accept(&self) {
        self.lock("cancel accept")
            .accepts
            .drain(WebsocketError::OperationCanceled);
    }
}

/// Held by a caller thread while it waits on a handle
struct Waiter<'a> {
    context: &'a Context,
    handle: ConnectionHandle,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.context.leave(self.handle);
    }
}

/// Proof that the context lock is held
pub(crate) struct ContextGuard<'a> {
    context: &'a Context,
    state: MutexGuard<'a, ContextState>,
}

impl<'a> ContextGuard<'a> {
    /// Release the context lock and take the process-wide engine lock
    pub(crate) fn into_engine_lock(self) -> EngineLockGuard<'a> {
        let context = self.context;
        drop(self);
        EngineLockGuard {
            context,
            _engine: ENGINE_LOCK.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

impl Deref for ContextGuard<'_> {
    type Target = ContextState;

    fn deref(&self) -> &ContextState {
        &self.state
    }
}

impl DerefMut for ContextGuard<'_> {
    fn deref_mut(&mut self) -> &mut ContextState {
        &mut self.state
    }
}

/// Process-wide engine lock, held without any context lock
///
/// Only obtainable from [`ContextGuard::into_engine_lock`].
pub(crate) struct EngineLockGuard<'a> {
    context: &'a Context,
    _engine: StdMutexGuard<'static, ()>,
}

impl<'a> EngineLockGuard<'a> {
    /// Release the engine lock and take the context lock again
    pub(crate) fn relock(self, purpose: &'static str) -> ContextGuard<'a> {
        let context = self.context;
        drop(self);
        context.lock(purpose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datalink::bsc::config::WebsocketProtocol;
    use crate::datalink::bsc::dispatch::event_channel;
    use std::sync::Arc;
    use std::thread;

    fn context_with_connection(state: ConnectionState) -> (Arc<Context>, ConnectionHandle) {
        let context = Arc::new(Context::new(2, TableLimits::default()));
        let (events, _rx) = event_channel();
        let record = ConnectionRecord::new(
            ConnectionRole::Client(WebsocketProtocol::Hub),
            state,
            events,
            Duration::from_secs(1),
            context.limits(),
        );
        let handle = context.lock("test").table.allocate(record).unwrap();
        (context, handle)
    }

    #[test]
    fn test_send_request_twice() {
        let (context, handle) = context_with_connection(ConnectionState::Connected);
        context.send_request(handle).unwrap();
        assert_eq!(
            context.send_request(handle).unwrap_err(),
            WebsocketError::OperationInProgress
        );
        assert!(matches!(
            context.lock("check").table.get(handle).unwrap().send,
            SendState::Requested
        ));
    }

    #[test]
    fn test_dispatch_send_without_permission() {
        let (context, handle) = context_with_connection(ConnectionState::Connected);
        assert_eq!(
            context.dispatch_send(handle, Bytes::from_static(b"x")).unwrap_err(),
            WebsocketError::InvalidOperation
        );
    }

    #[test]
    fn test_send_while_connecting() {
        let (context, handle) = context_with_connection(ConnectionState::Connecting);
        assert_eq!(
            context.send_request(handle).unwrap_err(),
            WebsocketError::InvalidOperation
        );
    }

    #[test]
    fn test_recv_times_out_without_closing() {
        let (context, handle) = context_with_connection(ConnectionState::Connected);
        let timeout = Duration::from_millis(40);
        let start = Instant::now();
        assert_eq!(
            context.recv_message(handle, timeout).unwrap_err(),
            WebsocketError::TimedOut
        );
        assert!(start.elapsed() >= timeout);
        assert_eq!(context.state_of(handle), Some(ConnectionState::Connected));
        let guard = context.lock("check");
        let record = guard.table.get(handle).unwrap();
        assert!(record.recv_queue.is_empty());
        assert_eq!(record.waiters, 0);
    }

    #[test]
    fn test_disconnect_drains_waiting_recv() {
        let (context, handle) = context_with_connection(ConnectionState::Connected);
        let receiver = {
            let context = context.clone();
            thread::spawn(move || context.recv_message(handle, Duration::from_secs(5)))
        };
        while context.lock("poll").table.get(handle).unwrap().recv_queue.is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        context.disconnect(handle).unwrap();
        assert_eq!(receiver.join().unwrap().unwrap_err(), WebsocketError::Closed);
        assert_eq!(context.state_of(handle), Some(ConnectionState::Disconnecting));
        assert_eq!(
            context.recv_message(handle, Duration::from_millis(1)).unwrap_err(),
            WebsocketError::Closed
        );
    }

    #[test]
    fn test_last_waiter_releases_disconnected_slot() {
        let (context, handle) = context_with_connection(ConnectionState::Connected);
        let receiver = {
            let context = context.clone();
            thread::spawn(move || context.recv_message(handle, Duration::from_secs(5)))
        };
        while context.lock("poll").table.get(handle).unwrap().waiters == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        {
            let mut guard = context.lock("close");
            let record = guard.table.get_mut(handle).unwrap();
            record.state = ConnectionState::Disconnected;
            record.drain(WebsocketError::Closed);
        }
        assert_eq!(receiver.join().unwrap().unwrap_err(), WebsocketError::Closed);
        assert_eq!(context.state_of(handle), None);
        assert_eq!(context.send_request(handle).unwrap_err(), WebsocketError::BadParam);
    }

    #[test]
    fn test_stopping_context_rejects_operations() {
        let (context, handle) = context_with_connection(ConnectionState::Connected);
        context.lock("stop").stopping = true;
        assert_eq!(context.disconnect(handle).unwrap_err(), WebsocketError::InvalidOperation);
        assert_eq!(context.accept(None).unwrap_err(), WebsocketError::InvalidOperation);
    }

    #[test]
    fn test_cancel_accept() {
        let context = Arc::new(Context::new(1, TableLimits::default()));
        let acceptor = {
            let context = context.clone();
            thread::spawn(move || context.accept(None))
        };
        while context.lock("poll").accepts.is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        context.cancel_accept();
        assert_eq!(
            acceptor.join().unwrap().unwrap_err(),
            WebsocketError::OperationCanceled
        );
    }

    #[test]
    fn test_engine_lock_round_trip() {
        let context = Context::new(1, TableLimits::default());
        let guard = context.lock("start");
        let engine = guard.into_engine_lock();
        // the context lock is free while the engine lock is held
        drop(context.lock("other"));
        let guard = engine.relock("after");
        assert!(guard.table.is_empty());
    }
}
