//! Event loop driving one engine context
//!
//! A client loop first resolves its peer address, before it ever takes the
//! context lock. Each pass then runs with the context lock held, except for
//! the blocking [`AsyncWebSocketEngine::service`] call:
//!
//! 1. on stop, drain and free every connection, tear the engine down under
//!    the engine lock, emit SERVER_STOPPED and exit
//! 2. start pending connects, arm write notifications, write permitted
//!    payloads, send close frames and enforce deadlines (connect, close,
//!    and the lifetime of an unused send permission)
//! 3. unlock, service the engine, relock and apply its events

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, error, info, trace, warn};

use super::close_reason::{error_code_for, CloseStatus};
use super::config::WebsocketProtocol;
use super::context::{ConnectionRecord, Context, ContextGuard, ContextState};
use super::dispatch::{EventSender, WebsocketEvent};
use super::engine::{AsyncWebSocketEngine, ConnectRequest, EngineEvent, FrameKind, SessionId};
use super::error::{ErrorCode, WebsocketError};
use super::handle::ConnectionHandle;
use super::operation::{SendOp, SendState};
use super::state::{ConnectionRole, ConnectionState};

/// Connections a loop is responsible for
pub(crate) enum LoopScope {
    /// One outbound connection with a private engine
    Client {
        handle: ConnectionHandle,
        request: ConnectRequest,
    },
    /// Every slot of a listening context
    Server {
        protocol: WebsocketProtocol,
        timeout: Duration,
        events: EventSender,
    },
}

pub(crate) struct EventLoop<E> {
    context: Arc<Context>,
    engine: E,
    scope: LoopScope,
    io: Vec<EngineEvent>,
    /// Why the client's peer address could not be resolved
    unresolved: Option<String>,
}

impl<E: AsyncWebSocketEngine> EventLoop<E> {
    pub(crate) fn new(context: Arc<Context>, engine: E, scope: LoopScope) -> Self {
        Self {
            context,
            engine,
            scope,
            io: Vec::new(),
            unresolved: None,
        }
    }

    pub(crate) fn run(mut self) {
        let context = self.context.clone();
        if let LoopScope::Client { handle, request } = &mut self.scope {
            // DNS may block; the context lock is not taken yet
            if let Err(e) = request.resolve() {
                warn!("connection {} cannot resolve {}: {}", handle, request.url, e);
                self.unresolved = Some(e.to_string());
            }
        }
        if let LoopScope::Server { events, protocol, .. } = &self.scope {
            info!("BACnet/SC {:?} server started", protocol);
            events.emit(WebsocketEvent::ServerStarted);
        }

        let mut guard = context.lock("event loop");
        loop {
            if self.finished(&guard) {
                break;
            }
            let deadline = self.prepare(&mut guard, Instant::now());

            drop(guard);
            let mut io = std::mem::take(&mut self.io);
            let serviced = self.engine.service(deadline, &mut io);
            guard = context.lock("event loop");

            if let Err(e) = serviced {
                error!("engine service failed: {}", e);
                self.fail_all(&mut guard, &e.to_string());
            }
            let now = Instant::now();
            for event in io.drain(..) {
                self.handle_event(&mut guard, event, now);
            }
            self.io = io;
        }
        self.teardown(guard);
    }

    fn handles(&self, state: &ContextState) -> Vec<ConnectionHandle> {
        match &self.scope {
            LoopScope::Client { handle, .. } => {
                state.table.get(*handle).map(|_| *handle).into_iter().collect()
            }
            LoopScope::Server { .. } => state.table.handles(),
        }
    }

    fn finished(&self, state: &ContextState) -> bool {
        match &self.scope {
            LoopScope::Client { handle, .. } => state
                .table
                .get(*handle)
                .map_or(true, |r| r.state == ConnectionState::Disconnected),
            LoopScope::Server { .. } => state.stopping,
        }
    }

    /// Drive every connection forward; returns the earliest deadline
    fn prepare(&mut self, state: &mut ContextState, now: Instant) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        for handle in self.handles(state) {
            let Some(record) = state.table.get_mut(handle) else {
                continue;
            };

            if record.state == ConnectionState::Configuring {
                if let LoopScope::Client { request, .. } = &self.scope {
                    let started = match &self.unresolved {
                        Some(description) => {
                            Err(io::Error::new(io::ErrorKind::NotFound, description.clone()))
                        }
                        None => self.engine.connect(request),
                    };
                    match started {
                        Ok(session) => {
                            debug!("connection {} connecting to {}", handle, request.url);
                            record.session = Some(session);
                            record.state = ConnectionState::Connecting;
                            record.deadline = Some(now + record.timeout);
                        }
                        Err(e) => {
                            warn!("connection {} failed to start: {}", handle, e);
                            record.set_reason(ErrorCode::WebsocketError, Some(e.to_string()));
                            finalize(state, handle);
                            continue;
                        }
                    }
                }
            }

            if record.state.is_connecting() && record.deadline.is_some_and(|d| d <= now) {
                warn!("connection {} timed out while connecting", handle);
                record.connect_waiters.drain(WebsocketError::TimedOut);
                record.begin_disconnect(ErrorCode::Timeout, CloseStatus::GOING_AWAY, now);
            }

            if matches!(record.send, SendState::Permitted) {
                match record.permit_deadline {
                    Some(d) if d <= now => {
                        debug!("connection {} send permission unused, withdrawn", handle);
                        record.send = SendState::Idle;
                        record.permit_deadline = None;
                    }
                    Some(d) => next = Some(next.map_or(d, |n| n.min(d))),
                    None => {}
                }
            }

            if record.state == ConnectionState::Connected {
                if let Some(session) = record.session {
                    if matches!(record.send, SendState::Ready(_)) {
                        if let SendState::Ready(op) = std::mem::take(&mut record.send) {
                            write_op(&mut self.engine, record, session, op, now);
                        }
                    } else if record.send.wants_writable() && !record.writable_armed {
                        record.writable_armed = true;
                        self.engine.request_writable(session);
                    }
                }
            }

            if record.state == ConnectionState::Disconnecting {
                match record.session {
                    None => {
                        finalize(state, handle);
                        continue;
                    }
                    Some(session) if !record.close_sent => {
                        trace!("connection {} sending close {}", handle, record.close_status);
                        record.close_sent = true;
                        self.engine.close(session, record.close_status);
                    }
                    Some(_) if record.deadline.is_some_and(|d| d <= now) => {
                        debug!("connection {} close not confirmed, dropping", handle);
                        finalize(state, handle);
                        continue;
                    }
                    Some(_) => {}
                }
            }

            if let Some(deadline) = record.deadline {
                next = Some(next.map_or(deadline, |n| n.min(deadline)));
            }
        }
        next
    }

    fn handle_event(&mut self, state: &mut ContextState, event: EngineEvent, now: Instant) {
        trace!("engine event {:?}", event);
        match event {
            EngineEvent::Incoming { session, peer } => self.on_incoming(state, session, peer, now),
            EngineEvent::Progress { session, stage } => {
                if let Some((_, record)) = find(state, session) {
                    if record.state.can_transition(stage) {
                        record.state = stage;
                    }
                }
            }
            EngineEvent::Established { session } => self.on_established(state, session),
            EngineEvent::Frame {
                session,
                kind,
                fin,
                payload,
            } => self.on_frame(state, session, kind, fin, payload, now),
            EngineEvent::Writable { session } => {
                let Some((handle, record)) = find(state, session) else {
                    return;
                };
                record.writable_armed = false;
                if record.state != ConnectionState::Connected {
                    return;
                }
                match std::mem::take(&mut record.send) {
                    SendState::Requested => {
                        record.send = SendState::Permitted;
                        record.permit_deadline = Some(now + record.timeout);
                        record.events.emit(WebsocketEvent::Sendable { handle });
                    }
                    SendState::Pending(op) | SendState::Ready(op) => {
                        write_op(&mut self.engine, record, session, op, now);
                    }
                    other => record.send = other,
                }
            }
            EngineEvent::Closed {
                session,
                status,
                description,
            } => {
                let Some((handle, record)) = find(state, session) else {
                    return;
                };
                debug!(
                    "connection {} closed by engine, status {:?}",
                    handle,
                    status.map(|s| s.code())
                );
                record.set_reason(error_code_for(status), description);
                finalize(state, handle);
            }
        }
    }

    fn on_incoming(
        &mut self,
        state: &mut ContextState,
        session: SessionId,
        peer: Option<SocketAddr>,
        now: Instant,
    ) {
        let LoopScope::Server {
            protocol,
            timeout,
            events,
        } = &self.scope
        else {
            return;
        };
        if state.stopping {
            self.engine.close(session, CloseStatus::GOING_AWAY);
            return;
        }
        let mut record = ConnectionRecord::new(
            ConnectionRole::Server(*protocol),
            ConnectionState::Connecting,
            events.clone(),
            *timeout,
            self.context.limits(),
        );
        record.session = Some(session);
        record.peer = peer;
        record.deadline = Some(now + *timeout);
        record.waker = Some(self.engine.waker());
        match state.table.allocate(record) {
            Ok(handle) => debug!("connection {} incoming from {:?}", handle, peer),
            Err(_) => {
                warn!("no free connection slot, dropping peer {:?}", peer);
                self.engine.close(session, CloseStatus::GOING_AWAY);
            }
        }
    }

    fn on_established(&mut self, state: &mut ContextState, session: SessionId) {
        let Some((handle, record)) = find(state, session) else {
            return;
        };
        if !record.state.is_connecting() {
            return;
        }
        debug!("connection {} established", handle);
        record.state = ConnectionState::Connected;
        record.ever_connected = true;
        record.deadline = None;
        if record.peer.is_none() {
            record.peer = self.engine.peer_addr(session);
        }
        record.events.emit(WebsocketEvent::Connected { handle });
        record.connect_waiters.complete_all(Ok(()));
        if record.role.is_server() {
            match state.accepts.pop() {
                Some(accept) => accept.complete(Ok(handle)),
                None => state.push_ready(handle),
            }
        }
    }

    fn on_frame(
        &mut self,
        state: &mut ContextState,
        session: SessionId,
        kind: FrameKind,
        fin: bool,
        payload: Bytes,
        now: Instant,
    ) {
        let Some((handle, record)) = find(state, session) else {
            return;
        };
        if record.state != ConnectionState::Connected {
            return;
        }
        match record.fragment.push_frame(kind, fin, payload) {
            Ok(None) => {}
            Ok(Some(message)) => deliver(handle, record, message),
            Err(e) => {
                warn!("connection {} rejected frame: {}", handle, e);
                record.begin_disconnect(e.reason(), e.close_status(), now);
                record.close_sent = true;
                self.engine.close(session, e.close_status());
            }
        }
    }

    /// Engine failure: every connection in scope is gone
    fn fail_all(&mut self, state: &mut ContextState, description: &str) {
        for handle in self.handles(state) {
            if let Some(record) = state.table.get_mut(handle) {
                record.set_reason(ErrorCode::WebsocketError, Some(description.to_string()));
                finalize(state, handle);
            }
        }
        if matches!(self.scope, LoopScope::Server { .. }) {
            state.stopping = true;
        }
    }

    fn teardown(mut self, mut guard: ContextGuard<'_>) {
        if let LoopScope::Server { .. } = &self.scope {
            // Disconnect events are not emitted on shutdown; SERVER_STOPPED
            // covers every connection.
            for handle in guard.table.handles() {
                if let Some(mut record) = guard.table.release(handle) {
                    record.drain(WebsocketError::Closed);
                }
            }
            guard.accepts.drain(WebsocketError::Closed);
            guard.ready.clear();
        }

        let engine_lock = guard.into_engine_lock();
        self.engine.shutdown();
        drop(engine_lock);

        match &self.scope {
            LoopScope::Server { events, protocol, .. } => {
                info!("BACnet/SC {:?} server stopped", protocol);
                events.emit(WebsocketEvent::ServerStopped);
            }
            LoopScope::Client { handle, .. } => {
                debug!("connection {} event loop exiting", handle);
            }
        }
    }
}

fn find(
    state: &mut ContextState,
    session: SessionId,
) -> Option<(ConnectionHandle, &mut ConnectionRecord)> {
    let handle = state.table.find(|r| r.session == Some(session))?;
    state.table.get_mut(handle).map(|r| (handle, r))
}

/// Hand a complete message to the oldest receive call, or post it
fn deliver(handle: ConnectionHandle, record: &mut ConnectionRecord, message: Bytes) {
    trace!("connection {} received {} bytes", handle, message.len());
    match record.recv_queue.pop() {
        Some(recv) => recv.complete(Ok(message)),
        None => record.events.emit(WebsocketEvent::Received {
            handle,
            payload: message,
        }),
    }
}

fn write_op<E: AsyncWebSocketEngine>(
    engine: &mut E,
    record: &mut ConnectionRecord,
    session: SessionId,
    op: SendOp,
    now: Instant,
) {
    let len = op.payload.len();
    match engine.write(session, &op.payload) {
        Ok(n) if n == len => {
            trace!("{} wrote {} bytes", session, len);
            record.send = SendState::Idle;
            op.completer.complete(Ok(()));
        }
        result => {
            let description = match result {
                Ok(n) => format!("short write: {} of {} bytes", n, len),
                Err(e) => e.to_string(),
            };
            warn!("{} write failed: {}", session, description);
            op.completer.complete(Err(WebsocketError::Closed));
            record.set_reason(ErrorCode::WebsocketError, Some(description));
            record.begin_disconnect(
                ErrorCode::WebsocketError,
                CloseStatus::UNEXPECTED_CONDITION,
                now,
            );
        }
    }
}

/// DISCONNECTED: drain, report, and free the slot unless someone waits on it
fn finalize(state: &mut ContextState, handle: ConnectionHandle) {
    let Some(record) = state.table.get_mut(handle) else {
        return;
    };
    record.state = ConnectionState::Disconnected;
    record.session = None;
    record.deadline = None;
    record.fragment.reset();
    record.drain(WebsocketError::Closed);

    // a server connection the application never saw goes away silently
    let silent = record.role.is_server() && !record.ever_connected;
    if !silent {
        let reason = record.reason.unwrap_or(ErrorCode::WebsocketError);
        debug!("connection {} disconnected: {}", handle, reason);
        record.events.emit(WebsocketEvent::Disconnected {
            handle,
            reason,
            description: record.description.clone(),
        });
    }
    if record.waiters == 0 {
        state.table.release(handle);
    }
}
