//! Engine whose I/O is scripted by the test
//!
//! Tests push [`EngineEvent`]s as if they came from the network and inspect
//! the calls the event loop made.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{
    AsyncWebSocketEngine, ConnectRequest, EngineEvent, EngineFactory, EngineWaker, FrameKind,
    SessionId,
};
use crate::datalink::bsc::close_reason::CloseStatus;
use crate::datalink::bsc::config::{ClientConfig, ServerConfig, TableLimits};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EngineCall {
    Connect(SessionId, Vec<SocketAddr>),
    RequestWritable(SessionId),
    Write(SessionId, Vec<u8>),
    Close(SessionId, CloseStatus),
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ScriptOptions {
    /// `connect` is followed by `Established`
    pub establish_on_connect: bool,
    /// `request_writable` is followed by `Writable`
    pub writable_on_request: bool,
    /// `close` is followed by `Closed` carrying the same status
    pub closed_on_close: bool,
    /// `write` accepts no bytes
    pub short_writes: bool,
}

impl Default for ScriptOptions {
    fn default() -> Self {
        Self {
            establish_on_connect: true,
            writable_on_request: true,
            closed_on_close: true,
            short_writes: false,
        }
    }
}

struct ScriptState {
    options: ScriptOptions,
    pending: VecDeque<EngineEvent>,
    calls: Vec<EngineCall>,
    next_session: u64,
    woken: bool,
}

struct ScriptShared {
    state: Mutex<ScriptState>,
    cond: Condvar,
}

/// Test-side view of one engine
#[derive(Clone)]
pub(crate) struct ScriptHandle {
    shared: Arc<ScriptShared>,
}

impl ScriptHandle {
    fn new(options: ScriptOptions) -> Self {
        Self {
            shared: Arc::new(ScriptShared {
                state: Mutex::new(ScriptState {
                    options,
                    pending: VecDeque::new(),
                    calls: Vec::new(),
                    next_session: 1,
                    woken: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.shared.state.lock().unwrap()
    }

    /// Deliver `event` on the next `service` call
    pub(crate) fn push(&self, event: EngineEvent) {
        self.lock().pending.push_back(event);
        self.shared.cond.notify_all();
    }

    /// Deliver a complete binary message
    pub(crate) fn push_message(&self, session: SessionId, payload: &[u8]) {
        self.push(EngineEvent::Frame {
            session,
            kind: FrameKind::Binary,
            fin: true,
            payload: bytes::Bytes::copy_from_slice(payload),
        });
    }

    /// Simulate a peer completing TCP, TLS and the handshake
    pub(crate) fn push_incoming(&self, session: u64) -> SessionId {
        let session = SessionId(session);
        self.push(EngineEvent::Incoming {
            session,
            peer: Some(SocketAddr::from(([192, 0, 2, 1], 40000 + session.0 as u16))),
        });
        session
    }

    pub(crate) fn set_options(&self, options: ScriptOptions) {
        self.lock().options = options;
    }

    pub(crate) fn calls(&self) -> Vec<EngineCall> {
        self.lock().calls.clone()
    }

    /// Wait until a recorded call satisfies `pred`
    pub(crate) fn wait_for_call(
        &self,
        timeout: Duration,
        pred: impl Fn(&EngineCall) -> bool,
    ) -> Option<EngineCall> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(call) = state.calls.iter().find(|c| pred(c)) {
                return Some(call.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self.shared.cond.wait_timeout(state, deadline - now).unwrap().0;
        }
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.calls().contains(&EngineCall::Shutdown)
    }

    fn record(&self, state: &mut ScriptState, call: EngineCall) {
        state.calls.push(call);
        self.shared.cond.notify_all();
    }
}

/// Engine returned by [`ScriptedHost`]
pub(crate) struct ScriptedEngine {
    script: ScriptHandle,
}

impl AsyncWebSocketEngine for ScriptedEngine {
    fn waker(&self) -> EngineWaker {
        let shared = self.script.shared.clone();
        EngineWaker::new(move || {
            shared.state.lock().unwrap().woken = true;
            shared.cond.notify_all();
        })
    }

    fn connect(&mut self, request: &ConnectRequest) -> io::Result<SessionId> {
        let mut state = self.script.lock();
        let session = SessionId(state.next_session);
        state.next_session += 1;
        if state.options.establish_on_connect {
            state.pending.push_back(EngineEvent::Established { session });
        }
        self.script.record(&mut state, EngineCall::Connect(session, request.addrs.clone()));
        Ok(session)
    }

    fn request_writable(&mut self, session: SessionId) {
        let mut state = self.script.lock();
        if state.options.writable_on_request {
            state.pending.push_back(EngineEvent::Writable { session });
        }
        self.script.record(&mut state, EngineCall::RequestWritable(session));
    }

    fn write(&mut self, session: SessionId, payload: &[u8]) -> io::Result<usize> {
        let mut state = self.script.lock();
        let written = if state.options.short_writes { 0 } else { payload.len() };
        self.script
            .record(&mut state, EngineCall::Write(session, payload.to_vec()));
        Ok(written)
    }

    fn close(&mut self, session: SessionId, status: CloseStatus) {
        let mut state = self.script.lock();
        if state.options.closed_on_close {
            state.pending.push_back(EngineEvent::Closed {
                session,
                status: Some(status),
                description: None,
            });
        }
        self.script.record(&mut state, EngineCall::Close(session, status));
    }

    fn peer_addr(&self, session: SessionId) -> Option<SocketAddr> {
        Some(SocketAddr::from(([192, 0, 2, 1], 40000 + session.0 as u16)))
    }

    fn service(
        &mut self,
        deadline: Option<Instant>,
        events: &mut Vec<EngineEvent>,
    ) -> io::Result<()> {
        let mut state = self.script.lock();
        loop {
            if !state.pending.is_empty() || state.woken {
                break;
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    deadline - now
                }
                None => Duration::from_secs(3600),
            };
            state = self.script.shared.cond.wait_timeout(state, wait).unwrap().0;
        }
        state.woken = false;
        events.extend(state.pending.drain(..));
        Ok(())
    }

    fn shutdown(&mut self) {
        let mut state = self.script.lock();
        self.script.record(&mut state, EngineCall::Shutdown);
    }
}

/// Factory that records every engine it creates
#[derive(Clone, Default)]
pub(crate) struct ScriptedHost {
    engines: Arc<Mutex<Vec<ScriptHandle>>>,
    options: Arc<Mutex<ScriptOptions>>,
    fail: Arc<Mutex<bool>>,
}

impl ScriptedHost {
    pub(crate) fn with_options(options: ScriptOptions) -> Self {
        let host = Self::default();
        *host.options.lock().unwrap() = options;
        host
    }

    /// Make the next engine creations fail
    pub(crate) fn fail_creation(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub(crate) fn engine(&self, index: usize) -> ScriptHandle {
        self.engines.lock().unwrap()[index].clone()
    }

    pub(crate) fn last(&self) -> ScriptHandle {
        self.engines.lock().unwrap().last().cloned().unwrap()
    }

    pub(crate) fn created(&self) -> usize {
        self.engines.lock().unwrap().len()
    }

    fn create(&self) -> io::Result<ScriptedEngine> {
        if *self.fail.lock().unwrap() {
            return Err(io::Error::new(io::ErrorKind::Other, "engine creation failed"));
        }
        let script = ScriptHandle::new(*self.options.lock().unwrap());
        self.engines.lock().unwrap().push(script.clone());
        Ok(ScriptedEngine { script })
    }
}

impl EngineFactory for ScriptedHost {
    type Engine = ScriptedEngine;

    fn client(&self, _config: &ClientConfig, _limits: &TableLimits) -> io::Result<ScriptedEngine> {
        self.create()
    }

    fn server(
        &self,
        _config: &ServerConfig,
        _addr: SocketAddr,
        _limits: &TableLimits,
    ) -> io::Result<ScriptedEngine> {
        self.create()
    }
}
