//! mio engine
//!
//! Sockets are non-blocking and registered edge-triggered; every readiness
//! event drives the session as far as it will go. Connect progress is
//! reported stage by stage:
//!
//! ```text
//! TCP_CONNECTING -> TLS_CONNECTING -> HANDSHAKE_CONNECTING -> Established
//! ```

use std::collections::HashMap;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use native_tls::{MidHandshakeTlsStream, TlsAcceptor, TlsConnector, TlsStream};
use tungstenite::handshake::client::{ClientHandshake, Request};
use tungstenite::handshake::server::ServerHandshake;
use tungstenite::handshake::{HandshakeError, HandshakeRole, MidHandshake};
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tungstenite::{Message, WebSocket};

use super::{
    client_request, close_status_for, tls, websocket_config, AsyncWebSocketEngine, ConnectRequest,
    EngineEvent, EngineFactory, EngineWaker, FrameKind, SessionId, SubprotocolCheck, CLOSE_LINGER,
};
use crate::datalink::bsc::close_reason::CloseStatus;
use crate::datalink::bsc::config::{ClientConfig, ServerConfig, TableLimits, WebsocketProtocol};
use crate::datalink::bsc::net;
use crate::datalink::bsc::state::ConnectionState;

const WAKER: Token = Token(usize::MAX);
const LISTENER: Token = Token(usize::MAX - 1);

type Stream = TlsStream<TcpStream>;

/// Why a session ended: close status and description
type Ended = (Option<CloseStatus>, Option<String>);

/// Creates [`PollingEngine`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct PollingHost;

impl EngineFactory for PollingHost {
    type Engine = PollingEngine;

    fn client(&self, config: &ClientConfig, limits: &TableLimits) -> io::Result<PollingEngine> {
        let setup = Setup {
            connector: Some(tls::connector(&config.credentials)?),
            acceptor: None,
            protocol: config.protocol,
            ws_config: websocket_config(limits),
        };
        PollingEngine::new(setup, None)
    }

    fn server(
        &self,
        config: &ServerConfig,
        addr: SocketAddr,
        limits: &TableLimits,
    ) -> io::Result<PollingEngine> {
        let setup = Setup {
            connector: None,
            acceptor: Some(tls::acceptor(&config.credentials)?),
            protocol: config.protocol,
            ws_config: websocket_config(limits),
        };
        let listener = TcpListener::from_std(net::bind_listener(addr)?);
        PollingEngine::new(setup, Some(listener))
    }
}

struct Setup {
    connector: Option<TlsConnector>,
    acceptor: Option<TlsAcceptor>,
    protocol: WebsocketProtocol,
    ws_config: WebSocketConfig,
}

enum Stage {
    /// Outbound TCP connect in flight
    Connecting {
        stream: TcpStream,
        host: String,
        request: Request,
    },
    /// TLS handshake; `request` is `None` on the server side
    Tls {
        mid: MidHandshakeTlsStream<TcpStream>,
        request: Option<Request>,
    },
    ClientHandshake(MidHandshake<ClientHandshake<Stream>>),
    ServerHandshake(MidHandshake<ServerHandshake<Stream, SubprotocolCheck>>),
    Open(WebSocket<Stream>),
    Gone,
}

struct Conn {
    stage: Stage,
    peer: Option<SocketAddr>,
    /// tungstenite holds unsent bytes
    flushing: bool,
    want_writable: bool,
    /// Close frame sent; drop the socket if the peer has not answered by then
    linger: Option<Instant>,
}

impl Conn {
    fn new(stage: Stage, peer: Option<SocketAddr>) -> Self {
        Self {
            stage,
            peer,
            flushing: false,
            want_writable: false,
            linger: None,
        }
    }
}

/// Engine context built on a mio poll
pub struct PollingEngine {
    poll: Poll,
    readiness: Events,
    waker: Arc<Waker>,
    listener: Option<TcpListener>,
    setup: Setup,
    sessions: HashMap<SessionId, Conn>,
    next_session: u64,
    /// Events produced outside `service`, reported by the next call
    queued: Vec<EngineEvent>,
}

impl PollingEngine {
    fn new(setup: Setup, mut listener: Option<TcpListener>) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        if let Some(listener) = listener.as_mut() {
            poll.registry()
                .register(listener, LISTENER, Interest::READABLE)?;
        }
        Ok(Self {
            poll,
            readiness: Events::with_capacity(256),
            waker,
            listener,
            setup,
            sessions: HashMap::new(),
            next_session: 1,
            queued: Vec::new(),
        })
    }

    fn allocate_session(&mut self) -> SessionId {
        let session = SessionId(self.next_session);
        self.next_session += 1;
        session
    }

    fn accept_all(&mut self) {
        loop {
            let Some(listener) = &self.listener else {
                return;
            };
            let (mut stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    return;
                }
            };
            let session = self.allocate_session();
            if let Err(e) = self.poll.registry().register(
                &mut stream,
                Token(session.0 as usize),
                Interest::READABLE | Interest::WRITABLE,
            ) {
                warn!("cannot register peer {}: {}", peer, e);
                continue;
            }
            trace!("{} accepted from {}", session, peer);
            self.queued.push(EngineEvent::Incoming {
                session,
                peer: Some(peer),
            });

            let Some(acceptor) = &self.setup.acceptor else {
                return;
            };
            self.queued.push(EngineEvent::Progress {
                session,
                stage: ConnectionState::TlsConnecting,
            });
            let handshake = acceptor.accept(stream);
            match tls_done(&self.setup, session, handshake, None, &mut self.queued) {
                Ok(stage) => {
                    let mut conn = Conn::new(stage, Some(peer));
                    match pump(session, &mut conn, &mut self.queued) {
                        Ok(()) => {
                            self.sessions.insert(session, conn);
                        }
                        Err(ended) => self.end(session, ended),
                    }
                }
                Err(ended) => self.end(session, ended),
            }
        }
    }

    fn advance(&mut self, session: SessionId) {
        let Some(conn) = self.sessions.get_mut(&session) else {
            return;
        };
        if let Err(ended) = step(&self.setup, session, conn, &mut self.queued) {
            self.sessions.remove(&session);
            self.end(session, ended);
        }
    }

    fn end(&mut self, session: SessionId, (status, description): Ended) {
        debug!("{} ended: {:?} {:?}", session, status.map(|s| s.code()), description);
        self.queued.push(EngineEvent::Closed {
            session,
            status,
            description,
        });
    }

    /// Drop sessions whose close was never answered
    fn expire(&mut self, now: Instant) {
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, c)| c.linger.is_some_and(|t| t <= now))
            .map(|(s, _)| *s)
            .collect();
        for session in expired {
            self.sessions.remove(&session);
            self.end(session, (None, Some("close not acknowledged".to_string())));
        }
    }
}

impl AsyncWebSocketEngine for PollingEngine {
    fn waker(&self) -> EngineWaker {
        let waker = self.waker.clone();
        EngineWaker::new(move || {
            if let Err(e) = waker.wake() {
                warn!("engine wake failed: {}", e);
            }
        })
    }

    fn connect(&mut self, request: &ConnectRequest) -> io::Result<SessionId> {
        let addr = *request
            .addrs
            .first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no resolved address"))?;
        let host = request
            .url
            .host_str()
            .unwrap_or_default()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let http = client_request(request)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

        let mut stream = TcpStream::connect(addr)?;
        let session = self.allocate_session();
        self.poll.registry().register(
            &mut stream,
            Token(session.0 as usize),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        let _ = stream.set_nodelay(true);
        self.sessions.insert(
            session,
            Conn::new(
                Stage::Connecting {
                    stream,
                    host,
                    request: http,
                },
                None,
            ),
        );
        self.queued.push(EngineEvent::Progress {
            session,
            stage: ConnectionState::TcpConnecting,
        });
        Ok(session)
    }

    fn request_writable(&mut self, session: SessionId) {
        let Some(conn) = self.sessions.get_mut(&session) else {
            return;
        };
        if !matches!(conn.stage, Stage::Open(_)) {
            return;
        }
        if conn.flushing {
            conn.want_writable = true;
        } else {
            self.queued.push(EngineEvent::Writable { session });
        }
    }

    fn write(&mut self, session: SessionId, payload: &[u8]) -> io::Result<usize> {
        let conn = self
            .sessions
            .get_mut(&session)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "unknown session"))?;
        let Stage::Open(ws) = &mut conn.stage else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "session not open"));
        };
        match ws.send(Message::Binary(payload.to_vec())) {
            Ok(()) => Ok(payload.len()),
            Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                conn.flushing = true;
                Ok(payload.len())
            }
            Err(tungstenite::Error::WriteBufferFull(_)) => Ok(0),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
        }
    }

    fn close(&mut self, session: SessionId, status: CloseStatus) {
        let Some(conn) = self.sessions.get_mut(&session) else {
            return;
        };
        let Stage::Open(ws) = &mut conn.stage else {
            // still connecting: abort
            self.sessions.remove(&session);
            self.end(session, (Some(status), None));
            return;
        };
        if conn.linger.is_some() {
            return;
        }
        conn.linger = Some(Instant::now() + CLOSE_LINGER);
        let frame = CloseFrame {
            code: CloseCode::from(status.code()),
            reason: "".into(),
        };
        match ws.close(Some(frame)) {
            Ok(()) => {}
            Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                conn.flushing = true;
            }
            Err(e) => {
                self.sessions.remove(&session);
                self.end(session, (Some(status), Some(e.to_string())));
            }
        }
    }

    fn peer_addr(&self, session: SessionId) -> Option<SocketAddr> {
        self.sessions.get(&session).and_then(|c| c.peer)
    }

    fn service(
        &mut self,
        deadline: Option<Instant>,
        events: &mut Vec<EngineEvent>,
    ) -> io::Result<()> {
        let now = Instant::now();
        let timeout = if self.queued.is_empty() {
            self.sessions
                .values()
                .filter_map(|c| c.linger)
                .chain(deadline)
                .min()
                .map(|t| t.saturating_duration_since(now))
        } else {
            Some(Duration::ZERO)
        };

        match self.poll.poll(&mut self.readiness, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
        let tokens: Vec<Token> = self.readiness.iter().map(|e| e.token()).collect();
        for token in tokens {
            match token {
                WAKER => {}
                LISTENER => self.accept_all(),
                Token(id) => self.advance(SessionId(id as u64)),
            }
        }
        self.expire(Instant::now());
        events.append(&mut self.queued);
        Ok(())
    }

    fn shutdown(&mut self) {
        for (session, conn) in self.sessions.iter_mut() {
            if let Stage::Open(ws) = &mut conn.stage {
                trace!("{} closing for shutdown", session);
                let frame = CloseFrame {
                    code: CloseCode::Away,
                    reason: "".into(),
                };
                let _ = ws.close(Some(frame));
            }
        }
        self.sessions.clear();
        self.queued.clear();
        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
    }
}

/// Drive one session as far as its socket allows
fn step(
    setup: &Setup,
    session: SessionId,
    conn: &mut Conn,
    out: &mut Vec<EngineEvent>,
) -> Result<(), Ended> {
    conn.stage = match mem::replace(&mut conn.stage, Stage::Gone) {
        Stage::Connecting {
            stream,
            host,
            request,
        } => {
            if let Some(e) = stream.take_error().map_err(io_ended)? {
                return Err(io_ended(e));
            }
            match stream.peer_addr() {
                Ok(peer) => conn.peer = Some(peer),
                Err(e)
                    if e.kind() == io::ErrorKind::NotConnected
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    conn.stage = Stage::Connecting {
                        stream,
                        host,
                        request,
                    };
                    return Ok(());
                }
                Err(e) => return Err(io_ended(e)),
            }
            out.push(EngineEvent::Progress {
                session,
                stage: ConnectionState::TlsConnecting,
            });
            let connector = setup
                .connector
                .as_ref()
                .ok_or_else(|| (None, Some("no TLS connector".to_string())))?;
            tls_done(setup, session, connector.connect(&host, stream), Some(request), out)?
        }
        Stage::Tls { mid, request } => tls_done(setup, session, mid.handshake(), request, out)?,
        Stage::ClientHandshake(mid) => opened(
            session,
            mid.handshake().map(|(ws, _)| ws),
            Stage::ClientHandshake,
            out,
        )?,
        Stage::ServerHandshake(mid) => {
            opened(session, mid.handshake(), Stage::ServerHandshake, out)?
        }
        stage => stage,
    };
    pump(session, conn, out)
}

fn tls_done(
    setup: &Setup,
    session: SessionId,
    result: Result<Stream, native_tls::HandshakeError<TcpStream>>,
    request: Option<Request>,
    out: &mut Vec<EngineEvent>,
) -> Result<Stage, Ended> {
    let tls = match result {
        Ok(tls) => tls,
        Err(native_tls::HandshakeError::WouldBlock(mid)) => return Ok(Stage::Tls { mid, request }),
        Err(native_tls::HandshakeError::Failure(e)) => {
            return Err((Some(CloseStatus::TLS_FAILURE), Some(e.to_string())))
        }
    };
    out.push(EngineEvent::Progress {
        session,
        stage: ConnectionState::HandshakeConnecting,
    });
    let config = Some(setup.ws_config);
    match request {
        Some(request) => opened(
            session,
            tungstenite::client::client_with_config(request, tls, config).map(|(ws, _)| ws),
            Stage::ClientHandshake,
            out,
        ),
        None => {
            let check = SubprotocolCheck {
                protocol: setup.protocol,
            };
            opened(
                session,
                tungstenite::accept_hdr_with_config(tls, check, config),
                Stage::ServerHandshake,
                out,
            )
        }
    }
}

fn opened<R: HandshakeRole>(
    session: SessionId,
    result: Result<WebSocket<Stream>, HandshakeError<R>>,
    interrupted: fn(MidHandshake<R>) -> Stage,
    out: &mut Vec<EngineEvent>,
) -> Result<Stage, Ended> {
    match result {
        Ok(ws) => {
            out.push(EngineEvent::Established { session });
            Ok(Stage::Open(ws))
        }
        Err(HandshakeError::Interrupted(mid)) => Ok(interrupted(mid)),
        Err(HandshakeError::Failure(e)) => Err((close_status_for(&e), Some(e.to_string()))),
    }
}

/// Read every available message, then flush pending writes
fn pump(session: SessionId, conn: &mut Conn, out: &mut Vec<EngineEvent>) -> Result<(), Ended> {
    let Conn {
        stage,
        flushing,
        want_writable,
        ..
    } = conn;
    let Stage::Open(ws) = stage else {
        return Ok(());
    };

    loop {
        match ws.read() {
            Ok(Message::Binary(data)) => out.push(EngineEvent::Frame {
                session,
                kind: FrameKind::Binary,
                fin: true,
                payload: data.into(),
            }),
            Ok(Message::Text(text)) => out.push(EngineEvent::Frame {
                session,
                kind: FrameKind::Text,
                fin: true,
                payload: text.into_bytes().into(),
            }),
            Ok(Message::Close(frame)) => {
                let _ = ws.flush();
                let status = frame.as_ref().map(|f| CloseStatus(u16::from(f.code)));
                let description = frame
                    .map(|f| f.reason.into_owned())
                    .filter(|r| !r.is_empty());
                return Err((status, description));
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(tungstenite::Error::ConnectionClosed) => return Err((None, None)),
            Err(e) => return Err((close_status_for(&e), Some(e.to_string()))),
        }
    }

    match ws.flush() {
        Ok(()) => {
            *flushing = false;
            if mem::take(want_writable) {
                out.push(EngineEvent::Writable { session });
            }
            Ok(())
        }
        Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
            *flushing = true;
            Ok(())
        }
        Err(e) => Err((close_status_for(&e), Some(e.to_string()))),
    }
}

fn io_ended(e: io::Error) -> Ended {
    (None, Some(e.to_string()))
}
