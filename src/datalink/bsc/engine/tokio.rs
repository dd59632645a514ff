//! tokio-tungstenite engine
//!
//! Every engine owns a private current-thread runtime. Session tasks only
//! make progress while the event loop sits in [`AsyncWebSocketEngine::service`],
//! which is where the loop spends its idle time anyway. Tasks report back
//! through an unbounded channel; the loop talks to them through per-session
//! command channels.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ::tokio::io::{AsyncRead, AsyncWrite};
use ::tokio::net::{TcpListener, TcpStream};
use ::tokio::runtime::{Builder, Runtime};
use ::tokio::sync::{mpsc, Notify};
use ::tokio::time::{self, sleep_until};
use futures_util::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::{
    client_request, close_status_for, tls, websocket_config, AsyncWebSocketEngine, ConnectRequest,
    EngineEvent, EngineFactory, EngineWaker, FrameKind, SessionId, SubprotocolCheck, CLOSE_LINGER,
};
use crate::datalink::bsc::close_reason::CloseStatus;
use crate::datalink::bsc::config::{ClientConfig, ServerConfig, TableLimits, WebsocketProtocol};
use crate::datalink::bsc::net;
use crate::datalink::bsc::state::ConnectionState;

/// Pause after a failed `accept` so a full fd table does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Creates [`TokioEngine`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioHost;

impl EngineFactory for TokioHost {
    type Engine = TokioEngine;

    fn client(&self, config: &ClientConfig, limits: &TableLimits) -> io::Result<TokioEngine> {
        let connector = tls::connector(&config.credentials)?;
        TokioEngine::new(Some(connector.into()), websocket_config(limits))
    }

    fn server(
        &self,
        config: &ServerConfig,
        addr: SocketAddr,
        limits: &TableLimits,
    ) -> io::Result<TokioEngine> {
        let acceptor = tls::acceptor(&config.credentials)?;
        let listener = net::bind_listener(addr)?;
        let engine = TokioEngine::new(None, websocket_config(limits))?;

        let runtime = engine.runtime()?;
        let listener = {
            let _entered = runtime.enter();
            TcpListener::from_std(listener)?
        };
        runtime.spawn(listen(
            listener,
            Listening {
                acceptor: acceptor.into(),
                protocol: config.protocol,
                config: engine.ws_config,
                sessions: engine.next_session.clone(),
                notices: engine.notices_tx.clone(),
            },
        ));
        Ok(engine)
    }
}

enum Command {
    Write(Vec<u8>),
    Writable,
    Close(CloseStatus),
}

/// What session tasks tell the engine
enum Notice {
    Event(EngineEvent),
    Peer(SessionId, SocketAddr),
    Attached {
        session: SessionId,
        peer: SocketAddr,
        commands: mpsc::UnboundedSender<Command>,
    },
}

struct Session {
    commands: mpsc::UnboundedSender<Command>,
    peer: Option<SocketAddr>,
}

/// Engine context backed by tokio-tungstenite
pub struct TokioEngine {
    runtime: Option<Runtime>,
    notify: Arc<Notify>,
    notices_tx: mpsc::UnboundedSender<Notice>,
    notices: mpsc::UnboundedReceiver<Notice>,
    sessions: HashMap<SessionId, Session>,
    next_session: Arc<AtomicU64>,
    connector: Option<tokio_native_tls::TlsConnector>,
    ws_config: WebSocketConfig,
}

impl TokioEngine {
    fn new(
        connector: Option<tokio_native_tls::TlsConnector>,
        ws_config: WebSocketConfig,
    ) -> io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let (notices_tx, notices) = mpsc::unbounded_channel();
        Ok(Self {
            runtime: Some(runtime),
            notify: Arc::new(Notify::new()),
            notices_tx,
            notices,
            sessions: HashMap::new(),
            next_session: Arc::new(AtomicU64::new(1)),
            connector,
            ws_config,
        })
    }

    fn runtime(&self) -> io::Result<&Runtime> {
        self.runtime
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "engine is shut down"))
    }

    fn apply(&mut self, notice: Notice, events: &mut Vec<EngineEvent>) {
        match notice {
            Notice::Event(event) => {
                if let EngineEvent::Closed { session, .. } = &event {
                    self.sessions.remove(session);
                }
                events.push(event);
            }
            Notice::Peer(session, peer) => {
                if let Some(s) = self.sessions.get_mut(&session) {
                    s.peer = Some(peer);
                }
            }
            Notice::Attached {
                session,
                peer,
                commands,
            } => {
                self.sessions.insert(
                    session,
                    Session {
                        commands,
                        peer: Some(peer),
                    },
                );
                events.push(EngineEvent::Incoming {
                    session,
                    peer: Some(peer),
                });
            }
        }
    }

    fn command(&self, session: SessionId, command: Command) -> io::Result<()> {
        let s = self
            .sessions
            .get(&session)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "unknown session"))?;
        s.commands
            .send(command)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "session task is gone"))
    }
}

impl AsyncWebSocketEngine for TokioEngine {
    fn waker(&self) -> EngineWaker {
        let notify = self.notify.clone();
        EngineWaker::new(move || notify.notify_one())
    }

    fn connect(&mut self, request: &ConnectRequest) -> io::Result<SessionId> {
        let connector = self
            .connector
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "listening engine"))?;
        let session = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        let (commands, rx) = mpsc::unbounded_channel();
        let notices = self.notices_tx.clone();
        let request = request.clone();
        let config = self.ws_config;

        self.runtime()?.spawn(async move {
            let mut rx = rx;
            let connected = ::tokio::select! {
                result = dial(session, &request, connector, config, &notices) => result,
                status = until_close(&mut rx) => Err((Some(status), "connect aborted".to_string())),
            };
            match connected {
                Ok(ws) => {
                    let _ = notices.send(Notice::Event(EngineEvent::Established { session }));
                    drive(session, ws, rx, notices).await;
                }
                Err((status, description)) => {
                    debug!("{} connect failed: {}", session, description);
                    let _ = notices.send(Notice::Event(EngineEvent::Closed {
                        session,
                        status,
                        description: Some(description),
                    }));
                }
            }
        });
        self.sessions.insert(session, Session { commands, peer: None });
        Ok(session)
    }

    fn request_writable(&mut self, session: SessionId) {
        if let Err(e) = self.command(session, Command::Writable) {
            trace!("{} writable request dropped: {}", session, e);
        }
    }

    fn write(&mut self, session: SessionId, payload: &[u8]) -> io::Result<usize> {
        self.command(session, Command::Write(payload.to_vec()))?;
        Ok(payload.len())
    }

    fn close(&mut self, session: SessionId, status: CloseStatus) {
        if let Err(e) = self.command(session, Command::Close(status)) {
            trace!("{} close dropped: {}", session, e);
        }
    }

    fn peer_addr(&self, session: SessionId) -> Option<SocketAddr> {
        self.sessions.get(&session).and_then(|s| s.peer)
    }

    fn service(
        &mut self,
        deadline: Option<Instant>,
        events: &mut Vec<EngineEvent>,
    ) -> io::Result<()> {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "engine is shut down"))?;
        let notify = self.notify.clone();
        let notices = &mut self.notices;
        let first = runtime.block_on(async {
            let expiry = async {
                match deadline {
                    Some(deadline) => sleep_until(time::Instant::from_std(deadline)).await,
                    None => std::future::pending().await,
                }
            };
            ::tokio::select! {
                notice = notices.recv() => notice,
                _ = notify.notified() => None,
                _ = expiry => None,
            }
        });

        let mut batch: Vec<Notice> = first.into_iter().collect();
        while let Ok(notice) = self.notices.try_recv() {
            batch.push(notice);
        }
        for notice in batch {
            self.apply(notice, events);
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        for (session, s) in &self.sessions {
            trace!("{} closing for shutdown", session);
            let _ = s.commands.send(Command::Close(CloseStatus::GOING_AWAY));
        }

        let sessions = &mut self.sessions;
        let notices = &mut self.notices;
        let drained = runtime.block_on(async {
            time::timeout(CLOSE_LINGER, async {
                while !sessions.is_empty() {
                    match notices.recv().await {
                        Some(Notice::Event(EngineEvent::Closed { session, .. })) => {
                            sessions.remove(&session);
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            })
            .await
        });
        if drained.is_err() {
            debug!("{} sessions did not close in time", self.sessions.len());
        }
        self.sessions.clear();
        runtime.shutdown_background();
    }
}

impl Drop for TokioEngine {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

type Failure = (Option<CloseStatus>, String);

/// TCP, TLS and the WebSocket handshake of an outbound session
async fn dial(
    session: SessionId,
    request: &ConnectRequest,
    connector: tokio_native_tls::TlsConnector,
    config: WebSocketConfig,
    notices: &mpsc::UnboundedSender<Notice>,
) -> Result<WebSocketStream<tokio_native_tls::TlsStream<TcpStream>>, Failure> {
    let host = request
        .url
        .host_str()
        .ok_or_else(|| (None, "URL has no host".to_string()))?
        .to_string();

    let progress = |stage| {
        let _ = notices.send(Notice::Event(EngineEvent::Progress { session, stage }));
    };
    progress(ConnectionState::TcpConnecting);
    if request.addrs.is_empty() {
        return Err((None, "no resolved address".to_string()));
    }
    let tcp = TcpStream::connect(&request.addrs[..])
        .await
        .map_err(|e| (None, e.to_string()))?;
    let _ = tcp.set_nodelay(true);
    if let Ok(peer) = tcp.peer_addr() {
        let _ = notices.send(Notice::Peer(session, peer));
    }

    progress(ConnectionState::TlsConnecting);
    let stream = connector
        .connect(&host, tcp)
        .await
        .map_err(|e| (Some(CloseStatus::TLS_FAILURE), e.to_string()))?;

    progress(ConnectionState::HandshakeConnecting);
    let http = client_request(request).map_err(|e| (close_status_for(&e), e.to_string()))?;
    let (ws, _response) = tokio_tungstenite::client_async_with_config(http, stream, Some(config))
        .await
        .map_err(|e| (close_status_for(&e), e.to_string()))?;
    Ok(ws)
}

struct Listening {
    acceptor: tokio_native_tls::TlsAcceptor,
    protocol: WebsocketProtocol,
    config: WebSocketConfig,
    sessions: Arc<AtomicU64>,
    notices: mpsc::UnboundedSender<Notice>,
}

/// Accept loop of a listening engine
async fn listen(listener: TcpListener, shared: Listening) {
    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept failed: {}", e);
                time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let _ = tcp.set_nodelay(true);
        let session = SessionId(shared.sessions.fetch_add(1, Ordering::Relaxed));
        let (commands, mut rx) = mpsc::unbounded_channel();
        let attached = Notice::Attached {
            session,
            peer,
            commands,
        };
        if shared.notices.send(attached).is_err() {
            return;
        }

        let acceptor = shared.acceptor.clone();
        let protocol = shared.protocol;
        let config = shared.config;
        let notices = shared.notices.clone();
        ::tokio::spawn(async move {
            let handshake = async {
                let stream = acceptor
                    .accept(tcp)
                    .await
                    .map_err(|e| (Some(CloseStatus::TLS_FAILURE), e.to_string()))?;
                let _ = notices.send(Notice::Event(EngineEvent::Progress {
                    session,
                    stage: ConnectionState::HandshakeConnecting,
                }));
                tokio_tungstenite::accept_hdr_async_with_config(
                    stream,
                    SubprotocolCheck { protocol },
                    Some(config),
                )
                .await
                .map_err(|e| (close_status_for(&e), e.to_string()))
            };
            let accepted: Result<_, Failure> = ::tokio::select! {
                result = handshake => result,
                status = until_close(&mut rx) => {
                    Err((Some(status), "handshake aborted".to_string()))
                }
            };
            match accepted {
                Ok(ws) => {
                    let _ = notices.send(Notice::Event(EngineEvent::Established { session }));
                    drive(session, ws, rx, notices).await;
                }
                Err((status, description)) => {
                    debug!("{} from {} failed handshake: {}", session, peer, description);
                    let _ = notices.send(Notice::Event(EngineEvent::Closed {
                        session,
                        status,
                        description: Some(description),
                    }));
                }
            }
        });
    }
}

/// Resolves once the event loop asks the session to close
async fn until_close(commands: &mut mpsc::UnboundedReceiver<Command>) -> CloseStatus {
    loop {
        match commands.recv().await {
            Some(Command::Close(status)) => return status,
            Some(_) => {}
            None => return CloseStatus::GOING_AWAY,
        }
    }
}

/// Pump one established session until it closes
async fn drive<S>(
    session: SessionId,
    ws: WebSocketStream<S>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    notices: mpsc::UnboundedSender<Notice>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    let mut linger: Option<time::Instant> = None;

    let (status, description) = loop {
        let lingering = linger;
        let expiry = async move {
            match lingering {
                Some(at) => sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        ::tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Write(payload)) => {
                    if let Err(e) = sink.send(Message::Binary(payload)).await {
                        break (close_status_for(&e), Some(e.to_string()));
                    }
                }
                Some(Command::Writable) => {
                    let _ = notices.send(Notice::Event(EngineEvent::Writable { session }));
                }
                Some(Command::Close(status)) => {
                    if linger.is_some() {
                        continue;
                    }
                    linger = Some(time::Instant::now() + CLOSE_LINGER);
                    let frame = CloseFrame {
                        code: CloseCode::from(status.code()),
                        reason: "".into(),
                    };
                    if sink.send(Message::Close(Some(frame))).await.is_err() {
                        break (Some(status), None);
                    }
                }
                None => break (Some(CloseStatus::GOING_AWAY), None),
            },
            message = stream.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    let _ = notices.send(Notice::Event(EngineEvent::Frame {
                        session,
                        kind: FrameKind::Binary,
                        fin: true,
                        payload: data.into(),
                    }));
                }
                Some(Ok(Message::Text(text))) => {
                    let _ = notices.send(Notice::Event(EngineEvent::Frame {
                        session,
                        kind: FrameKind::Text,
                        fin: true,
                        payload: text.into_bytes().into(),
                    }));
                }
                Some(Ok(Message::Close(frame))) => {
                    let status = frame.as_ref().map(|f| CloseStatus(u16::from(f.code)));
                    let description = frame
                        .map(|f| f.reason.into_owned())
                        .filter(|r| !r.is_empty());
                    // let tungstenite finish the closing handshake
                    let _ = sink.flush().await;
                    break (status, description);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break (close_status_for(&e), Some(e.to_string())),
                None => break (None, None),
            },
            _ = expiry => break (None, Some("close not acknowledged".to_string())),
        }
    };

    trace!("{} finished with status {:?}", session, status.map(|s| s.code()));
    let _ = notices.send(Notice::Event(EngineEvent::Closed {
        session,
        status,
        description,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datalink::bsc::config::TlsCredentials;
    use url::Url;

    fn engine() -> TokioEngine {
        let connector = native_tls::TlsConnector::new().unwrap();
        TokioEngine::new(Some(connector.into()), WebSocketConfig::default()).unwrap()
    }

    #[test]
    fn test_waker_interrupts_service() {
        let mut engine = engine();
        let waker = engine.waker();
        waker.wake();
        let started = Instant::now();
        let mut events = Vec::new();
        engine
            .service(Some(Instant::now() + Duration::from_secs(10)), &mut events)
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(events.is_empty());
    }

    #[test]
    fn test_service_honors_deadline() {
        let mut engine = engine();
        let mut events = Vec::new();
        engine
            .service(Some(Instant::now() + Duration::from_millis(20)), &mut events)
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_refused_connect_reports_closed() {
        // reserve a port and free it so nothing listens there
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut engine = engine();
        let mut request = ConnectRequest::new(
            Url::parse(&format!("wss://127.0.0.1:{}/", port)).unwrap(),
            WebsocketProtocol::Hub,
        );
        request.resolve().unwrap();
        let session = engine.connect(&request).unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut events = Vec::new();
        while !events
            .iter()
            .any(|e| matches!(e, EngineEvent::Closed { .. }))
        {
            assert!(Instant::now() < deadline, "no close reported");
            engine.service(Some(deadline), &mut events).unwrap();
        }
        assert_eq!(
            events.first(),
            Some(&EngineEvent::Progress {
                session,
                stage: ConnectionState::TcpConnecting
            })
        );
        assert!(matches!(
            events.last(),
            Some(EngineEvent::Closed { status: None, .. })
        ));
        assert!(engine.write(session, b"late").is_err());
        engine.shutdown();
    }

    #[test]
    fn test_write_to_unknown_session() {
        let mut engine = engine();
        let err = engine.write(SessionId(42), b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_bad_credentials_rejected() {
        let credentials = TlsCredentials::new(b"ca".to_vec(), b"cert".to_vec(), b"key".to_vec());
        let config = ServerConfig::new(WebsocketProtocol::Hub, 4443, credentials);
        let addr = "127.0.0.1:0".parse().unwrap();
        assert!(TokioHost
            .server(&config, addr, &TableLimits::default())
            .is_err());
    }
}
