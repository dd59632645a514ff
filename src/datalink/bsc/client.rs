//! BACnet/SC WebSocket client
//!
//! Opens outbound connections to hubs or direct connection peers. Every
//! connection gets its own engine context and event loop thread; all of
//! them share one connection table.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, error};

use super::close_reason::CloseStatus;
use super::config::{ClientConfig, TableLimits};
use super::context::{ConnectionRecord, Context};
use super::dispatch::EventSender;
use super::engine::{AsyncWebSocketEngine, ConnectRequest, EngineFactory};
use super::error::{ErrorCode, Result, WebsocketError};
use super::event_loop::{EventLoop, LoopScope};
use super::handle::ConnectionHandle;
use super::mutex::Mutex;
use super::state::{ConnectionRole, ConnectionState};

/// Engine used by [`BscClient::new`]
#[cfg(feature = "async")]
pub type DefaultFactory = super::engine::tokio::TokioHost;
#[cfg(not(feature = "async"))]
pub type DefaultFactory = super::engine::polling::PollingHost;

/// BACnet/SC WebSocket client
///
/// Dropping the client disconnects every connection and waits for their
/// event loops to exit.
pub struct BscClient<F: EngineFactory = DefaultFactory> {
    factory: F,
    context: Arc<Context>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl BscClient<DefaultFactory> {
    /// Create a client with the default engine and table limits
    pub fn new() -> Self {
        Self::with_factory(DefaultFactory::default(), TableLimits::default())
    }
}

impl Default for BscClient<DefaultFactory> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: EngineFactory> BscClient<F> {
    pub fn with_factory(factory: F, limits: TableLimits) -> Self {
        Self {
            factory,
            context: Arc::new(Context::new(limits.client_connections, limits)),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Start connecting to `config.url`
    ///
    /// Returns as soon as the connection has a slot and an event loop;
    /// progress is reported on `events` (CONNECTED or DISCONNECTED). Use
    /// [`BscClient::wait_connected`] to block until the handshake is done.
    pub fn connect(&self, config: &ClientConfig, events: EventSender) -> Result<ConnectionHandle> {
        let url = config.validate()?;
        let limits = *self.context.limits();

        let mut guard = self.context.lock("connect");
        if guard.stopping {
            return Err(WebsocketError::InvalidOperation);
        }
        let record = ConnectionRecord::new(
            ConnectionRole::Client(config.protocol),
            ConnectionState::Configuring,
            events,
            config.timeout,
            &limits,
        );
        let handle = guard.table.allocate(record)?;

        let engine_lock = guard.into_engine_lock();
        let engine = self.factory.client(config, &limits);
        let mut guard = engine_lock.relock("connect");

        let engine = match engine {
            Ok(engine) => engine,
            Err(e) => {
                error!("failed to create engine for {}: {}", url, e);
                guard.table.release(handle);
                return Err(WebsocketError::NoResources);
            }
        };
        if let Some(record) = guard.table.get_mut(handle) {
            record.waker = Some(engine.waker());
        }
        drop(guard);

        let request = ConnectRequest::new(url, config.protocol);
        let event_loop = EventLoop::new(
            self.context.clone(),
            engine,
            LoopScope::Client { handle, request },
        );
        let spawned = thread::Builder::new()
            .name(format!("bsc-client-{}", handle.slot()))
            .spawn(move || event_loop.run());

        match spawned {
            Ok(thread) => {
                let mut threads = self.threads.lock("connect");
                threads.retain(|t| !t.is_finished());
                threads.push(thread);
                debug!("connection {} started", handle);
                Ok(handle)
            }
            Err(e) => {
                error!("failed to spawn event loop: {}", e);
                self.context.lock("connect").table.release(handle);
                Err(WebsocketError::NoResources)
            }
        }
    }

    /// Block until `handle` is connected
    ///
    /// Fails with `Closed` if the connection attempt failed, or `TimedOut`
    /// if the handshake did not finish within the configured timeout.
    pub fn wait_connected(&self, handle: ConnectionHandle) -> Result<()> {
        self.context.wait_connected(handle)
    }

    /// Close the connection; pending operations complete with `Closed`
    pub fn disconnect(&self, handle: ConnectionHandle) -> Result<()> {
        self.context.disconnect(handle)
    }

    /// Send one message, blocking until the engine has taken it
    pub fn send(&self, handle: ConnectionHandle, payload: impl Into<Bytes>) -> Result<()> {
        self.context.send(handle, payload.into())
    }

    /// Ask for a [`WebsocketEvent::Sendable`](super::WebsocketEvent::Sendable) event
    pub fn send_request(&self, handle: ConnectionHandle) -> Result<()> {
        self.context.send_request(handle)
    }

    /// Write one message after a SENDABLE event
    pub fn dispatch_send(&self, handle: ConnectionHandle, payload: impl Into<Bytes>) -> Result<()> {
        self.context.dispatch_send(handle, payload.into())
    }

    /// Receive one message into `buf`
    pub fn recv(
        &self,
        handle: ConnectionHandle,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.context.recv(handle, buf, timeout)
    }

    /// Receive one complete message
    pub fn recv_message(&self, handle: ConnectionHandle, timeout: Duration) -> Result<Bytes> {
        self.context.recv_message(handle, timeout)
    }

    #[cfg(feature = "async")]
    pub async fn send_async(
        &self,
        handle: ConnectionHandle,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.context.send_async(handle, payload.into()).await
    }

    #[cfg(feature = "async")]
    pub async fn recv_async(&self, handle: ConnectionHandle) -> Result<Bytes> {
        self.context.recv_async(handle).await
    }

    pub fn peer_addr(&self, handle: ConnectionHandle) -> Option<SocketAddr> {
        self.context.peer_addr(handle)
    }

    /// Current state, or `None` once the slot is free
    pub fn state(&self, handle: ConnectionHandle) -> Option<ConnectionState> {
        self.context.state_of(handle)
    }
}

impl<F: EngineFactory> Drop for BscClient<F> {
    fn drop(&mut self) {
        {
            let mut guard = self.context.lock("shutdown");
            guard.stopping = true;
            let now = Instant::now();
            for (_, record) in guard.table.iter_mut() {
                record.begin_disconnect(ErrorCode::Success, CloseStatus::NORMAL, now);
                record.wake();
            }
        }
        let threads = std::mem::take(&mut *self.threads.lock("shutdown"));
        for thread in threads {
            if thread.join().is_err() {
                error!("client event loop panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datalink::bsc::config::{TlsCredentials, WebsocketProtocol};
    use crate::datalink::bsc::dispatch::{event_channel, EventReceiver, WebsocketEvent};
    use crate::datalink::bsc::engine::scripted::{EngineCall, ScriptOptions, ScriptedHost};
    use crate::datalink::bsc::engine::{EngineEvent, FrameKind, SessionId};

    const WAIT: Duration = Duration::from_secs(5);

    fn config() -> ClientConfig {
        let mut config = ClientConfig::new(
            WebsocketProtocol::Hub,
            "wss://192.0.2.10:4443",
            TlsCredentials::new(b"ca".to_vec(), b"cert".to_vec(), b"key".to_vec()),
        );
        config.timeout = Duration::from_secs(2);
        config
    }

    fn next_event(rx: &mut EventReceiver) -> WebsocketEvent {
        let deadline = Instant::now() + WAIT;
        loop {
            if let Ok(event) = rx.try_recv() {
                return event;
            }
            assert!(Instant::now() < deadline, "no event");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn connected_client() -> (
        BscClient<ScriptedHost>,
        ScriptedHost,
        ConnectionHandle,
        EventReceiver,
    ) {
        let _ = env_logger::builder().is_test(true).try_init();
        let host = ScriptedHost::default();
        let client = BscClient::with_factory(host.clone(), TableLimits::default());
        let (tx, mut rx) = event_channel();
        let handle = client.connect(&config(), tx).unwrap();
        client.wait_connected(handle).unwrap();
        assert_eq!(next_event(&mut rx), WebsocketEvent::Connected { handle });
        (client, host, handle, rx)
    }

    #[test]
    fn test_connect_validates_before_allocating() {
        let host = ScriptedHost::default();
        let client = BscClient::with_factory(host.clone(), TableLimits::default());
        let (tx, _rx) = event_channel();
        let mut bad = config();
        bad.url = "http://hub.example.com".into();
        assert_eq!(client.connect(&bad, tx).unwrap_err(), WebsocketError::BadParam);
        assert_eq!(host.created(), 0);
    }

    #[test]
    fn test_engine_gets_resolved_address() {
        let (_client, host, _handle, _rx) = connected_client();
        let addr = SocketAddr::from(([192, 0, 2, 10], 4443));
        assert_eq!(
            host.last().calls().first(),
            Some(&EngineCall::Connect(SessionId(1), vec![addr]))
        );
    }

    #[test]
    fn test_table_full() {
        let host = ScriptedHost::default();
        let limits = TableLimits {
            client_connections: 1,
            ..TableLimits::default()
        };
        let client = BscClient::with_factory(host, limits);
        let (tx, _rx) = event_channel();
        client.connect(&config(), tx.clone()).unwrap();
        assert_eq!(client.connect(&config(), tx).unwrap_err(), WebsocketError::NoResources);
    }

    #[test]
    fn test_engine_failure_frees_slot() {
        let host = ScriptedHost::default();
        host.fail_creation(true);
        let limits = TableLimits {
            client_connections: 1,
            ..TableLimits::default()
        };
        let client = BscClient::with_factory(host.clone(), limits);
        let (tx, _rx) = event_channel();
        assert_eq!(client.connect(&config(), tx.clone()).unwrap_err(), WebsocketError::NoResources);
        host.fail_creation(false);
        assert!(client.connect(&config(), tx).is_ok());
    }

    #[test]
    fn test_send_and_receive() {
        let (client, host, handle, mut rx) = connected_client();
        let engine = host.last();

        client.send(handle, &b"hello"[..]).unwrap();
        assert!(engine.calls().contains(&EngineCall::Write(SessionId(1), b"hello".to_vec())));

        engine.push_message(SessionId(1), b"unsolicited");
        assert_eq!(
            next_event(&mut rx),
            WebsocketEvent::Received {
                handle,
                payload: Bytes::from_static(b"unsolicited"),
            }
        );
    }

    #[test]
    fn test_recv_gets_message_before_event() {
        let (client, host, handle, mut rx) = connected_client();
        let engine = host.last();
        let pusher = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            engine.push_message(SessionId(1), b"for recv");
        });
        let mut buf = [0u8; 64];
        let n = client.recv(handle, &mut buf, WAIT).unwrap();
        assert_eq!(&buf[..n], b"for recv");
        pusher.join().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_recv_buffer_too_small() {
        let (client, host, handle, _rx) = connected_client();
        let engine = host.last();
        let pusher = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            engine.push_message(SessionId(1), b"0123456789");
        });
        let mut buf = [0u8; 4];
        assert_eq!(
            client.recv(handle, &mut buf, WAIT).unwrap_err(),
            WebsocketError::BufferTooSmall
        );
        assert_eq!(&buf, b"0123");
        pusher.join().unwrap();
    }

    #[test]
    fn test_two_phase_send() {
        let (client, host, handle, mut rx) = connected_client();
        client.send_request(handle).unwrap();
        assert_eq!(
            client.send_request(handle).unwrap_err(),
            WebsocketError::OperationInProgress
        );
        assert_eq!(next_event(&mut rx), WebsocketEvent::Sendable { handle });
        client.dispatch_send(handle, &b"granted"[..]).unwrap();
        assert!(host
            .last()
            .calls()
            .contains(&EngineCall::Write(SessionId(1), b"granted".to_vec())));
        // permission is used up
        assert_eq!(
            client.dispatch_send(handle, &b"again"[..]).unwrap_err(),
            WebsocketError::InvalidOperation
        );
    }

    #[test]
    fn test_unused_permission_expires() {
        let (client, host, handle, mut rx) = connected_client();
        client.send_request(handle).unwrap();
        assert_eq!(next_event(&mut rx), WebsocketEvent::Sendable { handle });
        // the application ignores SENDABLE
        assert_eq!(
            client.send(handle, &b"early"[..]).unwrap_err(),
            WebsocketError::OperationInProgress
        );

        let deadline = Instant::now() + WAIT;
        let result = loop {
            match client.send(handle, &b"later"[..]) {
                Err(WebsocketError::OperationInProgress) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(50));
                }
                other => break other,
            }
        };
        assert_eq!(result, Ok(()));
        assert!(host
            .last()
            .calls()
            .contains(&EngineCall::Write(SessionId(1), b"later".to_vec())));
        assert_eq!(
            client.dispatch_send(handle, &b"stale"[..]).unwrap_err(),
            WebsocketError::InvalidOperation
        );
    }

    #[test]
    fn test_second_send_while_pending() {
        let _ = env_logger::builder().is_test(true).try_init();
        let host = ScriptedHost::with_options(ScriptOptions {
            writable_on_request: false,
            ..ScriptOptions::default()
        });
        let client = Arc::new(BscClient::with_factory(host.clone(), TableLimits::default()));
        let (tx, _rx) = event_channel();
        let handle = client.connect(&config(), tx).unwrap();
        client.wait_connected(handle).unwrap();

        let sender = {
            let client = client.clone();
            thread::spawn(move || client.send(handle, &b"first"[..]))
        };
        let engine = host.last();
        engine
            .wait_for_call(WAIT, |c| matches!(c, EngineCall::RequestWritable(_)))
            .unwrap();
        assert_eq!(
            client.send(handle, &b"second"[..]).unwrap_err(),
            WebsocketError::OperationInProgress
        );
        engine.push(EngineEvent::Writable {
            session: SessionId(1),
        });
        assert_eq!(sender.join().unwrap(), Ok(()));
        assert!(engine.calls().contains(&EngineCall::Write(SessionId(1), b"first".to_vec())));
        assert!(!engine.calls().contains(&EngineCall::Write(SessionId(1), b"second".to_vec())));
    }

    #[test]
    fn test_short_write_closes() {
        let (client, host, handle, mut rx) = connected_client();
        let engine = host.last();
        engine.set_options(ScriptOptions {
            short_writes: true,
            ..ScriptOptions::default()
        });
        assert_eq!(client.send(handle, &b"lost"[..]).unwrap_err(), WebsocketError::Closed);
        match next_event(&mut rx) {
            WebsocketEvent::Disconnected { reason, .. } => {
                assert_eq!(reason, ErrorCode::WebsocketError)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_local_disconnect() {
        let (client, host, handle, mut rx) = connected_client();
        client.disconnect(handle).unwrap();
        assert_eq!(
            next_event(&mut rx),
            WebsocketEvent::Disconnected {
                handle,
                reason: ErrorCode::Success,
                description: None,
            }
        );
        let engine = host.last();
        assert!(engine.calls().contains(&EngineCall::Close(SessionId(1), CloseStatus::NORMAL)));
        engine.wait_for_call(WAIT, |c| *c == EngineCall::Shutdown).unwrap();
        assert_eq!(client.state(handle), None);
        assert_eq!(client.send_request(handle).unwrap_err(), WebsocketError::BadParam);
    }

    #[test]
    fn test_peer_close_reason() {
        let (client, host, handle, mut rx) = connected_client();
        host.last().push(EngineEvent::Closed {
            session: SessionId(1),
            status: Some(CloseStatus::GOING_AWAY),
            description: Some("bye".into()),
        });
        assert_eq!(
            next_event(&mut rx),
            WebsocketEvent::Disconnected {
                handle,
                reason: ErrorCode::EndpointLeaves,
                description: Some("bye".into()),
            }
        );
        assert_eq!(
            client.recv_message(handle, Duration::from_millis(10)).unwrap_err(),
            WebsocketError::BadParam
        );
    }

    #[test]
    fn test_non_binary_frame_rejected() {
        let (client, host, handle, mut rx) = connected_client();
        let engine = host.last();
        engine.set_options(ScriptOptions {
            closed_on_close: false,
            ..ScriptOptions::default()
        });
        engine.push(EngineEvent::Frame {
            session: SessionId(1),
            kind: FrameKind::Text,
            fin: true,
            payload: Bytes::from_static(b"{}"),
        });
        engine
            .wait_for_call(WAIT, |c| {
                *c == EngineCall::Close(SessionId(1), CloseStatus::UNACCEPTABLE_OPCODE)
            })
            .unwrap();
        assert_eq!(client.state(handle), Some(ConnectionState::Disconnecting));
        assert!(rx.try_recv().is_err());

        engine.push(EngineEvent::Closed {
            session: SessionId(1),
            status: Some(CloseStatus::UNACCEPTABLE_OPCODE),
            description: None,
        });
        match next_event(&mut rx) {
            WebsocketEvent::Disconnected { reason, .. } => {
                assert_eq!(reason, ErrorCode::DataNotAccepted)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_fragments_reassembled() {
        let (_client, host, handle, mut rx) = connected_client();
        let engine = host.last();
        for (part, fin) in [(&b"ab"[..], false), (&b"cd"[..], false), (&b"e"[..], true)] {
            engine.push(EngineEvent::Frame {
                session: SessionId(1),
                kind: FrameKind::Binary,
                fin,
                payload: Bytes::copy_from_slice(part),
            });
        }
        assert_eq!(
            next_event(&mut rx),
            WebsocketEvent::Received {
                handle,
                payload: Bytes::from_static(b"abcde"),
            }
        );
    }

    #[test]
    fn test_connect_timeout() {
        let _ = env_logger::builder().is_test(true).try_init();
        let host = ScriptedHost::with_options(ScriptOptions {
            establish_on_connect: false,
            ..ScriptOptions::default()
        });
        let client = BscClient::with_factory(host, TableLimits::default());
        let (tx, mut rx) = event_channel();
        let mut config = config();
        config.timeout = Duration::from_millis(50);
        let handle = client.connect(&config, tx).unwrap();
        assert_eq!(client.wait_connected(handle).unwrap_err(), WebsocketError::TimedOut);
        assert_eq!(
            next_event(&mut rx),
            WebsocketEvent::Disconnected {
                handle,
                reason: ErrorCode::Timeout,
                description: None,
            }
        );
    }

    #[test]
    fn test_drop_disconnects_everything() {
        let (client, host, handle, mut rx) = connected_client();
        drop(client);
        assert!(host.last().is_shut_down());
        assert_eq!(
            next_event(&mut rx),
            WebsocketEvent::Disconnected {
                handle,
                reason: ErrorCode::Success,
                description: None,
            }
        );
    }

    #[tokio::test]
    async fn test_async_round_trip() {
        let (client, host, handle, _rx) = connected_client();
        client.send_async(handle, &b"ping"[..]).await.unwrap();
        let engine = host.last();
        let reply = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            engine.push_message(SessionId(1), b"pong");
        };
        // the receive is queued on its first poll, before the reply arrives
        let (message, ()) = tokio::join!(
            tokio::time::timeout(WAIT, client.recv_async(handle)),
            reply
        );
        assert_eq!(&message.unwrap().unwrap()[..], b"pong");
    }
}
