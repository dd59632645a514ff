//! BACnet/SC WebSocket server
//!
//! Listens for hub or direct connections. One engine context and one event
//! loop thread serve the whole connection table. New connections are
//! announced with CONNECTED events and can also be pulled with
//! [`BscServer::accept`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use log::{error, info, warn};

use super::config::{ServerConfig, TableLimits, WebsocketProtocol};
use super::context::Context;
use super::dispatch::EventSender;
use super::engine::{AsyncWebSocketEngine, EngineFactory};
use super::error::{Result, WebsocketError};
use super::event_loop::{EventLoop, LoopScope};
use super::handle::ConnectionHandle;
use super::mutex::Mutex;
use super::net;
use super::state::ConnectionState;

/// BACnet/SC listening context
///
/// Dropping the server stops it and waits for its event loop.
pub struct BscServer {
    protocol: WebsocketProtocol,
    local_addr: SocketAddr,
    context: Arc<Context>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl BscServer {
    /// Bind the listener and start the event loop
    ///
    /// SERVER_STARTED is posted on `events` once the loop runs.
    pub fn start<F: EngineFactory>(
        factory: &F,
        config: &ServerConfig,
        limits: TableLimits,
        events: EventSender,
    ) -> Result<Self> {
        config.validate()?;
        let addr = net::listen_addr(config.iface.as_deref(), config.port).map_err(|e| {
            warn!("cannot resolve listen address {:?}: {}", config.iface, e);
            WebsocketError::BadParam
        })?;

        let context = Arc::new(Context::new(
            limits.server_connections(config.protocol),
            limits,
        ));
        let engine_lock = context.lock("server start").into_engine_lock();
        let engine = factory.server(config, addr, &limits);
        let mut guard = engine_lock.relock("server start");
        let engine = engine.map_err(|e| {
            error!("failed to start server on {}: {}", addr, e);
            WebsocketError::NoResources
        })?;
        guard.waker = Some(engine.waker());
        drop(guard);

        let event_loop = EventLoop::new(
            context.clone(),
            engine,
            LoopScope::Server {
                protocol: config.protocol,
                timeout: config.timeout,
                events,
            },
        );
        let thread = thread::Builder::new()
            .name(format!("bsc-server-{}", addr.port()))
            .spawn(move || event_loop.run())
            .map_err(|e| {
                error!("failed to spawn server event loop: {}", e);
                WebsocketError::NoResources
            })?;

        info!("BACnet/SC {:?} server listening on {}", config.protocol, addr);
        Ok(Self {
            protocol: config.protocol,
            local_addr: addr,
            context,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn protocol(&self) -> WebsocketProtocol {
        self.protocol
    }

    /// Address the listener was bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Ask the event loop to shut down
    ///
    /// Every connection is dropped and every pending operation completes
    /// with `Closed`. Returns immediately; use [`BscServer::join`] to wait.
    pub fn stop(&self) -> Result<()> {
        let mut guard = self.context.lock("server stop");
        if guard.stopping {
            return Err(WebsocketError::InvalidOperation);
        }
        info!("stopping BACnet/SC {:?} server", self.protocol);
        guard.stopping = true;
        guard.wake();
        Ok(())
    }

    /// Wait for the event loop to exit
    pub fn join(&self) {
        let thread = self.thread.lock("server join").take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!("server event loop panicked");
            }
        }
    }

    /// Wait for the next connection to complete its handshake
    ///
    /// Callers are served in the order they called. `None` waits forever.
    pub fn accept(&self, timeout: Option<Duration>) -> Result<ConnectionHandle> {
        self.context.accept(timeout)
    }

    #[cfg(feature = "async")]
    pub async fn accept_async(&self) -> Result<ConnectionHandle> {
        self.context.accept_async().await
    }

    /// Fail every pending `accept` with `OperationCanceled`
    pub fn cancel_accept(&self) {
        self.context.cancel_accept()
    }

    pub fn disconnect(&self, handle: ConnectionHandle) -> Result<()> {
        self.context.disconnect(handle)
    }

    /// Send one message, blocking until the engine has taken it
    pub fn send(&self, handle: ConnectionHandle, payload: impl Into<Bytes>) -> Result<()> {
        self.context.send(handle, payload.into())
    }

    pub fn send_request(&self, handle: ConnectionHandle) -> Result<()> {
        self.context.send_request(handle)
    }

    pub fn dispatch_send(&self, handle: ConnectionHandle, payload: impl Into<Bytes>) -> Result<()> {
        self.context.dispatch_send(handle, payload.into())
    }

    pub fn recv(
        &self,
        handle: ConnectionHandle,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.context.recv(handle, buf, timeout)
    }

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

    /// Remote address of a server connection
    pub fn peer_addr(&self, handle: ConnectionHandle) -> Option<SocketAddr> {
        self.context.peer_addr(handle)
    }

    pub fn state(&self, handle: ConnectionHandle) -> Option<ConnectionState> {
        self.context.state_of(handle)
    }
}

impl Drop for BscServer {
    fn drop(&mut self) {
        let _ = self.stop();
        self.join();
    }
}
