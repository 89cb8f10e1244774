//! Server that owns one shared object and serves copies of it.
//!
//! The [`Server`] manages the lifecycle:
//! 1. Bind a TCP listener (address reuse on)
//! 2. Accept connections while the running flag is set
//! 3. Spawn an independent handler task per connection
//! 4. Stop accepting once a `shutdown` request (or [`ShutdownHandle`]) clears
//!    the flag; the listener is closed when [`Server::serve`] returns
//!
//! Per connection the handler loops `AwaitRequest → Dispatch → respond`
//! until the peer disconnects, a transport error occurs, or a `shutdown`
//! request is answered.
//!
//! Shutdown only stops new accepts. Handlers already waiting on other
//! connections keep running until those peers disconnect.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pipeline_share::{Server, ServerConfig, ServerState};
//!
//! let state = Arc::new(ServerState::with_object(build_object()?));
//! let server = Server::bind(ServerConfig::default(), state).await?;
//! server.serve().await?;
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Serialize;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Notify;

use crate::error::{Result, ShareError};
use crate::protocol::{
    Request, RequestEnvelope, Response, NOT_INITIALIZED_MESSAGE, SHUTDOWN_MESSAGE,
};
use crate::transport::{Transfer, TransferConfig};

/// Default bind host.
pub const DEFAULT_HOST: &str = "localhost";

/// Default bind port.
pub const DEFAULT_PORT: u16 = 5000;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 128;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host name or address to bind.
    pub host: String,
    /// Port to bind (0 = ephemeral).
    pub port: u16,
    /// Listen backlog.
    pub backlog: u32,
    /// Close a connection that sends no request for this long.
    ///
    /// `None` waits forever, so a stalled client holds its handler task
    /// until it disconnects.
    pub request_timeout: Option<Duration>,
    /// Framing and staging settings.
    pub transfer: TransferConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            backlog: DEFAULT_BACKLOG,
            request_timeout: None,
            transfer: TransferConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Set the bind host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the bind port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the listen backlog.
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Set the per-request idle timeout.
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the transfer configuration.
    pub fn transfer(mut self, transfer: TransferConfig) -> Self {
        self.transfer = transfer;
        self
    }
}

/// Running flag plus the wake-up used to interrupt a pending accept.
#[derive(Debug, Default)]
struct Lifecycle {
    running: AtomicBool,
    shutdown: Notify,
}

impl Lifecycle {
    fn start(&self) {
        self.running.store(true, Ordering::Release);
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        // notify_one stores a permit, so a stop between accepts is not lost.
        self.shutdown.notify_one();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Cloneable handle that stops a server's accept loop.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    lifecycle: Arc<Lifecycle>,
}

impl ShutdownHandle {
    /// Clear the running flag and wake the accept loop.
    pub fn shutdown(&self) {
        self.lifecycle.stop();
    }

    /// Check whether the server is still accepting.
    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }
}

/// Process-wide server state shared by the accept loop and every handler.
///
/// The object is set at most once and never mutated afterwards, so handlers
/// read it without locking. The running flag is the only mutable state.
#[derive(Debug)]
pub struct ServerState<O> {
    object: OnceLock<Arc<O>>,
    lifecycle: Arc<Lifecycle>,
}

impl<O> ServerState<O> {
    /// State without an object; `get_object` answers "not initialized".
    pub fn new() -> Self {
        Self {
            object: OnceLock::new(),
            lifecycle: Arc::new(Lifecycle::default()),
        }
    }

    /// State holding an already constructed object.
    pub fn with_object(object: O) -> Self {
        let state = Self::new();
        let _ = state.object.set(Arc::new(object));
        state
    }

    /// Install the object. Returns `false` if one was already installed.
    pub fn install(&self, object: O) -> bool {
        self.object.set(Arc::new(object)).is_ok()
    }

    /// Shared reference to the object, if installed.
    pub fn object(&self) -> Option<Arc<O>> {
        self.object.get().cloned()
    }

    /// Check whether the object is installed.
    pub fn is_initialized(&self) -> bool {
        self.object.get().is_some()
    }

    /// Check whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    /// Clear the running flag and wake the accept loop.
    pub fn request_shutdown(&self) {
        self.lifecycle.stop();
    }

    /// Handle that can stop the server from elsewhere in the process.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            lifecycle: self.lifecycle.clone(),
        }
    }
}

impl<O> Default for ServerState<O> {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound server, ready to accept connections.
pub struct Server<O> {
    listener: TcpListener,
    state: Arc<ServerState<O>>,
    config: ServerConfig,
}

impl<O> Server<O>
where
    O: Serialize + Send + Sync + 'static,
{
    /// Resolve the configured host, bind with address reuse and listen.
    ///
    /// Sets the running flag on success.
    pub async fn bind(config: ServerConfig, state: Arc<ServerState<O>>) -> Result<Self> {
        let addr = tokio::net::lookup_host((config.host.as_str(), config.port))
            .await?
            .next()
            .ok_or_else(|| {
                ShareError::Io(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("Could not resolve {}:{}", config.host, config.port),
                ))
            })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(config.backlog)?;

        state.lifecycle.start();
        tracing::info!("Server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            state,
            config,
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared state.
    pub fn state(&self) -> &Arc<ServerState<O>> {
        &self.state
    }

    /// Handle that stops this server's accept loop.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.state.shutdown_handle()
    }

    /// Run the accept loop until shutdown, then close the listener.
    ///
    /// Returns once no new connections will be accepted; handler tasks that
    /// are still serving other connections are left to finish on their own.
    pub async fn serve(self) -> Result<()> {
        let Server {
            listener,
            state,
            config,
        } = self;
        let transfer = Transfer::new(config.transfer.clone());
        let lifecycle = state.lifecycle.clone();

        while lifecycle.is_running() {
            tokio::select! {
                _ = lifecycle.shutdown.notified() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::info!("Client connected from {}", peer);
                        let handler = ConnectionHandler {
                            stream,
                            peer,
                            state: state.clone(),
                            transfer: transfer.clone(),
                            request_timeout: config.request_timeout,
                        };
                        tokio::spawn(handler.run());
                    }
                    Err(e) => {
                        if lifecycle.is_running() {
                            tracing::error!("Error accepting connection: {}", e);
                        }
                    }
                },
            }
        }

        drop(listener);
        tracing::info!("Server stopped accepting connections");
        Ok(())
    }
}

/// What the handler does after answering a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    AwaitRequest,
    Close,
}

/// Serves one accepted connection.
struct ConnectionHandler<O> {
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ServerState<O>>,
    transfer: Transfer,
    request_timeout: Option<Duration>,
}

impl<O> ConnectionHandler<O>
where
    O: Serialize + Send + Sync + 'static,
{
    async fn run(mut self) {
        loop {
            let envelope = match self.await_request().await {
                Some(envelope) => envelope,
                None => break,
            };

            let (response, next) = dispatch(&self.state, envelope);
            if let Err(e) = self.transfer.send_message(&mut self.stream, response).await {
                tracing::warn!("Error sending response to {}: {}", self.peer, e);
                break;
            }
            if next == Next::Close {
                break;
            }
        }
        tracing::info!("Client connection closed ({})", self.peer);
    }

    /// Read the next request; `None` means the connection should close.
    async fn await_request(&mut self) -> Option<RequestEnvelope> {
        let received = match self.request_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.transfer.recv_message(&mut self.stream))
                    .await
                {
                    Ok(received) => received,
                    Err(_) => {
                        tracing::warn!("No request from {} within {:?}", self.peer, limit);
                        return None;
                    }
                }
            }
            None => self.transfer.recv_message(&mut self.stream).await,
        };

        match received {
            Ok(Some(envelope)) => Some(envelope),
            Ok(None) => {
                tracing::debug!("Client {} disconnected", self.peer);
                None
            }
            Err(e) => {
                tracing::warn!("Error receiving request from {}: {}", self.peer, e);
                None
            }
        }
    }
}

/// Turn one decoded request into its response.
fn dispatch<O>(state: &ServerState<O>, envelope: RequestEnvelope) -> (Response<Arc<O>>, Next) {
    let request = match Request::try_from(envelope) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("Rejecting request: {}", e);
            return (Response::error(e.to_string()), Next::AwaitRequest);
        }
    };

    tracing::info!("Received request type: {}", request.kind());
    match request {
        Request::GetObject => match state.object() {
            Some(object) => (Response::object(object), Next::AwaitRequest),
            None => {
                tracing::error!("{}", NOT_INITIALIZED_MESSAGE);
                (Response::error(NOT_INITIALIZED_MESSAGE), Next::AwaitRequest)
            }
        },
        Request::Shutdown => {
            state.request_shutdown();
            (Response::ack(SHUTDOWN_MESSAGE), Next::Close)
        }
    }
}
