//! Client builder and fetch loop.
//!
//! The [`ClientBuilder`] provides a fluent API for configuring the endpoint,
//! retry budget and timeouts. The [`Client`] fetches a copy of the shared
//! object, tolerating a server that is not ready yet:
//! 1. Connect (bounded by `connect_timeout`, which also caps the whole attempt)
//! 2. Send `get_object`
//! 3. Success → return the payload; error response or transport failure →
//!    log, sleep `retry_delay`, try again
//! 4. After `max_retries` failed attempts → give up
//!
//! # Example
//!
//! ```ignore
//! use pipeline_share::Client;
//!
//! let client = Client::builder()
//!     .port(5000)
//!     .max_retries(3)
//!     .retry_delay(std::time::Duration::from_secs(1))
//!     .build();
//!
//! let pipeline: Pipeline = client.fetch_or_exit().await;
//! ```

use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::net::TcpStream;

use crate::error::{Result, ShareError};
use crate::protocol::{Request, Response};
use crate::server::{DEFAULT_HOST, DEFAULT_PORT};
use crate::transport::{Transfer, TransferConfig};

/// Default number of fetch attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default pause between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Default bound on one attempt (connect + request + response).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Attempts before giving up (at least one attempt is always made).
    pub max_retries: u32,
    /// Pause between failed attempts.
    pub retry_delay: Duration,
    /// Upper bound on a single attempt.
    pub connect_timeout: Duration,
    /// Framing and staging settings.
    pub transfer: TransferConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            transfer: TransferConfig::default(),
        }
    }
}

/// Builder for configuring and creating a [`Client`].
#[derive(Debug, Clone, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new client builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the server host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set the server port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the number of attempts.
    ///
    /// Default: 3
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    /// Set the pause between attempts.
    ///
    /// Default: 1 second
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    /// Set the per-attempt timeout.
    ///
    /// Default: 5 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the transfer configuration.
    pub fn transfer(mut self, transfer: TransferConfig) -> Self {
        self.config.transfer = transfer;
        self
    }

    /// Build the client.
    pub fn build(self) -> Client {
        Client::new(self.config)
    }
}

/// One-shot client for the shared-object server.
#[derive(Debug, Clone)]
pub struct Client {
    config: ClientConfig,
    transfer: Transfer,
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Create a client from a configuration.
    pub fn new(config: ClientConfig) -> Self {
        let transfer = Transfer::new(config.transfer.clone());
        Self { config, transfer }
    }

    /// Get the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open a connection to the server, bounded by `connect_timeout`.
    pub async fn connect(&self) -> Result<Connection> {
        let addr = (self.config.host.as_str(), self.config.port);
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ShareError::Timeout(self.config.connect_timeout))??;
        stream.set_nodelay(true)?;

        Ok(Connection {
            stream,
            transfer: self.transfer.clone(),
        })
    }

    /// Fetch a copy of the shared object, retrying on any failure.
    ///
    /// Error responses from the server count as failed attempts, same as
    /// refused connections and timeouts. Returns
    /// [`ShareError::RetriesExhausted`] once the budget is spent.
    pub async fn fetch<O>(&self) -> Result<O>
    where
        O: DeserializeOwned + Send + 'static,
    {
        let attempts = self.config.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.fetch_once().await {
                Ok(object) => {
                    tracing::info!("Fetched shared object on attempt {}", attempt);
                    return Ok(object);
                }
                Err(ShareError::Server(message)) => {
                    tracing::warn!(
                        "Attempt {}/{}: server reported error: {}",
                        attempt,
                        attempts,
                        message
                    );
                    last_error = message;
                }
                Err(e) => {
                    tracing::warn!("Attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = e.to_string();
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }

        Err(ShareError::RetriesExhausted {
            attempts,
            last_error,
        })
    }

    /// Like [`Client::fetch`], but terminates the process with exit code 1
    /// once retries are exhausted.
    pub async fn fetch_or_exit<O>(&self) -> O
    where
        O: DeserializeOwned + Send + 'static,
    {
        match self.fetch().await {
            Ok(object) => object,
            Err(e) => {
                tracing::error!(
                    "Could not fetch shared object from {}:{}: {}",
                    self.config.host,
                    self.config.port,
                    e
                );
                std::process::exit(1);
            }
        }
    }

    /// Ask the server to stop accepting connections (single attempt).
    ///
    /// Returns the acknowledgement message.
    pub async fn shutdown_server(&self) -> Result<Option<String>> {
        let limit = self.config.connect_timeout;
        let response = tokio::time::timeout(limit, async {
            let mut connection = self.connect().await?;
            connection.request::<serde::de::IgnoredAny>(Request::Shutdown).await
        })
        .await
        .map_err(|_| ShareError::Timeout(limit))??;

        match response {
            Response::Success { message, .. } => Ok(message),
            Response::Error { message } => Err(ShareError::Server(message)),
        }
    }

    /// One attempt: connect, request, decode; bounded by `connect_timeout`.
    async fn fetch_once<O>(&self) -> Result<O>
    where
        O: DeserializeOwned + Send + 'static,
    {
        let limit = self.config.connect_timeout;
        tokio::time::timeout(limit, async {
            let mut connection = self.connect().await?;
            connection
                .request::<O>(Request::GetObject)
                .await?
                .into_payload()
        })
        .await
        .map_err(|_| ShareError::Timeout(limit))?
    }
}

/// An open connection; requests on it are answered strictly in order.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    transfer: Transfer,
}

impl Connection {
    /// Send a request and wait for its response.
    pub async fn request<O>(&mut self, request: Request) -> Result<Response<O>>
    where
        O: DeserializeOwned + Send + 'static,
    {
        tracing::debug!("Sending {} request", request.kind());
        self.transfer.send_message(&mut self.stream, request).await?;

        self.transfer
            .recv_message(&mut self.stream)
            .await?
            .ok_or(ShareError::ConnectionClosed)
    }

    /// Send an arbitrary serializable message as a request frame.
    ///
    /// Lets callers exercise the server's handling of malformed or unknown
    /// requests.
    pub async fn request_raw<T, O>(&mut self, message: T) -> Result<Response<O>>
    where
        T: serde::Serialize + Send + 'static,
        O: DeserializeOwned + Send + 'static,
    {
        self.transfer.send_message(&mut self.stream, message).await?;

        self.transfer
            .recv_message(&mut self.stream)
            .await?
            .ok_or(ShareError::ConnectionClosed)
    }
}
