//! # pipeline-share
//!
//! Serve one expensive, slow-to-construct object to short-lived client
//! processes over TCP.
//!
//! ## Architecture
//!
//! - **Framing**: 4-byte big-endian length header + payload, chunked I/O
//! - **Staging**: every message passes through a temporary file on both
//!   sides, so memory stays bounded for large payloads
//! - **Protocol**: MsgPack maps tagged `type` (requests) or `status`
//!   (responses)
//! - **Server**: one handler task per connection, shared read-only object,
//!   atomic running flag
//! - **Client**: bounded retries with a fixed delay
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pipeline_share::{Client, Server, ServerConfig, ServerState};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let state = Arc::new(ServerState::with_object(String::from("expensive")));
//!     let server = Server::bind(ServerConfig::default().port(0), state).await?;
//!     let port = server.local_addr()?.port();
//!     tokio::spawn(server.serve());
//!
//!     let object: String = Client::builder().port(port).build().fetch().await?;
//!     assert_eq!(object, "expensive");
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod transport;

mod client;
mod server;

pub use client::{Client, ClientBuilder, ClientConfig, Connection};
pub use error::{Result, ShareError};
pub use server::{Server, ServerConfig, ServerState, ShutdownHandle};

/// Default endpoint and client retry settings.
pub mod defaults {
    pub use crate::client::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY};
    pub use crate::server::{DEFAULT_BACKLOG, DEFAULT_HOST, DEFAULT_PORT};
}
