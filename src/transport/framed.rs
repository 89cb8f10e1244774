//! Framed transport over any async byte stream.
//!
//! One call moves exactly one frame. Writes go out in bounded chunks and each
//! chunk is written until fully consumed; reads loop on partial reads until
//! the header and then the full body have arrived.
//!
//! A peer that closes before sending any header byte produces `Ok(None)`,
//! the normal "disconnected between requests" signal. A peer that closes
//! after the header has started is a hard [`ShareError::ConnectionClosedMidFrame`].
//!
//! # Example
//!
//! ```ignore
//! use pipeline_share::transport::{recv_frame, send_frame, TransferConfig};
//!
//! let config = TransferConfig::default();
//! send_frame(&mut stream, b"hello", &config).await?;
//! let frame = recv_frame(&mut stream, &config).await?.expect("peer closed");
//! ```

use std::path::PathBuf;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, ShareError};
use crate::protocol::{Frame, Header, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};

/// Configuration shared by the framed and staged transfer paths.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Bytes moved per read/write call on the payload.
    pub chunk_size: usize,
    /// Largest payload accepted on send or receive.
    pub max_payload_size: u32,
    /// Directory for staging files (system temp dir when `None`).
    pub staging_dir: Option<PathBuf>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            staging_dir: None,
        }
    }
}

impl TransferConfig {
    /// Set the chunk size (clamped to at least one byte).
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Set the maximum payload size.
    pub fn max_payload_size(mut self, max_payload_size: u32) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    /// Stage files under `dir` instead of the system temp dir.
    pub fn staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    #[inline]
    pub(crate) fn effective_chunk_size(&self) -> usize {
        self.chunk_size.max(1)
    }
}

/// Write a frame header.
pub async fn write_header<W>(writer: &mut W, header: Header) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&header.encode()).await?;
    Ok(())
}

/// Read a frame header.
///
/// Returns `Ok(None)` when the stream ends before the first header byte.
pub async fn read_header<R>(reader: &mut R) -> Result<Option<Header>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HEADER_SIZE];
    let mut filled = 0;

    while filled < HEADER_SIZE {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ShareError::ConnectionClosedMidFrame {
                expected: HEADER_SIZE as u32,
                received: filled as u64,
            });
        }
        filled += n;
    }

    Ok(Header::decode(&buf))
}

/// Send one frame: length header, then the payload in bounded chunks.
///
/// The length is checked before anything is written. A write failure
/// propagates immediately; there is no retry.
pub async fn send_frame<W>(writer: &mut W, payload: &[u8], config: &TransferConfig) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = Header::for_payload(payload.len() as u64, config.max_payload_size)?;
    write_header(writer, header).await?;

    let mut sent = 0usize;
    for chunk in payload.chunks(config.effective_chunk_size()) {
        writer.write_all(chunk).await?;
        sent += chunk.len();
        tracing::trace!("Sent {}/{} bytes", sent, payload.len());
    }

    writer.flush().await?;
    Ok(())
}

/// Receive one frame.
///
/// Returns `Ok(None)` if the peer closed before sending a header.
pub async fn recv_frame<R>(reader: &mut R, config: &TransferConfig) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let header = match read_header(reader).await? {
        Some(header) => header,
        None => return Ok(None),
    };
    header.validate(config.max_payload_size)?;

    let expected = header.payload_length as usize;
    let chunk_size = config.effective_chunk_size();
    let mut payload = BytesMut::with_capacity(expected);

    while payload.len() < expected {
        let start = payload.len();
        let want = (expected - start).min(chunk_size);
        payload.resize(start + want, 0);

        let n = reader.read(&mut payload[start..]).await?;
        payload.truncate(start + n);

        if n == 0 {
            return Err(ShareError::ConnectionClosedMidFrame {
                expected: header.payload_length,
                received: start as u64,
            });
        }
        tracing::trace!("Received {}/{} bytes", payload.len(), expected);
    }

    Frame::new(payload.freeze()).map(Some)
}

/// Copy up to `len` bytes from `reader` to `writer` in `chunk_size` pieces.
///
/// Stops early only if `reader` reaches end of stream; returns the number of
/// bytes copied so callers can tell a short copy from a complete one.
pub(crate) async fn copy_exact<R, W>(
    reader: &mut R,
    writer: &mut W,
    len: u64,
    chunk_size: usize,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; (len.min(chunk_size as u64)) as usize];
    let mut copied = 0u64;

    while copied < len {
        let want = (len - copied).min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        copied += n as u64;
        tracing::trace!("Copied {}/{} bytes", copied, len);
    }

    Ok(copied)
}
