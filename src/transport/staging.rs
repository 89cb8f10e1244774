//! Disk-backed staging for whole-message transfer.
//!
//! Outbound messages are serialized into a staging file, measured, announced
//! with a length header and streamed to the socket in chunks. Inbound frames
//! are streamed into a staging file and deserialized from there. Peak memory
//! stays near one chunk instead of a serialized copy plus a socket buffer.
//!
//! ```text
//! send:  value ─► encode ─► staging file ─► header(len) ─► chunks ─► socket
//! recv:  socket ─► header(len) ─► chunks ─► staging file ─► decode ─► value
//! ```
//!
//! Each call owns exactly one [`StagingFile`], removed when the call returns
//! on every path. Removal failures are logged, never returned.

use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::framed::{copy_exact, read_header, write_header, TransferConfig};
use crate::codec::MsgPackCodec;
use crate::error::{Result, ShareError};
use crate::protocol::Header;

/// Filename prefix of every staging file.
pub const STAGING_PREFIX: &str = "pipeline-share-";

/// Filename suffix of every staging file.
pub const STAGING_SUFFIX: &str = ".stage";

/// Uniquely named temporary file scoped to one send or receive.
///
/// Deleted on drop.
#[derive(Debug)]
pub struct StagingFile {
    temp: Option<TempPath>,
    path: PathBuf,
}

impl StagingFile {
    /// Create an empty staging file in `dir`, or the system temp dir.
    pub fn create(dir: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(STAGING_PREFIX).suffix(STAGING_SUFFIX);

        let file = match dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        let temp = file.into_temp_path();
        let path = temp.to_path_buf();

        Ok(Self {
            temp: Some(temp),
            path,
        })
    }

    /// Path of the staging file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if let Some(temp) = self.temp.take() {
            if let Err(e) = temp.close() {
                tracing::warn!(
                    "Failed to remove staging file {}: {}",
                    self.path.display(),
                    e
                );
            }
        }
    }
}

/// Message transfer through staging files.
#[derive(Debug, Clone, Default)]
pub struct Transfer {
    config: TransferConfig,
}

impl Transfer {
    /// Create a transfer with the given configuration.
    pub fn new(config: TransferConfig) -> Self {
        Self { config }
    }

    /// Get the configuration.
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Serialize `value` and send it as one frame.
    ///
    /// Returns the payload length announced in the header. The header and the
    /// streamed bytes always agree; a staging file that comes up short is a
    /// protocol error.
    pub async fn send_message<W, T>(&self, writer: &mut W, value: T) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
        T: Serialize + Send + 'static,
    {
        let staging = StagingFile::create(self.config.staging_dir.as_deref())?;

        let path = staging.path().to_path_buf();
        let size = tokio::task::spawn_blocking(move || -> Result<u64> {
            let file = std::fs::OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(&path)?;
            let mut out = BufWriter::new(file);
            MsgPackCodec::encode_to(&mut out, &value)?;
            out.flush()?;
            Ok(out.get_ref().metadata()?.len())
        })
        .await??;

        let header = Header::for_payload(size, self.config.max_payload_size)?;
        tracing::debug!("Sending staged message of {} bytes", size);
        write_header(writer, header).await?;

        let mut file = tokio::fs::File::open(staging.path()).await?;
        let sent = copy_exact(&mut file, writer, size, self.config.effective_chunk_size()).await?;
        if sent != size {
            return Err(ShareError::Protocol(format!(
                "Staging file yielded {} of {} announced bytes",
                sent, size
            )));
        }

        writer.flush().await?;
        Ok(size)
    }

    /// Receive one frame and deserialize it.
    ///
    /// Returns `Ok(None)` if the peer closed before sending a header.
    pub async fn recv_message<R, T>(&self, reader: &mut R) -> Result<Option<T>>
    where
        R: AsyncRead + Unpin,
        T: DeserializeOwned + Send + 'static,
    {
        let header = match read_header(reader).await? {
            Some(header) => header,
            None => return Ok(None),
        };
        header.validate(self.config.max_payload_size)?;

        let staging = StagingFile::create(self.config.staging_dir.as_deref())?;
        let expected = header.payload_length;
        tracing::debug!("Receiving staged message of {} bytes", expected);

        let mut file = tokio::fs::File::create(staging.path()).await?;
        let received = copy_exact(
            reader,
            &mut file,
            u64::from(expected),
            self.config.effective_chunk_size(),
        )
        .await?;
        file.flush().await?;
        drop(file);

        if received < u64::from(expected) {
            return Err(ShareError::ConnectionClosedMidFrame { expected, received });
        }

        let path = staging.path().to_path_buf();
        let value = tokio::task::spawn_blocking(move || -> Result<T> {
            let file = std::fs::File::open(&path)?;
            MsgPackCodec::decode_from(BufReader::new(file))
        })
        .await??;

        Ok(Some(value))
    }
}
