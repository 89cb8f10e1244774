//! Wire format encoding and decoding.
//!
//! Every frame starts with a 4-byte header carrying the payload length:
//! ```text
//! ┌──────────────┬──────────────────────────┐
//! │ Length       │ Payload                  │
//! │ 4 bytes      │ `Length` bytes           │
//! │ uint32 BE    │ MsgPack message or blob  │
//! └──────────────┴──────────────────────────┘
//! ```

use crate::error::{Result, ShareError};

/// Header size in bytes (fixed, exactly 4).
pub const HEADER_SIZE: usize = 4;

/// Default maximum payload size (1 GB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 1_073_741_824;

/// Largest length the header can express.
pub const WIRE_MAX_PAYLOAD_SIZE: u32 = u32::MAX;

/// Default chunk size for streaming payload bytes (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(payload_length: u32) -> Self {
        Self { payload_length }
    }

    /// Build a header for a payload of `len` bytes.
    ///
    /// Rejects lengths the header cannot represent and lengths above
    /// `max_payload_size`, before anything touches the wire.
    ///
    /// # Example
    ///
    /// ```
    /// use pipeline_share::protocol::{Header, DEFAULT_MAX_PAYLOAD_SIZE};
    ///
    /// let header = Header::for_payload(5, DEFAULT_MAX_PAYLOAD_SIZE).unwrap();
    /// assert_eq!(header.encode(), [0, 0, 0, 5]);
    /// ```
    pub fn for_payload(len: u64, max_payload_size: u32) -> Result<Self> {
        let payload_length = u32::try_from(len).map_err(|_| ShareError::PayloadTooLarge {
            size: len,
            max: WIRE_MAX_PAYLOAD_SIZE,
        })?;
        let header = Self::new(payload_length);
        header.validate(max_payload_size)?;
        Ok(header)
    }

    /// Encode header to bytes (Big Endian).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        self.payload_length.to_be_bytes()
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let bytes: [u8; HEADER_SIZE] = buf.get(..HEADER_SIZE)?.try_into().ok()?;
        Some(Self::new(u32::from_be_bytes(bytes)))
    }

    /// Check the payload length against the configured maximum.
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.payload_length > max_payload_size {
            return Err(ShareError::PayloadTooLarge {
                size: u64::from(self.payload_length),
                max: max_payload_size,
            });
        }
        Ok(())
    }
}
