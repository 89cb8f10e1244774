//! Frame struct: one length-prefixed unit of transport.
//!
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use pipeline_share::protocol::{build_frame, Frame};
//! use bytes::Bytes;
//!
//! let frame = Frame::new(Bytes::from_static(b"hello")).unwrap();
//! assert_eq!(frame.len(), 5);
//!
//! let bytes = build_frame(frame.payload(), u32::MAX).unwrap();
//! assert_eq!(&bytes[..4], &[0, 0, 0, 5]);
//! ```

use bytes::Bytes;

use super::wire_format::{Header, HEADER_SIZE, WIRE_MAX_PAYLOAD_SIZE};
use crate::error::Result;

/// A complete protocol frame.
///
/// The header length always equals the payload length; a `Frame` is only
/// constructed once every payload byte is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: Header,
    payload: Bytes,
}

impl Frame {
    /// Create a frame around `payload`, deriving the header from its length.
    pub fn new(payload: Bytes) -> Result<Self> {
        let header = Header::for_payload(payload.len() as u64, WIRE_MAX_PAYLOAD_SIZE)?;
        Ok(Self { header, payload })
    }

    /// Get the decoded header.
    #[inline]
    pub fn header(&self) -> Header {
        self.header
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume the frame, returning the payload (zero-copy).
    #[inline]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Payload length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Check for an empty payload.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Build a complete frame (header + payload) as a single byte vector.
pub fn build_frame(payload: &[u8], max_payload_size: u32) -> Result<Vec<u8>> {
    let header = Header::for_payload(payload.len() as u64, max_payload_size)?;
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    Ok(buf)
}
