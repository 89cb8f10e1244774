//! Transport module - framed byte-stream I/O and staged message transfer.
//!
//! - [`send_frame`] / [`recv_frame`] move one raw payload per call.
//! - [`Transfer`] moves one serialized message per call through a
//!   [`StagingFile`].

mod framed;
mod staging;

pub use framed::{read_header, recv_frame, send_frame, write_header, TransferConfig};
pub use staging::{StagingFile, Transfer, STAGING_PREFIX, STAGING_SUFFIX};
