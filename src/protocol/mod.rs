//! Protocol module - wire format, frames and messages.
//!
//! This module implements the framing and vocabulary of the protocol:
//! - 4-byte big-endian length header encoding/decoding
//! - Frame struct with typed accessors
//! - Tagged request/response messages

mod frame;
mod message;
mod wire_format;

pub use frame::{build_frame, Frame};
pub use message::{
    Request, RequestEnvelope, RequestKind, Response, NOT_INITIALIZED_MESSAGE, SHUTDOWN_MESSAGE,
};
pub use wire_format::{
    Header, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE, WIRE_MAX_PAYLOAD_SIZE,
};
