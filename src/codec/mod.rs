//! Codec module - serialization/deserialization for frame payloads.
//!
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (`to_vec_named`), with
//!   in-memory and reader/writer entry points.
//!
//! # Design
//!
//! Codecs are marker structs with static methods rather than trait objects,
//! so the codec is chosen at compile time.

mod msgpack;

pub use msgpack::MsgPackCodec;
