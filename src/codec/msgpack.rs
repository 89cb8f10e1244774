//! MsgPack codec using `rmp-serde`.
//!
//! Always encodes with the named (struct-as-map) representation, so every
//! message on the wire is a map with a `type` or `status` key rather than a
//! positional array.
//!
//! # Example
//!
//! ```
//! use pipeline_share::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Message {
//!     id: u32,
//!     content: String,
//! }
//!
//! let msg = Message { id: 42, content: "hello".to_string() };
//! let encoded = MsgPackCodec::encode(&msg).unwrap();
//! let decoded: Message = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (struct-as-map).
    #[inline]
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Encode a value straight into a writer (struct-as-map).
    ///
    /// Used to serialize into staging files without an intermediate buffer.
    pub fn encode_to<W: Write, T: Serialize + ?Sized>(writer: &mut W, value: &T) -> Result<()> {
        rmp_serde::encode::write_named(writer, value)?;
        Ok(())
    }

    /// Decode a value from a reader.
    pub fn decode_from<R: Read, T: DeserializeOwned>(reader: R) -> Result<T> {
        Ok(rmp_serde::from_read(reader)?)
    }
}
