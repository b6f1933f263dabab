//! # Encoding Module
//!
//! Byte-level codecs used by the revision framing:
//!
//! - **Varint encoding**: Variable-length length prefixes for revision bodies

pub mod varint;

pub use varint::{
    decode_varint, encode_varint, peek_varint, varint_len, varint_width, MAX_VARINT_LEN,
};
