//! # Variable-Length Length Prefixes
//!
//! Every revision stored in a chunk starts with its own body length, encoded
//! with the marker-byte varint below. Small documents pay a single byte, and a
//! lease can find the end of a record from nothing but its start offset.
//!
//! ## Encoding Format
//!
//! | Value Range              | Bytes | Format                           |
//! |--------------------------|-------|----------------------------------|
//! | 0 - 240                  | 1     | `[value]`                        |
//! | 241 - 2287               | 2     | `[241 + (v-240)>>8, (v-240)&FF]` |
//! | 2288 - 67823             | 3     | `[249, (v-2288)>>8, (v-2288)&FF]`|
//! | 67824 - 16777215         | 4     | `[250, v>>16, v>>8, v]`          |
//! | 16777216 - 4294967295    | 5     | `[251, v>>24, v>>16, v>>8, v]`   |
//! | 4294967296 - u64::MAX    | 9     | `[255, 8-byte big-endian]`       |
//!
//! Markers 252-254 are invalid.
//!
//! ## Hot Path
//!
//! [`peek_varint`] returns `Option` and never allocates an error; it runs on
//! every lease. [`decode_varint`] wraps it with descriptive `eyre` errors for
//! validation paths.

use eyre::{bail, ensure, Result};

pub const MAX_VARINT_LEN: usize = 9;

pub fn varint_len(value: u64) -> usize {
    match value {
        0..=240 => 1,
        241..=2287 => 2,
        2288..=67823 => 3,
        67824..=0xFF_FFFF => 4,
        0x100_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

/// Writes `value` into `buf` and returns the number of bytes used.
///
/// `buf` must hold at least `varint_len(value)` bytes.
pub fn encode_varint(value: u64, buf: &mut [u8]) -> usize {
    let len = varint_len(value);
    match len {
        1 => buf[0] = value as u8,
        2 => {
            let v = value - 240;
            buf[0] = (241 + (v >> 8)) as u8;
            buf[1] = v as u8;
        }
        3 => {
            let v = value - 2288;
            buf[0] = 249;
            buf[1] = (v >> 8) as u8;
            buf[2] = v as u8;
        }
        4 => {
            buf[0] = 250;
            buf[1..4].copy_from_slice(&value.to_be_bytes()[5..]);
        }
        5 => {
            buf[0] = 251;
            buf[1..5].copy_from_slice(&value.to_be_bytes()[4..]);
        }
        _ => {
            buf[0] = 255;
            buf[1..9].copy_from_slice(&value.to_be_bytes());
        }
    }
    len
}

/// Total encoded width announced by a marker byte, `None` for reserved markers.
#[inline]
pub fn varint_width(marker: u8) -> Option<usize> {
    match marker {
        0..=240 => Some(1),
        241..=248 => Some(2),
        249 => Some(3),
        250 => Some(4),
        251 => Some(5),
        255 => Some(9),
        _ => None,
    }
}

fn be_tail(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

/// Decodes a varint prefix, returning `(value, bytes_read)`, or `None` if the
/// buffer is empty, truncated, or starts with a reserved marker.
#[inline]
pub fn peek_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let first = *buf.first()?;
    let width = varint_width(first)?;
    if width == 1 {
        return Some((first as u64, 1));
    }
    let tail = buf.get(1..width)?;

    let value = match first {
        241..=248 => 240 + ((first as u64 - 241) << 8) + tail[0] as u64,
        249 => 2288 + be_tail(tail),
        _ => be_tail(tail),
    };
    Some((value, width))
}

pub fn decode_varint(buf: &[u8]) -> Result<(u64, usize)> {
    ensure!(!buf.is_empty(), "empty buffer for varint decode");

    match peek_varint(buf) {
        Some(decoded) => Ok(decoded),
        None if (252..=254).contains(&buf[0]) => bail!("invalid varint marker: {}", buf[0]),
        None => bail!("truncated varint with marker {}", buf[0]),
    }
}
