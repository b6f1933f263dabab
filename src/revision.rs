//! # Revision Framing
//!
//! A revision is an immutable document body preceded by its own length:
//!
//! ```text
//! +----------------+---------------------------+
//! | varint(len)    | body (len bytes)          |
//! +----------------+---------------------------+
//! ```
//!
//! The cache stores the framed bytes verbatim, so the record size the cache
//! reserves is the framed length, and a lease recovers the record extent from
//! the prefix alone.

use eyre::{ensure, eyre, Result};

use crate::encoding::{encode_varint, peek_varint, varint_len, MAX_VARINT_LEN};

/// An owned, self-describing revision body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionBytes {
    bytes: Vec<u8>,
    header_len: usize,
}

impl RevisionBytes {
    /// Frames `body` with its length prefix.
    pub fn encode(body: &[u8]) -> Self {
        let mut header = [0u8; MAX_VARINT_LEN];
        let header_len = encode_varint(body.len() as u64, &mut header);

        let mut bytes = Vec::with_capacity(header_len + body.len());
        bytes.extend_from_slice(&header[..header_len]);
        bytes.extend_from_slice(body);

        Self { bytes, header_len }
    }

    /// Adopts bytes that are already framed, checking that the prefix
    /// describes exactly the bytes that follow it.
    pub fn from_framed(bytes: Vec<u8>) -> Result<Self> {
        let (body_len, header_len) =
            peek_varint(&bytes).ok_or_else(|| eyre!("revision has no valid length prefix"))?;
        let expected = usize::try_from(body_len)
            .ok()
            .and_then(|len| len.checked_add(header_len))
            .ok_or_else(|| eyre!("revision length {} is not addressable", body_len))?;

        ensure!(
            expected == bytes.len(),
            "revision prefix describes {} framed bytes but {} were supplied",
            expected,
            bytes.len()
        );

        Ok(Self { bytes, header_len })
    }

    /// Framed length: prefix plus body.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Never true; even an empty body carries a one-byte prefix.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn body(&self) -> &[u8] {
        &self.bytes[self.header_len..]
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl AsRef<[u8]> for RevisionBytes {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

/// Framed length of the record starting at `buf[0]`, decoded from its prefix.
///
/// Returns `None` when the prefix is malformed. Does not check that `buf`
/// actually holds the whole record.
#[inline]
pub fn framed_len(buf: &[u8]) -> Option<usize> {
    let (body_len, header_len) = peek_varint(buf)?;
    usize::try_from(body_len).ok()?.checked_add(header_len)
}

/// Framed length of a body of `body_len` bytes.
pub fn framed_size(body_len: usize) -> usize {
    varint_len(body_len as u64) + body_len
}

/// Splits a framed record into its body.
#[inline]
pub(crate) fn body_of(record: &[u8]) -> &[u8] {
    match peek_varint(record) {
        Some((_, header_len)) => &record[header_len..],
        None => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_small_body_uses_single_byte_prefix() {
        let rev = RevisionBytes::encode(b"hello");
        assert_eq!(rev.len(), 6);
        assert_eq!(rev.as_bytes()[0], 5);
        assert_eq!(rev.body(), b"hello");
    }

    #[test]
    fn test_encode_large_body() {
        let body = vec![0x5Au8; 5000];
        let rev = RevisionBytes::encode(&body);
        assert_eq!(rev.len(), framed_size(5000));
        assert_eq!(framed_len(rev.as_bytes()), Some(rev.len()));
        assert_eq!(rev.body(), &body[..]);
    }

    #[test]
    fn test_empty_body_is_still_framed() {
        let rev = RevisionBytes::encode(&[]);
        assert_eq!(rev.len(), 1);
        assert!(!rev.is_empty());
        assert!(rev.body().is_empty());
    }

    #[test]
    fn test_from_framed_accepts_exact_record() {
        let original = RevisionBytes::encode(b"document");
        let adopted = RevisionBytes::from_framed(original.clone().into_bytes()).unwrap();
        assert_eq!(adopted, original);
    }

    #[test]
    fn test_from_framed_rejects_length_mismatch() {
        let mut bytes = RevisionBytes::encode(b"document").into_bytes();
        bytes.push(0);
        assert!(RevisionBytes::from_framed(bytes).is_err());

        assert!(RevisionBytes::from_framed(vec![10, 1, 2]).is_err());
        assert!(RevisionBytes::from_framed(Vec::new()).is_err());
    }

    #[test]
    fn test_framed_len_reads_prefix_only() {
        let rev = RevisionBytes::encode(b"abc");
        let mut buf = rev.as_bytes().to_vec();
        buf.extend_from_slice(b"trailing garbage");
        assert_eq!(framed_len(&buf), Some(4));
        assert_eq!(body_of(&buf[..4]), b"abc");
    }

    #[test]
    fn test_framed_size_matches_encode() {
        for len in [0usize, 1, 240, 241, 2287, 2288, 70_000] {
            let body = vec![1u8; len];
            assert_eq!(RevisionBytes::encode(&body).len(), framed_size(len));
        }
    }
}
