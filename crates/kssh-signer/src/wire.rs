//! SSH binary encoding (RFC 4251 §5).
//!
//! Strings and integers go through `ssh-encoding`; this module adds the
//! `mpint` sign rules and a couple of buffer helpers shared with the agent
//! protocol codec.

pub use ssh_encoding::{CheckedSum, Decode, Encode, Reader, Writer};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error(transparent)]
    Encoding(#[from] ssh_encoding::Error),
    #[error("negative mpint")]
    NegativeMpint,
}

/// Writes a non-negative big-endian magnitude as an SSH `mpint`.
pub fn encode_mpint(magnitude: &[u8], writer: &mut impl Writer) -> Result<(), ssh_encoding::Error> {
    let trimmed = strip_leading_zeros(magnitude);
    if trimmed.first().is_some_and(|b| b & 0x80 != 0) {
        let mut padded = Vec::with_capacity(trimmed.len() + 1);
        padded.push(0);
        padded.extend_from_slice(trimmed);
        padded.encode(writer)
    } else {
        trimmed.encode(writer)
    }
}

pub fn mpint_len(magnitude: &[u8]) -> usize {
    let trimmed = strip_leading_zeros(magnitude);
    let pad = usize::from(trimmed.first().is_some_and(|b| b & 0x80 != 0));
    4 + pad + trimmed.len()
}

/// Reads an `mpint` and returns its magnitude without leading zeros.
pub fn decode_mpint(reader: &mut impl Reader) -> Result<Vec<u8>, WireError> {
    let raw = Vec::<u8>::decode(reader)?;
    if raw.first().is_some_and(|b| b & 0x80 != 0) {
        return Err(WireError::NegativeMpint);
    }
    Ok(strip_leading_zeros(&raw).to_vec())
}

pub fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

/// Encodes `value` into a buffer sized from its `encoded_len`.
pub fn to_vec<T: Encode + ?Sized>(value: &T) -> Result<Vec<u8>, ssh_encoding::Error> {
    let mut out = Vec::with_capacity(value.encoded_len()?);
    value.encode(&mut out)?;
    Ok(out)
}
