// SPDX-License-Identifier: Apache-2.0
//! Length-prefixed, canonical CBOR framing for [`crate::Cmd`] and
//! [`crate::State`] records over a byte stream.

use crate::canonical::{decode_value, encode_value, CanonError};
use serde::{de::DeserializeOwned, Serialize};

/// Either half of a value/CBOR conversion failed.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// `T` couldn't be converted to or from a `serde_cbor::Value`.
    #[error("cbor value conversion: {0}")]
    Value(#[from] serde_cbor::Error),
    /// The canonical encoder/decoder rejected the bytes.
    #[error(transparent)]
    Canon(#[from] CanonError),
}

/// Serialize `value` to canonical CBOR bytes (definite lengths, minimal
/// integer/float widths, sorted map keys — see [`crate::canonical`]).
pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    let v = serde_cbor::value::to_value(value)?;
    Ok(encode_value(&v)?)
}

/// Deserialize a value of type `T` from canonical CBOR bytes.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    let v = decode_value(bytes)?;
    Ok(serde_cbor::value::from_value(v)?)
}

/// Encode `value` as a length-prefixed canonical CBOR frame: a 4-byte
/// big-endian length followed by the CBOR payload.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    let body = to_cbor(value)?;
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode one length-prefixed frame from the head of `stream`, returning
/// the value and the number of bytes consumed. Returns `Ok(None)` if the
/// stream doesn't yet hold a complete frame.
pub fn decode_frame<T: DeserializeOwned>(
    stream: &[u8],
) -> Result<Option<(T, usize)>, WireError> {
    if stream.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([stream[0], stream[1], stream[2], stream[3]]) as usize;
    if stream.len() < 4 + len {
        return Ok(None);
    }
    let value = from_cbor(&stream[4..4 + len])?;
    Ok(Some((value, 4 + len)))
}
