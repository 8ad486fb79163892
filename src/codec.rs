//! Byte codecs for values crossing the local/physical boundary.
//!
//! A [`Codec`] turns a typed value into an opaque byte encoding and back. Every
//! collection in a [`Pipeline`](crate::Pipeline) carries a declared codec, and
//! the evaluation context uses it whenever values have to leave the local
//! process (distributing a local sequence) or come back to it (collecting a
//! dataset for the caller).
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CodecError;

/// Encodes and decodes values of type `T`.
///
/// Implementations must be deterministic and total over the values they are
/// registered for: `decode(encode(x))` yields a value equal to `x`.
pub trait Codec<T>: Send + Sync {
    /// Short name used in error messages.
    fn name(&self) -> &'static str;

    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// A codec shared between the pipeline, cells, and engine closures.
pub type SharedCodec<T> = Arc<dyn Codec<T>>;

/// Compact binary codec backed by CBOR.
pub struct CborCodec<T>(PhantomData<fn() -> T>);

impl<T> CborCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for CborCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for CborCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn name(&self) -> &'static str {
        "cbor"
    }

    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let mut buffer = Vec::new();
        ciborium::into_writer(value, &mut buffer).map_err(|err| CodecError::Encode {
            codec: "cbor",
            reason: err.to_string(),
        })?;
        Ok(buffer)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        ciborium::from_reader(bytes).map_err(|err| CodecError::Decode {
            codec: "cbor",
            reason: err.to_string(),
        })
    }
}

/// Human-readable codec backed by JSON.
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|err| CodecError::Encode {
            codec: "json",
            reason: err.to_string(),
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|err| CodecError::Decode {
            codec: "json",
            reason: err.to_string(),
        })
    }
}

/// Encodes every value, stopping at the first failure.
pub fn to_byte_arrays<T>(values: &[T], codec: &dyn Codec<T>) -> Result<Vec<Vec<u8>>, CodecError> {
    values.iter().map(|value| codec.encode(value)).collect()
}

/// Decodes every encoding, stopping at the first failure.
pub fn from_byte_arrays<T>(
    encoded: &[Vec<u8>],
    codec: &dyn Codec<T>,
) -> Result<Vec<T>, CodecError> {
    encoded.iter().map(|bytes| codec.decode(bytes)).collect()
}
