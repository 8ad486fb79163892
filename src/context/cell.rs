use std::any::{Any, type_name};
use std::sync::Arc;

use crate::codec::{self, SharedCodec};
use crate::engine::{Dataset, Session};
use crate::error::{CodecError, EngineError, EvaluationError};

/// Values of a collection brought into the local process.
///
/// Values that never left the process are handed out as they are. Values
/// collected from a dataset stay encoded and are decoded one by one while
/// iterating, so a caller reading only a prefix never pays for decoding the
/// whole collection.
pub struct LocalValues<T> {
    repr: LocalRepr<T>,
}

enum LocalRepr<T> {
    Decoded(Arc<[T]>),
    Encoded {
        bytes: Arc<[Vec<u8>]>,
        codec: SharedCodec<T>,
    },
}

impl<T> Clone for LocalValues<T> {
    fn clone(&self) -> Self {
        let repr = match &self.repr {
            LocalRepr::Decoded(values) => LocalRepr::Decoded(values.clone()),
            LocalRepr::Encoded { bytes, codec } => LocalRepr::Encoded {
                bytes: bytes.clone(),
                codec: codec.clone(),
            },
        };
        Self { repr }
    }
}

impl<T: Clone> LocalValues<T> {
    pub(crate) fn decoded(values: Arc<[T]>) -> Self {
        Self {
            repr: LocalRepr::Decoded(values),
        }
    }

    pub(crate) fn encoded(bytes: Vec<Vec<u8>>, codec: SharedCodec<T>) -> Self {
        Self {
            repr: LocalRepr::Encoded {
                bytes: bytes.into(),
                codec,
            },
        }
    }

    pub fn len(&self) -> usize {
        match &self.repr {
            LocalRepr::Decoded(values) => values.len(),
            LocalRepr::Encoded { bytes, .. } => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the values are still held in their byte encoding.
    pub fn is_encoded(&self) -> bool {
        matches!(self.repr, LocalRepr::Encoded { .. })
    }

    /// Iterates the values, decoding each one on demand.
    pub fn iter(&self) -> Box<dyn Iterator<Item = Result<T, CodecError>> + '_> {
        match &self.repr {
            LocalRepr::Decoded(values) => Box::new(values.iter().cloned().map(Ok)),
            LocalRepr::Encoded { bytes, codec } => {
                Box::new(bytes.iter().map(|item| codec.decode(item)))
            }
        }
    }

    /// Decodes every value.
    pub fn to_vec(&self) -> Result<Vec<T>, CodecError> {
        match &self.repr {
            LocalRepr::Decoded(values) => Ok(values.to_vec()),
            LocalRepr::Encoded { bytes, codec } => codec::from_byte_arrays(bytes, codec.as_ref()),
        }
    }
}

impl<T> std::fmt::Debug for LocalValues<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (kind, len) = match &self.repr {
            LocalRepr::Decoded(values) => ("decoded", values.len()),
            LocalRepr::Encoded { bytes, .. } => ("encoded", bytes.len()),
        };
        write!(f, "LocalValues({kind}, {len})")
    }
}

/// Holds either local values or a dataset, and fills in the other side on
/// demand.
///
/// The transition from local values to a dataset happens at most once and is
/// never reversed. Going the other way is a read-only projection: the dataset
/// stays, and the collected values are remembered next to it.
pub(crate) enum DeferredCell<T> {
    Local {
        values: Arc<[T]>,
        codec: SharedCodec<T>,
    },
    Physical {
        dataset: Dataset<T>,
        local: Option<LocalValues<T>>,
    },
}

impl<T> DeferredCell<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn from_values(values: Vec<T>, codec: SharedCodec<T>) -> Self {
        Self::Local {
            values: values.into(),
            codec,
        }
    }

    pub fn from_dataset(dataset: Dataset<T>) -> Self {
        Self::Physical {
            dataset,
            local: None,
        }
    }

    #[cfg(test)]
    pub fn is_materialized(&self) -> bool {
        matches!(self, Self::Physical { .. })
    }

    /// Returns the dataset, distributing the local values first if needed.
    ///
    /// Values are encoded eagerly, so an encoding failure leaves the cell
    /// untouched. Decoding is attached lazily to the distributed bytes.
    pub fn materialize(&mut self, session: &Session) -> Result<Dataset<T>, CodecError> {
        let (values, codec) = match self {
            Self::Physical { dataset, .. } => return Ok(dataset.clone()),
            Self::Local { values, codec } => (values, codec),
        };

        let encoded = codec::to_byte_arrays(values, codec.as_ref())?;
        let decoder = codec.clone();
        let dataset = session
            .parallelize(encoded)
            .try_map(move |bytes: &Vec<u8>| decoder.decode(bytes));

        *self = Self::from_dataset(dataset.clone());
        Ok(dataset)
    }

    /// Returns the values in the local process, decoding with `codec` when
    /// they have to be collected from the dataset.
    pub fn local_values(&mut self, codec: SharedCodec<T>) -> Result<LocalValues<T>, EngineError> {
        match self {
            Self::Local { values, .. } => Ok(LocalValues::decoded(values.clone())),
            Self::Physical {
                local: Some(local), ..
            } => Ok(local.clone()),
            Self::Physical { dataset, local } => {
                let encoder = codec.clone();
                let bytes = dataset
                    .try_map(move |value: &T| encoder.encode(value))
                    .collect()?;

                let values = LocalValues::encoded(bytes, codec);
                *local = Some(values.clone());
                Ok(values)
            }
        }
    }
}

/// The type-erased face of a [`DeferredCell`], so cells of different element
/// types can live in one map.
pub(crate) trait ErasedCell: Send {
    /// Materializes, caches and counts the dataset.
    fn force(&mut self, session: &Session) -> Result<usize, EvaluationError>;

    fn element_type(&self) -> &'static str;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T> ErasedCell for DeferredCell<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn force(&mut self, session: &Session) -> Result<usize, EvaluationError> {
        let dataset = self.materialize(session)?;
        dataset.cache();
        Ok(dataset.count()?)
    }

    fn element_type(&self) -> &'static str {
        type_name::<T>()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CborCodec, Codec, JsonCodec};

    fn cbor<T>() -> SharedCodec<T>
    where
        T: serde::Serialize + serde::de::DeserializeOwned + 'static,
    {
        Arc::new(CborCodec::new())
    }

    #[test]
    fn test_materialize_is_idempotent() {
        let session = Session::local().unwrap();
        let mut cell = DeferredCell::from_values(vec![1u32, 2, 3], cbor());
        assert!(!cell.is_materialized());

        let first = cell.materialize(&session).unwrap();
        let second = cell.materialize(&session).unwrap();

        assert!(cell.is_materialized());
        assert!(first.ptr_eq(&second));
        assert_eq!(first.collect().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_local_values_skip_encoding() {
        let mut cell = DeferredCell::from_values(vec!["a".to_string()], cbor());

        let values = cell.local_values(cbor()).unwrap();
        assert!(!values.is_encoded());
        assert_eq!(values.to_vec().unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn test_local_values_from_dataset_memoized() {
        let session = Session::local().unwrap();
        let dataset = session.parallelize(vec![10i64, 20]);
        let mut cell = DeferredCell::from_dataset(dataset.clone());

        let first = cell.local_values(cbor()).unwrap();
        let second = cell.local_values(cbor()).unwrap();

        assert!(first.is_encoded());
        assert_eq!(second.to_vec().unwrap(), vec![10, 20]);
        assert_eq!(dataset.metrics().computations(), 1);
    }

    #[test]
    fn test_local_values_use_supplied_codec() {
        let session = Session::local().unwrap();
        let mut cell = DeferredCell::from_dataset(session.parallelize(vec![7u8]));

        let json: SharedCodec<u8> = Arc::new(JsonCodec::new());
        let values = cell.local_values(json).unwrap();

        let LocalRepr::Encoded { bytes, .. } = &values.repr else {
            panic!("expected encoded values");
        };
        assert_eq!(bytes[0], b"7".to_vec());
    }

    #[test]
    fn test_lazy_decoding() {
        let codec: SharedCodec<u16> = Arc::new(CborCodec::new());
        let mut bytes = vec![codec.encode(&1).unwrap()];
        bytes.push(b"\xff\xff".to_vec());

        let values = LocalValues::encoded(bytes, codec);
        let mut iter = values.iter();

        assert_eq!(iter.next().unwrap().unwrap(), 1);
        assert!(iter.next().unwrap().is_err());
        assert!(values.to_vec().is_err());
    }

    #[test]
    fn test_force_counts_once_and_caches() {
        let session = Session::local().unwrap();
        let dataset = session.parallelize(vec![(); 4]);
        let mut cell: Box<dyn ErasedCell> = Box::new(DeferredCell::from_dataset(dataset.clone()));

        assert_eq!(cell.force(&session).unwrap(), 4);
        assert!(dataset.is_cached());
        assert_eq!(dataset.metrics().count_calls(), 1);
        assert_eq!(cell.element_type(), "()");
    }
}
