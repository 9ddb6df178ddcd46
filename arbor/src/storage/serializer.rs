//! Key and value serializers and the orderings tables sort by.
//!
//! A table is bound to one `TableSchema`, built explicitly by the caller and
//! owned by the table handle. Trees only ever see encoded bytes; they order
//! them through `KeyOrder`, which the schema implements by decoding both
//! keys and applying its comparator. When the key encoding is known to sort
//! like the keys themselves, encoded bytes are compared directly.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::storage::error::StoreError;

/// Converts values of `T` to and from bytes.
pub trait Serializer<T>: Send + Sync {
    /// Stable name recorded in the table's schema descriptor.
    fn name(&self) -> &str;

    fn serialize(&self, value: &T) -> Result<Vec<u8>, SerializationError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<T, SerializationError>;

    /// Whether comparing encodings byte-wise agrees with `Ord` on `T`.
    fn preserves_order(&self) -> bool {
        false
    }
}

/// A total order over keys.
pub trait Comparator<K>: Send + Sync {
    /// Stable name recorded in the table's schema descriptor.
    fn name(&self) -> &str;

    fn compare(&self, a: &K, b: &K) -> Ordering;

    /// Set when this order is the key type's natural order or its reverse.
    fn direction(&self) -> Option<Direction> {
        None
    }
}

/// Direction of a natural order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// Orders encoded keys inside a tree.
pub trait KeyOrder {
    fn compare_encoded(&self, a: &[u8], b: &[u8]) -> Result<Ordering, StoreError>;
}

/// Plain byte-wise order, used for the catalog.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteOrder;

impl KeyOrder for ByteOrder {
    fn compare_encoded(&self, a: &[u8], b: &[u8]) -> Result<Ordering, StoreError> {
        Ok(a.cmp(b))
    }
}

/// The key type's own `Ord`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaturalOrder;

impl<K: Ord> Comparator<K> for NaturalOrder {
    fn name(&self) -> &str {
        "natural"
    }

    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }

    fn direction(&self) -> Option<Direction> {
        Some(Direction::Ascending)
    }
}

/// The key type's `Ord`, reversed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReverseOrder;

impl<K: Ord> Comparator<K> for ReverseOrder {
    fn name(&self) -> &str {
        "reverse"
    }

    fn compare(&self, a: &K, b: &K) -> Ordering {
        b.cmp(a)
    }

    fn direction(&self) -> Option<Direction> {
        Some(Direction::Descending)
    }
}

/// Big-endian `u64`.
#[derive(Debug, Clone, Copy, Default)]
pub struct U64Serializer;

impl Serializer<u64> for U64Serializer {
    fn name(&self) -> &str {
        "u64"
    }

    fn serialize(&self, value: &u64) -> Result<Vec<u8>, SerializationError> {
        Ok(value.to_be_bytes().to_vec())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<u64, SerializationError> {
        Ok(u64::from_be_bytes(fixed(bytes)?))
    }

    fn preserves_order(&self) -> bool {
        true
    }
}

/// Big-endian `i64` with the sign bit flipped, so encodings sort like the
/// numbers.
#[derive(Debug, Clone, Copy, Default)]
pub struct I64Serializer;

impl Serializer<i64> for I64Serializer {
    fn name(&self) -> &str {
        "i64"
    }

    fn serialize(&self, value: &i64) -> Result<Vec<u8>, SerializationError> {
        let mut bytes = value.to_be_bytes();
        bytes[0] ^= 0x80;
        Ok(bytes.to_vec())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<i64, SerializationError> {
        let mut bytes: [u8; 8] = fixed(bytes)?;
        bytes[0] ^= 0x80;
        Ok(i64::from_be_bytes(bytes))
    }

    fn preserves_order(&self) -> bool {
        true
    }
}

/// UTF-8 strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl Serializer<String> for StringSerializer {
    fn name(&self) -> &str {
        "string"
    }

    fn serialize(&self, value: &String) -> Result<Vec<u8>, SerializationError> {
        Ok(value.as_bytes().to_vec())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<String, SerializationError> {
        String::from_utf8(bytes.to_vec()).map_err(SerializationError::InvalidUtf8)
    }

    fn preserves_order(&self) -> bool {
        true
    }
}

/// Raw bytes, stored as given.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerializer;

impl Serializer<Vec<u8>> for BytesSerializer {
    fn name(&self) -> &str {
        "bytes"
    }

    fn serialize(&self, value: &Vec<u8>) -> Result<Vec<u8>, SerializationError> {
        Ok(value.clone())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<u8>, SerializationError> {
        Ok(bytes.to_vec())
    }

    fn preserves_order(&self) -> bool {
        true
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], SerializationError> {
    bytes
        .try_into()
        .map_err(|_| SerializationError::InvalidLength {
            expected: N,
            actual: bytes.len(),
        })
}

/// Serializers and comparator for one table.
pub struct TableSchema<K, V> {
    keys: Arc<dyn Serializer<K>>,
    values: Arc<dyn Serializer<V>>,
    comparator: Arc<dyn Comparator<K>>,
}

impl<K, V> Clone for TableSchema<K, V> {
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    fn clone(&self) -> Self {
        Self {
            keys: Arc::clone(&self.keys),
            values: Arc::clone(&self.values),
            comparator: Arc::clone(&self.comparator),
        }
    }
}

impl<K, V> TableSchema<K, V> {
    pub fn new(
        keys: impl Serializer<K> + 'static,
        values: impl Serializer<V> + 'static,
        comparator: impl Comparator<K> + 'static,
    ) -> Self {
        Self {
            keys: Arc::new(keys),
            values: Arc::new(values),
            comparator: Arc::new(comparator),
        }
    }

    /// Text identifying the serializers and ordering, stored with the table
    /// and checked when it is reopened.
    #[must_use]
    pub fn descriptor(&self) -> String {
        format!(
            "key={};value={};order={}",
            self.keys.name(),
            self.values.name(),
            self.comparator.name()
        )
    }

    pub fn encode_key(&self, key: &K) -> Result<Vec<u8>, StoreError> {
        Ok(self.keys.serialize(key)?)
    }

    pub fn decode_key(&self, bytes: &[u8]) -> Result<K, StoreError> {
        Ok(self.keys.deserialize(bytes)?)
    }

    pub fn encode_value(&self, value: &V) -> Result<Vec<u8>, StoreError> {
        Ok(self.values.serialize(value)?)
    }

    pub fn decode_value(&self, bytes: &[u8]) -> Result<V, StoreError> {
        Ok(self.values.deserialize(bytes)?)
    }

    /// Compare two decoded keys.
    #[must_use]
    pub fn compare(&self, a: &K, b: &K) -> Ordering {
        self.comparator.compare(a, b)
    }

    fn byte_direction(&self) -> Option<Direction> {
        if self.keys.preserves_order() {
            self.comparator.direction()
        } else {
            None
        }
    }
}

impl<K, V> KeyOrder for TableSchema<K, V> {
    fn compare_encoded(&self, a: &[u8], b: &[u8]) -> Result<Ordering, StoreError> {
        match self.byte_direction() {
            Some(Direction::Ascending) => Ok(a.cmp(b)),
            Some(Direction::Descending) => Ok(b.cmp(a)),
            None => {
                let a = self.decode_key(a)?;
                let b = self.decode_key(b)?;
                Ok(self.comparator.compare(&a, &b))
            }
        }
    }
}

impl<K, V> std::fmt::Debug for TableSchema<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableSchema")
            .field("descriptor", &self.descriptor())
            .finish()
    }
}

/// Errors encoding or decoding keys and values.
#[derive(Debug)]
pub enum SerializationError {
    /// A fixed-width encoding had the wrong number of bytes.
    InvalidLength { expected: usize, actual: usize },
    /// String bytes were not UTF-8.
    InvalidUtf8(std::string::FromUtf8Error),
    /// Raised by a caller-provided serializer.
    Custom(String),
}

impl std::fmt::Display for SerializationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidLength { expected, actual } => {
                write!(f, "expected {expected} encoded bytes, got {actual}")
            }
            Self::InvalidUtf8(e) => write!(f, "invalid UTF-8: {e}"),
            Self::Custom(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for SerializationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidUtf8(e) => Some(e),
            Self::InvalidLength { .. } | Self::Custom(_) => None,
        }
    }
}
