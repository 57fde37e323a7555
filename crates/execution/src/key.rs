//! Join key values and deterministic bucket hashing.
//!
//! Integral keys map to `key mod B`; string and float keys map through a SHA-256 digest of their
//! canonical string form, read as a big-endian integer and reduced mod B. The mapping depends on
//! nothing but the key and B, so both sides of a join (and repeated runs) always agree on the
//! bucket of a key.

use std::cmp::Ordering;
use std::fmt;

use arrow::array::{Array, ArrayRef, AsArray};
use arrow::compute::cast;
use arrow::datatypes::{Float64Type, Int64Type, UInt64Type};
use arrow_schema::DataType;
use nq_common::{NqError, Result};
use sha2::{Digest, Sha256};

/// A single non-null join key value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyValue {
    /// Integer key that fits in i64; booleans are stored as 0/1.
    Int(i64),
    /// UInt64 key above `i64::MAX`. Never equal to an `Int`.
    UInt(u64),
    /// f32/f64 key stored as f64 bits so it can be hashed and compared totally.
    Float64Bits(u64),
    /// Utf8/LargeUtf8 key.
    Utf8(String),
}

impl KeyValue {
    /// Canonical string form fed to the digest for non-integral keys.
    pub fn canonical_string(&self) -> String {
        self.to_string()
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Int(_) | Self::UInt(_) => 1,
            Self::Float64Bits(_) => 2,
            Self::Utf8(_) => 3,
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::UInt(v) => write!(f, "{v}"),
            Self::Float64Bits(v) => write!(f, "{}", f64::from_bits(*v)),
            Self::Utf8(v) => f.write_str(v),
        }
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        use KeyValue::*;
        match (self, other) {
            (Int(a), Int(b)) => a.cmp(b),
            (UInt(a), UInt(b)) => a.cmp(b),
            // a UInt is always above i64::MAX
            (Int(_), UInt(_)) => Ordering::Less,
            (UInt(_), Int(_)) => Ordering::Greater,
            (Float64Bits(a), Float64Bits(b)) => f64::from_bits(*a).total_cmp(&f64::from_bits(*b)),
            (Utf8(a), Utf8(b)) => a.cmp(b),
            // mixed classes are rejected before a join starts; keep the order total anyway
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Hashing/comparison class of a key column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyClass {
    /// Integers and booleans (modulo hashing, booleans as 0/1).
    Integral,
    /// Floating point (digest hashing).
    Float,
    /// Strings (digest hashing).
    Utf8,
}

impl KeyClass {
    /// Class of `dt`, or `Unsupported` for types that cannot be join keys.
    pub fn of(dt: &DataType) -> Result<Self> {
        match dt {
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Boolean => Ok(Self::Integral),
            DataType::Float32 | DataType::Float64 => Ok(Self::Float),
            DataType::Utf8 | DataType::LargeUtf8 => Ok(Self::Utf8),
            other => Err(NqError::Unsupported(format!(
                "join key type not supported: {other:?}"
            ))),
        }
    }

    /// Both sides must share a class, otherwise equal-looking keys would land in different
    /// buckets.
    pub fn check_compatible(left: &DataType, right: &DataType) -> Result<Self> {
        let l = Self::of(left)?;
        let r = Self::of(right)?;
        if l != r {
            return Err(NqError::Planning(format!(
                "join key types are not comparable: {left:?} vs {right:?}"
            )));
        }
        Ok(l)
    }
}

/// Bucket in `[0, partitions)` for `key`.
pub fn bucket(key: &KeyValue, partitions: usize) -> usize {
    let partitions = partitions.max(1);
    match key {
        KeyValue::Int(v) => v.rem_euclid(partitions as i64) as usize,
        KeyValue::UInt(v) => (*v % partitions as u64) as usize,
        other => digest_bucket(other.canonical_string().as_bytes(), partitions),
    }
}

fn digest_bucket(bytes: &[u8], partitions: usize) -> usize {
    let digest = Sha256::digest(bytes);
    let m = partitions as u128;
    digest
        .iter()
        .fold(0_u128, |acc, b| (acc * 256 + u128::from(*b)) % m) as usize
}

/// Per-row key values of a key column; nulls come back as `None`.
pub fn extract_keys(array: &ArrayRef) -> Result<Vec<Option<KeyValue>>> {
    match array.data_type() {
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32 => {
            let widened = cast(array, &DataType::Int64)
                .map_err(|e| NqError::Execution(format!("key cast failed: {e}")))?;
            Ok(widened
                .as_primitive::<Int64Type>()
                .iter()
                .map(|v| v.map(KeyValue::Int))
                .collect())
        }
        DataType::UInt64 => Ok(array
            .as_primitive::<UInt64Type>()
            .iter()
            .map(|v| v.map(|x| i64::try_from(x).map_or(KeyValue::UInt(x), KeyValue::Int)))
            .collect()),
        DataType::Boolean => Ok(array
            .as_boolean()
            .iter()
            .map(|v| v.map(|b| KeyValue::Int(i64::from(b))))
            .collect()),
        DataType::Float32 | DataType::Float64 => {
            let widened = cast(array, &DataType::Float64)
                .map_err(|e| NqError::Execution(format!("key cast failed: {e}")))?;
            Ok(widened
                .as_primitive::<Float64Type>()
                .iter()
                .map(|v| v.map(|x| KeyValue::Float64Bits(x.to_bits())))
                .collect())
        }
        DataType::Utf8 => Ok(array
            .as_string::<i32>()
            .iter()
            .map(|v| v.map(|s| KeyValue::Utf8(s.to_string())))
            .collect()),
        DataType::LargeUtf8 => Ok(array
            .as_string::<i64>()
            .iter()
            .map(|v| v.map(|s| KeyValue::Utf8(s.to_string())))
            .collect()),
        other => Err(NqError::Unsupported(format!(
            "join key type not supported: {other:?}"
        ))),
    }
}

/// Like [`extract_keys`] but for streams that were already filtered of nulls.
pub(crate) fn extract_non_null_keys(array: &ArrayRef) -> Result<Vec<KeyValue>> {
    if array.null_count() > 0 {
        return Err(NqError::Execution(
            "null key in a sorted stream".to_string(),
        ));
    }
    extract_keys(array)?
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| NqError::Execution("null key in a sorted stream".to_string()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{
        ArrayRef, BooleanArray, Float64Array, Int32Array, Int8Array, StringArray, UInt64Array,
    };
    use arrow_schema::DataType;

    use super::{bucket, extract_keys, KeyClass, KeyValue};

    #[test]
    fn integral_keys_bucket_by_modulo() {
        assert_eq!(bucket(&KeyValue::Int(17), 8), 1);
        assert_eq!(bucket(&KeyValue::Int(8), 8), 0);
        assert_eq!(bucket(&KeyValue::Int(-1), 8), 7);
        assert_eq!(bucket(&KeyValue::UInt(u64::MAX), 8), 7);
        // equal values hash equally whatever the source integer width
        assert_eq!(bucket(&KeyValue::Int(1 << 40), 7), bucket(&KeyValue::UInt(1 << 40), 7));
    }

    #[test]
    fn string_keys_bucket_deterministically_in_range() {
        for b in [1_usize, 2, 7, 8, 64] {
            for s in ["", "A", "Song_1", "ünïcode"] {
                let k = KeyValue::Utf8(s.to_string());
                let first = bucket(&k, b);
                assert!(first < b);
                assert_eq!(first, bucket(&k.clone(), b));
            }
        }
        // distinct strings spread over buckets rather than collapsing into one
        let used = (0..64)
            .map(|i| bucket(&KeyValue::Utf8(format!("k{i}")), 8))
            .collect::<std::collections::HashSet<_>>();
        assert!(used.len() > 1);
    }

    #[test]
    fn extracts_keys_with_nulls_and_widening() {
        let a: ArrayRef = Arc::new(Int32Array::from(vec![Some(1), None, Some(3)]));
        assert_eq!(
            extract_keys(&a).expect("keys"),
            vec![Some(KeyValue::Int(1)), None, Some(KeyValue::Int(3))]
        );
        let s: ArrayRef = Arc::new(StringArray::from(vec![Some("a"), None]));
        assert_eq!(
            extract_keys(&s).expect("keys"),
            vec![Some(KeyValue::Utf8("a".to_string())), None]
        );
        let f: ArrayRef = Arc::new(Float64Array::from(vec![1.5]));
        assert_eq!(
            extract_keys(&f).expect("keys")[0]
                .as_ref()
                .map(KeyValue::canonical_string),
            Some("1.5".to_string())
        );
        let big: ArrayRef = Arc::new(UInt64Array::from(vec![7, u64::MAX]));
        assert_eq!(
            extract_keys(&big).expect("keys"),
            vec![Some(KeyValue::Int(7)), Some(KeyValue::UInt(u64::MAX))]
        );
        assert!(KeyValue::Int(i64::MAX) < KeyValue::UInt(u64::MAX));
    }

    #[test]
    fn booleans_are_keyed_like_integers() {
        let b: ArrayRef = Arc::new(BooleanArray::from(vec![Some(true), None, Some(false)]));
        let i: ArrayRef = Arc::new(Int8Array::from(vec![1_i8, 0]));
        assert_eq!(
            extract_keys(&b).expect("bool keys"),
            vec![Some(KeyValue::Int(1)), None, Some(KeyValue::Int(0))]
        );
        assert_eq!(
            extract_keys(&i).expect("int keys"),
            vec![Some(KeyValue::Int(1)), Some(KeyValue::Int(0))]
        );
        assert!(KeyClass::check_compatible(&DataType::Boolean, &DataType::Int8).is_ok());
    }

    #[test]
    fn key_classes_must_match() {
        assert!(KeyClass::check_compatible(&DataType::Int32, &DataType::Int64).is_ok());
        assert!(KeyClass::check_compatible(&DataType::Utf8, &DataType::LargeUtf8).is_ok());
        assert!(KeyClass::check_compatible(&DataType::Int64, &DataType::Utf8).is_err());
        assert!(KeyClass::of(&DataType::Binary).is_err());
    }

    #[test]
    fn float_keys_order_totally() {
        let a = KeyValue::Float64Bits((-1.0_f64).to_bits());
        let b = KeyValue::Float64Bits(2.5_f64.to_bits());
        assert!(a < b);
        assert!(KeyValue::Utf8("a".into()) < KeyValue::Utf8("b".into()));
    }
}
