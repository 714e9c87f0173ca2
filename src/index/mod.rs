pub(crate) mod btree;

use crate::errors::DbError;
use crate::tuple::{Rid, Tuple};
use crate::txn::Transaction;
use crate::types::{Types, Value};
use anyhow::{bail, Result};

/// Fixed-width, order-preserving key image. Comparing the raw bytes
/// lexicographically compares the original values.
pub type KeyBytes = [u8; 8];

/// Abstract key→RID multimap over single-column keys. Duplicate keys are
/// allowed; (key, rid) pairs are unique.
pub trait Index: Send + Sync {
    fn insert(&self, key: &Tuple, rid: Rid, txn: Option<&Transaction>) -> Result<()>;
    /// Removes one (key, rid) pair; false if it was not present.
    fn delete(&self, key: &Tuple, rid: Rid, txn: Option<&Transaction>) -> Result<bool>;
    fn scan_key(&self, key: &Tuple, txn: Option<&Transaction>) -> Result<Vec<Rid>>;
    fn scan_range(
        &self,
        lo: Option<&Tuple>,
        hi: Option<&Tuple>,
        lo_inclusive: bool,
        hi_inclusive: bool,
    ) -> Result<Vec<Rid>>;
    fn scan_all(&self) -> Result<Vec<Rid>>;
}

/// Encodes a key value into its 8-byte order-preserving image. The
/// declared column type picks the encoding so that mixed numerics in a
/// DOUBLE column still sort together.
pub fn encode_key(value: &Value, declared: Types) -> Result<KeyBytes> {
    if value.is_null() {
        bail!(DbError::Constraint("NULL cannot be an index key".into()));
    }
    match declared {
        Types::Bool => match value {
            Value::Bool(b) => Ok(pad_high(&[*b as u8])),
            _ => bail!(mismatch(value, declared)),
        },
        Types::Int8 | Types::Int16 | Types::Int32 | Types::Int64 => {
            let v = match value {
                Value::Int8(v) => *v as i64,
                Value::Int16(v) => *v as i64,
                Value::Int32(v) => *v as i64,
                Value::Int64(v) => *v,
                _ => bail!(mismatch(value, declared)),
            };
            // bias the sign so unsigned byte order matches signed order
            Ok(((v as u64) ^ (1 << 63)).to_be_bytes())
        }
        Types::Double => {
            let v = match value {
                Value::Int8(v) => *v as f64,
                Value::Int16(v) => *v as f64,
                Value::Int32(v) => *v as f64,
                Value::Int64(v) => *v as f64,
                Value::Double(v) => *v,
                _ => bail!(mismatch(value, declared)),
            };
            // IEEE-754 total-order translation
            let bits = v.to_bits();
            let ordered = if bits >> 63 == 1 { !bits } else { bits | (1 << 63) };
            Ok(ordered.to_be_bytes())
        }
        Types::Str => match value {
            Value::Str(s) => Ok(pad_high(s.as_bytes())),
            _ => bail!(mismatch(value, declared)),
        },
        Types::Blob => match value {
            Value::Blob(b) => Ok(pad_high(b)),
            _ => bail!(mismatch(value, declared)),
        },
        Types::Null | Types::Vector => bail!(DbError::Constraint(format!(
            "{} columns cannot be indexed",
            declared.name()
        ))),
    }
}

/// First eight bytes, zero-padded: a prefix image whose byte order
/// matches the full lexicographic order up to the prefix.
fn pad_high(bytes: &[u8]) -> KeyBytes {
    let mut out = [0u8; 8];
    let n = bytes.len().min(8);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

fn mismatch(value: &Value, declared: Types) -> DbError {
    DbError::Constraint(format!(
        "index key of type {} does not match declared {}",
        value.kind().name(),
        declared.name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_encoding_preserves_order() -> Result<()> {
        let values = [-500i64, -1, 0, 1, 2, 1 << 40];
        let mut encoded: Vec<KeyBytes> = values
            .iter()
            .map(|&v| encode_key(&Value::Int64(v), Types::Int64).unwrap())
            .collect();
        let sorted = encoded.clone();
        encoded.sort_unstable();
        assert_eq!(encoded, sorted);
        Ok(())
    }

    #[test]
    fn test_double_encoding_preserves_order() -> Result<()> {
        let values = [-1e9, -2.5, -0.0, 0.0, 1e-3, 7.0, 1e12];
        let encoded: Vec<KeyBytes> = values
            .iter()
            .map(|&v| encode_key(&Value::Double(v), Types::Double).unwrap())
            .collect();
        for pair in encoded.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        Ok(())
    }

    #[test]
    fn test_mixed_numerics_in_double_column() -> Result<()> {
        let a = encode_key(&Value::Int32(3), Types::Double)?;
        let b = encode_key(&Value::Double(3.5), Types::Double)?;
        assert!(a < b);
        Ok(())
    }

    #[test]
    fn test_string_prefix_order() -> Result<()> {
        let a = encode_key(&Value::Str("apple".into()), Types::Str)?;
        let b = encode_key(&Value::Str("banana".into()), Types::Str)?;
        assert!(a < b);
        Ok(())
    }

    #[test]
    fn test_null_key_refused() {
        let err = encode_key(&Value::Null, Types::Int32).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::Constraint(_))
        ));
    }
}
