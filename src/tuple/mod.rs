pub mod schema;

use crate::errors::DbError;
use crate::pages::PageId;
use crate::types::Value;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

pub type SlotId = u32;

/// Record id: the stable address of a tuple for its whole lifetime.
/// Deletion tombstones the slot but never reassigns it to another tuple
/// while the table heap lives.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct Rid {
    pub page_id: PageId,
    pub slot: SlotId,
}

impl Rid {
    pub fn new(page_id: PageId, slot: SlotId) -> Self {
        Self { page_id, slot }
    }
}

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.page_id, self.slot)
    }
}

/// An ordered sequence of typed values. The wire form is
/// `u32 count` followed by each value's tag + payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuple {
    values: Vec<Value>,
}

impl Tuple {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn value(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    pub fn arity(&self) -> usize {
        self.values.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 * self.values.len() + 4);
        out.extend_from_slice(&(self.values.len() as u32).to_le_bytes());
        for v in &self.values {
            v.write_to(&mut out);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Tuple> {
        if bytes.len() < 4 {
            bail!(DbError::Corruption("tuple shorter than its header".into()));
        }
        let count = u32::from_le_bytes(bytes[0..4].try_into()?) as usize;
        let mut pos = 4;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(Value::read_from(bytes, &mut pos)?);
        }
        if pos != bytes.len() {
            bail!(DbError::Corruption("trailing bytes after tuple".into()));
        }
        Ok(Tuple { values })
    }

    /// Projects the tuple through an attribute list, e.g. to build an
    /// index key.
    pub fn project(&self, attrs: &[usize]) -> Result<Tuple> {
        let mut values = Vec::with_capacity(attrs.len());
        for &i in attrs {
            match self.values.get(i) {
                Some(v) => values.push(v.clone()),
                None => bail!(DbError::Invariant(format!(
                    "projection attribute {i} out of bounds for arity {}",
                    self.values.len()
                ))),
            }
        }
        Ok(Tuple { values })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_tuple_round_trip() -> Result<()> {
        let tuple = Tuple::new(vec![
            Value::Int32(7),
            Value::Str("seven".to_string()),
            Value::Null,
            Value::Double(7.5),
            Value::Vector(vec![0.25, 0.75]),
        ]);
        let bytes = tuple.to_bytes();
        assert_eq!(Tuple::from_bytes(&bytes)?, tuple);
        Ok(())
    }

    #[test]
    fn test_empty_tuple() -> Result<()> {
        let tuple = Tuple::new(vec![]);
        assert_eq!(Tuple::from_bytes(&tuple.to_bytes())?, tuple);
        Ok(())
    }

    #[test]
    fn test_truncated_tuple_is_corruption() {
        let tuple = Tuple::new(vec![Value::Int64(42)]);
        let bytes = tuple.to_bytes();
        let err = Tuple::from_bytes(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::errors::DbError>(),
            Some(crate::errors::DbError::Corruption(_))
        ));
    }

    #[test]
    fn test_projection() -> Result<()> {
        let tuple = Tuple::new(vec![
            Value::Int32(1),
            Value::Str("x".to_string()),
            Value::Bool(false),
        ]);
        let key = tuple.project(&[1])?;
        assert_eq!(key.values(), &[Value::Str("x".to_string())]);
        assert!(tuple.project(&[5]).is_err());
        Ok(())
    }
}
