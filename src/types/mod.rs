use crate::errors::DbError;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// On-disk type tags. The numeric values are part of the file format
/// (tuple encoding and catalog page) and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Types {
    Null = 0,
    Bool = 1,
    Int8 = 2,
    Int16 = 3,
    Int32 = 4,
    Int64 = 5,
    Double = 6,
    Str = 7,
    Blob = 8,
    Vector = 9,
}

impl Types {
    pub fn tag(&self) -> u8 {
        *self as u8
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => Types::Null,
            1 => Types::Bool,
            2 => Types::Int8,
            3 => Types::Int16,
            4 => Types::Int32,
            5 => Types::Int64,
            6 => Types::Double,
            7 => Types::Str,
            8 => Types::Blob,
            9 => Types::Vector,
            _ => bail!(DbError::Corruption(format!("unknown type tag {tag}"))),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Types::Null => "NULL",
            Types::Bool => "BOOL",
            Types::Int8 => "INT8",
            Types::Int16 => "INT16",
            Types::Int32 => "INT32",
            Types::Int64 => "INT64",
            Types::Double => "DOUBLE",
            Types::Str => "STRING",
            Types::Blob => "BLOB",
            Types::Vector => "VECTOR",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Types::Int8 | Types::Int16 | Types::Int32 | Types::Int64 | Types::Double
        )
    }
}

/// A single typed cell of a tuple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Double(f64),
    Str(String),
    Blob(Vec<u8>),
    Vector(Vec<f64>),
}

impl Value {
    pub fn kind(&self) -> Types {
        match self {
            Value::Null => Types::Null,
            Value::Bool(_) => Types::Bool,
            Value::Int8(_) => Types::Int8,
            Value::Int16(_) => Types::Int16,
            Value::Int32(_) => Types::Int32,
            Value::Int64(_) => Types::Int64,
            Value::Double(_) => Types::Double,
            Value::Str(_) => Types::Str,
            Value::Blob(_) => Types::Blob,
            Value::Vector(_) => Types::Vector,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric promotion used by cross-type comparison.
    fn as_double(&self) -> Option<f64> {
        match self {
            Value::Int8(v) => Some(*v as f64),
            Value::Int16(v) => Some(*v as f64),
            Value::Int32(v) => Some(*v as f64),
            Value::Int64(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Serialized form: `u8 tag` then the payload. Fixed-width payloads are
    /// little-endian; Str/Blob carry a `u32` length prefix; Vector carries a
    /// `u32` element count.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.kind().tag());
        match self {
            Value::Null => {}
            Value::Bool(v) => out.push(*v as u8),
            Value::Int8(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Int16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Int32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Int64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Str(v) => {
                out.extend_from_slice(&(v.len() as u32).to_le_bytes());
                out.extend_from_slice(v.as_bytes());
            }
            Value::Blob(v) => {
                out.extend_from_slice(&(v.len() as u32).to_le_bytes());
                out.extend_from_slice(v);
            }
            Value::Vector(v) => {
                out.extend_from_slice(&(v.len() as u32).to_le_bytes());
                for x in v {
                    out.extend_from_slice(&x.to_le_bytes());
                }
            }
        }
    }

    pub fn read_from(buf: &[u8], pos: &mut usize) -> Result<Value> {
        let tag = *buf
            .get(*pos)
            .ok_or_else(|| DbError::Corruption("value tag past end of buffer".into()))?;
        *pos += 1;
        let ty = Types::from_tag(tag)?;
        Ok(match ty {
            Types::Null => Value::Null,
            Types::Bool => Value::Bool(take(buf, pos, 1)?[0] != 0),
            Types::Int8 => Value::Int8(take(buf, pos, 1)?[0] as i8),
            Types::Int16 => Value::Int16(i16::from_le_bytes(take(buf, pos, 2)?.try_into()?)),
            Types::Int32 => Value::Int32(i32::from_le_bytes(take(buf, pos, 4)?.try_into()?)),
            Types::Int64 => Value::Int64(i64::from_le_bytes(take(buf, pos, 8)?.try_into()?)),
            Types::Double => Value::Double(f64::from_le_bytes(take(buf, pos, 8)?.try_into()?)),
            Types::Str => {
                let len = read_u32(buf, pos)? as usize;
                let bytes = take(buf, pos, len)?;
                Value::Str(String::from_utf8(bytes.to_vec()).map_err(|_| {
                    DbError::Corruption("string payload is not valid utf-8".into())
                })?)
            }
            Types::Blob => {
                let len = read_u32(buf, pos)? as usize;
                Value::Blob(take(buf, pos, len)?.to_vec())
            }
            Types::Vector => {
                let count = read_u32(buf, pos)? as usize;
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(f64::from_le_bytes(take(buf, pos, 8)?.try_into()?));
                }
                Value::Vector(v)
            }
        })
    }

    /// Total order used by indexes and predicates. Numeric kinds
    /// cross-compare by promotion to double; Null sorts below everything
    /// and equal to itself; any other mixed pair is an error.
    pub fn compare(&self, other: &Value) -> Result<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Ok(Ordering::Equal),
            (Value::Null, _) => Ok(Ordering::Less),
            (_, Value::Null) => Ok(Ordering::Greater),
            (Value::Bool(a), Value::Bool(b)) => Ok(a.cmp(b)),
            (Value::Str(a), Value::Str(b)) => Ok(a.as_bytes().cmp(b.as_bytes())),
            (Value::Blob(a), Value::Blob(b)) => Ok(a.cmp(b)),
            (a, b) => match (a.as_double(), b.as_double()) {
                (Some(x), Some(y)) => Ok(x.partial_cmp(&y).unwrap_or(Ordering::Equal)),
                _ => bail!(DbError::Incompatible(
                    a.kind().name().to_string(),
                    b.kind().name().to_string()
                )),
            },
        }
    }
}

/// Structural equality with the same promotion rules as [`Value::compare`].
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        matches!(self.compare(other), Ok(Ordering::Equal))
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int8(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v}"),
            Value::Blob(v) => write!(f, "<blob {} bytes>", v.len()),
            Value::Vector(v) => write!(f, "<vector dim {}>", v.len()),
        }
    }
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    if *pos + len > buf.len() {
        bail!(DbError::Corruption("value payload past end of buffer".into()));
    }
    let slice = &buf[*pos..*pos + len];
    *pos += len;
    Ok(slice)
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32> {
    Ok(u32::from_le_bytes(take(buf, pos, 4)?.try_into()?))
}
