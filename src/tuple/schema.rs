use crate::errors::DbError;
use crate::tuple::Tuple;
use crate::types::Types;
use anyhow::{bail, Result};

/// One column of a table schema. `length` is only meaningful for
/// variable-width kinds (a declared maximum, 0 = unbounded) but is
/// always persisted in the catalog page.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub ty: Types,
    pub length: u32,
    pub nullable: bool,
}

impl Field {
    pub fn new(name: &str, ty: Types, nullable: bool) -> Self {
        Self {
            name: name.to_string(),
            ty,
            length: 0,
            nullable,
        }
    }

    pub fn with_length(mut self, length: u32) -> Self {
        self.length = length;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn arity(&self) -> usize {
        self.fields.len()
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Schema of a key projected through `attrs`, used by indexes.
    pub fn project(&self, attrs: &[usize]) -> Result<Schema> {
        let mut fields = Vec::with_capacity(attrs.len());
        for &i in attrs {
            match self.fields.get(i) {
                Some(f) => fields.push(f.clone()),
                None => bail!(DbError::Invariant(format!(
                    "key attribute {i} out of bounds for schema of {} columns",
                    self.fields.len()
                ))),
            }
        }
        Ok(Schema { fields })
    }

    /// Arity, NOT NULL and type conformance of a tuple against this schema.
    pub fn validate(&self, tuple: &Tuple) -> Result<()> {
        if tuple.arity() != self.fields.len() {
            bail!(DbError::Constraint(format!(
                "expected {} values, got {}",
                self.fields.len(),
                tuple.arity()
            )));
        }
        for (field, value) in self.fields.iter().zip(tuple.values()) {
            if value.is_null() {
                if !field.nullable {
                    bail!(DbError::Constraint(format!(
                        "column {} is NOT NULL",
                        field.name
                    )));
                }
                continue;
            }
            let kind = value.kind();
            let ok = kind == field.ty || (kind.is_numeric() && field.ty.is_numeric());
            if !ok {
                bail!(DbError::Constraint(format!(
                    "column {} expects {}, got {}",
                    field.name,
                    field.ty.name(),
                    kind.name()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;
    use anyhow::Result;

    fn people() -> Schema {
        Schema::new(vec![
            Field::new("id", Types::Int32, false),
            Field::new("name", Types::Str, true),
        ])
    }

    #[test]
    fn test_validate_accepts_conforming_tuple() -> Result<()> {
        let schema = people();
        schema.validate(&Tuple::new(vec![
            Value::Int32(1),
            Value::Str("ada".to_string()),
        ]))?;
        schema.validate(&Tuple::new(vec![Value::Int32(2), Value::Null]))?;
        Ok(())
    }

    #[test]
    fn test_validate_rejects_null_in_not_null() {
        let err = people()
            .validate(&Tuple::new(vec![Value::Null, Value::Null]))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::Constraint(_))
        ));
    }

    #[test]
    fn test_validate_rejects_wrong_arity_and_type() {
        let schema = people();
        assert!(schema.validate(&Tuple::new(vec![Value::Int32(1)])).is_err());
        assert!(schema
            .validate(&Tuple::new(vec![
                Value::Str("1".to_string()),
                Value::Str("x".to_string())
            ]))
            .is_err());
    }

    #[test]
    fn test_project() -> Result<()> {
        let key = people().project(&[0])?;
        assert_eq!(key.arity(), 1);
        assert_eq!(key.fields[0].name, "id");
        Ok(())
    }
}
