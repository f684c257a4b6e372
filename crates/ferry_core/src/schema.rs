use std::fmt;
use std::sync::Arc;

use datafusion::arrow::datatypes::{
    DataType,
    Field as ArrowField,
    Schema as ArrowSchema,
    SchemaRef,
};
use serde::{Deserialize, Serialize};

use crate::errors::{FerryError, Result};

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub datatype: DataType,
}

impl Field {
    pub fn new(name: impl Into<String>, datatype: DataType) -> Self {
        Field {
            name: name.into(),
            datatype,
        }
    }
}

/// Ordered list of fields describing the output of an operator.
///
/// Equality only considers names and types. Nullability and metadata of the
/// arrow schemas this is converted from are dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: impl IntoIterator<Item = Field>) -> Self {
        Schema {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Schema::default()
    }

    pub fn from_arrow(schema: &ArrowSchema) -> Self {
        Schema {
            fields: schema
                .fields()
                .iter()
                .map(|f| Field::new(f.name().clone(), f.data_type().clone()))
                .collect(),
        }
    }

    pub fn to_arrow(&self) -> SchemaRef {
        Arc::new(ArrowSchema::new(
            self.fields
                .iter()
                .map(|f| ArrowField::new(&f.name, f.datatype.clone(), true))
                .collect::<Vec<_>>(),
        ))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_or_err(&self, name: &str) -> Result<&Field> {
        self.field(name).ok_or_else(|| {
            FerryError::Plan(format!("missing column '{name}' in schema {self}"))
        })
    }

    /// Fail with a schema error if `actual` differs from this schema.
    pub fn check_declared(&self, actual: &Schema) -> Result<()> {
        if self != actual {
            return Err(FerryError::SchemaError {
                declared: self.clone(),
                actual: actual.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (idx, field) in self.fields.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", field.name, field.datatype)?;
        }
        write!(f, ")")
    }
}

impl From<&ArrowSchema> for Schema {
    fn from(value: &ArrowSchema) -> Self {
        Schema::from_arrow(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrow_round_trip_drops_nullability() {
        let arrow = ArrowSchema::new(vec![
            ArrowField::new("a", DataType::Int64, false),
            ArrowField::new("b", DataType::Utf8, true),
        ]);

        let schema = Schema::from_arrow(&arrow);
        let back = Schema::from_arrow(&schema.to_arrow());

        assert_eq!(schema, back);
        assert_eq!("(a: Int64, b: Utf8)", schema.to_string());
    }

    #[test]
    fn check_declared_never_coerces() {
        let declared = Schema::new([Field::new("a", DataType::Int64)]);
        let actual = Schema::new([Field::new("a", DataType::Int32)]);

        let err = declared.check_declared(&actual).unwrap_err();
        assert!(matches!(err, FerryError::SchemaError { .. }));
        declared.check_declared(&declared.clone()).unwrap();
    }
}
