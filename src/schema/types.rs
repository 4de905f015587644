//! Column types and the JSON Schema -> column type mapping

use crate::schema::field::{FieldSchema, JsonType, StringFormat};
use std::fmt;
use std::str::FromStr;

/// Precision used for every datetime column
pub const DATETIME_PRECISION: u8 = 6;

/// Resolved destination column type
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ColumnType {
    String,
    Bool,
    Int64,
    Float64,
    Date,
    DateTime64,
    Nullable(Box<ColumnType>),
    /// A type read back from the database that this crate does not produce itself
    Other(String),
}

impl ColumnType {
    /// Map a field's declared kinds to a column type.
    ///
    /// A type set declaring `null` next to other kinds yields the nullable form of the first
    /// non-null kind. Numbers always map to `Float64` (JSON Schema carries no precision/scale),
    /// integers to `Int64`, objects and arrays to `String` holding JSON text.
    pub fn from_field(field: &FieldSchema) -> ColumnType {
        let base = match field.primary_type() {
            None => ColumnType::String,
            Some(JsonType::Integer) => ColumnType::Int64,
            Some(JsonType::Number) => ColumnType::Float64,
            Some(JsonType::Boolean) => ColumnType::Bool,
            Some(JsonType::String) => match field.format {
                Some(StringFormat::Date) => ColumnType::Date,
                Some(StringFormat::DateTime) => ColumnType::DateTime64,
                Some(StringFormat::Time) | None => ColumnType::String,
            },
            Some(JsonType::Object) | Some(JsonType::Array) => ColumnType::String,
            Some(JsonType::Null) => ColumnType::String,
        };

        if field.is_nullable() {
            base.nullable()
        } else {
            base
        }
    }

    pub fn nullable(self) -> ColumnType {
        match self {
            ColumnType::Nullable(_) => self,
            other => ColumnType::Nullable(Box::new(other)),
        }
    }

    pub fn non_nullable(self) -> ColumnType {
        match self {
            ColumnType::Nullable(inner) => *inner,
            other => other,
        }
    }

    pub fn is_nullable(&self) -> bool {
        matches!(self, ColumnType::Nullable(_))
    }

    pub fn base(&self) -> &ColumnType {
        match self {
            ColumnType::Nullable(inner) => inner,
            other => other,
        }
    }

    fn numeric_rank(&self) -> Option<u8> {
        match self {
            ColumnType::Bool => Some(0),
            ColumnType::Int64 => Some(1),
            ColumnType::Float64 => Some(2),
            _ => None,
        }
    }

    /// The narrowest type able to hold values of both `self` and `other`.
    ///
    /// Returns `None` when either side is a foreign type the crate cannot reason about.
    pub fn widen(&self, other: &ColumnType) -> Option<ColumnType> {
        let nullable = self.is_nullable() || other.is_nullable();
        let (a, b) = (self.base(), other.base());

        let base = if a == b {
            a.clone()
        } else {
            match (a, b) {
                (ColumnType::Other(_), _) | (_, ColumnType::Other(_)) => return None,
                (ColumnType::Date, ColumnType::DateTime64)
                | (ColumnType::DateTime64, ColumnType::Date) => ColumnType::DateTime64,
                _ => match (a.numeric_rank(), b.numeric_rank()) {
                    (Some(x), Some(y)) => {
                        if x >= y {
                            a.clone()
                        } else {
                            b.clone()
                        }
                    }
                    _ => ColumnType::String,
                },
            }
        };

        Some(if nullable { base.nullable() } else { base })
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::String => write!(f, "String"),
            ColumnType::Bool => write!(f, "Bool"),
            ColumnType::Int64 => write!(f, "Int64"),
            ColumnType::Float64 => write!(f, "Float64"),
            ColumnType::Date => write!(f, "Date"),
            ColumnType::DateTime64 => write!(f, "DateTime64({})", DATETIME_PRECISION),
            ColumnType::Nullable(inner) => write!(f, "Nullable({})", inner),
            ColumnType::Other(raw) => write!(f, "{}", raw),
        }
    }
}

impl FromStr for ColumnType {
    type Err = std::convert::Infallible;

    /// Parse a type name as reported by `system.columns`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(inner) = s.strip_prefix("Nullable(").and_then(|rest| rest.strip_suffix(')')) {
            let inner: ColumnType = inner.parse()?;
            return Ok(inner.nullable());
        }

        let datetime = format!("DateTime64({})", DATETIME_PRECISION);
        Ok(match s {
            "String" => ColumnType::String,
            "Bool" | "Boolean" => ColumnType::Bool,
            "Int64" => ColumnType::Int64,
            "Float64" => ColumnType::Float64,
            "Date" => ColumnType::Date,
            _ if s == datetime => ColumnType::DateTime64,
            other => ColumnType::Other(other.to_string()),
        })
    }
}

/// A column of a table about to be created
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub column_type: ColumnType,
    /// Member of the ordering/primary key
    pub is_key: bool,
}

impl ColumnDescriptor {
    /// Ordering-key columns are never nullable: the engine refuses nullable sort keys.
    pub fn from_field(field: &FieldSchema, is_key: bool) -> Self {
        let column_type = ColumnType::from_field(field);
        Self {
            name: field.name.clone(),
            column_type: if is_key { column_type.non_nullable() } else { column_type },
            is_key,
        }
    }

    pub fn nullable(&self) -> bool {
        self.column_type.is_nullable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(types: &[JsonType]) -> FieldSchema {
        FieldSchema::new("f", types)
    }

    #[test]
    fn test_null_plus_one_primitive_is_nullable() {
        let cases = [
            (JsonType::Integer, ColumnType::Int64),
            (JsonType::Number, ColumnType::Float64),
            (JsonType::Boolean, ColumnType::Bool),
            (JsonType::String, ColumnType::String),
            (JsonType::Object, ColumnType::String),
            (JsonType::Array, ColumnType::String),
        ];
        for (ty, expected) in cases {
            assert_eq!(
                ColumnType::from_field(&field(&[JsonType::Null, ty])),
                expected.clone().nullable()
            );
            assert_eq!(ColumnType::from_field(&field(&[ty, JsonType::Null])), expected.nullable());
        }
    }

    #[test]
    fn test_number_is_never_fixed_decimal() {
        assert_eq!(ColumnType::from_field(&field(&[JsonType::Number])), ColumnType::Float64);
        assert_eq!(ColumnType::from_field(&field(&[JsonType::Number])).to_string(), "Float64");
    }

    #[test]
    fn test_first_non_null_type_wins() {
        let f = field(&[JsonType::Null, JsonType::Integer, JsonType::String]);
        assert_eq!(ColumnType::from_field(&f), ColumnType::Int64.nullable());
    }

    #[test]
    fn test_string_formats() {
        let date = field(&[JsonType::String]).with_format(StringFormat::Date);
        let datetime = field(&[JsonType::String]).with_format(StringFormat::DateTime);
        let time = field(&[JsonType::String]).with_format(StringFormat::Time);
        assert_eq!(ColumnType::from_field(&date), ColumnType::Date);
        assert_eq!(ColumnType::from_field(&datetime).to_string(), "DateTime64(6)");
        assert_eq!(ColumnType::from_field(&time), ColumnType::String);
    }

    #[test]
    fn test_mapping_is_idempotent() {
        let f = field(&[JsonType::Integer, JsonType::Null]);
        let first = ColumnDescriptor::from_field(&f, false);
        let second = ColumnDescriptor::from_field(&f, false);
        assert_eq!(first, second);
        let reparsed: ColumnType = first.column_type.to_string().parse().unwrap();
        assert_eq!(reparsed, first.column_type);
    }

    #[test]
    fn test_key_columns_drop_nullability() {
        let f = field(&[JsonType::Integer, JsonType::Null]);
        let column = ColumnDescriptor::from_field(&f, true);
        assert_eq!(column.column_type, ColumnType::Int64);
        assert!(!column.nullable());
    }

    #[test]
    fn test_widen() {
        assert_eq!(ColumnType::Int64.widen(&ColumnType::Float64), Some(ColumnType::Float64));
        assert_eq!(ColumnType::Float64.widen(&ColumnType::Int64), Some(ColumnType::Float64));
        assert_eq!(ColumnType::Int64.widen(&ColumnType::String), Some(ColumnType::String));
        assert_eq!(ColumnType::Date.widen(&ColumnType::DateTime64), Some(ColumnType::DateTime64));
        assert_eq!(
            ColumnType::Int64.nullable().widen(&ColumnType::Int64),
            Some(ColumnType::Int64.nullable())
        );
        assert_eq!(ColumnType::Other("UUID".into()).widen(&ColumnType::String), None);
    }

    #[test]
    fn test_parse_database_types() {
        assert_eq!("Nullable(Int64)".parse::<ColumnType>().unwrap(), ColumnType::Int64.nullable());
        assert_eq!("DateTime64(6)".parse::<ColumnType>().unwrap(), ColumnType::DateTime64);
        assert_eq!(
            "LowCardinality(String)".parse::<ColumnType>().unwrap(),
            ColumnType::Other("LowCardinality(String)".into())
        );
    }
}
