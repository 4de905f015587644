//! Record Normalizer
//!
//! Brings raw records into the shape the destination columns expect:
//! - arbitrary-precision decimals anywhere in the record become doubles
//! - fields declaring `string` get the string form of other values (JSON text for structures)
//! - nested objects and arrays of objects are normalized per their own schema first
//!
//! A record still rejected by validation afterwards gets one targeted repair at the failing
//! path. If that does not help the record is dropped. The same goes for a top-level value the
//! resolved column cannot hold, such as text in an `Int64` column of a mixed-kind field. Valid
//! records finally have the values of their String columns encoded as text and integral
//! doubles of their `Int64` columns written as integers.

use crate::schema::validation::{is_integral, matches_format};
use crate::schema::{
    validate_record, ColumnType, FieldSchema, FieldShape, JsonType, PathSegment, Row,
    StreamSchema, StringFormat, ValidationIssue,
};
use serde_json::{Map, Number, Value};
use tracing::{debug, warn};

/// Result of preparing one record
#[derive(Clone, Debug, PartialEq)]
pub enum Prepared {
    Valid(Row),
    Repaired(Row),
    Dropped(ValidationIssue),
}

#[derive(Clone, Debug, Default)]
pub struct RecordNormalizer;

impl RecordNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Normalize in place, ahead of validation
    pub fn normalize(&self, record: &mut Row, schema: &StreamSchema) {
        for value in record.values_mut() {
            collapse_decimals(value);
        }
        visit_fields(record, schema.fields(), &coerce_declared_string);
    }

    /// Encode values for their columns, after validation: structures and scalars of String
    /// columns become text, integral doubles of Int64 columns become integers
    pub fn encode_for_columns(&self, record: &mut Row, schema: &StreamSchema) {
        for field in schema.fields() {
            let Some(value) = record.get_mut(&field.name) else {
                continue;
            };
            match ColumnType::from_field(field).base() {
                ColumnType::String => stringify(value),
                ColumnType::Int64 => {
                    if let Value::Number(n) = value {
                        if !n.is_i64() {
                            if let Some(i) = as_int64(n) {
                                *value = Value::from(i);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Normalize, validate and repair once. `None` means the record was dropped.
    pub fn prepare(&self, record: Row, schema: &StreamSchema) -> Option<Row> {
        match self.prepare_detailed(record, schema) {
            Prepared::Valid(row) | Prepared::Repaired(row) => Some(row),
            Prepared::Dropped(_) => None,
        }
    }

    pub fn prepare_detailed(&self, mut record: Row, schema: &StreamSchema) -> Prepared {
        self.normalize(&mut record, schema);

        let issue = match check_record(&record, schema) {
            Ok(()) => {
                self.encode_for_columns(&mut record, schema);
                return Prepared::Valid(record);
            }
            Err(issue) => issue,
        };

        debug!(
            path = %issue.path_string(),
            "Record failed validation, attempting repair: {}",
            issue.message
        );
        if !self.repair(&mut record, &issue) {
            warn!(
                path = %issue.path_string(),
                "Dropping record that cannot be repaired: {}",
                issue.message
            );
            return Prepared::Dropped(issue);
        }

        match check_record(&record, schema) {
            Ok(()) => {
                self.encode_for_columns(&mut record, schema);
                Prepared::Repaired(record)
            }
            Err(issue) => {
                warn!(
                    path = %issue.path_string(),
                    "Dropping record still invalid after repair: {}",
                    issue.message
                );
                Prepared::Dropped(issue)
            }
        }
    }

    /// Rewrite the value at the issue's path. Returns true when something changed.
    pub fn repair(&self, record: &mut Row, issue: &ValidationIssue) -> bool {
        let Some(value) = value_at_mut(record, &issue.path) else {
            return false;
        };
        match repaired_value(value, &issue.field) {
            Some(repaired) => {
                debug!(
                    path = %issue.path_string(),
                    from = %value,
                    to = %repaired,
                    "Repaired value"
                );
                *value = repaired;
                true
            }
            None => false,
        }
    }
}

/// Declared kinds first, then the columns the top-level values land in
fn check_record(record: &Row, schema: &StreamSchema) -> Result<(), ValidationIssue> {
    validate_record(record, schema.fields())?;
    match column_issue(record, schema) {
        Some(issue) => Err(issue),
        None => Ok(()),
    }
}

/// First top-level value its column cannot hold. The issue carries the field narrowed to the
/// column's kind, so a repair targets the column rather than any declared kind.
fn column_issue(record: &Row, schema: &StreamSchema) -> Option<ValidationIssue> {
    schema.fields().iter().find_map(|field| {
        let value = record.get(&field.name)?;
        let column = ColumnType::from_field(field);
        if value.is_null() || fits_column(value, column.base()) {
            return None;
        }
        Some(ValidationIssue {
            path: vec![PathSegment::Key(field.name.clone())],
            field: column_field(field, column.base()),
            message: format!("{} does not fit column type {}", value, column),
        })
    })
}

fn fits_column(value: &Value, column: &ColumnType) -> bool {
    match (column, value) {
        (ColumnType::String | ColumnType::Other(_), _) => true,
        (ColumnType::Int64, Value::Number(n)) => as_int64(n).is_some(),
        (ColumnType::Float64, Value::Number(_)) => true,
        (ColumnType::Bool, Value::Bool(_)) => true,
        (ColumnType::Date, Value::String(s)) => matches_format(s, StringFormat::Date),
        (ColumnType::DateTime64, Value::String(s)) => matches_format(s, StringFormat::DateTime),
        _ => false,
    }
}

fn column_field(field: &FieldSchema, column: &ColumnType) -> FieldSchema {
    let (kind, format) = match column {
        ColumnType::Int64 => (JsonType::Integer, None),
        ColumnType::Float64 => (JsonType::Number, None),
        ColumnType::Bool => (JsonType::Boolean, None),
        ColumnType::Date => (JsonType::String, Some(StringFormat::Date)),
        ColumnType::DateTime64 => (JsonType::String, Some(StringFormat::DateTime)),
        _ => (JsonType::String, None),
    };
    let mut kinds = vec![kind];
    if field.is_nullable() {
        kinds.push(JsonType::Null);
    }
    let narrowed = FieldSchema::new(field.name.clone(), &kinds);
    match format {
        Some(format) => narrowed.with_format(format),
        None => narrowed,
    }
}

/// Integer value of a number an Int64 column can hold exactly
fn as_int64(n: &Number) -> Option<i64> {
    n.as_i64().or_else(|| {
        n.as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64)
            .map(|f| f as i64)
    })
}

/// Post-order walk over the declared fields present in `object`. Nested objects and object
/// arrays are visited before `transform` sees their parent.
pub fn visit_fields<F>(object: &mut Map<String, Value>, fields: &[FieldSchema], transform: &F)
where
    F: Fn(&FieldSchema, &mut Value),
{
    for field in fields {
        if let Some(value) = object.get_mut(&field.name) {
            visit_value(value, field, transform);
        }
    }
}

fn visit_value<F>(value: &mut Value, field: &FieldSchema, transform: &F)
where
    F: Fn(&FieldSchema, &mut Value),
{
    if value.is_null() && field.is_nullable() {
        return;
    }

    match (field.shape(), &mut *value) {
        (FieldShape::Object(properties), Value::Object(nested)) => {
            visit_fields(nested, properties, transform)
        }
        (FieldShape::Array(items), Value::Array(elements)) => {
            for element in elements.iter_mut() {
                visit_value(element, items, transform);
            }
        }
        _ => {}
    }

    transform(field, value);
}

/// A field declaring `string` takes the string form of a value of another kind, unless that
/// kind is declared too and maps to a non-String column
fn coerce_declared_string(field: &FieldSchema, value: &mut Value) {
    if value.is_null() || value.is_string() || !field.types.contains(&JsonType::String) {
        return;
    }
    if allows_kind(field, value) && *ColumnType::from_field(field).base() != ColumnType::String {
        return;
    }
    stringify(value);
}

fn allows_kind(field: &FieldSchema, value: &Value) -> bool {
    match value {
        Value::Null => field.allows(JsonType::Null),
        Value::Bool(_) => field.allows(JsonType::Boolean),
        Value::Number(n) => {
            field.allows(JsonType::Number) || (field.allows(JsonType::Integer) && is_integral(n))
        }
        Value::String(_) => field.allows(JsonType::String),
        Value::Array(_) => field.allows(JsonType::Array),
        Value::Object(_) => field.allows(JsonType::Object),
    }
}

fn stringify(value: &mut Value) {
    let text = match &*value {
        Value::Null | Value::String(_) => return,
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    };
    *value = Value::String(text);
}

/// Replace every non-integer number with its nearest double, at any depth
pub fn collapse_decimals(value: &mut Value) {
    match value {
        Value::Number(n) if !(n.is_i64() || n.is_u64()) => {
            if let Some(double) = n.as_f64().and_then(Number::from_f64) {
                *n = double;
            }
        }
        Value::Array(elements) => elements.iter_mut().for_each(collapse_decimals),
        Value::Object(object) => object.values_mut().for_each(collapse_decimals),
        _ => {}
    }
}

fn value_at_mut<'a>(record: &'a mut Row, path: &[PathSegment]) -> Option<&'a mut Value> {
    let (first, rest) = path.split_first()?;
    let PathSegment::Key(key) = first else {
        return None;
    };
    let mut current = record.get_mut(key)?;
    for segment in rest {
        current = match (segment, current) {
            (PathSegment::Key(key), Value::Object(object)) => object.get_mut(key)?,
            (PathSegment::Index(index), Value::Array(elements)) => elements.get_mut(*index)?,
            _ => return None,
        };
    }
    Some(current)
}

fn repaired_value(value: &Value, field: &FieldSchema) -> Option<Value> {
    match value {
        Value::String(s) => repair_string(s, field),
        Value::Number(n) => {
            if let Some(i) = as_int64(n).filter(|_| field.allows(JsonType::Integer)) {
                Some(Value::from(i))
            } else if field.allows(JsonType::String) {
                Some(Value::String(n.to_string()))
            } else if field.allows(JsonType::Boolean) {
                n.as_i64().filter(|i| *i == 0 || *i == 1).map(|i| Value::Bool(i == 1))
            } else {
                None
            }
        }
        Value::Bool(b) => {
            if field.allows(JsonType::Integer) {
                Some(Value::from(*b as i64))
            } else if field.allows(JsonType::String) {
                Some(Value::String(b.to_string()))
            } else {
                None
            }
        }
        Value::Object(_) | Value::Array(_) if field.allows(JsonType::String) => {
            Some(Value::String(value.to_string()))
        }
        _ => None,
    }
}

fn repair_string(s: &str, field: &FieldSchema) -> Option<Value> {
    let trimmed = s.trim();

    if trimmed.is_empty() && field.is_nullable() {
        return Some(Value::Null);
    }

    if field.allows(JsonType::String) {
        if let Some(format) = field.format {
            return repair_formatted(trimmed, format);
        }
    }

    if field.allows(JsonType::Integer) {
        if let Ok(i) = trimmed.parse::<i64>() {
            return Some(Value::from(i));
        }
    }
    if field.allows(JsonType::Number) {
        if let Some(n) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
            return Some(Value::Number(n));
        }
    }
    if field.allows(JsonType::Boolean) {
        match trimmed.to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "1" => return Some(Value::Bool(true)),
            "false" | "f" | "no" | "0" => return Some(Value::Bool(false)),
            _ => {}
        }
    }
    None
}

/// Dates arriving as datetimes keep their date part; a space-separated datetime gets the `T`
fn repair_formatted(s: &str, format: StringFormat) -> Option<Value> {
    let candidate = match format {
        StringFormat::Date => s.get(..10)?.to_string(),
        StringFormat::DateTime => s.replacen(' ', "T", 1),
        StringFormat::Time => return None,
    };
    if candidate != s && matches_format(&candidate, format) {
        Some(Value::String(candidate))
    } else {
        None
    }
}
