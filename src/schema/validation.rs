//! Record validation against a `StreamSchema`

use crate::error::TargetError;
use crate::schema::field::{FieldSchema, FieldShape, JsonType, StringFormat};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use itertools::Itertools;
use serde_json::{Map, Value};
use std::fmt;

/// One step of a path into a record
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// First mismatch found in a record, with enough context for a targeted repair
#[derive(Clone, Debug, PartialEq)]
pub struct ValidationIssue {
    pub path: Vec<PathSegment>,
    pub field: FieldSchema,
    pub message: String,
}

impl ValidationIssue {
    pub fn path_string(&self) -> String {
        let mut out = String::new();
        for segment in &self.path {
            match segment {
                PathSegment::Key(key) => {
                    if !out.is_empty() {
                        out.push('.');
                    }
                    out.push_str(key);
                }
                PathSegment::Index(index) => out.push_str(&format!("[{}]", index)),
            }
        }
        out
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path_string(), self.message)
    }
}

impl From<ValidationIssue> for TargetError {
    fn from(issue: ValidationIssue) -> Self {
        TargetError::Validation {
            path: issue.path_string(),
            message: issue.message,
        }
    }
}

/// Validate every declared field present in `record`. Undeclared keys are ignored.
pub fn validate_record(
    record: &Map<String, Value>,
    fields: &[FieldSchema],
) -> Result<(), ValidationIssue> {
    let mut path = Vec::new();
    validate_object(record, fields, &mut path)
}

fn validate_object(
    object: &Map<String, Value>,
    fields: &[FieldSchema],
    path: &mut Vec<PathSegment>,
) -> Result<(), ValidationIssue> {
    for field in fields {
        if let Some(value) = object.get(&field.name) {
            path.push(PathSegment::Key(field.name.clone()));
            validate_value(value, field, path)?;
            path.pop();
        }
    }
    Ok(())
}

fn validate_value(
    value: &Value,
    field: &FieldSchema,
    path: &mut Vec<PathSegment>,
) -> Result<(), ValidationIssue> {
    if !matches_declared_kind(value, field) {
        return Err(ValidationIssue {
            path: path.clone(),
            field: field.clone(),
            message: format!(
                "{} is not of type {}",
                describe(value),
                field.types.iter().map(JsonType::as_str).join(" | ")
            ),
        });
    }

    if let (Value::String(s), Some(format)) = (value, field.format) {
        if !matches_format(s, format) {
            return Err(ValidationIssue {
                path: path.clone(),
                field: field.clone(),
                message: format!("'{}' is not a valid {:?}", s, format),
            });
        }
    }

    match (field.shape(), value) {
        (FieldShape::Object(properties), Value::Object(object)) => {
            validate_object(object, properties, path)
        }
        (FieldShape::Array(items), Value::Array(elements)) => {
            for (index, element) in elements.iter().enumerate() {
                path.push(PathSegment::Index(index));
                validate_value(element, items, path)?;
                path.pop();
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn matches_declared_kind(value: &Value, field: &FieldSchema) -> bool {
    if field.is_unconstrained() {
        return true;
    }
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

pub(crate) fn is_integral(n: &serde_json::Number) -> bool {
    n.is_i64()
        || n.is_u64()
        || n.as_f64().map(|f| f.is_finite() && f.fract() == 0.0).unwrap_or(false)
}

/// Accepted textual forms for date and datetime columns
pub(crate) fn matches_format(s: &str, format: StringFormat) -> bool {
    match format {
        StringFormat::Date => NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok(),
        StringFormat::DateTime => parse_datetime(s),
        StringFormat::Time => true,
    }
}

fn parse_datetime(s: &str) -> bool {
    DateTime::parse_from_rfc3339(s).is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").is_ok()
        || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s),
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "object".to_string(),
    }
}
