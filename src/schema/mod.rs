//! Record schemas: parsing, column type mapping and validation

pub mod field;
pub mod types;
pub mod validation;

pub use field::{FieldSchema, FieldShape, JsonType, StreamSchema, StringFormat};
pub use types::{ColumnDescriptor, ColumnType};
pub use validation::{validate_record, PathSegment, ValidationIssue};

/// One record as a key -> value mapping
pub type Row = serde_json::Map<String, serde_json::Value>;
