//! Typed view of a stream's JSON Schema
//!
//! Singer streams describe records with a loosely-typed JSON Schema. This module parses it once
//! into a `FieldSchema` tree so the rest of the crate can match on declared kinds instead of
//! poking at raw `serde_json::Value`s.

use crate::error::{Result, TargetError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Primitive/structural kinds a JSON Schema `type` can declare
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonType {
    Null,
    Boolean,
    Integer,
    Number,
    String,
    Object,
    Array,
}

impl JsonType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JsonType::Null => "null",
            JsonType::Boolean => "boolean",
            JsonType::Integer => "integer",
            JsonType::Number => "number",
            JsonType::String => "string",
            JsonType::Object => "object",
            JsonType::Array => "array",
        }
    }
}

impl fmt::Display for JsonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JsonType {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "null" => Ok(JsonType::Null),
            "boolean" => Ok(JsonType::Boolean),
            "integer" => Ok(JsonType::Integer),
            "number" => Ok(JsonType::Number),
            "string" => Ok(JsonType::String),
            "object" => Ok(JsonType::Object),
            "array" => Ok(JsonType::Array),
            other => Err(TargetError::Schema(format!("Unknown JSON Schema type '{}'", other))),
        }
    }
}

/// String formats that change the resolved column type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StringFormat {
    Date,
    DateTime,
    Time,
}

impl StringFormat {
    fn parse(format: &str) -> Option<Self> {
        match format {
            "date" => Some(StringFormat::Date),
            "date-time" => Some(StringFormat::DateTime),
            "time" => Some(StringFormat::Time),
            _ => None,
        }
    }
}

/// Nested structure carried by a field, used by the record visitors
#[derive(Clone, Copy, Debug)]
pub enum FieldShape<'a> {
    Scalar,
    Object(&'a [FieldSchema]),
    Array(&'a FieldSchema),
}

/// One named field of a record schema
#[derive(Clone, Debug, PartialEq)]
pub struct FieldSchema {
    pub name: String,
    /// Declared kinds in declaration order, without duplicates. Empty means "anything".
    pub types: Vec<JsonType>,
    pub format: Option<StringFormat>,
    /// Nested fields for object kinds
    pub properties: Vec<FieldSchema>,
    /// Item schema for array kinds
    pub items: Option<Box<FieldSchema>>,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, types: &[JsonType]) -> Self {
        let mut field = Self {
            name: name.into(),
            types: Vec::new(),
            format: None,
            properties: Vec::new(),
            items: None,
        };
        for ty in types {
            field.push_type(*ty);
        }
        field
    }

    pub fn with_format(mut self, format: StringFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_properties(mut self, properties: Vec<FieldSchema>) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_items(mut self, items: FieldSchema) -> Self {
        self.items = Some(Box::new(items));
        self
    }

    /// Parse a JSON Schema property definition
    pub fn from_json(name: &str, definition: &Value) -> Result<Self> {
        let mut field = FieldSchema::new(name, &[]);

        let object = match definition {
            Value::Object(object) => object,
            // `true` and `{}` both accept any value
            Value::Bool(true) => return Ok(field),
            other => {
                return Err(TargetError::Schema(format!(
                    "Property '{}' has an invalid schema definition: {}",
                    name, other
                )))
            }
        };

        match object.get("type") {
            Some(Value::String(ty)) => field.push_type(ty.parse()?),
            Some(Value::Array(types)) => {
                for ty in types {
                    let ty = ty.as_str().ok_or_else(|| {
                        TargetError::Schema(format!(
                            "Property '{}' has a non-string type entry",
                            name
                        ))
                    })?;
                    field.push_type(ty.parse()?);
                }
            }
            Some(other) => {
                return Err(TargetError::Schema(format!(
                    "Property '{}' has an invalid type declaration: {}",
                    name, other
                )))
            }
            None => {}
        }

        if let Some(format) = object.get("format").and_then(Value::as_str) {
            field.format = StringFormat::parse(format);
        }

        if let Some(properties) = object.get("properties").and_then(Value::as_object) {
            field.properties = parse_properties(properties)?;
            if field.types.is_empty() {
                field.push_type(JsonType::Object);
            }
        }

        if let Some(items) = object.get("items") {
            field.items = Some(Box::new(FieldSchema::from_json(name, items)?));
            if field.types.is_empty() {
                field.push_type(JsonType::Array);
            }
        }

        // anyOf/oneOf branches contribute their kinds in order, first nested definition wins
        for key in ["anyOf", "oneOf"] {
            if let Some(branches) = object.get(key).and_then(Value::as_array) {
                for branch in branches {
                    let branch = FieldSchema::from_json(name, branch)?;
                    field.absorb(branch);
                }
            }
        }

        Ok(field)
    }

    fn push_type(&mut self, ty: JsonType) {
        if !self.types.contains(&ty) {
            self.types.push(ty);
        }
    }

    fn absorb(&mut self, other: FieldSchema) {
        for ty in &other.types {
            self.push_type(*ty);
        }
        if self.format.is_none() {
            self.format = other.format;
        }
        if self.properties.is_empty() {
            self.properties = other.properties;
        }
        if self.items.is_none() {
            self.items = other.items;
        }
    }

    pub fn allows(&self, ty: JsonType) -> bool {
        self.types.is_empty() || self.types.contains(&ty)
    }

    /// Declared kinds accept any value
    pub fn is_unconstrained(&self) -> bool {
        self.types.is_empty()
    }

    pub fn is_nullable(&self) -> bool {
        self.types.contains(&JsonType::Null)
    }

    /// First declared non-null kind
    pub fn primary_type(&self) -> Option<JsonType> {
        self.types.iter().copied().find(|ty| *ty != JsonType::Null)
    }

    pub fn shape(&self) -> FieldShape<'_> {
        if !self.properties.is_empty() {
            FieldShape::Object(&self.properties)
        } else if let Some(items) = &self.items {
            FieldShape::Array(items)
        } else {
            FieldShape::Scalar
        }
    }

    pub fn property(&self, name: &str) -> Option<&FieldSchema> {
        self.properties.iter().find(|p| p.name == name)
    }
}

fn parse_properties(properties: &Map<String, Value>) -> Result<Vec<FieldSchema>> {
    properties
        .iter()
        .map(|(name, definition)| FieldSchema::from_json(name, definition))
        .collect()
}

/// Ordered top-level fields of one stream's record schema
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamSchema {
    fields: Vec<FieldSchema>,
}

impl StreamSchema {
    pub fn new(fields: Vec<FieldSchema>) -> Self {
        Self { fields }
    }

    /// Parse a stream schema. A schema without `properties` is rejected.
    pub fn from_json(schema: &Value) -> Result<Self> {
        let properties = schema
            .get("properties")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                TargetError::Schema(format!("Schema does not define properties: {}", schema))
            })?;

        Ok(Self {
            fields: parse_properties(properties)?,
        })
    }

    pub fn fields(&self) -> &[FieldSchema] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Add a field if the schema does not declare it yet. Returns true when added.
    pub fn ensure_field(&mut self, field: FieldSchema) -> bool {
        if self.contains(&field.name) {
            return false;
        }
        self.fields.push(field);
        true
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
