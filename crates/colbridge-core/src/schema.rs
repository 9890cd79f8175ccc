//! Logical schema descriptors. Pure data; no Arrow dependency here.
//!
//! The host bridge converts these to and from the Arrow C data interface in
//! `colbridge::schema_bridge`. Nested types (lists, structs) are recursive.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeUnit {
    Second,
    Millisecond,
    Microsecond,
    Nanosecond,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Null,
    Boolean,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Utf8,
    LargeUtf8,
    Binary,
    LargeBinary,
    FixedSizeBinary(i32),
    Date32,
    Date64,
    /// Time of day; seconds or milliseconds only.
    Time32(TimeUnit),
    /// Time of day; microseconds or nanoseconds only.
    Time64(TimeUnit),
    Timestamp(TimeUnit, Option<String>),
    Duration(TimeUnit),
    Decimal128 { precision: u8, scale: i8 },
    List(Box<Field>),
    LargeList(Box<Field>),
    FixedSizeList(Box<Field>, i32),
    Struct(Vec<Field>),
    /// Categorical column: integer `key`s indexing a dictionary of `value`s.
    Dictionary {
        key: Box<DataType>,
        value: Box<DataType>,
    },
}

impl DataType {
    pub fn is_nested(&self) -> bool {
        matches!(
            self,
            DataType::List(_)
                | DataType::LargeList(_)
                | DataType::FixedSizeList(..)
                | DataType::Struct(_)
        )
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            DataType::Int8
                | DataType::Int16
                | DataType::Int32
                | DataType::Int64
                | DataType::UInt8
                | DataType::UInt16
                | DataType::UInt32
                | DataType::UInt64
        )
    }

    /// Dictionary of `value`s with `key` indices.
    pub fn dictionary(key: DataType, value: DataType) -> Self {
        DataType::Dictionary {
            key: Box::new(key),
            value: Box::new(value),
        }
    }

    /// Check a standalone type; see [`SchemaDescriptor::validate`].
    pub fn validate(&self) -> Result<()> {
        validate_type("<type>", self)
    }

    /// Convenience for `List(item)` with the conventional child name.
    pub fn list_of(item: DataType, nullable: bool) -> Self {
        DataType::List(Box::new(Field::new("item", item, nullable)))
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Timestamp(unit, Some(tz)) => write!(f, "Timestamp({unit:?}, {tz})"),
            DataType::Timestamp(unit, None) => write!(f, "Timestamp({unit:?})"),
            DataType::Duration(unit) => write!(f, "Duration({unit:?})"),
            DataType::Decimal128 { precision, scale } => {
                write!(f, "Decimal128({precision}, {scale})")
            }
            DataType::List(item) => write!(f, "List({})", item.data_type),
            DataType::LargeList(item) => write!(f, "LargeList({})", item.data_type),
            DataType::FixedSizeList(item, n) => {
                write!(f, "FixedSizeList({}, {n})", item.data_type)
            }
            DataType::Time32(unit) => write!(f, "Time32({unit:?})"),
            DataType::Time64(unit) => write!(f, "Time64({unit:?})"),
            DataType::Dictionary { key, value } => write!(f, "Dictionary({key}, {value})"),
            DataType::Struct(fields) => {
                write!(f, "Struct(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", field.name, field.data_type)?;
                }
                write!(f, ")")
            }
            other => write!(f, "{other:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }
}

/// Ordered (name, type, nullability) sequence describing one batch layout.
///
/// Every batch of a logical stream must carry exactly this layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub fields: Vec<Field>,
}

impl SchemaDescriptor {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self { fields: vec![] }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, idx: usize) -> Option<&Field> {
        self.fields.get(idx)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Reject duplicate top-level names and empty struct types.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.fields.len());
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(Error::Schema(format!(
                    "duplicate field name '{}'",
                    field.name
                )));
            }
            validate_type(&field.name, &field.data_type)?;
        }
        Ok(())
    }

    /// Compact JSON rendering, `{"fields":[...]}`.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

fn validate_type(path: &str, dt: &DataType) -> Result<()> {
    match dt {
        DataType::Struct(children) if children.is_empty() => Err(Error::Schema(format!(
            "struct field '{path}' has no children"
        ))),
        DataType::Struct(children) => {
            for child in children {
                validate_type(&format!("{path}.{}", child.name), &child.data_type)?;
            }
            Ok(())
        }
        DataType::List(item) | DataType::LargeList(item) => {
            validate_type(&format!("{path}[]"), &item.data_type)
        }
        DataType::FixedSizeList(item, n) => {
            if *n < 0 {
                return Err(Error::Schema(format!(
                    "fixed-size list at '{path}' has negative size {n}"
                )));
            }
            validate_type(&format!("{path}[]"), &item.data_type)
        }
        DataType::FixedSizeBinary(n) if *n < 0 => Err(Error::Schema(format!(
            "fixed-size binary at '{path}' has negative width {n}"
        ))),
        DataType::Time32(TimeUnit::Microsecond | TimeUnit::Nanosecond)
        | DataType::Time64(TimeUnit::Second | TimeUnit::Millisecond) => Err(
            Error::UnsupportedType(format!("{dt} at '{path}'")),
        ),
        DataType::Dictionary { key, value } => {
            if !key.is_integer() {
                return Err(Error::UnsupportedType(format!(
                    "dictionary key {key} at '{path}' is not an integer type"
                )));
            }
            validate_type(path, value)
        }
        DataType::Decimal128 { precision, scale } => {
            if *precision == 0 || *precision > 38 || i16::from(*scale) > i16::from(*precision) {
                return Err(Error::UnsupportedType(format!(
                    "decimal({precision}, {scale}) at '{path}'"
                )));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SchemaDescriptor {
        SchemaDescriptor::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("tags", DataType::list_of(DataType::Utf8, true), true),
            Field::new(
                "point",
                DataType::Struct(vec![
                    Field::new("x", DataType::Float64, false),
                    Field::new("y", DataType::Float64, false),
                ]),
                true,
            ),
        ])
    }

    #[test]
    fn lookup_by_name() {
        let schema = sample();
        assert_eq!(schema.index_of("tags"), Some(1));
        assert_eq!(schema.index_of("missing"), None);
        assert_eq!(schema.names().collect::<Vec<_>>(), vec!["k", "tags", "point"]);
    }

    #[test]
    fn validate_rejects_duplicates_and_empty_structs() {
        assert!(sample().validate().is_ok());

        let dup = SchemaDescriptor::new(vec![
            Field::new("a", DataType::Int32, true),
            Field::new("a", DataType::Utf8, true),
        ]);
        assert!(matches!(dup.validate(), Err(Error::Schema(_))));

        let empty_struct =
            SchemaDescriptor::new(vec![Field::new("s", DataType::Struct(vec![]), true)]);
        assert!(empty_struct.validate().is_err());
    }

    #[test]
    fn json_roundtrip_keeps_nesting() {
        let schema = sample();
        let json = schema.to_json().unwrap();
        let back = SchemaDescriptor::from_json(&json).unwrap();
        assert_eq!(schema, back);
    }

    #[test]
    fn display_nested() {
        let dt = DataType::Struct(vec![
            Field::new("x", DataType::Int32, true),
            Field::new("xs", DataType::list_of(DataType::Int32, true), true),
        ]);
        assert_eq!(dt.to_string(), "Struct(x: Int32, xs: List(Int32))");
    }

    #[test]
    fn categorical_and_time_types() {
        let schema = SchemaDescriptor::new(vec![
            Field::new(
                "city",
                DataType::dictionary(DataType::Int32, DataType::Utf8),
                true,
            ),
            Field::new("opened", DataType::Time32(TimeUnit::Millisecond), true),
            Field::new("closed", DataType::Time64(TimeUnit::Nanosecond), true),
        ]);
        assert!(schema.validate().is_ok());
        assert_eq!(
            schema.fields[0].data_type.to_string(),
            "Dictionary(Int32, Utf8)"
        );
        let back = SchemaDescriptor::from_json(&schema.to_json().unwrap()).unwrap();
        assert_eq!(back, schema);

        assert!(DataType::dictionary(DataType::Utf8, DataType::Utf8)
            .validate()
            .is_err());
        assert!(DataType::Time32(TimeUnit::Nanosecond).validate().is_err());
        assert!(DataType::Time64(TimeUnit::Second).validate().is_err());
        assert!(DataType::FixedSizeList(
            Box::new(Field::new("item", DataType::Float32, false)),
            -1
        )
        .validate()
        .is_err());
    }
}
