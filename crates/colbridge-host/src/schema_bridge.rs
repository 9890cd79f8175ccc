//! Schema and batch exchange over the Arrow C data interface.
//!
//! After [`export_schema`] the receiver owns the release obligation of the
//! returned struct. [`import_schema`] copies everything it needs and then
//! runs the struct's release callback itself. A type the descriptor model
//! cannot express fails the whole conversion; there is no partial schema.

use std::sync::Arc;

use arrow::array::{Array, RecordBatch, RecordBatchOptions, StructArray};
use arrow::datatypes::{
    DataType as ArrowType, Field as ArrowField, Schema, SchemaRef, TimeUnit as ArrowUnit,
};
use arrow::ffi::{from_ffi, FFI_ArrowArray, FFI_ArrowSchema};
use colbridge_core::schema::{DataType, Field, SchemaDescriptor, TimeUnit};
use colbridge_core::Error as CoreError;

use crate::error::{BridgeError, Result};

fn unsupported(what: impl std::fmt::Display) -> BridgeError {
    BridgeError::Core(CoreError::UnsupportedType(what.to_string()))
}

fn to_arrow_unit(unit: TimeUnit) -> ArrowUnit {
    match unit {
        TimeUnit::Second => ArrowUnit::Second,
        TimeUnit::Millisecond => ArrowUnit::Millisecond,
        TimeUnit::Microsecond => ArrowUnit::Microsecond,
        TimeUnit::Nanosecond => ArrowUnit::Nanosecond,
    }
}

fn from_arrow_unit(unit: &ArrowUnit) -> TimeUnit {
    match unit {
        ArrowUnit::Second => TimeUnit::Second,
        ArrowUnit::Millisecond => TimeUnit::Millisecond,
        ArrowUnit::Microsecond => TimeUnit::Microsecond,
        ArrowUnit::Nanosecond => TimeUnit::Nanosecond,
    }
}

pub fn to_arrow_type(dt: &DataType) -> Result<ArrowType> {
    dt.validate()?;
    build_arrow_type(dt)
}

fn build_arrow_type(dt: &DataType) -> Result<ArrowType> {
    Ok(match dt {
        DataType::Null => ArrowType::Null,
        DataType::Boolean => ArrowType::Boolean,
        DataType::Int8 => ArrowType::Int8,
        DataType::Int16 => ArrowType::Int16,
        DataType::Int32 => ArrowType::Int32,
        DataType::Int64 => ArrowType::Int64,
        DataType::UInt8 => ArrowType::UInt8,
        DataType::UInt16 => ArrowType::UInt16,
        DataType::UInt32 => ArrowType::UInt32,
        DataType::UInt64 => ArrowType::UInt64,
        DataType::Float32 => ArrowType::Float32,
        DataType::Float64 => ArrowType::Float64,
        DataType::Utf8 => ArrowType::Utf8,
        DataType::LargeUtf8 => ArrowType::LargeUtf8,
        DataType::Binary => ArrowType::Binary,
        DataType::LargeBinary => ArrowType::LargeBinary,
        DataType::FixedSizeBinary(n) => ArrowType::FixedSizeBinary(*n),
        DataType::Date32 => ArrowType::Date32,
        DataType::Date64 => ArrowType::Date64,
        DataType::Time32(unit) => ArrowType::Time32(to_arrow_unit(*unit)),
        DataType::Time64(unit) => ArrowType::Time64(to_arrow_unit(*unit)),
        DataType::Timestamp(unit, tz) => {
            ArrowType::Timestamp(to_arrow_unit(*unit), tz.as_deref().map(Into::into))
        }
        DataType::Duration(unit) => ArrowType::Duration(to_arrow_unit(*unit)),
        DataType::Decimal128 { precision, scale } => ArrowType::Decimal128(*precision, *scale),
        DataType::List(item) => ArrowType::List(Arc::new(to_arrow_field(item)?)),
        DataType::LargeList(item) => ArrowType::LargeList(Arc::new(to_arrow_field(item)?)),
        DataType::FixedSizeList(item, n) => {
            ArrowType::FixedSizeList(Arc::new(to_arrow_field(item)?), *n)
        }
        DataType::Struct(children) => ArrowType::Struct(
            children
                .iter()
                .map(to_arrow_field)
                .collect::<Result<Vec<_>>>()?
                .into(),
        ),
        DataType::Dictionary { key, value } => ArrowType::Dictionary(
            Box::new(build_arrow_type(key)?),
            Box::new(build_arrow_type(value)?),
        ),
    })
}

pub fn from_arrow_type(dt: &ArrowType) -> Result<DataType> {
    Ok(match dt {
        ArrowType::Null => DataType::Null,
        ArrowType::Boolean => DataType::Boolean,
        ArrowType::Int8 => DataType::Int8,
        ArrowType::Int16 => DataType::Int16,
        ArrowType::Int32 => DataType::Int32,
        ArrowType::Int64 => DataType::Int64,
        ArrowType::UInt8 => DataType::UInt8,
        ArrowType::UInt16 => DataType::UInt16,
        ArrowType::UInt32 => DataType::UInt32,
        ArrowType::UInt64 => DataType::UInt64,
        ArrowType::Float32 => DataType::Float32,
        ArrowType::Float64 => DataType::Float64,
        ArrowType::Utf8 => DataType::Utf8,
        ArrowType::LargeUtf8 => DataType::LargeUtf8,
        ArrowType::Binary => DataType::Binary,
        ArrowType::LargeBinary => DataType::LargeBinary,
        ArrowType::FixedSizeBinary(n) => DataType::FixedSizeBinary(*n),
        ArrowType::Date32 => DataType::Date32,
        ArrowType::Date64 => DataType::Date64,
        ArrowType::Time32(unit) => DataType::Time32(from_arrow_unit(unit)),
        ArrowType::Time64(unit) => DataType::Time64(from_arrow_unit(unit)),
        ArrowType::Timestamp(unit, tz) => {
            DataType::Timestamp(from_arrow_unit(unit), tz.as_ref().map(|s| s.to_string()))
        }
        ArrowType::Duration(unit) => DataType::Duration(from_arrow_unit(unit)),
        ArrowType::Decimal128(precision, scale) => DataType::Decimal128 {
            precision: *precision,
            scale: *scale,
        },
        ArrowType::List(item) => DataType::List(Box::new(from_arrow_field(item)?)),
        ArrowType::LargeList(item) => DataType::LargeList(Box::new(from_arrow_field(item)?)),
        ArrowType::FixedSizeList(item, n) => {
            DataType::FixedSizeList(Box::new(from_arrow_field(item)?), *n)
        }
        ArrowType::Dictionary(key, value) => {
            DataType::dictionary(from_arrow_type(key)?, from_arrow_type(value)?)
        }
        ArrowType::Struct(children) => DataType::Struct(
            children
                .iter()
                .map(|f| from_arrow_field(f))
                .collect::<Result<Vec<_>>>()?,
        ),
        other => return Err(unsupported(other)),
    })
}

pub fn to_arrow_field(field: &Field) -> Result<ArrowField> {
    Ok(ArrowField::new(
        &field.name,
        to_arrow_type(&field.data_type)?,
        field.nullable,
    ))
}

pub fn from_arrow_field(field: &ArrowField) -> Result<Field> {
    from_arrow_type(field.data_type())
        .map(|dt| Field::new(field.name(), dt, field.is_nullable()))
        .map_err(|e| match e {
            BridgeError::Core(CoreError::UnsupportedType(t)) => {
                unsupported(format!("{t} in field '{}'", field.name()))
            }
            other => other,
        })
}

pub fn to_arrow_schema(desc: &SchemaDescriptor) -> Result<SchemaRef> {
    desc.validate()?;
    let fields = desc
        .fields
        .iter()
        .map(to_arrow_field)
        .collect::<Result<Vec<_>>>()?;
    Ok(Arc::new(Schema::new(fields)))
}

pub fn from_arrow_schema(schema: &Schema) -> Result<SchemaDescriptor> {
    let fields = schema
        .fields()
        .iter()
        .map(|f| from_arrow_field(f))
        .collect::<Result<Vec<_>>>()?;
    let desc = SchemaDescriptor::new(fields);
    desc.validate()?;
    Ok(desc)
}

/// Export a descriptor as an ABI struct graph. The receiver must release it.
pub fn export_schema(desc: &SchemaDescriptor) -> Result<FFI_ArrowSchema> {
    let schema = to_arrow_schema(desc)?;
    Ok(FFI_ArrowSchema::try_from(schema.as_ref())?)
}

/// Import and release a schema struct. `ptr` is left released even when
/// the conversion fails.
///
/// # Safety
/// `ptr` must be null or point to a valid `FFI_ArrowSchema` that nobody
/// else will release.
pub unsafe fn import_schema(ptr: *mut FFI_ArrowSchema) -> Result<SchemaDescriptor> {
    if ptr.is_null() {
        return Err(BridgeError::Schema("null schema pointer".into()));
    }
    // SAFETY: the caller hands over the struct; an empty one stays behind.
    let raw = unsafe { std::ptr::replace(ptr, FFI_ArrowSchema::empty()) };
    let result = Schema::try_from(&raw)
        .map_err(BridgeError::from)
        .and_then(|schema| from_arrow_schema(&schema));
    drop(raw);
    result
}

/// Same names, types and nullability, in order. Metadata is ignored.
pub fn ensure_same_layout(expected: &Schema, actual: &Schema) -> Result<()> {
    let same = expected.fields().len() == actual.fields().len()
        && expected
            .fields()
            .iter()
            .zip(actual.fields().iter())
            .all(|(e, a)| {
                e.name() == a.name()
                    && e.data_type() == a.data_type()
                    && e.is_nullable() == a.is_nullable()
            });
    if same {
        Ok(())
    } else {
        Err(BridgeError::SchemaMismatch(format!(
            "expected {}, got {}",
            layout(expected),
            layout(actual)
        )))
    }
}

fn layout(schema: &Schema) -> String {
    let cols: Vec<String> = schema
        .fields()
        .iter()
        .map(|f| format!("{}: {}", f.name(), f.data_type()))
        .collect();
    format!("[{}]", cols.join(", "))
}

/// Export a batch as a struct array plus its schema.
pub(crate) fn export_batch(batch: &RecordBatch) -> Result<(FFI_ArrowArray, FFI_ArrowSchema)> {
    let schema = FFI_ArrowSchema::try_from(batch.schema_ref().as_ref())?;
    let array = FFI_ArrowArray::new(&StructArray::from(batch.clone()).into_data());
    Ok((array, schema))
}

/// Import a struct array into a batch. Consumes `array`; `schema` is
/// released by the caller.
///
/// # Safety
/// `array` and `schema` must be valid and describe each other.
pub(crate) unsafe fn import_batch(
    array: FFI_ArrowArray,
    schema: &FFI_ArrowSchema,
) -> Result<RecordBatch> {
    let data = unsafe { from_ffi(array, schema)? };
    if !matches!(data.data_type(), ArrowType::Struct(_)) {
        return Err(BridgeError::Schema(format!(
            "expected a struct array for a batch, got {}",
            data.data_type()
        )));
    }
    let array = StructArray::from(data);
    if array.null_count() > 0 {
        return Err(BridgeError::Schema(
            "batch struct array has top-level nulls".into(),
        ));
    }
    Ok(RecordBatch::from(array))
}

/// Same columns under `schema`; the layouts must already agree. Field
/// metadata is taken from `schema`.
pub(crate) fn rebind(batch: &RecordBatch, schema: &SchemaRef) -> Result<RecordBatch> {
    let options = RecordBatchOptions::new().with_row_count(Some(batch.num_rows()));
    Ok(RecordBatch::try_new_with_options(
        schema.clone(),
        batch.columns().to_vec(),
        &options,
    )?)
}
