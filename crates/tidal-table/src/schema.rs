//! Table schema model and Arrow conversions.
//!
//! Tables store primitive columns only. Arrow input is mapped onto these
//! types strictly: unsigned integers widen to the next signed type, `UInt64`
//! is rejected, and temporal, nested, and union types are rejected.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use arrow::datatypes::{
    DataType as ArrowDataType, Field as ArrowField, Schema as ArrowSchema, SchemaRef, TimeUnit,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TableError};

/// Maximum decimal precision.
pub const MAX_DECIMAL_PRECISION: u8 = 38;

/// A primitive column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DataType {
    /// `boolean`
    Boolean,
    /// `byte` (8-bit signed)
    Byte,
    /// `short` (16-bit signed)
    Short,
    /// `integer` (32-bit signed)
    Integer,
    /// `long` (64-bit signed)
    Long,
    /// `float` (32-bit)
    Float,
    /// `double` (64-bit)
    Double,
    /// `string` (UTF-8)
    String,
    /// `binary`
    Binary,
    /// `date` (days since the epoch)
    Date,
    /// `timestamp` (UTC, microseconds)
    Timestamp,
    /// `timestamp_ntz` (no time zone, microseconds)
    TimestampNtz,
    /// `decimal(precision, scale)`
    Decimal {
        /// Total digits, at most 38.
        precision: u8,
        /// Digits after the decimal point.
        scale: i8,
    },
}

impl DataType {
    /// Returns a decimal type after checking its bounds.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMismatch` if precision is 0 or above 38, or scale is
    /// negative or exceeds precision.
    pub fn decimal(precision: u8, scale: i8) -> Result<Self> {
        if precision == 0 || precision > MAX_DECIMAL_PRECISION {
            return Err(TableError::schema_mismatch(format!(
                "decimal precision {precision} must be between 1 and {MAX_DECIMAL_PRECISION}"
            )));
        }
        if scale < 0 || scale.unsigned_abs() > precision {
            return Err(TableError::schema_mismatch(format!(
                "decimal scale {scale} must be between 0 and precision {precision}"
            )));
        }
        Ok(Self::Decimal { precision, scale })
    }

    /// Returns true for integer, floating point, and decimal types.
    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::Byte
                | Self::Short
                | Self::Integer
                | Self::Long
                | Self::Float
                | Self::Double
                | Self::Decimal { .. }
        )
    }

    /// Returns the Arrow type used in memory and in data files.
    #[must_use]
    pub fn to_arrow(&self) -> ArrowDataType {
        match self {
            Self::Boolean => ArrowDataType::Boolean,
            Self::Byte => ArrowDataType::Int8,
            Self::Short => ArrowDataType::Int16,
            Self::Integer => ArrowDataType::Int32,
            Self::Long => ArrowDataType::Int64,
            Self::Float => ArrowDataType::Float32,
            Self::Double => ArrowDataType::Float64,
            Self::String => ArrowDataType::Utf8,
            Self::Binary => ArrowDataType::Binary,
            Self::Date => ArrowDataType::Date32,
            Self::Timestamp => ArrowDataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            Self::TimestampNtz => ArrowDataType::Timestamp(TimeUnit::Microsecond, None),
            Self::Decimal { precision, scale } => ArrowDataType::Decimal128(*precision, *scale),
        }
    }

    /// Maps an Arrow type onto a column type.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMismatch` naming the unsupported Arrow type.
    pub fn try_from_arrow(data_type: &ArrowDataType) -> Result<Self> {
        let mapped = match data_type {
            ArrowDataType::Boolean => Self::Boolean,
            ArrowDataType::Int8 => Self::Byte,
            ArrowDataType::Int16 | ArrowDataType::UInt8 => Self::Short,
            ArrowDataType::Int32 | ArrowDataType::UInt16 => Self::Integer,
            ArrowDataType::Int64 | ArrowDataType::UInt32 => Self::Long,
            ArrowDataType::Float16 | ArrowDataType::Float32 => Self::Float,
            ArrowDataType::Float64 => Self::Double,
            ArrowDataType::Utf8 | ArrowDataType::LargeUtf8 | ArrowDataType::Utf8View => {
                Self::String
            }
            ArrowDataType::Binary
            | ArrowDataType::LargeBinary
            | ArrowDataType::BinaryView
            | ArrowDataType::FixedSizeBinary(_) => Self::Binary,
            ArrowDataType::Date32 | ArrowDataType::Date64 => Self::Date,
            ArrowDataType::Timestamp(_, Some(_)) => Self::Timestamp,
            ArrowDataType::Timestamp(_, None) => Self::TimestampNtz,
            ArrowDataType::Decimal128(precision, scale)
            | ArrowDataType::Decimal256(precision, scale) => Self::decimal(*precision, *scale)?,
            ArrowDataType::Dictionary(_, value) => Self::try_from_arrow(value)?,
            ArrowDataType::RunEndEncoded(_, value) => Self::try_from_arrow(value.data_type())?,
            other => {
                return Err(TableError::schema_mismatch(format!(
                    "unsupported column type {other}"
                )));
            }
        };
        Ok(mapped)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean => f.write_str("boolean"),
            Self::Byte => f.write_str("byte"),
            Self::Short => f.write_str("short"),
            Self::Integer => f.write_str("integer"),
            Self::Long => f.write_str("long"),
            Self::Float => f.write_str("float"),
            Self::Double => f.write_str("double"),
            Self::String => f.write_str("string"),
            Self::Binary => f.write_str("binary"),
            Self::Date => f.write_str("date"),
            Self::Timestamp => f.write_str("timestamp"),
            Self::TimestampNtz => f.write_str("timestamp_ntz"),
            Self::Decimal { precision, scale } => write!(f, "decimal({precision},{scale})"),
        }
    }
}

impl FromStr for DataType {
    type Err = TableError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        let simple = match normalized.as_str() {
            "boolean" | "bool" => Some(Self::Boolean),
            "byte" | "tinyint" => Some(Self::Byte),
            "short" | "smallint" => Some(Self::Short),
            "integer" | "int" => Some(Self::Integer),
            "long" | "bigint" => Some(Self::Long),
            "float" | "real" => Some(Self::Float),
            "double" => Some(Self::Double),
            "string" | "varchar" | "text" => Some(Self::String),
            "binary" => Some(Self::Binary),
            "date" => Some(Self::Date),
            "timestamp" => Some(Self::Timestamp),
            "timestamp_ntz" => Some(Self::TimestampNtz),
            _ => None,
        };
        if let Some(simple) = simple {
            return Ok(simple);
        }

        let args = normalized
            .strip_prefix("decimal(")
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| TableError::schema_mismatch(format!("unknown column type `{s}`")))?;
        let (precision, scale) = args
            .split_once(',')
            .ok_or_else(|| TableError::schema_mismatch(format!("malformed decimal type `{s}`")))?;
        let precision = precision
            .trim()
            .parse::<u8>()
            .map_err(|e| TableError::schema_mismatch(format!("decimal precision in `{s}`: {e}")))?;
        let scale = scale
            .trim()
            .parse::<i8>()
            .map_err(|e| TableError::schema_mismatch(format!("decimal scale in `{s}`: {e}")))?;
        Self::decimal(precision, scale)
    }
}

impl TryFrom<String> for DataType {
    type Error = TableError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DataType> for String {
    fn from(value: DataType) -> Self {
        value.to_string()
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructField {
    /// Column name.
    pub name: String,
    /// Column type.
    #[serde(rename = "type")]
    pub data_type: DataType,
    /// Whether the column admits nulls.
    pub nullable: bool,
}

impl StructField {
    /// Creates a field.
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }

    /// Returns the Arrow field.
    #[must_use]
    pub fn to_arrow(&self) -> ArrowField {
        ArrowField::new(&self.name, self.data_type.to_arrow(), self.nullable)
    }
}

/// An ordered list of uniquely named columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SchemaRepr", into = "SchemaRepr")]
pub struct Schema {
    fields: Vec<StructField>,
}

#[derive(Serialize, Deserialize)]
struct SchemaRepr {
    fields: Vec<StructField>,
}

impl TryFrom<SchemaRepr> for Schema {
    type Error = TableError;

    fn try_from(value: SchemaRepr) -> Result<Self> {
        Self::new(value.fields)
    }
}

impl From<Schema> for SchemaRepr {
    fn from(value: Schema) -> Self {
        Self {
            fields: value.fields,
        }
    }
}

impl Schema {
    /// Creates a schema.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMismatch` if there are no fields, a name is empty, or a
    /// name repeats.
    pub fn new(fields: Vec<StructField>) -> Result<Self> {
        if fields.is_empty() {
            return Err(TableError::schema_mismatch("schema has no columns"));
        }
        let mut seen = HashSet::new();
        for field in &fields {
            if field.name.trim().is_empty() {
                return Err(TableError::schema_mismatch("column names cannot be empty"));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(TableError::schema_mismatch(format!(
                    "duplicate column `{}`",
                    field.name
                )));
            }
        }
        Ok(Self { fields })
    }

    /// Converts an Arrow schema.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMismatch` for unsupported column types or invalid names.
    pub fn try_from_arrow(schema: &ArrowSchema) -> Result<Self> {
        let fields = schema
            .fields()
            .iter()
            .map(|field| {
                let data_type = DataType::try_from_arrow(field.data_type()).map_err(|e| {
                    TableError::schema_mismatch(format!("column `{}`: {e}", field.name()))
                })?;
                Ok(StructField::new(field.name(), data_type, field.is_nullable()))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(fields)
    }

    /// Returns the fields in order.
    #[must_use]
    pub fn fields(&self) -> &[StructField] {
        &self.fields
    }

    /// Returns a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&StructField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Returns the position of a field.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Returns column names in order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Returns the Arrow schema of full table rows.
    #[must_use]
    pub fn to_arrow(&self) -> SchemaRef {
        Arc::new(ArrowSchema::new(
            self.fields.iter().map(StructField::to_arrow).collect::<Vec<_>>(),
        ))
    }

    /// Returns the Arrow schema of data files, which omit partition columns.
    #[must_use]
    pub fn to_arrow_without(&self, partition_columns: &[String]) -> SchemaRef {
        Arc::new(ArrowSchema::new(
            self.fields
                .iter()
                .filter(|f| !partition_columns.contains(&f.name))
                .map(StructField::to_arrow)
                .collect::<Vec<_>>(),
        ))
    }

    /// Unions `incoming` into this schema: new columns are appended as
    /// nullable, existing columns keep their type and position.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMismatch` if a shared column has a different type.
    pub fn merge(&self, incoming: &Schema) -> Result<Schema> {
        let mut fields = self.fields.clone();
        for field in &incoming.fields {
            match self.field(&field.name) {
                Some(existing) if existing.data_type != field.data_type => {
                    return Err(TableError::schema_mismatch(format!(
                        "column `{}` is {} in the table but {} in the new data",
                        field.name, existing.data_type, field.data_type
                    )));
                }
                Some(_) => {}
                None => fields.push(StructField::new(&field.name, field.data_type, true)),
            }
        }
        Schema::new(fields)
    }

    /// Checks that every partition column exists.
    ///
    /// # Errors
    ///
    /// Returns `Validation` naming the missing or duplicated column.
    pub fn validate_partition_columns(&self, partition_columns: &[String]) -> Result<()> {
        let mut seen = HashSet::new();
        for column in partition_columns {
            if self.field(column).is_none() {
                return Err(TableError::validation(format!(
                    "partition column `{column}` is not in the schema"
                )));
            }
            if !seen.insert(column) {
                return Err(TableError::validation(format!(
                    "partition column `{column}` listed twice"
                )));
            }
        }
        if partition_columns.len() == self.fields.len() {
            return Err(TableError::validation(
                "at least one column must not be a partition column",
            ));
        }
        Ok(())
    }
}
