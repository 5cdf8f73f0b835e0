//! Row values and their conversion to and from Arrow arrays.
//!
//! Merge and partitioning work row-at-a-time on [`Value`]s; data files are
//! read and written as Arrow record batches. Conversions cast input arrays to
//! the canonical Arrow type of each column first, so only those canonical
//! types are decoded here.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, BinaryArray, BooleanArray, Date32Array, Decimal128Array,
    Float32Array, Float64Array, Int16Array, Int32Array, Int64Array, Int8Array, RecordBatch,
    StringArray, TimestampMicrosecondArray,
};
use arrow::compute::cast;
use arrow::datatypes::{
    Date32Type, Decimal128Type, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type,
    Int8Type, Schema as ArrowSchema, TimestampMicrosecondType,
};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};

use crate::error::{Result, TableError};
use crate::schema::{DataType, Schema};

const MICROS_PER_DAY: i64 = 86_400_000_000;
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// A single column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL `NULL`.
    Null,
    /// `boolean`
    Boolean(bool),
    /// `byte`
    Byte(i8),
    /// `short`
    Short(i16),
    /// `integer`
    Integer(i32),
    /// `long`
    Long(i64),
    /// `float`
    Float(f32),
    /// `double`
    Double(f64),
    /// `string`
    String(String),
    /// `binary`
    Binary(Vec<u8>),
    /// `date`, days since 1970-01-01.
    Date(i32),
    /// `timestamp`, microseconds since the epoch in UTC.
    Timestamp(i64),
    /// `timestamp_ntz`, microseconds since the epoch, no zone.
    TimestampNtz(i64),
    /// `decimal(precision, scale)` as a scaled integer.
    Decimal {
        /// Unscaled value.
        value: i128,
        /// Total digits.
        precision: u8,
        /// Digits after the point.
        scale: i8,
    },
}

/// A table row, one value per schema column.
pub type Row = Vec<Value>;

/// Numeric view of a value used for cross-type comparison and arithmetic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Numeric {
    Int(i128),
    Float(f64),
    Decimal(i128, i8),
}

impl Numeric {
    pub(crate) fn to_f64(self) -> f64 {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Int(v) => v as f64,
            Self::Float(v) => v,
            #[allow(clippy::cast_precision_loss)]
            Self::Decimal(v, scale) => v as f64 / 10_f64.powi(i32::from(scale)),
        }
    }

    /// Brings two exact numerics to a common scale.
    pub(crate) fn align(self, other: Self) -> Option<(i128, i128, i8)> {
        let (a, sa) = self.exact()?;
        let (b, sb) = other.exact()?;
        let scale = sa.max(sb);
        Some((rescale(a, sa, scale)?, rescale(b, sb, scale)?, scale))
    }

    fn exact(self) -> Option<(i128, i8)> {
        match self {
            Self::Int(v) => Some((v, 0)),
            Self::Decimal(v, s) => Some((v, s)),
            Self::Float(_) => None,
        }
    }
}

fn pow10(exp: u32) -> Option<i128> {
    10_i128.checked_pow(exp)
}

/// Rescales an unscaled decimal upward; downward rescales truncate.
pub(crate) fn rescale(value: i128, from: i8, to: i8) -> Option<i128> {
    match to.cmp(&from) {
        Ordering::Equal => Some(value),
        Ordering::Greater => value.checked_mul(pow10(u32::from((to - from).unsigned_abs()))?),
        Ordering::Less => Some(value / pow10(u32::from((from - to).unsigned_abs()))?),
    }
}

impl Value {
    /// Returns true for `NULL`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the column type this value belongs to, `None` for `NULL`.
    #[must_use]
    pub fn data_type(&self) -> Option<DataType> {
        Some(match self {
            Self::Null => return None,
            Self::Boolean(_) => DataType::Boolean,
            Self::Byte(_) => DataType::Byte,
            Self::Short(_) => DataType::Short,
            Self::Integer(_) => DataType::Integer,
            Self::Long(_) => DataType::Long,
            Self::Float(_) => DataType::Float,
            Self::Double(_) => DataType::Double,
            Self::String(_) => DataType::String,
            Self::Binary(_) => DataType::Binary,
            Self::Date(_) => DataType::Date,
            Self::Timestamp(_) => DataType::Timestamp,
            Self::TimestampNtz(_) => DataType::TimestampNtz,
            Self::Decimal {
                precision, scale, ..
            } => DataType::Decimal {
                precision: *precision,
                scale: *scale,
            },
        })
    }

    /// Returns the boolean payload, `None` for non-booleans and `NULL`.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub(crate) fn numeric(&self) -> Option<Numeric> {
        Some(match self {
            Self::Byte(v) => Numeric::Int(i128::from(*v)),
            Self::Short(v) => Numeric::Int(i128::from(*v)),
            Self::Integer(v) => Numeric::Int(i128::from(*v)),
            Self::Long(v) => Numeric::Int(i128::from(*v)),
            Self::Float(v) => Numeric::Float(f64::from(*v)),
            Self::Double(v) => Numeric::Float(*v),
            Self::Decimal { value, scale, .. } => Numeric::Decimal(*value, *scale),
            _ => return None,
        })
    }

    fn as_micros(&self) -> Option<i64> {
        match self {
            Self::Date(days) => Some(i64::from(*days) * MICROS_PER_DAY),
            Self::Timestamp(v) | Self::TimestampNtz(v) => Some(*v),
            _ => None,
        }
    }

    /// SQL ordering between two non-null values of comparable types.
    ///
    /// Returns `None` if either side is `NULL` or the types are not
    /// comparable.
    #[must_use]
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        if let (Some(a), Some(b)) = (self.numeric(), other.numeric()) {
            return match a.align(b) {
                Some((a, b, _)) => Some(a.cmp(&b)),
                None => a.to_f64().partial_cmp(&b.to_f64()),
            };
        }
        match (self, other) {
            (Self::Boolean(a), Self::Boolean(b)) => Some(a.cmp(b)),
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            (Self::Binary(a), Self::Binary(b)) => Some(a.cmp(b)),
            (Self::Date(a), Self::Date(b)) => Some(a.cmp(b)),
            _ => match (self.as_micros(), other.as_micros()) {
                (Some(a), Some(b)) => Some(a.cmp(&b)),
                _ => None,
            },
        }
    }

    /// Casts the value to `target`.
    ///
    /// Float to integer casts truncate toward zero; decimal downscaling
    /// truncates. Out-of-range values and unparsable strings are errors.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMismatch` describing the failed conversion.
    pub fn cast_to(&self, target: &DataType) -> Result<Value> {
        if self.is_null() {
            return Ok(Value::Null);
        }
        if self.data_type().as_ref() == Some(target) {
            return Ok(self.clone());
        }
        self.convert(target).ok_or_else(|| {
            TableError::schema_mismatch(format!("cannot convert {self:?} to {target}"))
        })
    }

    fn convert(&self, target: &DataType) -> Option<Value> {
        if let Self::String(s) = self {
            return parse_as(s, target);
        }
        match target {
            DataType::Boolean => match self.numeric()? {
                Numeric::Int(v) => Some(Value::Boolean(v != 0)),
                _ => None,
            },
            DataType::Byte => Some(Value::Byte(i8::try_from(self.to_i128()?).ok()?)),
            DataType::Short => Some(Value::Short(i16::try_from(self.to_i128()?).ok()?)),
            DataType::Integer => Some(Value::Integer(i32::try_from(self.to_i128()?).ok()?)),
            DataType::Long => Some(Value::Long(i64::try_from(self.to_i128()?).ok()?)),
            #[allow(clippy::cast_possible_truncation)]
            DataType::Float => Some(Value::Float(self.numeric()?.to_f64() as f32)),
            DataType::Double => Some(Value::Double(self.numeric()?.to_f64())),
            DataType::String => Some(Value::String(self.to_string())),
            DataType::Binary => None,
            DataType::Date => {
                let micros = self.as_micros()?;
                i32::try_from(micros.div_euclid(MICROS_PER_DAY))
                    .ok()
                    .map(Value::Date)
            }
            DataType::Timestamp => self.as_micros().map(Value::Timestamp),
            DataType::TimestampNtz => self.as_micros().map(Value::TimestampNtz),
            DataType::Decimal { precision, scale } => {
                let value = match self.numeric()? {
                    Numeric::Int(v) => rescale(v, 0, *scale)?,
                    Numeric::Decimal(v, s) => rescale(v, s, *scale)?,
                    Numeric::Float(f) => {
                        let scaled = (f * 10_f64.powi(i32::from(*scale))).round();
                        if !scaled.is_finite() || scaled.abs() >= 1e38 {
                            return None;
                        }
                        #[allow(clippy::cast_possible_truncation)]
                        let v = scaled as i128;
                        v
                    }
                };
                decimal_fits(value, *precision).then_some(Value::Decimal {
                    value,
                    precision: *precision,
                    scale: *scale,
                })
            }
        }
    }

    /// Converts like SQL `CAST`: fractional numbers are truncated toward
    /// zero when `target` is an integer type. Implicit conversions use
    /// [`Value::cast_to`], which rejects them.
    ///
    /// # Errors
    ///
    /// Same as [`Value::cast_to`].
    pub fn cast_truncating(&self, target: &DataType) -> Result<Value> {
        let integral = matches!(
            target,
            DataType::Byte | DataType::Short | DataType::Integer | DataType::Long
        );
        if integral {
            match self.numeric() {
                Some(Numeric::Float(f)) => return Value::Double(f.trunc()).cast_to(target),
                Some(Numeric::Decimal(v, s)) if s > 0 => {
                    if let Some(whole) = rescale(v, s, 0) {
                        return Value::Decimal {
                            value: whole,
                            precision: 38,
                            scale: 0,
                        }
                        .cast_to(target);
                    }
                }
                _ => {}
            }
        }
        self.cast_to(target)
    }

    /// Integer value, only if the conversion is exact.
    fn to_i128(&self) -> Option<i128> {
        match self.numeric()? {
            Numeric::Int(v) => Some(v),
            Numeric::Decimal(v, s) => {
                let whole = rescale(v, s, 0)?;
                (rescale(whole, 0, s)? == v).then_some(whole)
            }
            Numeric::Float(f) => {
                #[allow(clippy::cast_possible_truncation)]
                let v = f as i128;
                (f.is_finite() && f.fract() == 0.0 && f.abs() < 1.7e38).then_some(v)
            }
        }
    }

    /// Returns the string stored in a partition path, `None` for `NULL`.
    #[must_use]
    pub fn to_partition_value(&self) -> Option<String> {
        if self.is_null() {
            None
        } else {
            Some(self.to_string())
        }
    }

    /// Parses a partition value recorded in the log.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMismatch` if the string does not parse as `data_type`.
    pub fn from_partition_value(raw: Option<&str>, data_type: &DataType) -> Result<Value> {
        match raw {
            None => Ok(Value::Null),
            Some(s) if s.is_empty() && *data_type != DataType::String => Ok(Value::Null),
            Some(s) => Value::String(s.to_string()).cast_to(data_type),
        }
    }

    /// Returns a hashable key for equi-join matching; `None` for `NULL`,
    /// which never matches.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn hash_key(&self) -> Option<KeyValue> {
        Some(match self {
            Self::Null => return None,
            Self::Boolean(b) => KeyValue::Bool(*b),
            Self::String(s) => KeyValue::Str(s.clone()),
            Self::Binary(b) => KeyValue::Bytes(b.clone()),
            Self::Date(d) => KeyValue::Date(*d),
            Self::Timestamp(v) | Self::TimestampNtz(v) => KeyValue::Micros(*v),
            Self::Float(_) | Self::Double(_) => {
                let f = self.numeric()?.to_f64();
                if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e38 {
                    KeyValue::Int(f as i128)
                } else {
                    KeyValue::FloatBits(f.to_bits())
                }
            }
            Self::Decimal { value, scale, .. } => {
                let (mut v, mut s) = (*value, *scale);
                while s > 0 && v % 10 == 0 {
                    v /= 10;
                    s -= 1;
                }
                if s == 0 {
                    KeyValue::Int(v)
                } else {
                    KeyValue::Decimal(v, s)
                }
            }
            Self::Byte(_) | Self::Short(_) | Self::Integer(_) | Self::Long(_) => {
                KeyValue::Int(self.to_i128()?)
            }
        })
    }
}

/// Normalized join key component. Integers, integral floats, and decimals
/// without a fractional part share the `Int` form so that `2`, `2.0` and
/// `2.00` match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum KeyValue {
    Bool(bool),
    Int(i128),
    FloatBits(u64),
    Decimal(i128, i8),
    Str(String),
    Bytes(Vec<u8>),
    Date(i32),
    Micros(i64),
}

fn decimal_fits(value: i128, precision: u8) -> bool {
    pow10(u32::from(precision)).is_some_and(|limit| value.abs() < limit)
}

fn parse_as(s: &str, target: &DataType) -> Option<Value> {
    let t = s.trim();
    Some(match target {
        DataType::Boolean => match t.to_ascii_lowercase().as_str() {
            "true" | "t" | "1" => Value::Boolean(true),
            "false" | "f" | "0" => Value::Boolean(false),
            _ => return None,
        },
        DataType::Byte => Value::Byte(t.parse().ok()?),
        DataType::Short => Value::Short(t.parse().ok()?),
        DataType::Integer => Value::Integer(t.parse().ok()?),
        DataType::Long => Value::Long(t.parse().ok()?),
        DataType::Float => Value::Float(t.parse().ok()?),
        DataType::Double => Value::Double(t.parse().ok()?),
        DataType::String => Value::String(s.to_string()),
        DataType::Binary => Value::Binary(s.as_bytes().to_vec()),
        DataType::Date => Value::Date(parse_date(t)?),
        DataType::Timestamp => Value::Timestamp(parse_timestamp(t)?),
        DataType::TimestampNtz => Value::TimestampNtz(parse_timestamp(t)?),
        DataType::Decimal { precision, scale } => {
            let value = parse_decimal(t, *scale)?;
            if !decimal_fits(value, *precision) {
                return None;
            }
            Value::Decimal {
                value,
                precision: *precision,
                scale: *scale,
            }
        }
    })
}

fn parse_date(s: &str) -> Option<i32> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    Some(date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE)
}

fn parse_timestamp(s: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc).timestamp_micros());
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc().timestamp_micros());
        }
    }
    parse_date(s).map(|days| i64::from(days) * MICROS_PER_DAY)
}

fn parse_decimal(s: &str, scale: i8) -> Option<i128> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.chars().chain(frac_part.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }
    let unscaled: i128 = format!("{int_part}{frac_part}").parse().ok()?;
    let frac_len = i8::try_from(frac_part.len()).ok()?;
    let value = rescale(unscaled, frac_len, scale)?;
    Some(if negative { -value } else { value })
}

fn format_date(days: i32) -> String {
    NaiveDate::from_num_days_from_ce_opt(days.saturating_add(UNIX_EPOCH_DAYS_FROM_CE))
        .map_or_else(|| days.to_string(), |d| d.format("%Y-%m-%d").to_string())
}

fn format_micros(micros: i64) -> String {
    DateTime::<Utc>::from_timestamp_micros(micros).map_or_else(
        || micros.to_string(),
        |dt| dt.naive_utc().format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
    )
}

fn format_decimal(value: i128, scale: i8) -> String {
    if scale <= 0 {
        return value.to_string();
    }
    let scale = usize::from(scale.unsigned_abs());
    let digits = value.unsigned_abs().to_string();
    let padded = format!("{digits:0>width$}", width = scale + 1);
    let (int_part, frac_part) = padded.split_at(padded.len() - scale);
    let sign = if value < 0 { "-" } else { "" };
    format!("{sign}{int_part}.{frac_part}")
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Byte(v) => write!(f, "{v}"),
            Self::Short(v) => write!(f, "{v}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Long(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(v) => f.write_str(v),
            Self::Binary(v) => {
                for byte in v {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Self::Date(v) => f.write_str(&format_date(*v)),
            Self::Timestamp(v) | Self::TimestampNtz(v) => f.write_str(&format_micros(*v)),
            Self::Decimal { value, scale, .. } => f.write_str(&format_decimal(*value, *scale)),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Decodes one column into values of `data_type`, casting the array first
/// when its Arrow type differs from the canonical one.
///
/// # Errors
///
/// Returns `Arrow` if the cast fails.
pub fn column_values(array: &ArrayRef, data_type: &DataType) -> Result<Vec<Value>> {
    let target = data_type.to_arrow();
    let array = if array.data_type() == &target {
        Arc::clone(array)
    } else {
        cast(array, &target)?
    };

    let len = array.len();
    let mut values = Vec::with_capacity(len);
    macro_rules! primitive {
        ($arrow:ty, $variant:expr) => {{
            let typed = array.as_primitive::<$arrow>();
            for i in 0..len {
                values.push(if typed.is_null(i) {
                    Value::Null
                } else {
                    $variant(typed.value(i))
                });
            }
        }};
    }

    match data_type {
        DataType::Boolean => {
            let typed = array.as_boolean();
            for i in 0..len {
                values.push(if typed.is_null(i) {
                    Value::Null
                } else {
                    Value::Boolean(typed.value(i))
                });
            }
        }
        DataType::Byte => primitive!(Int8Type, Value::Byte),
        DataType::Short => primitive!(Int16Type, Value::Short),
        DataType::Integer => primitive!(Int32Type, Value::Integer),
        DataType::Long => primitive!(Int64Type, Value::Long),
        DataType::Float => primitive!(Float32Type, Value::Float),
        DataType::Double => primitive!(Float64Type, Value::Double),
        DataType::Date => primitive!(Date32Type, Value::Date),
        DataType::Timestamp => primitive!(TimestampMicrosecondType, Value::Timestamp),
        DataType::TimestampNtz => primitive!(TimestampMicrosecondType, Value::TimestampNtz),
        DataType::Decimal { precision, scale } => primitive!(Decimal128Type, |value| {
            Value::Decimal {
                value,
                precision: *precision,
                scale: *scale,
            }
        }),
        DataType::String => {
            let typed = array.as_string::<i32>();
            for i in 0..len {
                values.push(if typed.is_null(i) {
                    Value::Null
                } else {
                    Value::String(typed.value(i).to_string())
                });
            }
        }
        DataType::Binary => {
            let typed = array.as_binary::<i32>();
            for i in 0..len {
                values.push(if typed.is_null(i) {
                    Value::Null
                } else {
                    Value::Binary(typed.value(i).to_vec())
                });
            }
        }
    }
    Ok(values)
}

/// Decodes a batch into rows laid out by `schema`. Columns missing from the
/// batch decode as `NULL`.
///
/// # Errors
///
/// Returns `Arrow` if a column cannot be cast to its table type.
pub fn batch_to_rows(batch: &RecordBatch, schema: &Schema) -> Result<Vec<Row>> {
    let columns = schema
        .fields()
        .iter()
        .map(|field| match batch.column_by_name(&field.name) {
            Some(array) => column_values(array, &field.data_type),
            None => Ok(vec![Value::Null; batch.num_rows()]),
        })
        .collect::<Result<Vec<_>>>()?;

    let mut rows: Vec<Row> = (0..batch.num_rows())
        .map(|_| Vec::with_capacity(columns.len()))
        .collect();
    for column in columns {
        for (row, value) in rows.iter_mut().zip(column) {
            row.push(value);
        }
    }
    Ok(rows)
}

/// Encodes the columns at `indices` of `rows` into a record batch.
///
/// # Errors
///
/// Returns `SchemaMismatch` for `NULL` in a non-nullable column or a value
/// that cannot be converted to its column type.
pub fn rows_to_batch(rows: &[Row], schema: &Schema, indices: &[usize]) -> Result<RecordBatch> {
    let mut fields = Vec::with_capacity(indices.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(indices.len());

    for &index in indices {
        let field = schema.fields().get(index).ok_or_else(|| {
            TableError::validation(format!("column index {index} out of range"))
        })?;
        let column = rows
            .iter()
            .map(|row| {
                let value = row.get(index).unwrap_or(&Value::Null);
                if value.is_null() && !field.nullable {
                    return Err(TableError::schema_mismatch(format!(
                        "column `{}` is not nullable but received NULL",
                        field.name
                    )));
                }
                value.cast_to(&field.data_type)
            })
            .collect::<Result<Vec<_>>>()?;
        arrays.push(build_array(&column, &field.data_type)?);
        fields.push(field.to_arrow());
    }

    let schema = Arc::new(ArrowSchema::new(fields));
    Ok(RecordBatch::try_new(schema, arrays)?)
}

fn build_array(values: &[Value], data_type: &DataType) -> Result<ArrayRef> {
    macro_rules! collect {
        ($array:ty, $pattern:pat => $out:expr) => {
            Arc::new(
                values
                    .iter()
                    .map(|v| match v {
                        $pattern => Some($out),
                        _ => None,
                    })
                    .collect::<$array>(),
            ) as ArrayRef
        };
    }

    Ok(match data_type {
        DataType::Boolean => collect!(BooleanArray, Value::Boolean(v) => *v),
        DataType::Byte => collect!(Int8Array, Value::Byte(v) => *v),
        DataType::Short => collect!(Int16Array, Value::Short(v) => *v),
        DataType::Integer => collect!(Int32Array, Value::Integer(v) => *v),
        DataType::Long => collect!(Int64Array, Value::Long(v) => *v),
        DataType::Float => collect!(Float32Array, Value::Float(v) => *v),
        DataType::Double => collect!(Float64Array, Value::Double(v) => *v),
        DataType::String => collect!(StringArray, Value::String(v) => v.as_str()),
        DataType::Binary => collect!(BinaryArray, Value::Binary(v) => v.as_slice()),
        DataType::Date => collect!(Date32Array, Value::Date(v) => *v),
        DataType::Timestamp => Arc::new(
            values
                .iter()
                .map(|v| match v {
                    Value::Timestamp(v) => Some(*v),
                    _ => None,
                })
                .collect::<TimestampMicrosecondArray>()
                .with_timezone("UTC"),
        ),
        DataType::TimestampNtz => {
            collect!(TimestampMicrosecondArray, Value::TimestampNtz(v) => *v)
        }
        DataType::Decimal { precision, scale } => Arc::new(
            values
                .iter()
                .map(|v| match v {
                    Value::Decimal { value, .. } => Some(*value),
                    _ => None,
                })
                .collect::<Decimal128Array>()
                .with_precision_and_scale(*precision, *scale)?,
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::StructField;
    use arrow::array::UInt8Array;

    #[test]
    fn test_cross_type_numeric_comparison() {
        assert_eq!(Value::Integer(2).compare(&Value::Long(2)), Some(Ordering::Equal));
        assert_eq!(Value::Double(2.5).compare(&Value::Long(2)), Some(Ordering::Greater));
        let cents = Value::Decimal {
            value: 250,
            precision: 5,
            scale: 2,
        };
        assert_eq!(cents.compare(&Value::Integer(3)), Some(Ordering::Less));
        assert_eq!(Value::Null.compare(&Value::Integer(1)), None);
        assert_eq!(Value::from("a").compare(&Value::Integer(1)), None);
    }

    #[test]
    fn test_cast_checks_ranges() {
        assert_eq!(Value::Long(7).cast_to(&DataType::Byte).unwrap(), Value::Byte(7));
        assert!(Value::Long(300).cast_to(&DataType::Byte).is_err());
        assert_eq!(Value::Double(2.0).cast_to(&DataType::Integer).unwrap(), Value::Integer(2));
        assert!(Value::Double(2.9).cast_to(&DataType::Integer).is_err());
        assert!(Value::Float(-0.5).cast_to(&DataType::Long).is_err());
        let whole = Value::Decimal {
            value: 300,
            precision: 5,
            scale: 2,
        };
        assert_eq!(whole.cast_to(&DataType::Short).unwrap(), Value::Short(3));
        let fractional = Value::Decimal {
            value: 301,
            precision: 5,
            scale: 2,
        };
        assert!(fractional.cast_to(&DataType::Short).is_err());
        assert_eq!(
            fractional.cast_truncating(&DataType::Short).unwrap(),
            Value::Short(3)
        );
        assert_eq!(
            Value::Double(-2.9).cast_truncating(&DataType::Long).unwrap(),
            Value::Long(-2)
        );
        assert_eq!(
            Value::from("12.345").cast_to(&DataType::decimal(6, 2).unwrap()).unwrap(),
            Value::Decimal {
                value: 1234,
                precision: 6,
                scale: 2
            }
        );
        assert!(Value::Long(100_000)
            .cast_to(&DataType::decimal(4, 0).unwrap())
            .is_err());
    }

    #[test]
    fn test_partition_value_text_forms() {
        let date = Value::from_partition_value(Some("2024-02-29"), &DataType::Date).unwrap();
        assert_eq!(date.to_partition_value().as_deref(), Some("2024-02-29"));

        let ts = Value::from_partition_value(Some("2024-01-02 03:04:05"), &DataType::Timestamp)
            .unwrap();
        assert_eq!(
            ts.to_partition_value().as_deref(),
            Some("2024-01-02 03:04:05.000000")
        );

        let neg = Value::Decimal {
            value: -5,
            precision: 4,
            scale: 2,
        };
        assert_eq!(neg.to_string(), "-0.05");
        assert_eq!(
            Value::from_partition_value(None, &DataType::Long).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_hash_keys_normalize_numerics() {
        assert_eq!(Value::Integer(2).hash_key(), Value::Long(2).hash_key());
        assert_eq!(Value::Double(2.0).hash_key(), Value::Long(2).hash_key());
        let two = Value::Decimal {
            value: 200,
            precision: 5,
            scale: 2,
        };
        assert_eq!(two.hash_key(), Value::Byte(2).hash_key());
        assert_eq!(Value::Null.hash_key(), None);
    }

    #[test]
    fn test_batch_rows_batch() {
        let schema = Schema::new(vec![
            StructField::new("x", DataType::Long, false),
            StructField::new("s", DataType::String, true),
            StructField::new("missing", DataType::Double, true),
        ])
        .unwrap();
        let input = RecordBatch::try_new(
            Arc::new(ArrowSchema::new(vec![
                arrow::datatypes::Field::new("x", arrow::datatypes::DataType::UInt8, false),
                arrow::datatypes::Field::new("s", arrow::datatypes::DataType::Utf8, true),
            ])),
            vec![
                Arc::new(UInt8Array::from(vec![1, 2])),
                Arc::new(StringArray::from(vec![Some("a"), None])),
            ],
        )
        .unwrap();

        let rows = batch_to_rows(&input, &schema).unwrap();
        assert_eq!(
            rows,
            vec![
                vec![Value::Long(1), Value::from("a"), Value::Null],
                vec![Value::Long(2), Value::Null, Value::Null],
            ]
        );

        let batch = rows_to_batch(&rows, &schema, &[0, 1]).unwrap();
        assert_eq!(batch.num_columns(), 2);
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.schema().field(0).data_type(), &arrow::datatypes::DataType::Int64);
    }

    #[test]
    fn test_rows_to_batch_rejects_null_in_required_column() {
        let schema = Schema::new(vec![StructField::new("x", DataType::Long, false)]).unwrap();
        let err = rows_to_batch(&[vec![Value::Null]], &schema, &[0]).unwrap_err();
        assert!(matches!(err, TableError::SchemaMismatch { .. }));
    }
}
