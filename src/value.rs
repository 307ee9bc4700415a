use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde_json::Value as Json;
use uuid::Uuid;

use crate::error::{Error, Result};

/// A driver-neutral SQL value.
///
/// Everything that crosses the facade boundary — bound parameters going in,
/// row cells coming out — is one of these. Backends translate to and from
/// their driver's native types at the edge.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
  Null,
  Boolean(bool),
  Integer(i64),
  Float(f64),
  Text(String),
  Bytes(Vec<u8>),
  Numeric(Decimal),
  Date(NaiveDate),
  Time(NaiveTime),
  DateTime(NaiveDateTime),
  TimestampTz(DateTime<Utc>),
  Uuid(Uuid),
  Json(Json),
}

impl Value {
  pub fn is_null(&self) -> bool {
    matches!(self, Value::Null)
  }

  /// Whether the value is still in an undecoded driver shape (int, float,
  /// or text). Natively-decoding backends only run result processors over
  /// primitives; anything richer has already been decoded by the driver.
  pub(crate) fn is_primitive(&self) -> bool {
    matches!(self, Value::Integer(_) | Value::Float(_) | Value::Text(_))
  }

  pub fn type_name(&self) -> &'static str {
    match self {
      Value::Null => "null",
      Value::Boolean(_) => "boolean",
      Value::Integer(_) => "integer",
      Value::Float(_) => "float",
      Value::Text(_) => "text",
      Value::Bytes(_) => "bytes",
      Value::Numeric(_) => "numeric",
      Value::Date(_) => "date",
      Value::Time(_) => "time",
      Value::DateTime(_) => "datetime",
      Value::TimestampTz(_) => "timestamptz",
      Value::Uuid(_) => "uuid",
      Value::Json(_) => "json",
    }
  }
}

macro_rules! value_from {
  ($($ty:ty => $variant:ident ($conv:expr)),* $(,)?) => {
    $(impl From<$ty> for Value {
      fn from(v: $ty) -> Self {
        Value::$variant($conv(v))
      }
    })*
  };
}

value_from! {
  bool => Boolean(std::convert::identity),
  i8 => Integer(i64::from),
  i16 => Integer(i64::from),
  i32 => Integer(i64::from),
  i64 => Integer(std::convert::identity),
  u8 => Integer(i64::from),
  u16 => Integer(i64::from),
  u32 => Integer(i64::from),
  f32 => Float(f64::from),
  f64 => Float(std::convert::identity),
  String => Text(std::convert::identity),
  Vec<u8> => Bytes(std::convert::identity),
  Decimal => Numeric(std::convert::identity),
  NaiveDate => Date(std::convert::identity),
  NaiveTime => Time(std::convert::identity),
  NaiveDateTime => DateTime(std::convert::identity),
  Uuid => Uuid(std::convert::identity),
  Json => Json(std::convert::identity),
}

impl From<&str> for Value {
  fn from(v: &str) -> Self {
    Value::Text(v.to_string())
  }
}

impl From<&[u8]> for Value {
  fn from(v: &[u8]) -> Self {
    Value::Bytes(v.to_vec())
  }
}

impl From<DateTime<Utc>> for Value {
  fn from(v: DateTime<Utc>) -> Self {
    Value::TimestampTz(v)
  }
}

impl<T: Into<Value>> From<Option<T>> for Value {
  fn from(v: Option<T>) -> Self {
    match v {
      Some(v) => v.into(),
      None => Value::Null,
    }
  }
}

/// Declared type of a result column.
///
/// Acts as the column's result processor: `decode` converts whatever raw
/// shape the driver returned into the declared application type. A SQLite
/// boolean arrives as an integer, a JSON column as text, a numeric column as
/// text or a float; the declared type folds them all back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
  Boolean,
  Integer,
  Float,
  Text,
  Bytes,
  Numeric,
  Date,
  Time,
  DateTime,
  TimestampTz,
  Uuid,
  Json,
  /// Named enumerations travel as their text label on every backend.
  Enum,
}

impl ColumnType {
  pub fn decode(self, raw: Value) -> Result<Value> {
    if raw.is_null() {
      return Ok(Value::Null);
    }
    let found = raw.type_name();
    match (self, raw) {
      (ColumnType::Boolean, v @ Value::Boolean(_)) => Ok(v),
      (ColumnType::Boolean, Value::Integer(i)) => Ok(Value::Boolean(i != 0)),
      (ColumnType::Boolean, _) => Err(Error::decode("boolean", found)),

      (ColumnType::Integer, v @ Value::Integer(_)) => Ok(v),
      (ColumnType::Integer, Value::Boolean(b)) => Ok(Value::Integer(i64::from(b))),
      (ColumnType::Integer, Value::Text(s)) => s
        .parse::<i64>()
        .map(Value::Integer)
        .map_err(|_| Error::decode("integer", "text")),
      (ColumnType::Integer, _) => Err(Error::decode("integer", found)),

      (ColumnType::Float, v @ Value::Float(_)) => Ok(v),
      (ColumnType::Float, Value::Integer(i)) => Ok(Value::Float(i as f64)),
      (ColumnType::Float, Value::Numeric(d)) => d
        .to_f64()
        .map(Value::Float)
        .ok_or_else(|| Error::decode("float", "numeric")),
      (ColumnType::Float, Value::Text(s)) => s
        .parse::<f64>()
        .map(Value::Float)
        .map_err(|_| Error::decode("float", "text")),
      (ColumnType::Float, _) => Err(Error::decode("float", found)),

      (ColumnType::Text | ColumnType::Enum, v @ Value::Text(_)) => Ok(v),
      (ColumnType::Text | ColumnType::Enum, _) => Err(Error::decode("text", found)),

      (ColumnType::Bytes, v @ Value::Bytes(_)) => Ok(v),
      (ColumnType::Bytes, _) => Err(Error::decode("bytes", found)),

      (ColumnType::Numeric, v @ Value::Numeric(_)) => Ok(v),
      (ColumnType::Numeric, Value::Integer(i)) => Ok(Value::Numeric(Decimal::from(i))),
      // Backends without a decimal wire type round-trip through text; REAL
      // storage (sqlite) additionally rounds at float precision.
      (ColumnType::Numeric, Value::Float(f)) => Decimal::from_f64(f)
        .map(Value::Numeric)
        .ok_or_else(|| Error::decode("numeric", "float")),
      (ColumnType::Numeric, Value::Text(s)) => s
        .parse::<Decimal>()
        .map(Value::Numeric)
        .map_err(|_| Error::decode("numeric", "text")),
      (ColumnType::Numeric, _) => Err(Error::decode("numeric", found)),

      (ColumnType::Date, v @ Value::Date(_)) => Ok(v),
      (ColumnType::Date, Value::Text(s)) => NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map(Value::Date)
        .map_err(|_| Error::decode("date", "text")),
      (ColumnType::Date, _) => Err(Error::decode("date", found)),

      (ColumnType::Time, v @ Value::Time(_)) => Ok(v),
      (ColumnType::Time, Value::Text(s)) => NaiveTime::parse_from_str(&s, "%H:%M:%S%.f")
        .map(Value::Time)
        .map_err(|_| Error::decode("time", "text")),
      (ColumnType::Time, _) => Err(Error::decode("time", found)),

      (ColumnType::DateTime, v @ Value::DateTime(_)) => Ok(v),
      (ColumnType::DateTime, Value::Text(s)) => parse_datetime(&s)
        .map(Value::DateTime)
        .ok_or_else(|| Error::decode("datetime", "text")),
      (ColumnType::DateTime, _) => Err(Error::decode("datetime", found)),

      (ColumnType::TimestampTz, v @ Value::TimestampTz(_)) => Ok(v),
      (ColumnType::TimestampTz, Value::DateTime(dt)) => Ok(Value::TimestampTz(dt.and_utc())),
      (ColumnType::TimestampTz, Value::Text(s)) => DateTime::parse_from_rfc3339(&s)
        .map(|dt| Value::TimestampTz(dt.with_timezone(&Utc)))
        .or_else(|_| {
          parse_datetime(&s)
            .map(|dt| Value::TimestampTz(dt.and_utc()))
            .ok_or_else(|| Error::decode("timestamptz", "text"))
        }),
      (ColumnType::TimestampTz, _) => Err(Error::decode("timestamptz", found)),

      (ColumnType::Uuid, v @ Value::Uuid(_)) => Ok(v),
      (ColumnType::Uuid, Value::Text(s)) => Uuid::parse_str(&s)
        .map(Value::Uuid)
        .map_err(|_| Error::decode("uuid", "text")),
      (ColumnType::Uuid, Value::Bytes(b)) => Uuid::from_slice(&b)
        .map(Value::Uuid)
        .map_err(|_| Error::decode("uuid", "bytes")),
      (ColumnType::Uuid, _) => Err(Error::decode("uuid", found)),

      (ColumnType::Json, v @ Value::Json(_)) => Ok(v),
      (ColumnType::Json, Value::Text(s)) => serde_json::from_str(&s)
        .map(Value::Json)
        .map_err(|_| Error::decode("json", "text")),
      (ColumnType::Json, _) => Err(Error::decode("json", found)),
    }
  }
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
  NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
    .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
    .ok()
}

/// Conversion out of a [`Value`] for typed row access.
pub trait FromValue: Sized {
  fn from_value(value: Value) -> Result<Self>;
}

macro_rules! from_value {
  ($($ty:ty => $expected:literal: $($pattern:pat => $out:expr),+);* $(;)?) => {
    $(impl FromValue for $ty {
      fn from_value(value: Value) -> Result<Self> {
        match value {
          $($pattern => $out,)+
          other => Err(Error::decode($expected, other.type_name())),
        }
      }
    })*
  };
}

from_value! {
  bool => "boolean": Value::Boolean(v) => Ok(v), Value::Integer(i) => Ok(i != 0);
  i64 => "integer": Value::Integer(v) => Ok(v);
  i32 => "integer":
    Value::Integer(v) => i32::try_from(v).map_err(|_| Error::decode("i32", "integer"));
  f64 => "float": Value::Float(v) => Ok(v), Value::Integer(i) => Ok(i as f64);
  String => "text": Value::Text(v) => Ok(v);
  Vec<u8> => "bytes": Value::Bytes(v) => Ok(v);
  Decimal => "numeric":
    Value::Numeric(v) => Ok(v),
    Value::Integer(i) => Ok(Decimal::from(i)),
    Value::Text(s) => s.parse::<Decimal>().map_err(|_| Error::decode("numeric", "text"));
  NaiveDate => "date": Value::Date(v) => Ok(v);
  NaiveTime => "time": Value::Time(v) => Ok(v);
  NaiveDateTime => "datetime":
    Value::DateTime(v) => Ok(v),
    Value::TimestampTz(v) => Ok(v.naive_utc());
  Uuid => "uuid": Value::Uuid(v) => Ok(v);
  Json => "json": Value::Json(v) => Ok(v);
}

impl FromValue for DateTime<Utc> {
  fn from_value(value: Value) -> Result<Self> {
    match value {
      Value::TimestampTz(v) => Ok(v),
      Value::DateTime(v) => Ok(v.and_utc()),
      other => Err(Error::decode("timestamptz", other.type_name())),
    }
  }
}

impl FromValue for Value {
  fn from_value(value: Value) -> Result<Self> {
    Ok(value)
  }
}

impl<T: FromValue> FromValue for Option<T> {
  fn from_value(value: Value) -> Result<Self> {
    match value {
      Value::Null => Ok(None),
      other => T::from_value(other).map(Some),
    }
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn test_decode_boolean_from_integer() {
    assert_eq!(
      ColumnType::Boolean.decode(Value::Integer(1)).unwrap(),
      Value::Boolean(true)
    );
    assert_eq!(
      ColumnType::Boolean.decode(Value::Integer(0)).unwrap(),
      Value::Boolean(false)
    );
  }

  #[test]
  fn test_decode_json_from_text() {
    let decoded = ColumnType::Json
      .decode(Value::Text(r#"{"a": [1, 2]}"#.to_string()))
      .unwrap();
    assert_eq!(decoded, Value::Json(serde_json::json!({"a": [1, 2]})));
  }

  #[test]
  fn test_decode_numeric_from_text_and_float() {
    assert_eq!(
      ColumnType::Numeric.decode(Value::Text("12.50".into())).unwrap(),
      Value::Numeric("12.50".parse().unwrap())
    );
    // float round-trips lose trailing zeros but keep the magnitude
    let Value::Numeric(d) = ColumnType::Numeric.decode(Value::Float(0.5)).unwrap() else {
      panic!("expected numeric");
    };
    assert_eq!(d, Decimal::new(5, 1));
  }

  #[test]
  fn test_decode_temporal_from_text() {
    assert_eq!(
      ColumnType::Date.decode(Value::Text("2024-03-01".into())).unwrap(),
      Value::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
    );
    let decoded = ColumnType::DateTime
      .decode(Value::Text("2024-03-01 10:30:00.125".into()))
      .unwrap();
    let Value::DateTime(dt) = decoded else { panic!("expected datetime") };
    assert_eq!(dt.date(), NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
  }

  #[test]
  fn test_decode_null_passthrough() {
    assert_eq!(ColumnType::Integer.decode(Value::Null).unwrap(), Value::Null);
    assert_eq!(ColumnType::Json.decode(Value::Null).unwrap(), Value::Null);
  }

  #[test]
  fn test_decode_mismatch_errors() {
    assert!(ColumnType::Date.decode(Value::Boolean(true)).is_err());
    assert!(ColumnType::Integer.decode(Value::Text("nope".into())).is_err());
  }

  #[test]
  fn test_from_value_option() {
    assert_eq!(Option::<i64>::from_value(Value::Null).unwrap(), None);
    assert_eq!(Option::<i64>::from_value(Value::Integer(7)).unwrap(), Some(7));
  }
}
