use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::query::ResultColumn;
use crate::value::{ColumnType, FromValue, Value};

/// Lookup tables built once per result set and shared by every row in it.
///
/// Three ways to address a column resolve to the same `(index, type)` pair:
/// the bare result name, the position, and the fully-qualified
/// `table.column` string. When two result columns share a name the later one
/// wins for name lookup; positional access reaches both.
#[derive(Debug, Default)]
pub struct ColumnMaps {
  by_name: HashMap<String, (usize, ColumnType)>,
  by_qualified: HashMap<String, (usize, ColumnType)>,
  names: Vec<String>,
  types: Vec<ColumnType>,
}

impl ColumnMaps {
  pub fn from_columns(columns: &[ResultColumn]) -> Arc<Self> {
    let mut maps = ColumnMaps::default();
    for (idx, column) in columns.iter().enumerate() {
      maps.by_name.insert(column.name.clone(), (idx, column.datatype));
      maps.by_qualified.insert(column.qualified_name(), (idx, column.datatype));
      maps.names.push(column.name.clone());
      maps.types.push(column.datatype);
    }
    Arc::new(maps)
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }
}

/// A column address: position, result name, or fully-qualified column.
#[derive(Debug, Clone, Copy)]
pub enum ColumnIndex<'a> {
  Position(usize),
  Name(&'a str),
  Qualified(&'a str),
}

impl From<usize> for ColumnIndex<'_> {
  fn from(idx: usize) -> Self {
    ColumnIndex::Position(idx)
  }
}

impl<'a> From<&'a str> for ColumnIndex<'a> {
  fn from(name: &'a str) -> Self {
    ColumnIndex::Name(name)
  }
}

/// One decoded result row.
///
/// Holds the driver's values translated into neutral [`Value`]s plus the
/// shared column maps. Declared result types act as result processors and
/// are applied on access; for backends whose driver already decodes rich
/// types (postgres) a processor only runs when the stored value is still a
/// primitive, so driver-decoded JSON or numerics pass through untouched.
#[derive(Debug, Clone)]
pub struct Record {
  values: Vec<Value>,
  row_names: Arc<Vec<String>>,
  maps: Arc<ColumnMaps>,
  native_decoding: bool,
}

impl Record {
  pub(crate) fn new(
    values: Vec<Value>,
    row_names: Arc<Vec<String>>,
    maps: Arc<ColumnMaps>,
    native_decoding: bool,
  ) -> Self {
    Self { values, row_names, maps, native_decoding }
  }

  /// Fetch and decode a single column.
  pub fn get<'a>(&self, key: impl Into<ColumnIndex<'a>>) -> Result<Value> {
    let key = key.into();
    let (idx, datatype) = self.resolve(key)?;
    let raw = self.values[idx].clone();
    let Some(datatype) = datatype else {
      return Ok(raw);
    };
    // Rich driver-decoded values are final; re-running the processor over
    // them would double-decode (json, arrays, numerics on postgres).
    if self.native_decoding && !raw.is_primitive() {
      return Ok(raw);
    }
    datatype.decode(raw).map_err(|e| e.with_column(&self.column_label(key)))
  }

  /// Fetch a column and convert it to a concrete Rust type, in the
  /// `record.try_get::<i64, _>("id")` style.
  pub fn try_get<'a, T, K>(&self, key: K) -> Result<T>
  where
    T: FromValue,
    K: Into<ColumnIndex<'a>>,
  {
    let key = key.into();
    T::from_value(self.get(key)?).map_err(|e| e.with_column(&self.column_label(key)))
  }

  fn resolve(&self, key: ColumnIndex<'_>) -> Result<(usize, Option<ColumnType>)> {
    // Undeclared (raw SQL) results fall back to the driver row's own naming.
    if self.maps.is_empty() {
      return match key {
        ColumnIndex::Position(idx) if idx < self.values.len() => Ok((idx, None)),
        ColumnIndex::Position(idx) => Err(Error::NoSuchColumn(idx.to_string())),
        ColumnIndex::Name(name) | ColumnIndex::Qualified(name) => self
          .row_names
          .iter()
          .position(|n| n == name)
          .map(|idx| (idx, None))
          .ok_or_else(|| Error::NoSuchColumn(name.to_string())),
      };
    }

    match key {
      ColumnIndex::Position(idx) => match self.maps.types.get(idx) {
        Some(datatype) => Ok((idx, Some(*datatype))),
        None => Err(Error::NoSuchColumn(idx.to_string())),
      },
      ColumnIndex::Name(name) => self
        .maps
        .by_name
        .get(name)
        .map(|(idx, t)| (*idx, Some(*t)))
        .ok_or_else(|| Error::NoSuchColumn(name.to_string())),
      ColumnIndex::Qualified(name) => self
        .maps
        .by_qualified
        .get(name)
        .map(|(idx, t)| (*idx, Some(*t)))
        .ok_or_else(|| Error::NoSuchColumn(name.to_string())),
    }
  }

  fn column_label(&self, key: ColumnIndex<'_>) -> String {
    match key {
      ColumnIndex::Position(idx) => idx.to_string(),
      ColumnIndex::Name(name) | ColumnIndex::Qualified(name) => name.to_string(),
    }
  }

  pub fn len(&self) -> usize {
    self.values.len()
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  /// Column names in result order, duplicates preserved.
  pub fn keys(&self) -> impl Iterator<Item = &str> {
    self.names().iter().map(String::as_str)
  }

  /// Raw stored values in result order, without result processing.
  pub fn values(&self) -> &[Value] {
    &self.values
  }

  /// The mapping view: `(name, raw value)` pairs, duplicates preserved.
  pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
    self.keys().zip(self.values.iter())
  }

  fn names(&self) -> &Vec<String> {
    if self.maps.is_empty() {
      &self.row_names
    } else {
      &self.maps.names
    }
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  fn declared_record(native_decoding: bool) -> Record {
    let columns = vec![
      ResultColumn::qualified("notes", "id", ColumnType::Integer),
      ResultColumn::qualified("notes", "completed", ColumnType::Boolean),
      ResultColumn::qualified("notes", "data", ColumnType::Json),
    ];
    Record::new(
      vec![
        Value::Integer(1),
        Value::Integer(1),
        Value::Text(r#"{"k": true}"#.to_string()),
      ],
      Arc::new(vec!["id".into(), "completed".into(), "data".into()]),
      ColumnMaps::from_columns(&columns),
      native_decoding,
    )
  }

  #[test]
  fn test_record_access_by_name_position_and_column() {
    let record = declared_record(false);
    assert_eq!(record.get("id").unwrap(), Value::Integer(1));
    assert_eq!(record.get(1_usize).unwrap(), Value::Boolean(true));
    assert_eq!(
      record.get(ColumnIndex::Qualified("notes.completed")).unwrap(),
      Value::Boolean(true)
    );
  }

  #[test]
  fn test_record_result_processing() {
    let record = declared_record(false);
    assert_eq!(record.get("completed").unwrap(), Value::Boolean(true));
    assert_eq!(
      record.get("data").unwrap(),
      Value::Json(serde_json::json!({"k": true}))
    );
  }

  #[test]
  fn test_record_native_decoding_only_processes_primitives() {
    // a natively-decoded json value must not be re-processed...
    let columns = vec![ResultColumn::new("data", ColumnType::Json)];
    let record = Record::new(
      vec![Value::Json(serde_json::json!([1, 2]))],
      Arc::new(vec!["data".into()]),
      ColumnMaps::from_columns(&columns),
      true,
    );
    assert_eq!(record.get("data").unwrap(), Value::Json(serde_json::json!([1, 2])));

    // ...while a primitive still is
    let record = declared_record(true);
    assert_eq!(record.get("completed").unwrap(), Value::Boolean(true));
  }

  #[test]
  fn test_record_duplicate_names() {
    let columns = vec![
      ResultColumn::qualified("a", "id", ColumnType::Integer),
      ResultColumn::qualified("b", "id", ColumnType::Integer),
    ];
    let record = Record::new(
      vec![Value::Integer(10), Value::Integer(20)],
      Arc::new(vec!["id".into(), "id".into()]),
      ColumnMaps::from_columns(&columns),
      false,
    );
    // later duplicate wins for name lookup, positions reach both
    assert_eq!(record.get("id").unwrap(), Value::Integer(20));
    assert_eq!(record.get(0_usize).unwrap(), Value::Integer(10));
    assert_eq!(record.get(ColumnIndex::Qualified("a.id")).unwrap(), Value::Integer(10));
    assert_eq!(record.keys().collect::<Vec<_>>(), vec!["id", "id"]);
    assert_eq!(record.values().len(), 2);
  }

  #[test]
  fn test_record_raw_passthrough() {
    let record = Record::new(
      vec![Value::Text("x".into()), Value::Integer(2)],
      Arc::new(vec!["note".into(), "count".into()]),
      Arc::new(ColumnMaps::default()),
      false,
    );
    assert_eq!(record.get("note").unwrap(), Value::Text("x".into()));
    assert_eq!(record.get(1_usize).unwrap(), Value::Integer(2));
    assert!(record.get("missing").is_err());
  }

  #[test]
  fn test_record_typed_access() {
    let record = declared_record(false);
    assert_eq!(record.try_get::<i64, _>("id").unwrap(), 1);
    assert!(record.try_get::<bool, _>("completed").unwrap());
    assert!(record.try_get::<String, _>("id").is_err());
  }
}
