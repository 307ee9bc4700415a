use std::collections::HashMap;

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::value::{ColumnType, Value};

/// Per-parameter transform applied to a bound value right before emission,
/// e.g. collapsing an application enum to its label.
pub type BindProcessor = fn(Value) -> Value;

/// Declared shape of one result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultColumn {
  pub name: String,
  pub table: Option<String>,
  pub datatype: ColumnType,
}

impl ResultColumn {
  pub fn new(name: impl Into<String>, datatype: ColumnType) -> Self {
    Self { name: name.into(), table: None, datatype }
  }

  pub fn qualified(
    table: impl Into<String>,
    name: impl Into<String>,
    datatype: ColumnType,
  ) -> Self {
    Self { name: name.into(), table: Some(table.into()), datatype }
  }

  /// The fully-qualified `table.column` key, or the bare name when the
  /// column is unqualified.
  pub fn qualified_name(&self) -> String {
    match &self.table {
      Some(table) => format!("{}.{}", table, self.name),
      None => self.name.clone(),
    }
  }
}

/// A SQL statement with named `:param` placeholders plus its bound values.
///
/// This is the facade's statement carrier: the query-building layer above it
/// (or plain handwritten SQL) produces the text, parameter values, optional
/// bind processors, and optional declared result columns; the backends
/// rewrite the placeholders into their driver's style at execution time.
///
/// ```
/// use aquifer::SqlQuery;
///
/// let query = SqlQuery::new("SELECT id FROM notes WHERE completed = :done")
///   .bind("done", true);
/// ```
#[derive(Debug, Clone)]
pub struct SqlQuery {
  sql: String,
  params: IndexMap<String, Value>,
  processors: HashMap<String, BindProcessor>,
  result_columns: Vec<ResultColumn>,
  ddl: Option<bool>,
}

impl SqlQuery {
  pub fn new(sql: impl Into<String>) -> Self {
    Self {
      sql: sql.into(),
      params: IndexMap::new(),
      processors: HashMap::new(),
      result_columns: Vec::new(),
      ddl: None,
    }
  }

  pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
    self.params.insert(name.into(), value.into());
    self
  }

  pub fn bind_values(mut self, values: impl IntoIterator<Item = (String, Value)>) -> Self {
    for (name, value) in values {
      self.params.insert(name, value);
    }
    self
  }

  pub fn bind_processor(mut self, name: impl Into<String>, processor: BindProcessor) -> Self {
    self.processors.insert(name.into(), processor);
    self
  }

  /// Declare the result columns so records decode into application types.
  pub fn columns(mut self, columns: Vec<ResultColumn>) -> Self {
    self.result_columns = columns;
    self
  }

  /// Force the DDL classification instead of inferring it from the text.
  pub fn ddl(mut self, ddl: bool) -> Self {
    self.ddl = Some(ddl);
    self
  }

  pub fn sql(&self) -> &str {
    &self.sql
  }

  pub fn params(&self) -> &IndexMap<String, Value> {
    &self.params
  }

  pub fn result_columns(&self) -> &[ResultColumn] {
    &self.result_columns
  }

  /// DDL statements bypass parameter binding entirely.
  pub fn is_ddl(&self) -> bool {
    match self.ddl {
      Some(ddl) => ddl,
      None => {
        let keyword = leading_keyword(&self.sql);
        ["CREATE", "ALTER", "DROP", "TRUNCATE"]
          .iter()
          .any(|k| keyword.eq_ignore_ascii_case(k))
      },
    }
  }

  fn processed(&self, name: &str) -> Result<Value> {
    let value = self
      .params
      .get(name)
      .ok_or_else(|| Error::MissingParameter(name.to_string()))?;
    Ok(match self.processors.get(name) {
      Some(processor) => processor(value.clone()),
      None => value.clone(),
    })
  }
}

impl From<&str> for SqlQuery {
  fn from(sql: &str) -> Self {
    SqlQuery::new(sql)
  }
}

impl From<String> for SqlQuery {
  fn from(sql: String) -> Self {
    SqlQuery::new(sql)
  }
}

/// Placeholder style spoken by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamStyle {
  /// `:name` left as-is; arguments emitted as a name → value map.
  Named,
  /// `$1, $2, ...` (postgres wire protocol).
  Numeric,
  /// `?` per occurrence (mysql, sqlite).
  QMark,
  /// `@P1, @P2, ...` (mssql/tds).
  AtNumbered,
}

/// Arguments emitted alongside the rewritten SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryArgs {
  Positional(Vec<Value>),
  Named(IndexMap<String, Value>),
}

impl QueryArgs {
  pub fn len(&self) -> usize {
    match self {
      QueryArgs::Positional(args) => args.len(),
      QueryArgs::Named(args) => args.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn as_positional(&self) -> &[Value] {
    match self {
      QueryArgs::Positional(args) => args,
      QueryArgs::Named(_) => panic!("named arguments used with a positional driver"),
    }
  }
}

/// Output of placeholder rewriting: driver-ready SQL text, arguments in the
/// driver's shape, and the declared result columns carried through.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
  pub sql: String,
  pub args: QueryArgs,
  pub result_columns: Vec<ResultColumn>,
}

/// Rewrite `:name` placeholders into the target style and collect arguments.
///
/// Placeholders inside string literals, quoted identifiers, comments, and
/// `::type` casts are left alone. For numbered styles the distinct parameter
/// names are ordered by a stable sort so repeated compilations of the same
/// statement produce identical text and prepared statements can be reused.
pub fn compile(query: &SqlQuery, style: ParamStyle) -> Result<CompiledQuery> {
  if query.is_ddl() {
    tracing::debug!(sql = %query.sql(), "compiled ddl query");
    return Ok(CompiledQuery {
      sql: query.sql().to_string(),
      args: QueryArgs::Positional(Vec::new()),
      result_columns: Vec::new(),
    });
  }

  let placeholders = find_placeholders(query.sql());
  let (sql, args) = match style {
    ParamStyle::Named => {
      let mut named = IndexMap::new();
      for ph in &placeholders {
        if !named.contains_key(&ph.name) {
          named.insert(ph.name.clone(), query.processed(&ph.name)?);
        }
      }
      (query.sql().to_string(), QueryArgs::Named(named))
    },
    ParamStyle::QMark => {
      let mut args = Vec::with_capacity(placeholders.len());
      let sql = rewrite(query.sql(), &placeholders, |ph| {
        args.push(ph.name.clone());
        "?".to_string()
      });
      let args = args
        .iter()
        .map(|name| query.processed(name))
        .collect::<Result<Vec<_>>>()?;
      (sql, QueryArgs::Positional(args))
    },
    ParamStyle::Numeric | ParamStyle::AtNumbered => {
      let mut names: Vec<&str> = placeholders.iter().map(|ph| ph.name.as_str()).collect();
      names.sort_unstable();
      names.dedup();
      let index: HashMap<&str, usize> =
        names.iter().enumerate().map(|(i, name)| (*name, i + 1)).collect();
      let sql = rewrite(query.sql(), &placeholders, |ph| {
        let n = index[ph.name.as_str()];
        match style {
          ParamStyle::Numeric => format!("${n}"),
          _ => format!("@P{n}"),
        }
      });
      let args = names
        .iter()
        .map(|name| query.processed(name))
        .collect::<Result<Vec<_>>>()?;
      (sql, QueryArgs::Positional(args))
    },
  };

  tracing::debug!(sql = %sql, args = ?args, "compiled query");
  Ok(CompiledQuery { sql, args, result_columns: query.result_columns().to_vec() })
}

struct Placeholder {
  name: String,
  start: usize,
  end: usize,
}

fn rewrite(sql: &str, placeholders: &[Placeholder], mut f: impl FnMut(&Placeholder) -> String) -> String {
  let mut out = String::with_capacity(sql.len());
  let mut last = 0;
  for ph in placeholders {
    out.push_str(&sql[last..ph.start]);
    out.push_str(&f(ph));
    last = ph.end;
  }
  out.push_str(&sql[last..]);
  out
}

fn find_placeholders(sql: &str) -> Vec<Placeholder> {
  let bytes = sql.as_bytes();
  let mut out = Vec::new();
  let mut i = 0;
  while i < bytes.len() {
    match bytes[i] {
      b'\'' => i = skip_quoted(bytes, i, b'\''),
      b'"' => i = skip_quoted(bytes, i, b'"'),
      b'`' => i = skip_quoted(bytes, i, b'`'),
      b'[' => {
        i += 1;
        while i < bytes.len() && bytes[i] != b']' {
          i += 1;
        }
        i += 1;
      },
      b'-' if bytes.get(i + 1) == Some(&b'-') => {
        while i < bytes.len() && bytes[i] != b'\n' {
          i += 1;
        }
      },
      b'/' if bytes.get(i + 1) == Some(&b'*') => {
        i += 2;
        while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
          i += 1;
        }
        i = (i + 2).min(bytes.len());
      },
      b':' => {
        // `::type` casts are not placeholders
        if bytes.get(i + 1) == Some(&b':') {
          i += 2;
          continue;
        }
        let start = i;
        i += 1;
        let name_start = i;
        while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
          i += 1;
        }
        if i > name_start && !bytes[name_start].is_ascii_digit() {
          out.push(Placeholder { name: sql[name_start..i].to_string(), start, end: i });
        }
      },
      _ => i += 1,
    }
  }
  out
}

fn skip_quoted(bytes: &[u8], mut i: usize, quote: u8) -> usize {
  i += 1;
  while i < bytes.len() {
    if bytes[i] == quote {
      // doubled quotes escape themselves
      if bytes.get(i + 1) == Some(&quote) {
        i += 2;
        continue;
      }
      return i + 1;
    }
    i += 1;
  }
  i
}

fn leading_keyword(sql: &str) -> &str {
  let mut rest = sql;
  loop {
    rest = rest.trim_start();
    if let Some(stripped) = rest.strip_prefix("--") {
      rest = stripped.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
    } else if let Some(stripped) = rest.strip_prefix("/*") {
      rest = stripped.split_once("*/").map(|(_, tail)| tail).unwrap_or("");
    } else {
      break;
    }
  }
  let end = rest
    .find(|c: char| !c.is_ascii_alphabetic())
    .unwrap_or(rest.len());
  &rest[..end]
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  fn insert_query() -> SqlQuery {
    SqlQuery::new("INSERT INTO notes (text, completed) VALUES (:text, :completed)")
      .bind("text", "x")
      .bind("completed", true)
  }

  #[test]
  fn test_compile_numeric() {
    let compiled = compile(&insert_query(), ParamStyle::Numeric).unwrap();
    assert_eq!(compiled.sql, "INSERT INTO notes (text, completed) VALUES ($2, $1)");
    assert_eq!(
      compiled.args,
      QueryArgs::Positional(vec![Value::Boolean(true), Value::Text("x".into())])
    );
  }

  #[test]
  fn test_compile_qmark() {
    let compiled = compile(&insert_query(), ParamStyle::QMark).unwrap();
    assert_eq!(compiled.sql, "INSERT INTO notes (text, completed) VALUES (?, ?)");
    assert_eq!(
      compiled.args,
      QueryArgs::Positional(vec![Value::Text("x".into()), Value::Boolean(true)])
    );
  }

  #[test]
  fn test_compile_at_numbered() {
    let compiled = compile(&insert_query(), ParamStyle::AtNumbered).unwrap();
    assert_eq!(compiled.sql, "INSERT INTO notes (text, completed) VALUES (@P2, @P1)");
    assert_eq!(compiled.args.len(), 2);
  }

  #[test]
  fn test_compile_named_passthrough() {
    let compiled = compile(&insert_query(), ParamStyle::Named).unwrap();
    assert_eq!(compiled.sql, "INSERT INTO notes (text, completed) VALUES (:text, :completed)");
    let QueryArgs::Named(named) = compiled.args else { panic!("expected named args") };
    assert_eq!(named.get("text"), Some(&Value::Text("x".into())));
    assert_eq!(named.get("completed"), Some(&Value::Boolean(true)));
  }

  #[test]
  fn test_placeholder_count_matches_args() {
    for style in [ParamStyle::Numeric, ParamStyle::QMark, ParamStyle::AtNumbered] {
      let compiled = compile(&insert_query(), style).unwrap();
      let marker = match style {
        ParamStyle::Numeric => '$',
        ParamStyle::AtNumbered => '@',
        _ => '?',
      };
      let count = compiled.sql.matches(marker).count();
      assert_eq!(count, compiled.args.len(), "style {style:?}");
    }
  }

  #[test]
  fn test_repeated_parameter_qmark_duplicates_args() {
    let query = SqlQuery::new("SELECT * FROM t WHERE a = :v OR b = :v").bind("v", 1_i64);
    let compiled = compile(&query, ParamStyle::QMark).unwrap();
    assert_eq!(compiled.sql, "SELECT * FROM t WHERE a = ? OR b = ?");
    assert_eq!(
      compiled.args,
      QueryArgs::Positional(vec![Value::Integer(1), Value::Integer(1)])
    );
  }

  #[test]
  fn test_repeated_parameter_numeric_reuses_index() {
    let query = SqlQuery::new("SELECT * FROM t WHERE a = :v OR b = :v").bind("v", 1_i64);
    let compiled = compile(&query, ParamStyle::Numeric).unwrap();
    assert_eq!(compiled.sql, "SELECT * FROM t WHERE a = $1 OR b = $1");
    assert_eq!(compiled.args, QueryArgs::Positional(vec![Value::Integer(1)]));
  }

  #[test]
  fn test_cast_and_literal_placeholders_untouched() {
    let query = SqlQuery::new("SELECT ':skip', note::text FROM t WHERE id = :id").bind("id", 3_i64);
    let compiled = compile(&query, ParamStyle::Numeric).unwrap();
    assert_eq!(compiled.sql, "SELECT ':skip', note::text FROM t WHERE id = $1");
    assert_eq!(compiled.args.len(), 1);
  }

  #[test]
  fn test_comments_skipped() {
    let query = SqlQuery::new("SELECT 1 -- :nope\n, :yes /* :also_nope */").bind("yes", 2_i64);
    let compiled = compile(&query, ParamStyle::QMark).unwrap();
    assert_eq!(compiled.sql, "SELECT 1 -- :nope\n, ? /* :also_nope */");
    assert_eq!(compiled.args.len(), 1);
  }

  #[test]
  fn test_missing_parameter() {
    let query = SqlQuery::new("SELECT :absent");
    let err = compile(&query, ParamStyle::QMark).unwrap_err();
    assert!(matches!(err, Error::MissingParameter(name) if name == "absent"));
  }

  #[test]
  fn test_unused_binds_ignored() {
    let query = SqlQuery::new("SELECT :used").bind("used", 1_i64).bind("unused", 2_i64);
    let compiled = compile(&query, ParamStyle::Numeric).unwrap();
    assert_eq!(compiled.args.len(), 1);
  }

  #[test]
  fn test_ddl_bypasses_binding() {
    let query = SqlQuery::new("CREATE TABLE notes (id INTEGER, note TEXT DEFAULT ':x')");
    assert!(query.is_ddl());
    let compiled = compile(&query, ParamStyle::Numeric).unwrap();
    assert_eq!(compiled.sql, query.sql());
    assert!(compiled.args.is_empty());

    let query = SqlQuery::new("  -- setup\n  DROP TABLE notes");
    assert!(query.is_ddl());

    let query = SqlQuery::new("SELECT * FROM notes");
    assert!(!query.is_ddl());
  }

  #[test]
  fn test_bind_processor_applied() {
    let query = SqlQuery::new("SELECT :flag")
      .bind("flag", true)
      .bind_processor("flag", |v| match v {
        Value::Boolean(b) => Value::Integer(i64::from(b)),
        other => other,
      });
    let compiled = compile(&query, ParamStyle::QMark).unwrap();
    assert_eq!(compiled.args, QueryArgs::Positional(vec![Value::Integer(1)]));
  }

  #[test]
  fn test_stable_ordering_across_compilations() {
    let query = SqlQuery::new("UPDATE t SET b = :beta, a = :alpha WHERE id = :id")
      .bind("beta", 1_i64)
      .bind("alpha", 2_i64)
      .bind("id", 3_i64);
    let first = compile(&query, ParamStyle::Numeric).unwrap();
    let second = compile(&query, ParamStyle::Numeric).unwrap();
    assert_eq!(first.sql, second.sql);
    // alphabetical: alpha -> $1, beta -> $2, id -> $3
    assert_eq!(first.sql, "UPDATE t SET b = $2, a = $1 WHERE id = $3");
  }
}
