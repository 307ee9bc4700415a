use std::any::Any;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tokio::sync::Mutex;

use super::{
  savepoint_name, ConnectionBackend, DatabaseBackend, DatabaseOptions, IsolationLevel,
  QueryDialect, TransactionBackend, TransactionOptions,
};
use crate::error::{Error, Result};
use crate::query::{compile, CompiledQuery, ParamStyle, SqlQuery};
use crate::record::{ColumnMaps, Record};
use crate::url::DatabaseUrl;
use crate::value::Value;

const DIALECT: QueryDialect = QueryDialect {
  name: "sqlite",
  paramstyle: ParamStyle::QMark,
  native_decoding: false,
};

type SharedConn = Arc<Mutex<Option<PoolConnection<Sqlite>>>>;

pub struct SqliteBackend {
  url: DatabaseUrl,
  options: DatabaseOptions,
  pool: StdMutex<Option<sqlx::Pool<Sqlite>>>,
}

impl SqliteBackend {
  pub fn new(url: &DatabaseUrl, options: &DatabaseOptions) -> Self {
    Self { url: url.clone(), options: options.clone(), pool: StdMutex::new(None) }
  }

  fn connect_options(&self) -> SqliteConnectOptions {
    let database = self.url.database();
    if database.is_empty() || database == ":memory:" {
      SqliteConnectOptions::new()
    } else {
      SqliteConnectOptions::new().filename(database).create_if_missing(true)
    }
  }
}

#[async_trait]
impl DatabaseBackend for SqliteBackend {
  async fn connect(&self) -> Result<()> {
    assert!(
      self.pool.lock().unwrap().is_none(),
      "DatabaseBackend is already running"
    );
    let mut pool_options = SqlitePoolOptions::new();
    if let Some(min_size) = self.options.min_size {
      pool_options = pool_options.min_connections(min_size);
    }
    if let Some(max_size) = self.options.max_size {
      pool_options = pool_options.max_connections(max_size);
    }
    if let Some(seconds) = self.options.pool_recycle {
      pool_options = pool_options.max_lifetime(Duration::from_secs(seconds));
    }
    let pool = pool_options.connect_with(self.connect_options()).await?;
    tracing::debug!(url = ?self.url, "sqlite pool started");
    *self.pool.lock().unwrap() = Some(pool);
    Ok(())
  }

  async fn disconnect(&self) -> Result<()> {
    let pool = self
      .pool
      .lock()
      .unwrap()
      .take()
      .expect("DatabaseBackend is not running");
    pool.close().await;
    tracing::debug!(url = ?self.url, "sqlite pool closed");
    Ok(())
  }

  fn connection(&self) -> Result<Box<dyn ConnectionBackend>> {
    let pool = self.pool.lock().unwrap().clone().ok_or(Error::NotConnected)?;
    Ok(Box::new(SqliteConnection { pool, conn: Arc::new(Mutex::new(None)) }))
  }

  fn dialect(&self) -> QueryDialect {
    DIALECT
  }
}

pub struct SqliteConnection {
  pool: sqlx::Pool<Sqlite>,
  conn: SharedConn,
}

impl SqliteConnection {
  /// The held raw connection, for callers that downcast through `as_any`.
  pub fn raw(&self) -> SharedConn {
    Arc::clone(&self.conn)
  }
}

#[async_trait]
impl ConnectionBackend for SqliteConnection {
  async fn acquire(&mut self) -> Result<()> {
    let mut guard = self.conn.lock().await;
    assert!(guard.is_none(), "Connection is already acquired");
    *guard = Some(self.pool.acquire().await?);
    Ok(())
  }

  async fn release(&mut self) -> Result<()> {
    let mut guard = self.conn.lock().await;
    assert!(guard.is_some(), "Connection is not acquired");
    // dropping the pooled handle returns it
    guard.take();
    Ok(())
  }

  async fn fetch_all(&mut self, query: &SqlQuery) -> Result<Vec<Record>> {
    let compiled = compile(query, ParamStyle::QMark)?;
    let maps = ColumnMaps::from_columns(&compiled.result_columns);
    let mut guard = self.conn.lock().await;
    let conn = guard.as_mut().expect("Connection is not acquired");
    let rows = bind_args(&compiled).fetch_all(&mut **conn).await?;
    let names = Arc::new(rows.first().map(row_names).unwrap_or_default());
    rows
      .iter()
      .map(|row| record_from_row(row, Arc::clone(&names), Arc::clone(&maps)))
      .collect()
  }

  async fn fetch_one(&mut self, query: &SqlQuery) -> Result<Option<Record>> {
    let compiled = compile(query, ParamStyle::QMark)?;
    let maps = ColumnMaps::from_columns(&compiled.result_columns);
    let mut guard = self.conn.lock().await;
    let conn = guard.as_mut().expect("Connection is not acquired");
    let row = bind_args(&compiled).fetch_optional(&mut **conn).await?;
    match row {
      Some(row) => {
        let names = Arc::new(row_names(&row));
        Ok(Some(record_from_row(&row, names, maps)?))
      },
      None => Ok(None),
    }
  }

  async fn execute(&mut self, query: &SqlQuery) -> Result<Value> {
    let compiled = compile(query, ParamStyle::QMark)?;
    let mut guard = self.conn.lock().await;
    let conn = guard.as_mut().expect("Connection is not acquired");
    let result = bind_args(&compiled).execute(&mut **conn).await?;
    // aiosqlite-compatible hint: rowid when the statement produced one,
    // affected rows otherwise
    if result.last_insert_rowid() == 0 {
      Ok(Value::Integer(result.rows_affected() as i64))
    } else {
      Ok(Value::Integer(result.last_insert_rowid()))
    }
  }

  async fn execute_many(&mut self, queries: &[SqlQuery]) -> Result<()> {
    let mut guard = self.conn.lock().await;
    let conn = guard.as_mut().expect("Connection is not acquired");
    for query in queries {
      let compiled = compile(query, ParamStyle::QMark)?;
      bind_args(&compiled).execute(&mut **conn).await?;
    }
    Ok(())
  }

  fn stream<'q>(&'q mut self, query: &'q SqlQuery) -> BoxStream<'q, Result<Record>> {
    let conn = Arc::clone(&self.conn);
    let compiled = compile(query, ParamStyle::QMark);
    Box::pin(try_stream! {
      let compiled = compiled?;
      let maps = ColumnMaps::from_columns(&compiled.result_columns);
      let mut guard = conn.lock().await;
      let conn = guard.as_mut().expect("Connection is not acquired");
      let mut rows = bind_args(&compiled).fetch(&mut **conn);
      let mut names: Option<Arc<Vec<String>>> = None;
      while let Some(row) = rows.try_next().await? {
        let names = names.get_or_insert_with(|| Arc::new(row_names(&row)));
        yield record_from_row(&row, Arc::clone(names), Arc::clone(&maps))?;
      }
    })
  }

  fn transaction(&self) -> Box<dyn TransactionBackend> {
    Box::new(SqliteTransaction {
      conn: Arc::clone(&self.conn),
      is_root: false,
      savepoint: String::new(),
    })
  }

  fn dialect(&self) -> QueryDialect {
    DIALECT
  }

  fn as_any(&mut self) -> &mut dyn Any {
    self
  }
}

pub struct SqliteTransaction {
  conn: SharedConn,
  is_root: bool,
  savepoint: String,
}

impl SqliteTransaction {
  async fn execute_raw(&self, sql: &str) -> Result<()> {
    use sqlx::Executor;
    let mut guard = self.conn.lock().await;
    let conn = guard.as_mut().expect("Connection is not acquired");
    (&mut **conn).execute(sqlx::raw_sql(sql)).await?;
    Ok(())
  }
}

#[async_trait]
impl TransactionBackend for SqliteTransaction {
  async fn start(&mut self, is_root: bool, options: &TransactionOptions) -> Result<()> {
    self.is_root = is_root;
    if is_root {
      // read_uncommitted is the only isolation knob sqlite exposes
      if let Some(isolation) = options.isolation {
        let pragma = match isolation {
          IsolationLevel::ReadUncommitted => "PRAGMA read_uncommitted = 1",
          _ => "PRAGMA read_uncommitted = 0",
        };
        self.execute_raw(pragma).await?;
      }
      self.execute_raw("BEGIN").await
    } else {
      self.savepoint = savepoint_name();
      self.execute_raw(&format!("SAVEPOINT {}", self.savepoint)).await
    }
  }

  async fn commit(&mut self) -> Result<()> {
    if self.is_root {
      self.execute_raw("COMMIT").await
    } else {
      self.execute_raw(&format!("RELEASE SAVEPOINT {}", self.savepoint)).await
    }
  }

  async fn rollback(&mut self) -> Result<()> {
    if self.is_root {
      self.execute_raw("ROLLBACK").await
    } else {
      self
        .execute_raw(&format!("ROLLBACK TO SAVEPOINT {}", self.savepoint))
        .await
    }
  }
}

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn bind_args(compiled: &CompiledQuery) -> SqliteQuery<'_> {
  let mut query = sqlx::query(&compiled.sql);
  for value in compiled.args.as_positional() {
    query = bind_value(query, value);
  }
  query
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: &'q Value) -> SqliteQuery<'q> {
  match value {
    Value::Null => query.bind(None::<String>),
    Value::Boolean(v) => query.bind(*v),
    Value::Integer(v) => query.bind(*v),
    Value::Float(v) => query.bind(*v),
    Value::Text(v) => query.bind(v.as_str()),
    Value::Bytes(v) => query.bind(v.as_slice()),
    // no decimal wire type; round-trips through text
    Value::Numeric(v) => query.bind(v.to_string()),
    Value::Date(v) => query.bind(*v),
    Value::Time(v) => query.bind(*v),
    Value::DateTime(v) => query.bind(*v),
    Value::TimestampTz(v) => query.bind(*v),
    Value::Uuid(v) => query.bind(*v),
    Value::Json(v) => query.bind(v.clone()),
  }
}

fn row_names(row: &SqliteRow) -> Vec<String> {
  row.columns().iter().map(|c| c.name().to_string()).collect()
}

fn record_from_row(
  row: &SqliteRow,
  names: Arc<Vec<String>>,
  maps: Arc<ColumnMaps>,
) -> Result<Record> {
  let mut values = Vec::with_capacity(row.len());
  for idx in 0..row.len() {
    values.push(decode_column(row, idx)?);
  }
  Ok(Record::new(values, names, maps, DIALECT.native_decoding))
}

fn decode_column(row: &SqliteRow, idx: usize) -> Result<Value> {
  if row.try_get_raw(idx)?.is_null() {
    return Ok(Value::Null);
  }
  let type_name = row.column(idx).type_info().name().to_uppercase();
  let value = match type_name.as_str() {
    "BOOLEAN" => Value::Boolean(row.try_get(idx)?),
    "INTEGER" => Value::Integer(row.try_get(idx)?),
    "REAL" => Value::Float(row.try_get(idx)?),
    "TEXT" => Value::Text(row.try_get(idx)?),
    "BLOB" => Value::Bytes(row.try_get(idx)?),
    "DATE" => Value::Date(row.try_get(idx)?),
    "TIME" => Value::Time(row.try_get(idx)?),
    "DATETIME" => Value::DateTime(row.try_get(idx)?),
    // NUMERIC affinity may hold integers, floats, or text
    "NUMERIC" => match row.try_get::<f64, _>(idx) {
      Ok(v) => Value::Float(v),
      Err(_) => Value::Text(row.try_get(idx)?),
    },
    _ => Value::Text(row.try_get(idx)?),
  };
  Ok(value)
}
