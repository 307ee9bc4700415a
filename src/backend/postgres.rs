use std::any::Any;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow, PgSslMode, Postgres};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tokio::sync::Mutex;

use super::{
  savepoint_name, ConnectionBackend, DatabaseBackend, DatabaseOptions, QueryDialect, SslMode,
  TransactionBackend, TransactionOptions,
};
use crate::error::{Error, Result};
use crate::query::{compile, CompiledQuery, ParamStyle, SqlQuery};
use crate::record::{ColumnMaps, Record};
use crate::url::DatabaseUrl;
use crate::value::Value;

const DIALECT: QueryDialect = QueryDialect {
  name: "postgresql",
  paramstyle: ParamStyle::Numeric,
  native_decoding: true,
};

type SharedConn = Arc<Mutex<Option<PoolConnection<Postgres>>>>;

pub struct PostgresBackend {
  url: DatabaseUrl,
  options: DatabaseOptions,
  pool: StdMutex<Option<sqlx::Pool<Postgres>>>,
}

impl PostgresBackend {
  pub fn new(url: &DatabaseUrl, options: &DatabaseOptions) -> Self {
    Self { url: url.clone(), options: options.clone(), pool: StdMutex::new(None) }
  }

  fn connect_options(&self) -> Result<PgConnectOptions> {
    let mut opts = PgConnectOptions::new();
    if let Some(host) = self.url.hostname() {
      // unix-socket urls carry the directory in the host position
      if host.starts_with('/') {
        opts = opts.socket(host);
      } else {
        opts = opts.host(host);
      }
    }
    if let Some(port) = self.url.port() {
      opts = opts.port(port);
    }
    if let Some(username) = self.url.username() {
      opts = opts.username(username);
    }
    if let Some(password) = self.url.password() {
      opts = opts.password(password);
    }
    if !self.url.database().is_empty() {
      opts = opts.database(self.url.database());
    }
    if let Some(ssl) = &self.options.ssl {
      opts = opts.ssl_mode(pg_ssl_mode(ssl)?);
    }
    Ok(opts)
  }
}

fn pg_ssl_mode(ssl: &SslMode) -> Result<PgSslMode> {
  Ok(match ssl {
    SslMode::Enabled => PgSslMode::Require,
    SslMode::Disabled => PgSslMode::Disable,
    SslMode::Custom(mode) => match mode.as_str() {
      "disable" => PgSslMode::Disable,
      "allow" => PgSslMode::Allow,
      "prefer" => PgSslMode::Prefer,
      "require" => PgSslMode::Require,
      "verify-ca" => PgSslMode::VerifyCa,
      "verify-full" => PgSslMode::VerifyFull,
      other => {
        return Err(Error::Configuration {
          name: "ssl".to_string(),
          reason: format!("unknown sslmode `{other}`"),
        })
      },
    },
  })
}

#[async_trait]
impl DatabaseBackend for PostgresBackend {
  async fn connect(&self) -> Result<()> {
    assert!(
      self.pool.lock().unwrap().is_none(),
      "DatabaseBackend is already running"
    );
    let mut pool_options = PgPoolOptions::new();
    if let Some(min_size) = self.options.min_size {
      pool_options = pool_options.min_connections(min_size);
    }
    if let Some(max_size) = self.options.max_size {
      pool_options = pool_options.max_connections(max_size);
    }
    if let Some(seconds) = self.options.pool_recycle {
      pool_options = pool_options.max_lifetime(Duration::from_secs(seconds));
    }
    let pool = pool_options.connect_with(self.connect_options()?).await?;
    tracing::debug!(url = ?self.url, "postgres pool started");
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
    tracing::debug!(url = ?self.url, "postgres pool closed");
    Ok(())
  }

  fn connection(&self) -> Result<Box<dyn ConnectionBackend>> {
    let pool = self.pool.lock().unwrap().clone().ok_or(Error::NotConnected)?;
    Ok(Box::new(PostgresConnection { pool, conn: Arc::new(Mutex::new(None)) }))
  }

  fn dialect(&self) -> QueryDialect {
    DIALECT
  }
}

pub struct PostgresConnection {
  pool: sqlx::Pool<Postgres>,
  conn: SharedConn,
}

impl PostgresConnection {
  /// The held raw connection, for callers that downcast through `as_any`.
  pub fn raw(&self) -> SharedConn {
    Arc::clone(&self.conn)
  }
}

#[async_trait]
impl ConnectionBackend for PostgresConnection {
  async fn acquire(&mut self) -> Result<()> {
    let mut guard = self.conn.lock().await;
    assert!(guard.is_none(), "Connection is already acquired");
    *guard = Some(self.pool.acquire().await?);
    Ok(())
  }

  async fn release(&mut self) -> Result<()> {
    let mut guard = self.conn.lock().await;
    assert!(guard.is_some(), "Connection is not acquired");
    guard.take();
    Ok(())
  }

  async fn fetch_all(&mut self, query: &SqlQuery) -> Result<Vec<Record>> {
    let compiled = compile(query, ParamStyle::Numeric)?;
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
    let compiled = compile(query, ParamStyle::Numeric)?;
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
    let compiled = compile(query, ParamStyle::Numeric)?;
    let mut guard = self.conn.lock().await;
    let conn = guard.as_mut().expect("Connection is not acquired");
    // run through the row path so a RETURNING value survives; the driver's
    // plain execute would collapse it into a status string
    let row = bind_args(&compiled).fetch_optional(&mut **conn).await?;
    match row {
      Some(row) if row.len() > 0 => decode_column(&row, 0),
      _ => Ok(Value::Null),
    }
  }

  async fn execute_many(&mut self, queries: &[SqlQuery]) -> Result<()> {
    let mut guard = self.conn.lock().await;
    let conn = guard.as_mut().expect("Connection is not acquired");
    // one statement at a time; the driver-side statement cache keeps the
    // prepared statement shared across iterations
    for query in queries {
      let compiled = compile(query, ParamStyle::Numeric)?;
      bind_args(&compiled).execute(&mut **conn).await?;
    }
    Ok(())
  }

  fn stream<'q>(&'q mut self, query: &'q SqlQuery) -> BoxStream<'q, Result<Record>> {
    let conn = Arc::clone(&self.conn);
    let compiled = compile(query, ParamStyle::Numeric);
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
    Box::new(PostgresTransaction {
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

pub struct PostgresTransaction {
  conn: SharedConn,
  is_root: bool,
  savepoint: String,
}

impl PostgresTransaction {
  async fn execute_raw(&self, sql: &str) -> Result<()> {
    use sqlx::Executor;
    let mut guard = self.conn.lock().await;
    let conn = guard.as_mut().expect("Connection is not acquired");
    (&mut **conn).execute(sqlx::raw_sql(sql)).await?;
    Ok(())
  }
}

#[async_trait]
impl TransactionBackend for PostgresTransaction {
  async fn start(&mut self, is_root: bool, options: &TransactionOptions) -> Result<()> {
    self.is_root = is_root;
    if is_root {
      let mut sql = String::from("BEGIN");
      if let Some(isolation) = options.isolation {
        sql.push_str(" ISOLATION LEVEL ");
        sql.push_str(isolation.as_sql());
      }
      if options.read_only {
        sql.push_str(" READ ONLY");
      }
      if options.deferrable {
        sql.push_str(" DEFERRABLE");
      }
      self.execute_raw(&sql).await
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

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>;

fn bind_args(compiled: &CompiledQuery) -> PgQuery<'_> {
  let mut query = sqlx::query(&compiled.sql);
  for value in compiled.args.as_positional() {
    query = bind_value(query, value);
  }
  query
}

fn bind_value<'q>(query: PgQuery<'q>, value: &'q Value) -> PgQuery<'q> {
  match value {
    Value::Null => query.bind(None::<String>),
    Value::Boolean(v) => query.bind(*v),
    Value::Integer(v) => query.bind(*v),
    Value::Float(v) => query.bind(*v),
    Value::Text(v) => query.bind(v.as_str()),
    Value::Bytes(v) => query.bind(v.as_slice()),
    Value::Numeric(v) => query.bind(*v),
    Value::Date(v) => query.bind(*v),
    Value::Time(v) => query.bind(*v),
    Value::DateTime(v) => query.bind(*v),
    Value::TimestampTz(v) => query.bind(*v),
    Value::Uuid(v) => query.bind(*v),
    Value::Json(v) => query.bind(v.clone()),
  }
}

fn row_names(row: &PgRow) -> Vec<String> {
  row.columns().iter().map(|c| c.name().to_string()).collect()
}

fn record_from_row(row: &PgRow, names: Arc<Vec<String>>, maps: Arc<ColumnMaps>) -> Result<Record> {
  let mut values = Vec::with_capacity(row.len());
  for idx in 0..row.len() {
    values.push(decode_column(row, idx)?);
  }
  Ok(Record::new(values, names, maps, DIALECT.native_decoding))
}

fn decode_column(row: &PgRow, idx: usize) -> Result<Value> {
  if row.try_get_raw(idx)?.is_null() {
    return Ok(Value::Null);
  }
  let type_name = row.column(idx).type_info().name().to_uppercase();
  let value = match type_name.as_str() {
    "BOOL" => Value::Boolean(row.try_get(idx)?),
    "INT2" | "SMALLINT" | "SMALLSERIAL" => Value::Integer(i64::from(row.try_get::<i16, _>(idx)?)),
    "INT4" | "INT" | "SERIAL" => Value::Integer(i64::from(row.try_get::<i32, _>(idx)?)),
    "INT8" | "BIGINT" | "BIGSERIAL" => Value::Integer(row.try_get(idx)?),
    "FLOAT4" | "REAL" => Value::Float(f64::from(row.try_get::<f32, _>(idx)?)),
    "FLOAT8" | "DOUBLE PRECISION" => Value::Float(row.try_get(idx)?),
    "NUMERIC" => Value::Numeric(row.try_get(idx)?),
    "TEXT" | "VARCHAR" | "NAME" | "CITEXT" | "BPCHAR" | "CHAR" => {
      Value::Text(row.try_get(idx)?)
    },
    "BYTEA" => Value::Bytes(row.try_get(idx)?),
    "DATE" => Value::Date(row.try_get(idx)?),
    "TIME" => Value::Time(row.try_get(idx)?),
    "TIMESTAMP" => Value::DateTime(row.try_get(idx)?),
    "TIMESTAMPTZ" => Value::TimestampTz(row.try_get(idx)?),
    "UUID" => Value::Uuid(row.try_get(idx)?),
    "JSON" | "JSONB" => Value::Json(row.try_get(idx)?),
    "VOID" => Value::Null,
    // enums and other custom types cast to their text form
    _ => Value::Text(row.try_get_unchecked(idx)?),
  };
  Ok(value)
}
