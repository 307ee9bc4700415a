use std::any::Any;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use rust_decimal::Decimal;
use sqlx::mysql::{MySql, MySqlConnectOptions, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::pool::PoolConnection;
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
  name: "mysql",
  paramstyle: ParamStyle::QMark,
  native_decoding: false,
};

type SharedConn = Arc<Mutex<Option<PoolConnection<MySql>>>>;

pub struct MySqlBackend {
  url: DatabaseUrl,
  options: DatabaseOptions,
  pool: StdMutex<Option<sqlx::Pool<MySql>>>,
}

impl MySqlBackend {
  pub fn new(url: &DatabaseUrl, options: &DatabaseOptions) -> Self {
    Self { url: url.clone(), options: options.clone(), pool: StdMutex::new(None) }
  }

  fn connect_options(&self) -> Result<MySqlConnectOptions> {
    let mut opts = MySqlConnectOptions::new();
    if let Some(socket) = &self.options.unix_socket {
      opts = opts.socket(socket);
    } else if let Some(host) = self.url.hostname() {
      opts = opts.host(host);
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
      opts = opts.ssl_mode(mysql_ssl_mode(ssl)?);
    }
    Ok(opts)
  }
}

fn mysql_ssl_mode(ssl: &SslMode) -> Result<MySqlSslMode> {
  Ok(match ssl {
    SslMode::Enabled => MySqlSslMode::Required,
    SslMode::Disabled => MySqlSslMode::Disabled,
    SslMode::Custom(mode) => match mode.as_str() {
      "disabled" => MySqlSslMode::Disabled,
      "preferred" => MySqlSslMode::Preferred,
      "required" => MySqlSslMode::Required,
      "verify_ca" | "verify-ca" => MySqlSslMode::VerifyCa,
      "verify_identity" | "verify-identity" => MySqlSslMode::VerifyIdentity,
      other => {
        return Err(Error::Configuration {
          name: "ssl".to_string(),
          reason: format!("unknown ssl mode `{other}`"),
        })
      },
    },
  })
}

#[async_trait]
impl DatabaseBackend for MySqlBackend {
  async fn connect(&self) -> Result<()> {
    assert!(
      self.pool.lock().unwrap().is_none(),
      "DatabaseBackend is already running"
    );
    let mut pool_options = MySqlPoolOptions::new();
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
    tracing::debug!(url = ?self.url, "mysql pool started");
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
    tracing::debug!(url = ?self.url, "mysql pool closed");
    Ok(())
  }

  fn connection(&self) -> Result<Box<dyn ConnectionBackend>> {
    let pool = self.pool.lock().unwrap().clone().ok_or(Error::NotConnected)?;
    Ok(Box::new(MySqlConnection { pool, conn: Arc::new(Mutex::new(None)) }))
  }

  fn dialect(&self) -> QueryDialect {
    DIALECT
  }
}

pub struct MySqlConnection {
  pool: sqlx::Pool<MySql>,
  conn: SharedConn,
}

impl MySqlConnection {
  /// The held raw connection, for callers that downcast through `as_any`.
  pub fn raw(&self) -> SharedConn {
    Arc::clone(&self.conn)
  }
}

#[async_trait]
impl ConnectionBackend for MySqlConnection {
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
    Ok(Value::Integer(result.last_insert_id() as i64))
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
    Box::new(MySqlTransaction {
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

pub struct MySqlTransaction {
  conn: SharedConn,
  is_root: bool,
  savepoint: String,
}

impl MySqlTransaction {
  async fn execute_raw(&self, sql: &str) -> Result<()> {
    use sqlx::Executor;
    let mut guard = self.conn.lock().await;
    let conn = guard.as_mut().expect("Connection is not acquired");
    (&mut **conn).execute(sqlx::raw_sql(sql)).await?;
    Ok(())
  }
}

#[async_trait]
impl TransactionBackend for MySqlTransaction {
  async fn start(&mut self, is_root: bool, options: &TransactionOptions) -> Result<()> {
    self.is_root = is_root;
    if is_root {
      // SET TRANSACTION applies to the next transaction, so it goes first
      if let Some(isolation) = options.isolation {
        self
          .execute_raw(&format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.as_sql()))
          .await?;
      }
      if options.read_only {
        self.execute_raw("START TRANSACTION READ ONLY").await
      } else {
        self.execute_raw("BEGIN").await
      }
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

type MySqlQuery<'q> = sqlx::query::Query<'q, MySql, sqlx::mysql::MySqlArguments>;

fn bind_args(compiled: &CompiledQuery) -> MySqlQuery<'_> {
  let mut query = sqlx::query(&compiled.sql);
  for value in compiled.args.as_positional() {
    query = bind_value(query, value);
  }
  query
}

fn bind_value<'q>(query: MySqlQuery<'q>, value: &'q Value) -> MySqlQuery<'q> {
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

fn row_names(row: &MySqlRow) -> Vec<String> {
  row.columns().iter().map(|c| c.name().to_string()).collect()
}

fn record_from_row(
  row: &MySqlRow,
  names: Arc<Vec<String>>,
  maps: Arc<ColumnMaps>,
) -> Result<Record> {
  let mut values = Vec::with_capacity(row.len());
  for idx in 0..row.len() {
    values.push(decode_column(row, idx)?);
  }
  Ok(Record::new(values, names, maps, DIALECT.native_decoding))
}

fn decode_column(row: &MySqlRow, idx: usize) -> Result<Value> {
  if row.try_get_raw(idx)?.is_null() {
    return Ok(Value::Null);
  }
  let type_name = row.column(idx).type_info().name().to_uppercase();
  let value = match type_name.as_str() {
    "BOOLEAN" => Value::Boolean(row.try_get(idx)?),
    "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
      Value::Integer(row.try_get(idx)?)
    },
    "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
    | "BIGINT UNSIGNED" | "BIT" => {
      let v = row.try_get::<u64, _>(idx)?;
      match i64::try_from(v) {
        Ok(v) => Value::Integer(v),
        Err(_) => Value::Numeric(Decimal::from(v)),
      }
    },
    "FLOAT" => Value::Float(f64::from(row.try_get::<f32, _>(idx)?)),
    "DOUBLE" => Value::Float(row.try_get(idx)?),
    "DECIMAL" => Value::Numeric(row.try_get(idx)?),
    "CHAR" | "VARCHAR" | "TEXT" | "TINYTEXT" | "MEDIUMTEXT" | "LONGTEXT" | "ENUM" | "SET" => {
      Value::Text(row.try_get(idx)?)
    },
    "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" => {
      Value::Bytes(row.try_get(idx)?)
    },
    "DATE" => Value::Date(row.try_get(idx)?),
    "TIME" => Value::Time(row.try_get(idx)?),
    "DATETIME" => Value::DateTime(row.try_get(idx)?),
    "TIMESTAMP" => Value::TimestampTz(row.try_get(idx)?),
    "JSON" => Value::Json(row.try_get(idx)?),
    _ => Value::Text(row.try_get_unchecked(idx)?),
  };
  Ok(value)
}
