use std::any::Any;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use deadpool::managed::{Manager, Metrics, Object, Pool, RecycleError, RecycleResult};
use futures::stream::BoxStream;
use futures::TryStreamExt;
use rust_decimal::Decimal;
use tiberius::numeric::Numeric as TdsNumeric;
use tiberius::{AuthMethod, Client, ColumnType as TdsType, Config, EncryptionLevel, Query as TdsQuery, Row as TdsRow};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use uuid::Uuid;

use super::{
  ConnectionBackend, DatabaseBackend, DatabaseOptions, QueryDialect, SslMode, TransactionBackend,
  TransactionOptions,
};
use crate::error::{Error, Result};
use crate::query::{compile, CompiledQuery, ParamStyle, SqlQuery};
use crate::record::{ColumnMaps, Record};
use crate::url::DatabaseUrl;
use crate::value::Value;

const DIALECT: QueryDialect = QueryDialect {
  name: "mssql",
  paramstyle: ParamStyle::AtNumbered,
  native_decoding: false,
};

type TdsClient = Client<Compat<TcpStream>>;
type SharedConn = Arc<Mutex<Option<Object<MssqlManager>>>>;

pub struct MssqlManager {
  config: Config,
  recycle_after: Option<Duration>,
}

impl Manager for MssqlManager {
  type Type = TdsClient;
  type Error = Error;

  async fn create(&self) -> Result<TdsClient> {
    let tcp = TcpStream::connect(self.config.get_addr()).await?;
    tcp.set_nodelay(true)?;
    let client = Client::connect(self.config.clone(), tcp.compat_write()).await?;
    Ok(client)
  }

  async fn recycle(&self, client: &mut TdsClient, metrics: &Metrics) -> RecycleResult<Error> {
    if let Some(recycle_after) = self.recycle_after {
      if metrics.created.elapsed() > recycle_after {
        return Err(RecycleError::Message("connection exceeded pool_recycle age".into()));
      }
    }
    match client.simple_query("SELECT 1").await {
      Ok(stream) => match stream.into_results().await {
        Ok(_) => Ok(()),
        Err(e) => Err(RecycleError::Backend(e.into())),
      },
      Err(e) => Err(RecycleError::Backend(e.into())),
    }
  }
}

pub struct MssqlBackend {
  url: DatabaseUrl,
  options: DatabaseOptions,
  config: Config,
  pool: StdMutex<Option<Pool<MssqlManager>>>,
}

impl MssqlBackend {
  pub fn new(url: &DatabaseUrl, options: &DatabaseOptions) -> Result<Self> {
    let config = Self::build_config(url, options)?;
    Ok(Self {
      url: url.clone(),
      options: options.clone(),
      config,
      pool: StdMutex::new(None),
    })
  }

  fn build_config(url: &DatabaseUrl, options: &DatabaseOptions) -> Result<Config> {
    let mut config = Config::new();
    if let Some(host) = url.hostname() {
      config.host(host);
    }
    if let Some(port) = url.port() {
      config.port(port);
    }
    if !url.database().is_empty() {
      config.database(url.database());
    }

    if options.extra.get("trusted_connection").map(String::as_str) == Some("true") {
      return Err(Error::Configuration {
        name: "trusted_connection".to_string(),
        reason: "windows integrated authentication is not available".to_string(),
      });
    }
    config.authentication(AuthMethod::sql_server(
      url.username().unwrap_or_default(),
      url.password().unwrap_or_default(),
    ));

    match &options.ssl {
      Some(SslMode::Enabled) => config.encryption(EncryptionLevel::Required),
      Some(SslMode::Disabled) => config.encryption(EncryptionLevel::NotSupported),
      Some(SslMode::Custom(mode)) => {
        return Err(Error::Configuration {
          name: "ssl".to_string(),
          reason: format!("unknown ssl mode `{mode}`"),
        })
      },
      None => {},
    }
    match options.extra.get("encrypt").map(String::as_str) {
      Some("true") => config.encryption(EncryptionLevel::Required),
      Some("false") => config.encryption(EncryptionLevel::NotSupported),
      _ => {},
    }
    if options.extra.get("trust_cert").map(String::as_str) == Some("true") {
      config.trust_cert();
    }
    // `driver` is accepted for odbc-url compatibility and has no meaning here
    Ok(config)
  }
}

#[async_trait]
impl DatabaseBackend for MssqlBackend {
  async fn connect(&self) -> Result<()> {
    assert!(
      self.pool.lock().unwrap().is_none(),
      "DatabaseBackend is already running"
    );
    let manager = MssqlManager {
      config: self.config.clone(),
      recycle_after: self.options.pool_recycle.map(Duration::from_secs),
    };
    let mut builder = Pool::builder(manager);
    if let Some(max_size) = self.options.max_size {
      builder = builder.max_size(max_size as usize);
    }
    let pool = builder.build().map_err(|e| Error::MssqlPool(e.to_string()))?;
    tracing::debug!(url = ?self.url, "mssql pool started");
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
    pool.close();
    tracing::debug!(url = ?self.url, "mssql pool closed");
    Ok(())
  }

  fn connection(&self) -> Result<Box<dyn ConnectionBackend>> {
    let pool = self.pool.lock().unwrap().clone().ok_or(Error::NotConnected)?;
    Ok(Box::new(MssqlConnection { pool, conn: Arc::new(Mutex::new(None)) }))
  }

  fn dialect(&self) -> QueryDialect {
    DIALECT
  }
}

pub struct MssqlConnection {
  pool: Pool<MssqlManager>,
  conn: SharedConn,
}

impl MssqlConnection {
  /// The held raw connection, for callers that downcast through `as_any`.
  pub fn raw(&self) -> SharedConn {
    Arc::clone(&self.conn)
  }
}

#[async_trait]
impl ConnectionBackend for MssqlConnection {
  async fn acquire(&mut self) -> Result<()> {
    let mut guard = self.conn.lock().await;
    assert!(guard.is_none(), "Connection is already acquired");
    *guard = Some(self.pool.get().await.map_err(Error::from)?);
    Ok(())
  }

  async fn release(&mut self) -> Result<()> {
    let mut guard = self.conn.lock().await;
    assert!(guard.is_some(), "Connection is not acquired");
    guard.take();
    Ok(())
  }

  async fn fetch_all(&mut self, query: &SqlQuery) -> Result<Vec<Record>> {
    let compiled = compile(query, ParamStyle::AtNumbered)?;
    let maps = ColumnMaps::from_columns(&compiled.result_columns);
    let mut guard = self.conn.lock().await;
    let client = guard.as_mut().expect("Connection is not acquired");
    let stream = build_query(&compiled).query(&mut **client).await?;
    let rows = stream.into_first_result().await?;
    let names = Arc::new(rows.first().map(row_names).unwrap_or_default());
    rows
      .iter()
      .map(|row| record_from_row(row, Arc::clone(&names), Arc::clone(&maps)))
      .collect()
  }

  async fn fetch_one(&mut self, query: &SqlQuery) -> Result<Option<Record>> {
    let compiled = compile(query, ParamStyle::AtNumbered)?;
    let maps = ColumnMaps::from_columns(&compiled.result_columns);
    let mut guard = self.conn.lock().await;
    let client = guard.as_mut().expect("Connection is not acquired");
    let stream = build_query(&compiled).query(&mut **client).await?;
    let row = stream.into_row().await?;
    match row {
      Some(row) => {
        let names = Arc::new(row_names(&row));
        Ok(Some(record_from_row(&row, names, maps)?))
      },
      None => Ok(None),
    }
  }

  async fn execute(&mut self, query: &SqlQuery) -> Result<Value> {
    let compiled = compile(query, ParamStyle::AtNumbered)?;
    let mut guard = self.conn.lock().await;
    let client = guard.as_mut().expect("Connection is not acquired");
    let result = build_query(&compiled).execute(&mut **client).await?;
    // tds has no rowid hint; report affected rows
    Ok(Value::Integer(result.rows_affected().iter().sum::<u64>() as i64))
  }

  async fn execute_many(&mut self, queries: &[SqlQuery]) -> Result<()> {
    let mut guard = self.conn.lock().await;
    let client = guard.as_mut().expect("Connection is not acquired");
    for query in queries {
      let compiled = compile(query, ParamStyle::AtNumbered)?;
      build_query(&compiled).execute(&mut **client).await?;
    }
    Ok(())
  }

  fn stream<'q>(&'q mut self, query: &'q SqlQuery) -> BoxStream<'q, Result<Record>> {
    let conn = Arc::clone(&self.conn);
    let compiled = compile(query, ParamStyle::AtNumbered);
    Box::pin(try_stream! {
      let compiled = compiled?;
      let maps = ColumnMaps::from_columns(&compiled.result_columns);
      let mut guard = conn.lock().await;
      let client = guard.as_mut().expect("Connection is not acquired");
      let stream = build_query(&compiled).query(&mut **client).await?;
      let mut rows = stream.into_row_stream();
      let mut names: Option<Arc<Vec<String>>> = None;
      while let Some(row) = rows.try_next().await? {
        let names = names.get_or_insert_with(|| Arc::new(row_names(&row)));
        yield record_from_row(&row, Arc::clone(names), Arc::clone(&maps))?;
      }
    })
  }

  fn transaction(&self) -> Box<dyn TransactionBackend> {
    Box::new(MssqlTransaction {
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

pub struct MssqlTransaction {
  conn: SharedConn,
  is_root: bool,
  savepoint: String,
}

impl MssqlTransaction {
  async fn execute_raw(&self, sql: &str) -> Result<()> {
    let mut guard = self.conn.lock().await;
    let client = guard.as_mut().expect("Connection is not acquired");
    client.execute(sql.to_string(), &[]).await?;
    Ok(())
  }
}

#[async_trait]
impl TransactionBackend for MssqlTransaction {
  async fn start(&mut self, is_root: bool, options: &TransactionOptions) -> Result<()> {
    self.is_root = is_root;
    if is_root {
      if let Some(isolation) = options.isolation {
        self
          .execute_raw(&format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.as_sql()))
          .await?;
      }
      self.execute_raw("BEGIN TRANSACTION").await
    } else {
      // savepoint identifiers cap at 32 chars; 12 uuid chars keep the name
      // unique enough within one transaction stack
      let id = Uuid::new_v4().simple().to_string();
      self.savepoint = format!("SAVEPOINT_{}", &id[..12]);
      self.execute_raw(&format!("SAVE TRANSACTION {}", self.savepoint)).await
    }
  }

  async fn commit(&mut self) -> Result<()> {
    if self.is_root {
      self.execute_raw("COMMIT TRANSACTION").await
    } else {
      self
        .execute_raw(&format!("COMMIT TRANSACTION {}", self.savepoint))
        .await
    }
  }

  async fn rollback(&mut self) -> Result<()> {
    if self.is_root {
      // the extra BEGIN keeps @@TRANCOUNT balanced on drivers that have
      // already closed the outer frame; ROLLBACK then unwinds everything
      self.execute_raw("BEGIN TRANSACTION").await?;
      self.execute_raw("ROLLBACK TRANSACTION").await
    } else {
      self
        .execute_raw(&format!("ROLLBACK TRANSACTION {}", self.savepoint))
        .await
    }
  }
}

fn decimal_to_tds_numeric(v: &Decimal) -> TdsNumeric {
  let unpacked = v.unpack();
  let mut value = (((unpacked.hi as u128) << 64) + ((unpacked.mid as u128) << 32) + unpacked.lo as u128) as i128;
  if v.is_sign_negative() {
    value = -value;
  }
  TdsNumeric::new_with_scale(value, v.scale() as u8)
}

fn build_query(compiled: &CompiledQuery) -> TdsQuery<'static> {
  let mut query = TdsQuery::new(compiled.sql.clone());
  for value in compiled.args.as_positional() {
    match value {
      Value::Null => query.bind(Option::<&str>::None),
      Value::Boolean(v) => query.bind(*v),
      Value::Integer(v) => query.bind(*v),
      Value::Float(v) => query.bind(*v),
      Value::Text(v) => query.bind(v.clone()),
      Value::Bytes(v) => query.bind(v.clone()),
      Value::Numeric(v) => query.bind(decimal_to_tds_numeric(v)),
      Value::Date(v) => query.bind(*v),
      Value::Time(v) => query.bind(*v),
      Value::DateTime(v) => query.bind(*v),
      Value::TimestampTz(v) => query.bind(*v),
      Value::Uuid(v) => query.bind(*v),
      // no json wire type; travels as nvarchar
      Value::Json(v) => query.bind(v.to_string()),
    }
  }
  query
}

fn row_names(row: &TdsRow) -> Vec<String> {
  row.columns().iter().map(|c| c.name().to_string()).collect()
}

fn record_from_row(row: &TdsRow, names: Arc<Vec<String>>, maps: Arc<ColumnMaps>) -> Result<Record> {
  let types: Vec<TdsType> = row.columns().iter().map(|c| c.column_type()).collect();
  let mut values = Vec::with_capacity(types.len());
  for (idx, column_type) in types.iter().enumerate() {
    values.push(decode_column(row, idx, *column_type)?);
  }
  Ok(Record::new(values, names, maps, DIALECT.native_decoding))
}

fn decode_column(row: &TdsRow, idx: usize, column_type: TdsType) -> Result<Value> {
  let value = match column_type {
    TdsType::Null => Value::Null,
    TdsType::Bit | TdsType::Bitn => opt(row.try_get::<bool, _>(idx)?, Value::Boolean),
    TdsType::Int1 => opt(row.try_get::<u8, _>(idx)?, |v| Value::Integer(i64::from(v))),
    TdsType::Int2 => opt(row.try_get::<i16, _>(idx)?, |v| Value::Integer(i64::from(v))),
    TdsType::Int4 => opt(row.try_get::<i32, _>(idx)?, |v| Value::Integer(i64::from(v))),
    TdsType::Int8 => opt(row.try_get::<i64, _>(idx)?, Value::Integer),
    TdsType::Intn => decode_intn(row, idx)?,
    TdsType::Float4 => opt(row.try_get::<f32, _>(idx)?, |v| Value::Float(f64::from(v))),
    TdsType::Float8 => opt(row.try_get::<f64, _>(idx)?, Value::Float),
    TdsType::Floatn => decode_floatn(row, idx)?,
    TdsType::Decimaln | TdsType::Numericn => {
      opt(row.try_get::<Decimal, _>(idx)?, Value::Numeric)
    },
    TdsType::Money | TdsType::Money4 => opt(row.try_get::<f64, _>(idx)?, Value::Float),
    TdsType::Guid => opt(row.try_get::<Uuid, _>(idx)?, Value::Uuid),
    TdsType::NVarchar | TdsType::NChar | TdsType::BigVarChar | TdsType::BigChar | TdsType::Text
    | TdsType::NText | TdsType::Xml => {
      opt(row.try_get::<&str, _>(idx)?, |v| Value::Text(v.to_string()))
    },
    TdsType::BigVarBin | TdsType::BigBinary | TdsType::Image => {
      opt(row.try_get::<&[u8], _>(idx)?, |v| Value::Bytes(v.to_vec()))
    },
    TdsType::Daten => opt(row.try_get::<chrono::NaiveDate, _>(idx)?, Value::Date),
    TdsType::Timen => opt(row.try_get::<chrono::NaiveTime, _>(idx)?, Value::Time),
    TdsType::Datetime | TdsType::Datetime4 | TdsType::Datetimen | TdsType::Datetime2 => {
      opt(row.try_get::<chrono::NaiveDateTime, _>(idx)?, Value::DateTime)
    },
    TdsType::DatetimeOffsetn => {
      opt(row.try_get::<chrono::DateTime<chrono::Utc>, _>(idx)?, Value::TimestampTz)
    },
    _ => opt(row.try_get::<&str, _>(idx)?, |v| Value::Text(v.to_string())),
  };
  Ok(value)
}

// `Intn`/`Floatn` columns carry whatever width the row actually stored.
fn decode_intn(row: &TdsRow, idx: usize) -> Result<Value> {
  if let Ok(v) = row.try_get::<i64, _>(idx) {
    return Ok(opt(v, Value::Integer));
  }
  if let Ok(v) = row.try_get::<i32, _>(idx) {
    return Ok(opt(v, |v| Value::Integer(i64::from(v))));
  }
  if let Ok(v) = row.try_get::<i16, _>(idx) {
    return Ok(opt(v, |v| Value::Integer(i64::from(v))));
  }
  let v = row.try_get::<u8, _>(idx)?;
  Ok(opt(v, |v| Value::Integer(i64::from(v))))
}

fn decode_floatn(row: &TdsRow, idx: usize) -> Result<Value> {
  if let Ok(v) = row.try_get::<f64, _>(idx) {
    return Ok(opt(v, Value::Float));
  }
  let v = row.try_get::<f32, _>(idx)?;
  Ok(opt(v, |v| Value::Float(f64::from(v))))
}

fn opt<T>(value: Option<T>, f: impl FnOnce(T) -> Value) -> Value {
  match value {
    Some(v) => f(v),
    None => Value::Null,
  }
}
