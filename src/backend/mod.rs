use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::stream::BoxStream;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::query::{ParamStyle, SqlQuery};
use crate::record::Record;
use crate::url::DatabaseUrl;
use crate::value::Value;

pub mod mssql;
pub mod mysql;
pub mod postgres;
pub mod sqlite;

/// Static description of the driver a backend speaks.
#[derive(Debug, Clone, Copy)]
pub struct QueryDialect {
  pub name: &'static str,
  pub paramstyle: ParamStyle,
  /// Whether the driver decodes rich types itself. Controls the
  /// primitives-only result-processing rule in [`Record`].
  pub native_decoding: bool,
}

/// Owns the driver pool and mints connections.
#[async_trait]
pub trait DatabaseBackend: Send + Sync {
  /// Bring up the driver pool. The facade guarantees this is called at most
  /// once per connected period; calling it on a running backend is a
  /// programming error.
  async fn connect(&self) -> Result<()>;

  /// Tear the pool down. Outstanding connections drain per driver policy.
  async fn disconnect(&self) -> Result<()>;

  /// Mint a connection handle bound to the pool. Fails with
  /// [`Error::NotConnected`] before `connect`.
  fn connection(&self) -> Result<Box<dyn ConnectionBackend>>;

  fn dialect(&self) -> QueryDialect;
}

/// One logical connection: holds at most one raw driver connection and runs
/// the query verbs against it.
///
/// `acquire`/`release` misuse (double acquire, release without acquire) is a
/// programming error and panics; the reference-counted facade connection is
/// responsible for balancing them.
#[async_trait]
pub trait ConnectionBackend: Send {
  async fn acquire(&mut self) -> Result<()>;

  async fn release(&mut self) -> Result<()>;

  async fn fetch_all(&mut self, query: &SqlQuery) -> Result<Vec<Record>>;

  async fn fetch_one(&mut self, query: &SqlQuery) -> Result<Option<Record>>;

  /// Execute a statement and return the driver's primary-key hint:
  /// `last_insert_id` (mysql), `last_insert_rowid` falling back to the
  /// affected-row count (sqlite), the first column of the first returned row
  /// (postgres `RETURNING`), or the affected-row count (mssql).
  async fn execute(&mut self, query: &SqlQuery) -> Result<Value>;

  /// Execute a batch one statement at a time on the held connection.
  /// Atomicity is whatever the driver gives a plain statement sequence.
  async fn execute_many(&mut self, queries: &[SqlQuery]) -> Result<()>;

  /// Lazily stream records. The underlying cursor lives as long as the
  /// returned stream and is closed when it is dropped.
  fn stream<'q>(&'q mut self, query: &'q SqlQuery) -> BoxStream<'q, Result<Record>>;

  fn transaction(&self) -> Box<dyn TransactionBackend>;

  fn dialect(&self) -> QueryDialect;

  /// Escape hatch: the concrete backend for downcasting to reach the raw
  /// driver connection.
  fn as_any(&mut self) -> &mut dyn Any;
}

/// One transaction frame on a connection: a real transaction when root, a
/// named savepoint otherwise.
#[async_trait]
pub trait TransactionBackend: Send {
  async fn start(&mut self, is_root: bool, options: &TransactionOptions) -> Result<()>;

  async fn commit(&mut self) -> Result<()>;

  async fn rollback(&mut self) -> Result<()>;
}

/// Standard SQL isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
  ReadUncommitted,
  ReadCommitted,
  RepeatableRead,
  Serializable,
}

impl IsolationLevel {
  pub fn as_sql(self) -> &'static str {
    match self {
      IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
      IsolationLevel::ReadCommitted => "READ COMMITTED",
      IsolationLevel::RepeatableRead => "REPEATABLE READ",
      IsolationLevel::Serializable => "SERIALIZABLE",
    }
  }
}

/// Extra driver options consumed at root transaction start; savepoints
/// ignore them.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionOptions {
  pub isolation: Option<IsolationLevel>,
  pub read_only: bool,
  pub deferrable: bool,
}

/// TLS requirement parsed from the `ssl` connection option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SslMode {
  Enabled,
  Disabled,
  /// Postgres accepts the libpq sslmode strings (`verify-full`, ...)
  /// unchanged.
  Custom(String),
}

/// Normalized pool/connection options, merged from URL query parameters and
/// builder overrides (builder wins).
#[derive(Debug, Clone, Default)]
pub struct DatabaseOptions {
  pub force_rollback: bool,
  pub min_size: Option<u32>,
  pub max_size: Option<u32>,
  pub ssl: Option<SslMode>,
  /// Seconds a pooled connection may live before being recycled.
  pub pool_recycle: Option<u64>,
  /// MySQL only.
  pub unix_socket: Option<String>,
  /// Unrecognized options, passed through to the backend unmodified.
  pub extra: IndexMap<String, String>,
}

impl DatabaseOptions {
  pub fn from_url(url: &DatabaseUrl) -> Result<Self> {
    let mut options = DatabaseOptions::default();
    for (key, value) in url.options() {
      match key.as_str() {
        "min_size" => options.min_size = Some(parse_int(key, value)? as u32),
        "max_size" => options.max_size = Some(parse_int(key, value)? as u32),
        "pool_recycle" => options.pool_recycle = Some(parse_int(key, value)?),
        "unix_socket" => options.unix_socket = Some(value.clone()),
        "ssl" => {
          options.ssl = Some(match value.as_str() {
            "true" => SslMode::Enabled,
            "false" => SslMode::Disabled,
            other => SslMode::Custom(other.to_string()),
          })
        },
        _ => {
          options.extra.insert(key.clone(), value.clone());
        },
      }
    }
    Ok(options)
  }

  pub fn force_rollback(mut self, force_rollback: bool) -> Self {
    self.force_rollback = force_rollback;
    self
  }

  pub fn min_size(mut self, min_size: u32) -> Self {
    self.min_size = Some(min_size);
    self
  }

  pub fn max_size(mut self, max_size: u32) -> Self {
    self.max_size = Some(max_size);
    self
  }

  pub fn ssl(mut self, ssl: SslMode) -> Self {
    self.ssl = Some(ssl);
    self
  }

  pub fn pool_recycle(mut self, seconds: u64) -> Self {
    self.pool_recycle = Some(seconds);
    self
  }

  pub fn unix_socket(mut self, path: impl Into<String>) -> Self {
    self.unix_socket = Some(path.into());
    self
  }

  /// URL options override nothing already set explicitly; explicit builder
  /// values win.
  pub(crate) fn merge_url(mut self, url: &DatabaseUrl) -> Result<Self> {
    let from_url = DatabaseOptions::from_url(url)?;
    self.min_size = self.min_size.or(from_url.min_size);
    self.max_size = self.max_size.or(from_url.max_size);
    self.ssl = self.ssl.or(from_url.ssl);
    self.pool_recycle = self.pool_recycle.or(from_url.pool_recycle);
    self.unix_socket = self.unix_socket.or(from_url.unix_socket);
    for (key, value) in from_url.extra {
      self.extra.entry(key).or_insert(value);
    }
    Ok(self)
  }
}

fn parse_int(name: &str, value: &str) -> Result<u64> {
  value.parse::<u64>().map_err(|_| Error::Configuration {
    name: name.to_string(),
    reason: format!("expected an integer, got `{value}`"),
  })
}

/// `SAVEPOINT_` plus a uuid, underscored so it stays a bare identifier.
pub(crate) fn savepoint_name() -> String {
  format!("SAVEPOINT_{}", Uuid::new_v4().to_string().replace('-', "_"))
}

type BackendFactory =
  Arc<dyn Fn(&DatabaseUrl, &DatabaseOptions) -> Result<Box<dyn DatabaseBackend>> + Send + Sync>;

static REGISTRY: Lazy<RwLock<HashMap<String, BackendFactory>>> = Lazy::new(|| {
  let mut map: HashMap<String, BackendFactory> = HashMap::new();
  let postgres: BackendFactory = Arc::new(|url, options| {
    Ok(Box::new(postgres::PostgresBackend::new(url, options)) as Box<dyn DatabaseBackend>)
  });
  map.insert("postgresql".to_string(), Arc::clone(&postgres));
  map.insert("postgres".to_string(), postgres);
  let mysql: BackendFactory = Arc::new(|url, options| {
    Ok(Box::new(mysql::MySqlBackend::new(url, options)) as Box<dyn DatabaseBackend>)
  });
  map.insert("mysql".to_string(), mysql);
  let sqlite: BackendFactory = Arc::new(|url, options| {
    Ok(Box::new(sqlite::SqliteBackend::new(url, options)) as Box<dyn DatabaseBackend>)
  });
  map.insert("sqlite".to_string(), sqlite);
  let mssql: BackendFactory = Arc::new(|url, options| {
    Ok(Box::new(mssql::MssqlBackend::new(url, options)?) as Box<dyn DatabaseBackend>)
  });
  map.insert("mssql".to_string(), mssql);
  RwLock::new(map)
});

/// Register a backend factory for a URL scheme, replacing any existing one.
/// Built-in schemes (`postgresql`, `postgres`, `mysql`, `sqlite`, `mssql`)
/// are pre-registered.
pub fn register_backend(
  scheme: impl Into<String>,
  factory: impl Fn(&DatabaseUrl, &DatabaseOptions) -> Result<Box<dyn DatabaseBackend>>
    + Send
    + Sync
    + 'static,
) {
  let mut registry = REGISTRY.write().expect("backend registry poisoned");
  registry.insert(scheme.into(), Arc::new(factory));
}

/// Resolve a backend for the URL: the full scheme wins over the bare
/// dialect, so a registration for `postgresql+custom` shadows `postgresql`.
pub(crate) fn create_backend(
  url: &DatabaseUrl,
  options: &DatabaseOptions,
) -> Result<Box<dyn DatabaseBackend>> {
  let registry = REGISTRY.read().expect("backend registry poisoned");
  let factory = registry
    .get(url.scheme())
    .or_else(|| registry.get(url.dialect()))
    .ok_or_else(|| Error::UnsupportedScheme(url.scheme().to_string()))?
    .clone();
  drop(registry);
  factory(url, options)
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn test_options_from_url_pool_size() {
    let url = DatabaseUrl::parse("postgres://localhost/database?min_size=1&max_size=20").unwrap();
    let options = DatabaseOptions::from_url(&url).unwrap();
    assert_eq!(options.min_size, Some(1));
    assert_eq!(options.max_size, Some(20));
    assert!(options.extra.is_empty());
  }

  #[test]
  fn test_options_explicit_overrides_url() {
    let url = DatabaseUrl::parse("postgres://localhost/database?min_size=1&max_size=20").unwrap();
    let options = DatabaseOptions::default().min_size(5).merge_url(&url).unwrap();
    assert_eq!(options.min_size, Some(5));
    assert_eq!(options.max_size, Some(20));
  }

  #[test]
  fn test_options_ssl_modes() {
    let url = DatabaseUrl::parse("postgres://localhost/database?ssl=true").unwrap();
    assert_eq!(DatabaseOptions::from_url(&url).unwrap().ssl, Some(SslMode::Enabled));

    let url = DatabaseUrl::parse("postgres://localhost/database?ssl=false").unwrap();
    assert_eq!(DatabaseOptions::from_url(&url).unwrap().ssl, Some(SslMode::Disabled));

    let url = DatabaseUrl::parse("postgres://localhost/database?ssl=verify-full").unwrap();
    assert_eq!(
      DatabaseOptions::from_url(&url).unwrap().ssl,
      Some(SslMode::Custom("verify-full".to_string()))
    );
  }

  #[test]
  fn test_options_pool_recycle_and_socket() {
    let url = DatabaseUrl::parse("mysql://localhost/database?pool_recycle=20").unwrap();
    assert_eq!(DatabaseOptions::from_url(&url).unwrap().pool_recycle, Some(20));

    let url = DatabaseUrl::parse(
      "mysql://username:password@/testsuite?unix_socket=/tmp/mysqld/mysqld.sock",
    )
    .unwrap();
    assert_eq!(
      DatabaseOptions::from_url(&url).unwrap().unix_socket.as_deref(),
      Some("/tmp/mysqld/mysqld.sock")
    );
  }

  #[test]
  fn test_options_unknown_pass_through() {
    let url = DatabaseUrl::parse(
      "mssql://sa:pw@localhost/db?driver=ODBC+Driver+17&trusted_connection=false",
    )
    .unwrap();
    let options = DatabaseOptions::from_url(&url).unwrap();
    assert_eq!(options.extra.get("driver").map(String::as_str), Some("ODBC+Driver+17"));
    assert_eq!(
      options.extra.get("trusted_connection").map(String::as_str),
      Some("false")
    );
  }

  #[test]
  fn test_options_bad_integer() {
    let url = DatabaseUrl::parse("postgres://localhost/database?min_size=many").unwrap();
    assert!(matches!(
      DatabaseOptions::from_url(&url),
      Err(Error::Configuration { .. })
    ));
  }

  #[test]
  fn test_savepoint_names_unique_and_bare() {
    let a = savepoint_name();
    let b = savepoint_name();
    assert_ne!(a, b);
    assert!(a.starts_with("SAVEPOINT_"));
    assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
  }

  #[test]
  fn test_registry_unknown_scheme() {
    let url = DatabaseUrl::parse("oracle://localhost/db").unwrap();
    let err = create_backend(&url, &DatabaseOptions::default()).unwrap_err();
    assert!(matches!(err, Error::UnsupportedScheme(s) if s == "oracle"));
  }

  #[test]
  fn test_registry_dialect_fallback() {
    // `postgresql+asyncpg` resolves through the bare dialect entry
    let url = DatabaseUrl::parse("postgresql+asyncpg://localhost/db").unwrap();
    assert!(create_backend(&url, &DatabaseOptions::default()).is_ok());
  }
}
