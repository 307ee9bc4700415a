/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the facade.
///
/// Driver errors pass through unwrapped so callers can match on the
/// underlying `sqlx::Error` (or `tiberius::error::Error` for mssql) exactly
/// as they would when using the driver directly. Misuse of the facade itself
/// (releasing an unacquired connection, committing a non-top transaction
/// frame) is treated as a programming error and panics instead of returning
/// one of these variants.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
  #[error("unsupported database scheme `{0}`")]
  UnsupportedScheme(String),

  #[error("invalid database url: {0}")]
  InvalidUrl(String),

  #[error("database is not connected")]
  NotConnected,

  #[error(transparent)]
  Driver(#[from] sqlx::Error),

  #[error(transparent)]
  Mssql(#[from] tiberius::error::Error),

  #[error("mssql pool error: {0}")]
  MssqlPool(String),

  #[error(transparent)]
  Io(#[from] std::io::Error),

  #[error("no value bound for parameter `:{0}`")]
  MissingParameter(String),

  #[error("no such column: {0}")]
  NoSuchColumn(String),

  #[error("cannot decode `{column}` as {expected}, row holds {found}")]
  Decode {
    column: String,
    expected: &'static str,
    found: String,
  },

  #[error("invalid connection option `{name}`: {reason}")]
  Configuration { name: String, reason: String },
}

impl Error {
  pub(crate) fn decode(expected: &'static str, found: impl Into<String>) -> Self {
    Error::Decode { column: String::new(), expected, found: found.into() }
  }

  pub(crate) fn with_column(self, column: &str) -> Self {
    match self {
      Error::Decode { expected, found, .. } => {
        Error::Decode { column: column.to_string(), expected, found }
      },
      other => other,
    }
  }
}

impl From<deadpool::managed::PoolError<Error>> for Error {
  fn from(err: deadpool::managed::PoolError<Error>) -> Self {
    match err {
      deadpool::managed::PoolError::Backend(inner) => inner,
      other => Error::MssqlPool(other.to_string()),
    }
  }
}
