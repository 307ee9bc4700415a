use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_stream::try_stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use indexmap::IndexMap;
use tokio::sync::Mutex;

use crate::backend::{
  create_backend, ConnectionBackend, DatabaseBackend, DatabaseOptions, QueryDialect,
  TransactionBackend, TransactionOptions,
};
use crate::error::{Error, Result};
use crate::query::SqlQuery;
use crate::record::{ColumnIndex, Record};
use crate::url::DatabaseUrl;
use crate::value::Value;

/// The facade entry point: one of these per database, shared freely.
///
/// A `Database` owns the driver backend and hands out [`Connection`]s. Each
/// tokio task that goes through [`Database::connection`] gets its own
/// connection for the lifetime of the task; cloning a `Connection` into a
/// spawned task instead shares it, which is how child tasks join a parent's
/// transaction.
///
/// ```no_run
/// use aquifer::{Database, SqlQuery};
///
/// # async fn demo() -> aquifer::Result<()> {
/// let db = Database::new("sqlite:///app.db")?;
/// db.connect().await?;
/// let rows = db
///   .fetch_all(SqlQuery::new("SELECT * FROM notes WHERE completed = :done").bind("done", true))
///   .await?;
/// db.disconnect().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Database {
  inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
  url: DatabaseUrl,
  options: DatabaseOptions,
  backend: Box<dyn DatabaseBackend>,
  connected: AtomicBool,
  connections: StdMutex<HashMap<tokio::task::Id, Weak<ConnectionInner>>>,
  global: Mutex<Option<GlobalState>>,
  force_rollback_depth: AtomicUsize,
}

struct GlobalState {
  connection: Connection,
  transaction: Option<Transaction>,
}

impl Database {
  pub fn new(url: impl AsRef<str>) -> Result<Self> {
    Self::with_options(url, DatabaseOptions::default())
  }

  pub fn with_options(url: impl AsRef<str>, options: DatabaseOptions) -> Result<Self> {
    let url = DatabaseUrl::parse(url)?;
    let options = options.merge_url(&url)?;
    let backend = create_backend(&url, &options)?;
    Ok(Self::from_parts(url, options, backend))
  }

  pub(crate) fn from_parts(
    url: DatabaseUrl,
    options: DatabaseOptions,
    backend: Box<dyn DatabaseBackend>,
  ) -> Self {
    Self {
      inner: Arc::new(DatabaseInner {
        url,
        options,
        backend,
        connected: AtomicBool::new(false),
        connections: StdMutex::new(HashMap::new()),
        global: Mutex::new(None),
        force_rollback_depth: AtomicUsize::new(0),
      }),
    }
  }

  pub fn url(&self) -> &DatabaseUrl {
    &self.inner.url
  }

  pub fn options(&self) -> &DatabaseOptions {
    &self.inner.options
  }

  pub fn is_connected(&self) -> bool {
    self.inner.connected.load(Ordering::SeqCst)
  }

  /// Start the driver pool. Calling `connect` on a connected database is a
  /// no-op. In force-rollback mode this also opens the hidden outer
  /// transaction that [`Database::disconnect`] will roll back.
  pub async fn connect(&self) -> Result<()> {
    if self.inner.connected.swap(true, Ordering::SeqCst) {
      return Ok(());
    }
    if let Err(e) = self.inner.backend.connect().await {
      self.inner.connected.store(false, Ordering::SeqCst);
      return Err(e);
    }
    if self.force_rollback_active() {
      self.ensure_global().await?;
    }
    Ok(())
  }

  /// Roll back the hidden transaction (if any), drop the per-task
  /// connections, and close the pool. Idempotent.
  pub async fn disconnect(&self) -> Result<()> {
    if !self.inner.connected.swap(false, Ordering::SeqCst) {
      return Ok(());
    }
    let global = self.inner.global.lock().await.take();
    if let Some(state) = global {
      if let Some(transaction) = state.transaction {
        transaction.rollback().await?;
      }
    }
    self.inner.connections.lock().unwrap().clear();
    self.inner.backend.disconnect().await
  }

  /// The connection bound to the current tokio task, created on first use.
  ///
  /// In force-rollback mode every caller shares the single global
  /// connection. Outside a task (no tokio task id) each call returns a
  /// fresh unbound connection.
  pub async fn connection(&self) -> Result<Connection> {
    if !self.is_connected() {
      return Err(Error::NotConnected);
    }
    if self.force_rollback_active() {
      return self.ensure_global().await;
    }
    let Some(task_id) = tokio::task::try_id() else {
      return self.new_connection();
    };
    {
      let mut map = self.inner.connections.lock().unwrap();
      // reclaim entries of finished tasks
      map.retain(|_, weak| weak.strong_count() > 0);
      if let Some(existing) = map.get(&task_id).and_then(Weak::upgrade) {
        return Ok(Connection { inner: existing });
      }
    }
    let connection = self.new_connection()?;
    self
      .inner
      .connections
      .lock()
      .unwrap()
      .insert(task_id, Arc::downgrade(&connection.inner));
    Ok(connection)
  }

  fn new_connection(&self) -> Result<Connection> {
    Ok(Connection::new(self.inner.backend.connection()?))
  }

  fn force_rollback_active(&self) -> bool {
    self.inner.options.force_rollback
      || self.inner.force_rollback_depth.load(Ordering::SeqCst) > 0
  }

  async fn ensure_global(&self) -> Result<Connection> {
    let mut global = self.inner.global.lock().await;
    if let Some(state) = global.as_ref() {
      return Ok(state.connection.clone());
    }
    let connection = self.new_connection()?;
    let transaction =
      Transaction::begin(connection.clone(), TransactionOptions::default()).await?;
    *global = Some(GlobalState { connection: connection.clone(), transaction: Some(transaction) });
    Ok(connection)
  }

  /// Turn on force-rollback until the returned guard drops. Reentrant: the
  /// mode stays active while any guard is alive. Work done in the mode is
  /// discarded when the database disconnects.
  pub fn force_rollback(&self) -> ForceRollbackGuard {
    self.inner.force_rollback_depth.fetch_add(1, Ordering::SeqCst);
    ForceRollbackGuard { inner: Arc::clone(&self.inner) }
  }

  pub async fn fetch_all(&self, query: impl Into<SqlQuery>) -> Result<Vec<Record>> {
    self.connection().await?.fetch_all(query).await
  }

  pub async fn fetch_one(&self, query: impl Into<SqlQuery>) -> Result<Option<Record>> {
    self.connection().await?.fetch_one(query).await
  }

  pub async fn fetch_val<'a>(
    &self,
    query: impl Into<SqlQuery>,
    column: impl Into<ColumnIndex<'a>>,
  ) -> Result<Value> {
    self.connection().await?.fetch_val(query, column).await
  }

  pub async fn execute(&self, query: impl Into<SqlQuery>) -> Result<Value> {
    self.connection().await?.execute(query).await
  }

  pub async fn execute_many(
    &self,
    query: impl Into<SqlQuery>,
    values: Vec<IndexMap<String, Value>>,
  ) -> Result<()> {
    self.connection().await?.execute_many(query, values).await
  }

  /// Stream records lazily; the connection scope lasts for the stream's
  /// lifetime.
  pub fn iterate(&self, query: impl Into<SqlQuery>) -> BoxStream<'static, Result<Record>> {
    let db = self.clone();
    let query = query.into();
    Box::pin(try_stream! {
      let connection = db.connection().await?;
      let mut rows = connection.iterate(query);
      while let Some(record) = rows.next().await {
        yield record?;
      }
    })
  }

  /// Run `f` inside a transaction on the task's connection: commit on `Ok`,
  /// roll back on `Err`. Each call opens its own transaction, so wrapping a
  /// function body in this is the decorator form.
  pub async fn transaction<F, Fut, T>(&self, f: F) -> Result<T>
  where
    F: FnOnce(Connection) -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    self.connection().await?.transaction(f).await
  }

  pub async fn transaction_with<F, Fut, T>(
    &self,
    options: TransactionOptions,
    force_rollback: bool,
    f: F,
  ) -> Result<T>
  where
    F: FnOnce(Connection) -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    self
      .connection()
      .await?
      .transaction_with(options, force_rollback, f)
      .await
  }

  /// Open a transaction for manual commit/rollback.
  pub async fn begin(&self) -> Result<Transaction> {
    self.connection().await?.begin().await
  }

  pub async fn begin_with(&self, options: TransactionOptions) -> Result<Transaction> {
    self.connection().await?.begin_with(options).await
  }

  #[cfg(test)]
  pub(crate) fn task_connections(&self) -> usize {
    let mut map = self.inner.connections.lock().unwrap();
    map.retain(|_, weak| weak.strong_count() > 0);
    map.len()
  }
}

impl std::fmt::Debug for Database {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Database")
      .field("url", &self.inner.url)
      .field("connected", &self.is_connected())
      .finish_non_exhaustive()
  }
}

/// Scoped force-rollback flag; see [`Database::force_rollback`].
pub struct ForceRollbackGuard {
  inner: Arc<DatabaseInner>,
}

impl Drop for ForceRollbackGuard {
  fn drop(&mut self) {
    self.inner.force_rollback_depth.fetch_sub(1, Ordering::SeqCst);
  }
}

/// A reference-counted logical connection.
///
/// Cloning is cheap and shares the underlying state: the first operation
/// (or open transaction) pulls a raw connection from the pool, the last one
/// to finish returns it. Operations on one `Connection` are serialized.
#[derive(Clone)]
pub struct Connection {
  inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
  backend: Mutex<Box<dyn ConnectionBackend>>,
  dialect: QueryDialect,
  /// Holder count; the lock is held across pool i/o so concurrent enters
  /// cannot observe a half-acquired connection.
  acquire_count: Mutex<usize>,
  stack: Mutex<Vec<TxFrame>>,
  next_frame_id: AtomicU64,
}

struct TxFrame {
  id: u64,
  backend: Box<dyn TransactionBackend>,
}

impl ConnectionInner {
  async fn enter(&self) -> Result<()> {
    let mut count = self.acquire_count.lock().await;
    *count += 1;
    if *count == 1 {
      let acquired = self.backend.lock().await.acquire().await;
      if let Err(e) = acquired {
        *count -= 1;
        return Err(e);
      }
    }
    Ok(())
  }

  async fn exit(&self) -> Result<()> {
    let mut count = self.acquire_count.lock().await;
    assert!(*count > 0, "connection released more times than acquired");
    *count -= 1;
    if *count == 0 {
      self.backend.lock().await.release().await?;
    }
    Ok(())
  }

  async fn force_exit(&self) {
    if let Err(e) = self.exit().await {
      tracing::warn!(error = %e, "deferred connection release failed");
    }
  }

  /// Roll back an abandoned frame and everything stacked on top of it.
  async fn abandon_frame(&self, frame_id: u64) {
    let mut stack = self.stack.lock().await;
    if !stack.iter().any(|frame| frame.id == frame_id) {
      return;
    }
    while let Some(mut frame) = stack.pop() {
      let was_target = frame.id == frame_id;
      if let Err(e) = frame.backend.rollback().await {
        tracing::warn!(error = %e, "rollback of abandoned transaction failed");
      }
      self.force_exit().await;
      if was_target {
        break;
      }
    }
  }
}

/// Balances one `enter` with exactly one `exit`, falling back to a spawned
/// release if the owning future is dropped mid-operation.
struct ConnScope {
  inner: Arc<ConnectionInner>,
  done: bool,
}

impl ConnScope {
  async fn finish(mut self) -> Result<()> {
    self.done = true;
    let inner = Arc::clone(&self.inner);
    inner.exit().await
  }
}

impl Drop for ConnScope {
  fn drop(&mut self) {
    if self.done {
      return;
    }
    let inner = Arc::clone(&self.inner);
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
      handle.spawn(async move { inner.force_exit().await });
    }
  }
}

fn settle<T>(result: Result<T>, finished: Result<()>) -> Result<T> {
  match (result, finished) {
    (Err(e), _) => Err(e),
    (Ok(_), Err(e)) => Err(e),
    (Ok(value), Ok(())) => Ok(value),
  }
}

impl Connection {
  pub(crate) fn new(backend: Box<dyn ConnectionBackend>) -> Self {
    let dialect = backend.dialect();
    Self {
      inner: Arc::new(ConnectionInner {
        backend: Mutex::new(backend),
        dialect,
        acquire_count: Mutex::new(0),
        stack: Mutex::new(Vec::new()),
        next_frame_id: AtomicU64::new(0),
      }),
    }
  }

  pub fn dialect(&self) -> QueryDialect {
    self.inner.dialect
  }

  async fn scope(&self) -> Result<ConnScope> {
    self.inner.enter().await?;
    Ok(ConnScope { inner: Arc::clone(&self.inner), done: false })
  }

  pub async fn fetch_all(&self, query: impl Into<SqlQuery>) -> Result<Vec<Record>> {
    let query = query.into();
    let scope = self.scope().await?;
    let result = self.inner.backend.lock().await.fetch_all(&query).await;
    settle(result, scope.finish().await)
  }

  pub async fn fetch_one(&self, query: impl Into<SqlQuery>) -> Result<Option<Record>> {
    let query = query.into();
    let scope = self.scope().await?;
    let result = self.inner.backend.lock().await.fetch_one(&query).await;
    settle(result, scope.finish().await)
  }

  /// A single value from the first row, or `Null` when there is no row.
  /// Goes through `fetch_one` so result processing applies; a `Null` return
  /// cannot distinguish a missing row from a NULL column.
  pub async fn fetch_val<'a>(
    &self,
    query: impl Into<SqlQuery>,
    column: impl Into<ColumnIndex<'a>>,
  ) -> Result<Value> {
    match self.fetch_one(query).await? {
      Some(record) => record.get(column),
      None => Ok(Value::Null),
    }
  }

  pub async fn execute(&self, query: impl Into<SqlQuery>) -> Result<Value> {
    let query = query.into();
    let scope = self.scope().await?;
    let result = self.inner.backend.lock().await.execute(&query).await;
    settle(result, scope.finish().await)
  }

  /// Run the statement once per value map, on one held connection.
  pub async fn execute_many(
    &self,
    query: impl Into<SqlQuery>,
    values: Vec<IndexMap<String, Value>>,
  ) -> Result<()> {
    let base = query.into();
    let queries: Vec<SqlQuery> = values
      .into_iter()
      .map(|item| base.clone().bind_values(item))
      .collect();
    let scope = self.scope().await?;
    let result = self.inner.backend.lock().await.execute_many(&queries).await;
    settle(result, scope.finish().await)
  }

  /// Stream records lazily. Dropping the stream closes the cursor and
  /// releases the connection scope.
  pub fn iterate(&self, query: impl Into<SqlQuery>) -> BoxStream<'static, Result<Record>> {
    let inner = Arc::clone(&self.inner);
    let query = query.into();
    Box::pin(try_stream! {
      inner.enter().await?;
      let scope = ConnScope { inner: Arc::clone(&inner), done: false };
      {
        let mut backend = inner.backend.lock().await;
        let mut rows = backend.stream(&query);
        while let Some(record) = rows.next().await {
          yield record?;
        }
      }
      scope.finish().await?;
    })
  }

  /// Run `f` inside a transaction: commit on `Ok`, roll back on `Err`.
  pub async fn transaction<F, Fut, T>(&self, f: F) -> Result<T>
  where
    F: FnOnce(Connection) -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    self.transaction_with(TransactionOptions::default(), false, f).await
  }

  /// As [`Connection::transaction`], with driver options for the root frame
  /// and an optional force-rollback override that discards the work even on
  /// success.
  pub async fn transaction_with<F, Fut, T>(
    &self,
    options: TransactionOptions,
    force_rollback: bool,
    f: F,
  ) -> Result<T>
  where
    F: FnOnce(Connection) -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let transaction = Transaction::begin(self.clone(), options).await?;
    match f(self.clone()).await {
      Ok(value) => {
        if force_rollback {
          transaction.rollback().await?;
        } else {
          transaction.commit().await?;
        }
        Ok(value)
      },
      Err(error) => {
        transaction.rollback().await?;
        Err(error)
      },
    }
  }

  /// Open a transaction frame for manual commit/rollback. The outermost
  /// frame begins a real transaction; nested frames are savepoints.
  pub async fn begin(&self) -> Result<Transaction> {
    Transaction::begin(self.clone(), TransactionOptions::default()).await
  }

  pub async fn begin_with(&self, options: TransactionOptions) -> Result<Transaction> {
    Transaction::begin(self.clone(), options).await
  }

  /// Driver escape hatch: run `f` against the concrete backend connection,
  /// downcasting through `Any` (e.g. to `backend::sqlite::SqliteConnection`).
  pub async fn with_raw<F, T>(&self, f: F) -> T
  where
    F: FnOnce(&mut dyn Any) -> T,
  {
    let mut backend = self.inner.backend.lock().await;
    f(backend.as_any())
  }
}

impl std::fmt::Debug for Connection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connection")
      .field("dialect", &self.inner.dialect.name)
      .finish_non_exhaustive()
  }
}

/// An open transaction frame.
///
/// Obtained from [`Connection::begin`] (or [`Database::begin`]); ended with
/// [`Transaction::commit`] or [`Transaction::rollback`], which must be
/// called on the most recent frame of the connection. Dropping an open
/// frame schedules a rollback of it and every frame stacked above it.
#[must_use = "a transaction left to drop is rolled back in the background"]
pub struct Transaction {
  connection: Connection,
  frame_id: u64,
  is_root: bool,
  finished: bool,
}

impl Transaction {
  pub(crate) async fn begin(connection: Connection, options: TransactionOptions) -> Result<Self> {
    let inner = Arc::clone(&connection.inner);
    // the stack lock is held across start so sibling tasks sharing this
    // connection cannot interleave their push
    let mut stack = inner.stack.lock().await;
    let is_root = stack.is_empty();
    inner.enter().await?;
    let mut backend_tx = inner.backend.lock().await.transaction();
    if let Err(e) = backend_tx.start(is_root, &options).await {
      drop(stack);
      inner.force_exit().await;
      return Err(e);
    }
    let frame_id = inner.next_frame_id.fetch_add(1, Ordering::SeqCst);
    stack.push(TxFrame { id: frame_id, backend: backend_tx });
    drop(stack);
    Ok(Self { connection, frame_id, is_root, finished: false })
  }

  pub fn is_root(&self) -> bool {
    self.is_root
  }

  /// Commit this frame (release its savepoint when nested). Panics if a
  /// frame opened after this one is still open.
  pub async fn commit(mut self) -> Result<()> {
    self.finished = true;
    let inner = Arc::clone(&self.connection.inner);
    let mut frame = {
      let mut stack = inner.stack.lock().await;
      let top = stack.last().expect("commit with no open transaction");
      assert!(
        top.id == self.frame_id,
        "transaction is not the most recent frame"
      );
      stack.pop().unwrap()
    };
    frame.backend.commit().await?;
    inner.exit().await
  }

  /// Roll this frame back. Panics if a frame opened after this one is still
  /// open. The connection holder count is released even when the driver
  /// rollback fails.
  pub async fn rollback(mut self) -> Result<()> {
    self.finished = true;
    let inner = Arc::clone(&self.connection.inner);
    let mut frame = {
      let mut stack = inner.stack.lock().await;
      let top = stack.last().expect("rollback with no open transaction");
      assert!(
        top.id == self.frame_id,
        "transaction is not the most recent frame"
      );
      stack.pop().unwrap()
    };
    let result = frame.backend.rollback().await;
    let exited = inner.exit().await;
    result.and(exited)
  }

  /// The connection this frame lives on, for running statements inside it.
  pub fn connection(&self) -> Connection {
    self.connection.clone()
  }
}

impl Drop for Transaction {
  fn drop(&mut self) {
    if self.finished {
      return;
    }
    let inner = Arc::clone(&self.connection.inner);
    let frame_id = self.frame_id;
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
      handle.spawn(async move { inner.abandon_frame(frame_id).await });
    }
  }
}

impl std::fmt::Debug for Transaction {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Transaction")
      .field("is_root", &self.is_root)
      .field("finished", &self.finished)
      .finish_non_exhaustive()
  }
}
