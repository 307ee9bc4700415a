use aquifer::{
  ColumnType, Database, DatabaseOptions, Error, ResultColumn, SqlQuery, Value,
};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use futures::StreamExt;
use indexmap::IndexMap;
use pretty_assertions::assert_eq;
use rust_decimal::Decimal;

fn url_for(dir: &tempfile::TempDir) -> String {
  format!("sqlite:///{}", dir.path().join("test.sqlite").display())
}

async fn setup() -> (Database, tempfile::TempDir) {
  let dir = tempfile::tempdir().unwrap();
  let db = Database::new(url_for(&dir)).unwrap();
  db.connect().await.unwrap();
  db.execute(
    "CREATE TABLE notes (id INTEGER PRIMARY KEY AUTOINCREMENT, text TEXT, completed BOOLEAN)",
  )
  .await
  .unwrap();
  (db, dir)
}

fn insert_note(text: &str, completed: bool) -> SqlQuery {
  SqlQuery::new("INSERT INTO notes (text, completed) VALUES (:text, :completed)")
    .bind("text", text)
    .bind("completed", completed)
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sqlite_basic_crud() {
  let (db, _dir) = setup().await;

  db.execute(insert_note("a", true)).await.unwrap();
  db.execute_many(
    "INSERT INTO notes (text, completed) VALUES (:text, :completed)",
    vec![
      IndexMap::from([
        ("text".to_string(), Value::Text("b".into())),
        ("completed".to_string(), Value::Boolean(false)),
      ]),
      IndexMap::from([
        ("text".to_string(), Value::Text("c".into())),
        ("completed".to_string(), Value::Boolean(true)),
      ]),
    ],
  )
  .await
  .unwrap();

  let rows = db.fetch_all("SELECT * FROM notes").await.unwrap();
  assert_eq!(rows.len(), 3);
  let texts: Vec<Value> = rows.iter().map(|r| r.get("text").unwrap()).collect();
  assert_eq!(
    texts,
    vec![Value::Text("a".into()), Value::Text("b".into()), Value::Text("c".into())]
  );
  assert_eq!(rows[0].get("completed").unwrap(), Value::Boolean(true));
  assert_eq!(rows[1].get("completed").unwrap(), Value::Boolean(false));

  db.disconnect().await.unwrap();
}

#[tokio::test]
async fn sqlite_execute_returns_rowid() {
  let (db, _dir) = setup().await;
  let first = db.execute(insert_note("a", false)).await.unwrap();
  let second = db.execute(insert_note("b", false)).await.unwrap();
  assert_eq!(first, Value::Integer(1));
  assert_eq!(second, Value::Integer(2));
  db.disconnect().await.unwrap();
}

#[tokio::test]
async fn sqlite_fetch_one_and_val() {
  let (db, _dir) = setup().await;
  db.execute(insert_note("only", true)).await.unwrap();

  let row = db
    .fetch_one(SqlQuery::new("SELECT * FROM notes WHERE text = :text").bind("text", "only"))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(row.get("completed").unwrap(), Value::Boolean(true));

  let missing = db
    .fetch_one(SqlQuery::new("SELECT * FROM notes WHERE text = :text").bind("text", "absent"))
    .await
    .unwrap();
  assert!(missing.is_none());

  let value = db
    .fetch_val(SqlQuery::new("SELECT text FROM notes WHERE id = :id").bind("id", 1_i64), 0_usize)
    .await
    .unwrap();
  assert_eq!(value, Value::Text("only".into()));

  // both a missing row and a NULL column come back as Null
  let empty = db
    .fetch_val(SqlQuery::new("SELECT text FROM notes WHERE id = :id").bind("id", 99_i64), 0_usize)
    .await
    .unwrap();
  assert_eq!(empty, Value::Null);

  db.disconnect().await.unwrap();
}

#[tokio::test]
async fn sqlite_iterate_streams_lazily() {
  let (db, _dir) = setup().await;
  for i in 0..5 {
    db.execute(insert_note(&format!("note {i}"), false)).await.unwrap();
  }

  let mut rows = db.iterate("SELECT text FROM notes");
  let mut seen = Vec::new();
  while let Some(row) = rows.next().await {
    seen.push(row.unwrap().get("text").unwrap());
  }
  assert_eq!(seen.len(), 5);
  assert_eq!(seen[0], Value::Text("note 0".into()));

  // dropping a half-consumed stream releases the connection for new work
  let mut rows = db.iterate("SELECT text FROM notes");
  let _ = rows.next().await;
  drop(rows);
  db.execute(insert_note("after", true)).await.unwrap();

  db.disconnect().await.unwrap();
}

#[tokio::test]
async fn sqlite_duplicate_column_names() {
  let (db, _dir) = setup().await;
  db.execute(insert_note("x", false)).await.unwrap();
  let row = db
    .fetch_one("SELECT text, text FROM notes")
    .await
    .unwrap()
    .unwrap();
  assert_eq!(row.len(), 2);
  assert_eq!(row.get(0_usize).unwrap(), Value::Text("x".into()));
  assert_eq!(row.get(1_usize).unwrap(), Value::Text("x".into()));
  assert_eq!(row.keys().collect::<Vec<_>>(), vec!["text", "text"]);
  db.disconnect().await.unwrap();
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sqlite_nested_savepoint_rollback() {
  let (db, _dir) = setup().await;
  let conn = db.connection().await.unwrap();

  let outer = conn.begin().await.unwrap();
  conn.execute(insert_note("A", false)).await.unwrap();
  let inner = conn.begin().await.unwrap();
  conn.execute(insert_note("B", false)).await.unwrap();
  inner.rollback().await.unwrap();
  outer.commit().await.unwrap();

  let rows = db.fetch_all("SELECT text FROM notes").await.unwrap();
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0].get("text").unwrap(), Value::Text("A".into()));
  db.disconnect().await.unwrap();
}

#[tokio::test]
async fn sqlite_closure_transaction_commit_and_rollback() {
  let (db, _dir) = setup().await;

  db.transaction(|conn| async move {
    conn.execute(insert_note("kept", false)).await?;
    Ok(())
  })
  .await
  .unwrap();

  let result: aquifer::Result<()> = db
    .transaction(|conn| async move {
      conn.execute(insert_note("discarded", false)).await?;
      Err(Error::NoSuchColumn("forced failure".to_string()))
    })
    .await;
  assert!(result.is_err());

  let rows = db.fetch_all("SELECT text FROM notes").await.unwrap();
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0].get("text").unwrap(), Value::Text("kept".into()));
  db.disconnect().await.unwrap();
}

#[tokio::test]
async fn sqlite_child_task_shares_parent_transaction() {
  let (db, _dir) = setup().await;
  let conn = db.connection().await.unwrap();

  let tx = conn.begin().await.unwrap();
  conn
    .execute(
      SqlQuery::new("INSERT INTO notes (id, text) VALUES (:id, :text)")
        .bind("id", 1_i64)
        .bind("text", "prior"),
    )
    .await
    .unwrap();

  let child = conn.clone();
  tokio::spawn(async move {
    child
      .execute(
        SqlQuery::new("UPDATE notes SET text = :text WHERE id = :id")
          .bind("text", "test")
          .bind("id", 1_i64),
      )
      .await
      .unwrap();
  })
  .await
  .unwrap();

  let row = conn
    .fetch_one(SqlQuery::new("SELECT text FROM notes WHERE id = :id").bind("id", 1_i64))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(row.get("text").unwrap(), Value::Text("test".into()));

  tx.rollback().await.unwrap();
  let rows = db.fetch_all("SELECT * FROM notes").await.unwrap();
  assert!(rows.is_empty());
  db.disconnect().await.unwrap();
}

#[tokio::test]
async fn sqlite_sibling_task_does_not_see_uncommitted_work() {
  let (db, _dir) = setup().await;
  let conn = db.connection().await.unwrap();

  let tx = conn.begin().await.unwrap();
  conn.execute(insert_note("pending", false)).await.unwrap();

  // a sibling task resolves its own connection and reads around the open
  // transaction
  let sibling = db.clone();
  let seen = tokio::spawn(async move {
    sibling.fetch_all("SELECT * FROM notes").await.unwrap().len()
  })
  .await
  .unwrap();
  assert_eq!(seen, 0);

  tx.commit().await.unwrap();
  let sibling = db.clone();
  let seen = tokio::spawn(async move {
    sibling.fetch_all("SELECT * FROM notes").await.unwrap().len()
  })
  .await
  .unwrap();
  assert_eq!(seen, 1);
  db.disconnect().await.unwrap();
}

#[tokio::test]
async fn sqlite_force_rollback_isolates_all_work() {
  let dir = tempfile::tempdir().unwrap();
  let url = url_for(&dir);

  let db = Database::new(&url).unwrap();
  db.connect().await.unwrap();
  db.execute("CREATE TABLE notes (id INTEGER PRIMARY KEY AUTOINCREMENT, text TEXT, completed BOOLEAN)")
    .await
    .unwrap();
  db.disconnect().await.unwrap();

  let isolated =
    Database::with_options(&url, DatabaseOptions::default().force_rollback(true)).unwrap();
  isolated.connect().await.unwrap();
  isolated.execute(insert_note("gone", true)).await.unwrap();
  let rows = isolated.fetch_all("SELECT * FROM notes").await.unwrap();
  assert_eq!(rows.len(), 1);
  isolated.disconnect().await.unwrap();

  let fresh = Database::new(&url).unwrap();
  fresh.connect().await.unwrap();
  let rows = fresh.fetch_all("SELECT * FROM notes").await.unwrap();
  assert!(rows.is_empty());
  fresh.disconnect().await.unwrap();
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sqlite_type_round_trips() {
  let (db, _dir) = setup().await;
  db.execute(
    "CREATE TABLE kitchen (
      id INTEGER PRIMARY KEY,
      flag BOOLEAN,
      label TEXT,
      payload BLOB,
      ratio REAL,
      price TEXT,
      born DATE,
      wakes TIME,
      seen DATETIME,
      data TEXT
    )",
  )
  .await
  .unwrap();

  let born = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
  let wakes = NaiveTime::from_hms_opt(7, 30, 0).unwrap();
  let seen = NaiveDateTime::new(born, wakes);
  let price: Decimal = "12.34".parse().unwrap();
  let data = serde_json::json!({"tags": ["a", "b"], "pinned": true});

  db.execute(
    SqlQuery::new(
      "INSERT INTO kitchen (flag, label, payload, ratio, price, born, wakes, seen, data)
       VALUES (:flag, :label, :payload, :ratio, :price, :born, :wakes, :seen, :data)",
    )
    .bind("flag", true)
    .bind("label", "widget")
    .bind("payload", vec![1_u8, 2, 3])
    .bind("ratio", 0.5_f64)
    .bind("price", price)
    .bind("born", born)
    .bind("wakes", wakes)
    .bind("seen", seen)
    .bind("data", data.clone()),
  )
  .await
  .unwrap();

  let columns = vec![
    ResultColumn::qualified("kitchen", "flag", ColumnType::Boolean),
    ResultColumn::qualified("kitchen", "label", ColumnType::Text),
    ResultColumn::qualified("kitchen", "payload", ColumnType::Bytes),
    ResultColumn::qualified("kitchen", "ratio", ColumnType::Float),
    ResultColumn::qualified("kitchen", "price", ColumnType::Numeric),
    ResultColumn::qualified("kitchen", "born", ColumnType::Date),
    ResultColumn::qualified("kitchen", "wakes", ColumnType::Time),
    ResultColumn::qualified("kitchen", "seen", ColumnType::DateTime),
    ResultColumn::qualified("kitchen", "data", ColumnType::Json),
  ];
  let row = db
    .fetch_one(
      SqlQuery::new(
        "SELECT flag, label, payload, ratio, price, born, wakes, seen, data FROM kitchen",
      )
      .columns(columns),
    )
    .await
    .unwrap()
    .unwrap();

  assert!(row.try_get::<bool, _>("flag").unwrap());
  assert_eq!(row.try_get::<String, _>("label").unwrap(), "widget");
  assert_eq!(row.try_get::<Vec<u8>, _>("payload").unwrap(), vec![1, 2, 3]);
  assert_eq!(row.try_get::<f64, _>("ratio").unwrap(), 0.5);
  assert_eq!(row.try_get::<Decimal, _>("price").unwrap(), price);
  assert_eq!(row.try_get::<NaiveDate, _>("born").unwrap(), born);
  assert_eq!(row.try_get::<NaiveTime, _>("wakes").unwrap(), wakes);
  assert_eq!(row.try_get::<NaiveDateTime, _>("seen").unwrap(), seen);
  assert_eq!(row.get("data").unwrap(), Value::Json(data));

  db.disconnect().await.unwrap();
}

// ---------------------------------------------------------------------------
// Error handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sqlite_usable_after_driver_error() {
  let (db, _dir) = setup().await;

  let err = db.fetch_all("SELECT nope FROM missing_table").await;
  assert!(matches!(err, Err(Error::Driver(_))));

  // the connection scope unwound; new queries run normally
  db.execute(insert_note("still alive", false)).await.unwrap();
  let rows = db.fetch_all("SELECT * FROM notes").await.unwrap();
  assert_eq!(rows.len(), 1);
  db.disconnect().await.unwrap();
}

#[tokio::test]
async fn sqlite_missing_parameter_surfaces_before_execution() {
  let (db, _dir) = setup().await;
  let err = db
    .execute(SqlQuery::new("INSERT INTO notes (text) VALUES (:text)"))
    .await;
  assert!(matches!(err, Err(Error::MissingParameter(name)) if name == "text"));
  db.disconnect().await.unwrap();
}

#[tokio::test]
async fn sqlite_connect_is_idempotent() {
  let (db, _dir) = setup().await;
  db.connect().await.unwrap();
  db.execute(insert_note("fine", false)).await.unwrap();
  db.disconnect().await.unwrap();
  db.disconnect().await.unwrap();
}
