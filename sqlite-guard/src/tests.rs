use std::thread;

use tracing_subscriber::EnvFilter;

use super::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn test_execute_and_query_row() {
    init_tracing();
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, val TEXT);")
        .expect("create table");
    let changed = conn
        .execute(
            "INSERT INTO t (id, val) VALUES (?1, ?2)",
            params![1_i64, "hello"],
        )
        .expect("insert");
    assert_eq!(changed, 1);
    assert_eq!(conn.last_insert_rowid(), Ok(1));

    let result = conn
        .query_row("SELECT val FROM t WHERE id = ?1", params![1_i64], |row| {
            row.column_text(0)
        })
        .expect("query");
    assert_eq!(result, "hello");
    assert_eq!(conn.open_statements(), Ok(0));
}

#[test]
fn test_query_row_optional_none() {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY);")
        .expect("create table");
    let result = conn
        .query_row_optional("SELECT id FROM t WHERE id = 999", &[], |row| {
            row.column_i64(0)
        })
        .expect("query");
    assert!(result.is_none());

    let err = conn
        .query_row("SELECT id FROM t WHERE id = 999", &[], |row| row.column_i64(0))
        .unwrap_err();
    assert_eq!(err.code(), Some(DbErrorCode(ffi::SQLITE_DONE)));
}

#[test]
fn test_query_map_collects_rows() {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "CREATE TABLE t (id INTEGER PRIMARY KEY, score REAL);
         INSERT INTO t VALUES (1, 0.5), (2, 1.5), (3, NULL);",
    )
    .expect("seed");
    let rows = conn
        .query_map("SELECT id, score FROM t ORDER BY id", &[], |row| {
            let score = if row.is_column_null(1)? {
                None
            } else {
                Some(row.column_f64(1)?)
            };
            Ok((row.column_i64(0)?, score))
        })
        .expect("query");
    assert_eq!(rows, vec![(1, Some(0.5)), (2, Some(1.5)), (3, None)]);
}

#[test]
fn test_blob_and_null_handling() {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, data BLOB);")
        .expect("create table");
    let data = vec![0xDE, 0xAD, 0xBE, 0xEF];
    conn.execute(
        "INSERT INTO t (id, data) VALUES (?1, ?2), (?3, ?4)",
        params![1_i64, data.as_slice(), 2_i64, Value::Null],
    )
    .expect("insert");

    let stmt = conn
        .prepare("SELECT data FROM t ORDER BY id")
        .expect("prepare");
    assert_eq!(stmt.step(), Ok(StepResult::Row));
    assert_eq!(stmt.column_type(0), Ok(ColumnType::Blob));
    assert_eq!(stmt.column_blob(0), Ok(data));
    assert_eq!(stmt.step(), Ok(StepResult::Row));
    assert_eq!(stmt.is_column_null(0), Ok(true));
    assert_eq!(stmt.column_blob(0), Ok(Vec::new()));
    assert_eq!(stmt.step(), Ok(StepResult::Done));
}

#[test]
fn test_statement_reuse_with_reset() {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, val TEXT);")
        .expect("create table");
    let insert = conn
        .prepare("INSERT INTO t (id, val) VALUES (?1, ?2)")
        .expect("prepare");
    for (id, val) in [(1_i64, "a"), (2, "b"), (3, "c")] {
        insert.bind_values(params![id, val]).expect("bind");
        assert_eq!(insert.step(), Ok(StepResult::Done));
        insert.reset().expect("reset");
    }
    assert_eq!(insert.close(), Ok(ffi::SQLITE_OK));

    let count = conn
        .query_row("SELECT count(*) FROM t", &[], |row| row.column_i64(0))
        .expect("count");
    assert_eq!(count, 3);
}

#[test]
fn test_bind_count_mismatch_is_rejected() {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    let stmt = conn.prepare("SELECT ?1 + ?2").expect("prepare");
    let err = stmt.bind_values(params![1_i64]).unwrap_err();
    assert_eq!(err.code(), Some(DbErrorCode(ffi::SQLITE_MISUSE)));
}

#[test]
fn test_prepare_error_reports_engine_message() {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    let err = conn.prepare("SELEKT 1").unwrap_err();
    assert_eq!(err.code(), Some(DbErrorCode(ffi::SQLITE_ERROR)));
    assert!(err.to_string().contains("syntax error"), "{err}");
    assert_eq!(conn.open_statements(), Ok(0));
}

#[test]
fn test_closed_statement_is_rejected_and_pointer_forgotten() {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    let stmt = conn.prepare("SELECT 1").expect("prepare");
    let ptr = stmt.pointer();
    assert_eq!(conn.use_db(|db| Ok(db.owns(ptr))), Ok(true));

    assert_eq!(stmt.close(), Ok(ffi::SQLITE_OK));
    assert_eq!(stmt.close(), Ok(ffi::SQLITE_OK));
    assert_eq!(stmt.step(), Err(DbError::AlreadyClosed));
    assert_eq!(conn.use_db(|db| Ok(db.owns(ptr))), Ok(false));
    assert_eq!(conn.use_db(|db| Ok(db.live_statements())), Ok(0));
}

#[test]
fn test_adopted_foreign_pointer_never_reaches_engine() {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    let stmt = SafeStatement::new(&conn, StmtPtr::new(42)).expect("adopt");

    let err = stmt.step().unwrap_err();
    assert_eq!(err.code(), Some(DbErrorCode(ffi::SQLITE_MISUSE)));

    let first = stmt.close().unwrap_err();
    assert_eq!(first.code(), Some(DbErrorCode(ffi::SQLITE_MISUSE)));
    assert!(stmt.is_closed());
    assert!(stmt.close().unwrap_err().is_same_failure(&first));
}

#[test]
fn test_statements_shared_across_threads() {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY AUTOINCREMENT, who TEXT);")
        .expect("create table");
    let insert_a = conn
        .prepare("INSERT INTO t (who) VALUES ('a')")
        .expect("prepare");
    let insert_b = conn
        .prepare("INSERT INTO t (who) VALUES ('b')")
        .expect("prepare");

    thread::scope(|s| {
        for stmt in [&insert_a, &insert_b] {
            s.spawn(move || {
                for _ in 0..25 {
                    stmt.safe_run(|db, ptr| {
                        db.step(ptr)?;
                        db.reset(ptr)
                    })
                    .expect("insert");
                }
            });
        }
    });

    let counts = conn
        .query_map("SELECT who, count(*) FROM t GROUP BY who ORDER BY who", &[], |row| {
            Ok((row.column_text(0)?, row.column_i64(1)?))
        })
        .expect("count");
    assert_eq!(counts, vec![("a".to_string(), 25), ("b".to_string(), 25)]);
}

#[test]
fn test_connection_close_finalizes_open_statements() {
    init_tracing();
    let conn = Connection::open_in_memory().expect("open in-memory db");
    let stmt = conn.prepare("SELECT 1").expect("prepare");
    assert_eq!(conn.open_statements(), Ok(1));

    conn.close().expect("close");
    assert!(stmt.is_closed());
    assert_eq!(stmt.close_outcome(), Some(Ok(ffi::SQLITE_OK)));
    assert_eq!(stmt.close(), Ok(ffi::SQLITE_OK));
    assert_eq!(stmt.step(), Err(DbError::AlreadyClosed));
    assert_eq!(conn.execute_batch("SELECT 1"), Err(DbError::ConnectionClosed));
    assert!(matches!(conn.prepare("SELECT 1"), Err(DbError::ConnectionClosed)));
}

#[test]
fn test_open_with_config_applies_pragmas() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = ConnectionConfig {
        busy_timeout_ms: Some(500),
        journal_mode: Some("wal".to_string()),
        synchronous: Some("full".to_string()),
        ..ConnectionConfig::new(dir.path().join("guard.sqlite"))
    };
    let conn = Connection::open_with(&config).expect("open");

    let journal = conn
        .query_row("PRAGMA journal_mode", &[], |row| row.column_text(0))
        .expect("journal_mode");
    assert_eq!(journal.to_ascii_lowercase(), "wal");
    let foreign_keys = conn
        .query_row("PRAGMA foreign_keys", &[], |row| row.column_i64(0))
        .expect("foreign_keys");
    assert_eq!(foreign_keys, 1);
    let synchronous = conn
        .query_row("PRAGMA synchronous", &[], |row| row.column_i64(0))
        .expect("synchronous");
    assert_eq!(synchronous, 2);
}

#[test]
fn test_read_only_connection_rejects_writes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("ro.sqlite");
    {
        let conn = Connection::open(&path, false).expect("create");
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY);")
            .expect("create table");
    }

    let conn = Connection::open(&path, true).expect("open read-only");
    let err = conn
        .execute("INSERT INTO t (id) VALUES (1)", &[])
        .unwrap_err();
    assert_eq!(err.code(), Some(DbErrorCode(libsqlite3_sys::SQLITE_READONLY)));
    assert_eq!(conn.open_statements(), Ok(0));
}

#[test]
fn test_open_missing_read_only_file_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = Connection::open(&dir.path().join("missing.sqlite"), true).unwrap_err();
    assert_eq!(err.code(), Some(DbErrorCode(libsqlite3_sys::SQLITE_CANTOPEN)));
}
