use std::path::Path;
use std::sync::Mutex;

use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use rusqlite::Connection;
use tracing::debug;

use crate::error::SQLError;
use crate::traits::{Row, SQLExecutor, SQLStore, Value};

/// SqliteStore is a SQLStore implementation backed by rusqlite (bundled SQLite).
///
/// Foreign keys are enforced on every connection it opens.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self, SQLError> {
        let conn = Connection::open(path)
            .map_err(|e| SQLError::Connection(e.to_string()))?;

        // WAL for concurrent readers while a reset transaction is running.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| SQLError::Connection(e.to_string()))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory SQLite database (useful for tests).
    pub fn open_in_memory() -> Result<Self, SQLError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SQLError::Connection(e.to_string()))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| SQLError::Connection(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(match self {
            Value::Null => ValueRef::Null,
            Value::Integer(i) => ValueRef::Integer(*i),
            Value::Real(f) => ValueRef::Real(*f),
            Value::Text(s) => ValueRef::Text(s.as_bytes()),
            Value::Blob(b) => ValueRef::Blob(b.as_slice()),
        }))
    }
}

fn query_on(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<Row>, SQLError> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| SQLError::Query(e.to_string()))?;

    let column_names: Vec<String> = stmt
        .column_names()
        .iter()
        .map(|s| s.to_string())
        .collect();

    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), |row| {
            let mut columns = Vec::with_capacity(column_names.len());
            for (i, name) in column_names.iter().enumerate() {
                columns.push((name.clone(), row_value_at(row, i)?));
            }
            Ok(Row { columns })
        })
        .map_err(|e| SQLError::Query(e.to_string()))?;

    let mut result = Vec::new();
    for row in rows {
        result.push(row.map_err(|e| SQLError::Query(e.to_string()))?);
    }
    Ok(result)
}

fn exec_on(conn: &Connection, sql: &str, params: &[Value]) -> Result<u64, SQLError> {
    let affected = conn
        .execute(sql, rusqlite::params_from_iter(params.iter()))
        .map_err(|e| SQLError::Execution(e.to_string()))?;
    Ok(affected as u64)
}

/// Extract a Value from a rusqlite row at a given column index.
fn row_value_at(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Value> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    })
}

/// Executor handed to transaction work; borrows the open transaction.
struct TxExecutor<'a> {
    conn: &'a Connection,
}

impl SQLExecutor for TxExecutor<'_> {
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, SQLError> {
        query_on(self.conn, sql, params)
    }

    fn exec(&self, sql: &str, params: &[Value]) -> Result<u64, SQLError> {
        exec_on(self.conn, sql, params)
    }
}

impl SQLExecutor for SqliteStore {
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, SQLError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| SQLError::Query(e.to_string()))?;
        query_on(&conn, sql, params)
    }

    fn exec(&self, sql: &str, params: &[Value]) -> Result<u64, SQLError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| SQLError::Execution(e.to_string()))?;
        exec_on(&conn, sql, params)
    }
}

impl SQLStore for SqliteStore {
    fn transaction(
        &self,
        work: &mut dyn FnMut(&dyn SQLExecutor) -> Result<(), SQLError>,
    ) -> Result<(), SQLError> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| SQLError::Transaction(e.to_string()))?;
        let tx = conn
            .transaction()
            .map_err(|e| SQLError::Transaction(e.to_string()))?;

        let outcome = work(&TxExecutor { conn: &tx });
        match outcome {
            Ok(()) => tx
                .commit()
                .map_err(|e| SQLError::Transaction(e.to_string())),
            Err(e) => {
                debug!(error = %e, "rolling back transaction");
                tx.rollback()
                    .map_err(|e| SQLError::Transaction(e.to_string()))?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn store_with_tables() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .exec("CREATE TABLE parent (id TEXT PRIMARY KEY, name TEXT NOT NULL)", &[])
            .unwrap();
        store
            .exec(
                "CREATE TABLE child (id TEXT PRIMARY KEY, parent TEXT NOT NULL REFERENCES parent(id), weight REAL)",
                &[],
            )
            .unwrap();
        store
    }

    fn count(store: &dyn SQLStore, table: &str) -> i64 {
        let rows = store
            .query(&format!("SELECT COUNT(*) AS cnt FROM {table}"), &[])
            .unwrap();
        rows[0].get_i64("cnt").unwrap()
    }

    #[test]
    fn test_query_types() {
        let store = store_with_tables();
        store
            .exec("INSERT INTO parent (id, name) VALUES (?1, ?2)", &["p1".into(), "Parent".into()])
            .unwrap();
        store
            .exec(
                "INSERT INTO child (id, parent, weight) VALUES (?1, ?2, ?3)",
                &["c1".into(), "p1".into(), Value::Real(1.5)],
            )
            .unwrap();
        store
            .exec(
                "INSERT INTO child (id, parent, weight) VALUES (?1, ?2, ?3)",
                &["c2".into(), "p1".into(), Value::from(None::<String>)],
            )
            .unwrap();

        let rows = store
            .query("SELECT id, weight, 1 AS flag FROM child ORDER BY id", &[])
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get_str("id"), Some("c1"));
        assert_eq!(rows[0].get("weight"), Some(&Value::Real(1.5)));
        assert_eq!(rows[0].get_bool("flag"), Some(true));
        assert_eq!(rows[1].get("weight"), Some(&Value::Null));
    }

    #[test]
    fn test_foreign_keys_enforced() {
        let store = store_with_tables();
        let err = store
            .exec(
                "INSERT INTO child (id, parent) VALUES (?1, ?2)",
                &["c1".into(), "missing".into()],
            )
            .unwrap_err();
        assert!(err.to_string().contains("FOREIGN KEY"));
    }

    #[test]
    fn test_transaction_commit() {
        let store = store_with_tables();
        store
            .transaction(&mut |tx| {
                tx.exec("INSERT INTO parent (id, name) VALUES ('p1', 'one')", &[])?;
                tx.exec("INSERT INTO child (id, parent) VALUES ('c1', 'p1')", &[])?;
                Ok(())
            })
            .unwrap();
        assert_eq!(count(&store, "parent"), 1);
        assert_eq!(count(&store, "child"), 1);
    }

    #[test]
    fn test_transaction_rollback() {
        let store = store_with_tables();
        store
            .exec("INSERT INTO parent (id, name) VALUES ('p0', 'zero')", &[])
            .unwrap();

        let result = store.transaction(&mut |tx| {
            tx.exec("DELETE FROM parent", &[])?;
            tx.exec("INSERT INTO parent (id, name) VALUES ('p1', 'one')", &[])?;
            // Violates the foreign key: the whole unit must roll back.
            tx.exec("INSERT INTO child (id, parent) VALUES ('c1', 'nope')", &[])?;
            Ok(())
        });
        assert!(result.is_err());

        let rows = store.query("SELECT id FROM parent", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_str("id"), Some("p0"));
    }

    #[test]
    fn test_transaction_on_shared_store() {
        let store: Arc<dyn SQLStore> = Arc::new(store_with_tables());
        let workers: Vec<_> = (0..4)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store.transaction(&mut |tx| {
                        let id = format!("p{i}");
                        tx.exec("INSERT INTO parent (id, name) VALUES (?1, 'x')", &[id.clone().into()])?;
                        tx.exec(
                            "INSERT INTO child (id, parent) VALUES (?1, ?2)",
                            &[format!("c{i}").into(), id.into()],
                        )?;
                        Ok(())
                    })
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap().unwrap();
        }
        assert_eq!(count(store.as_ref(), "parent"), 4);
        assert_eq!(count(store.as_ref(), "child"), 4);
    }

    #[test]
    fn test_unique_violation() {
        let store = store_with_tables();
        store
            .exec("INSERT INTO parent (id, name) VALUES ('p1', 'one')", &[])
            .unwrap();
        let err = store
            .exec("INSERT INTO parent (id, name) VALUES ('p1', 'again')", &[])
            .unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.sqlite");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .exec("CREATE TABLE t (id TEXT PRIMARY KEY)", &[])
                .unwrap();
            store.exec("INSERT INTO t (id) VALUES ('a')", &[]).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(count(&store, "t"), 1);
    }
}
