//! Embedded single-writer backend on SQLite.
//!
//! Calls never suspend: each operation takes the connection lock, runs to
//! completion and returns. The lock also serialises writers, which is what
//! makes the queue's conditional updates atomic here.

use crate::backend::{BackendKind, Dialect, Kind, Row, Statement, StorageBackend, Value};
use crate::schema::MIGRATIONS;
use crate::MemError;
use async_trait::async_trait;
use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub struct EmbeddedBackend {
    conn: Mutex<Option<Connection>>,
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Integer(i) => ToSqlOutput::from(*i),
            Value::Real(f) => ToSqlOutput::from(*f),
            Value::Text(s) => ToSqlOutput::from(s.as_str()),
            Value::Null(_) => ToSqlOutput::from(rusqlite::types::Null),
        })
    }
}

fn from_sqlite(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null(Kind::Text),
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Text(String::from_utf8_lossy(b).into_owned()),
    }
}

fn apply_pragmas(conn: &Connection, in_memory: bool) -> Result<(), MemError> {
    if !in_memory {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
    }
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

#[cfg(unix)]
fn ensure_parent_dir(db_path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(dir) = db_path.parent()
        && !dir.as_os_str().is_empty()
        && !dir.exists()
    {
        std::fs::create_dir_all(dir)?;
        // Only tighten dirs we created
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_parent_dir(db_path: &Path) -> std::io::Result<()> {
    if let Some(dir) = db_path.parent()
        && !dir.as_os_str().is_empty()
        && !dir.exists()
    {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

fn query_rows(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<Row>, MemError> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();
    let rows = stmt
        .query_map(params_from_iter(params.iter()), |r| {
            (0..width)
                .map(|i| r.get_ref(i).map(from_sqlite))
                .collect::<rusqlite::Result<Vec<Value>>>()
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows
        .into_iter()
        .map(|values| Row::new(columns.clone(), values))
        .collect())
}

/// `execute` rejects statements that return rows, so RETURNING goes through the row path.
fn run_statement(conn: &Connection, sql: &str, params: &[Value]) -> Result<u64, MemError> {
    let mut stmt = conn.prepare(sql)?;
    if stmt.column_count() > 0 {
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut n = 0u64;
        while rows.next()?.is_some() {
            n += 1;
        }
        Ok(n)
    } else {
        Ok(stmt.execute(params_from_iter(params.iter()))? as u64)
    }
}

impl EmbeddedBackend {
    pub fn open(db_path: &Path) -> Result<Self, MemError> {
        ensure_parent_dir(db_path)?;
        let mut conn = Connection::open(db_path)?;
        apply_pragmas(&conn, false)?;
        MIGRATIONS.to_latest(&mut conn)?;

        #[cfg(unix)]
        {
            if db_path.exists() {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(db_path, std::fs::Permissions::from_mode(0o600))?;
            }
        }

        log::info!("embedded backend opened at {}", db_path.display());
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, MemError> {
        let mut conn = Connection::open_in_memory()?;
        apply_pragmas(&conn, true)?;
        MIGRATIONS.to_latest(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Connection>>, MemError> {
        self.conn
            .lock()
            .map_err(|_| MemError::Config("embedded connection lock poisoned".into()))
    }
}

fn closed() -> MemError {
    MemError::Config("embedded backend is closed".into())
}

#[async_trait]
impl StorageBackend for EmbeddedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Embedded
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, MemError> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or_else(closed)?;
        run_statement(conn, sql, params)
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, MemError> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or_else(closed)?;
        query_rows(conn, sql, params)
    }

    async fn transaction(&self, statements: &[Statement]) -> Result<Vec<u64>, MemError> {
        let mut guard = self.lock()?;
        let conn = guard.as_mut().ok_or_else(closed)?;
        let tx = conn.transaction()?;
        let mut affected = Vec::with_capacity(statements.len());
        for s in statements {
            affected.push(run_statement(&tx, &s.sql, &s.params)?);
        }
        tx.commit()?;
        Ok(affected)
    }

    async fn close(&self) -> Result<(), MemError> {
        let mut guard = self.lock()?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| MemError::Database(e))?;
            log::info!("embedded backend closed");
        }
        Ok(())
    }
}
