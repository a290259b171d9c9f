//! Networked multi-writer backend on PostgreSQL via sqlx.
//!
//! Everything engine-specific is normalised here: `?` placeholders become
//! `$n`, and integer columns of any width come back as `i64`.

use crate::backend::{BackendKind, Dialect, Kind, Row, Statement, StorageBackend, Value};
use crate::schema::NETWORKED_SCHEMA;
use crate::MemError;
use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, PgPool, Postgres, Row as _, TypeInfo, ValueRef};

pub struct NetworkedBackend {
    pool: PgPool,
}

/// Rewrite `?` placeholders to `$1, $2, ...`, leaving quoted literals and identifiers alone.
pub fn rewrite_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut n = 0;
    let mut quote: Option<char> = None;
    for c in sql.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                out.push(c);
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    out.push(c);
                }
                '?' => {
                    n += 1;
                    out.push('$');
                    out.push_str(&n.to_string());
                }
                _ => out.push(c),
            },
        }
    }
    out
}

fn bind_all<'q>(
    mut q: Query<'q, Postgres, PgArguments>,
    params: &'q [Value],
) -> Query<'q, Postgres, PgArguments> {
    for p in params {
        q = match p {
            Value::Integer(i) => q.bind(*i),
            Value::Real(f) => q.bind(*f),
            Value::Text(s) => q.bind(s.as_str()),
            Value::Null(Kind::Integer) => q.bind(None::<i64>),
            Value::Null(Kind::Real) => q.bind(None::<f64>),
            Value::Null(Kind::Text) => q.bind(None::<String>),
        };
    }
    q
}

fn decode_row(row: &PgRow) -> Result<Row, MemError> {
    let mut columns = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());
    for (i, col) in row.columns().iter().enumerate() {
        columns.push(col.name().to_string());
        if row.try_get_raw(i)?.is_null() {
            values.push(Value::Null(Kind::Text));
            continue;
        }
        let value = match col.type_info().name() {
            "INT8" => Value::Integer(row.try_get::<i64, _>(i)?),
            "INT4" => Value::Integer(i64::from(row.try_get::<i32, _>(i)?)),
            "INT2" => Value::Integer(i64::from(row.try_get::<i16, _>(i)?)),
            "BOOL" => Value::Integer(i64::from(row.try_get::<bool, _>(i)?)),
            "FLOAT8" => Value::Real(row.try_get::<f64, _>(i)?),
            "FLOAT4" => Value::Real(f64::from(row.try_get::<f32, _>(i)?)),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => Value::Text(row.try_get::<String, _>(i)?),
            other => {
                return Err(MemError::Config(format!(
                    "unsupported column type {other} for {:?}",
                    col.name()
                )));
            }
        };
        values.push(value);
    }
    Ok(Row::new(columns, values))
}

impl NetworkedBackend {
    /// Connect and bring the schema up to date.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, MemError> {
        if database_url.trim().is_empty() {
            return Err(MemError::Config(
                "networked backend requires a database_url".into(),
            ));
        }
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        for stmt in NETWORKED_SCHEMA {
            sqlx::raw_sql(stmt).execute(&pool).await?;
        }
        log::info!("networked backend connected (pool size {max_connections})");
        Ok(Self { pool })
    }
}

#[async_trait]
impl StorageBackend for NetworkedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Networked
    }

    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, MemError> {
        let sql = rewrite_placeholders(sql);
        let result = bind_all(sqlx::query(&sql), params)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, MemError> {
        let sql = rewrite_placeholders(sql);
        let rows = bind_all(sqlx::query(&sql), params)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_row).collect()
    }

    async fn transaction(&self, statements: &[Statement]) -> Result<Vec<u64>, MemError> {
        let mut tx = self.pool.begin().await?;
        let mut affected = Vec::with_capacity(statements.len());
        for s in statements {
            let sql = rewrite_placeholders(&s.sql);
            let result = bind_all(sqlx::query(&sql), &s.params)
                .execute(&mut *tx)
                .await?;
            affected.push(result.rows_affected());
        }
        tx.commit().await?;
        Ok(affected)
    }

    async fn close(&self) -> Result<(), MemError> {
        self.pool.close().await;
        log::info!("networked backend closed");
        Ok(())
    }
}
