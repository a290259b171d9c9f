//! Storage backend contract shared by the embedded and networked engines.
//!
//! SQL crosses this boundary written once, with `?` positional placeholders.
//! Parameters and results are plain [`Value`]s so neither engine's client
//! types leak into the session store or the work queue.

use crate::MemError;
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Embedded,
    Networked,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Embedded => "embedded",
            BackendKind::Networked => "networked",
        }
    }
}

/// Column type a NULL parameter stands in for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Integer,
    Real,
    Text,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Real(f64),
    Text(String),
    Null(Kind),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null(_))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::Text(v.clone())
    }
}

impl From<Option<i64>> for Value {
    fn from(v: Option<i64>) -> Self {
        v.map_or(Value::Null(Kind::Integer), Value::Integer)
    }
}

impl From<Option<String>> for Value {
    fn from(v: Option<String>) -> Self {
        v.map_or(Value::Null(Kind::Text), Value::Text)
    }
}

impl From<Option<&str>> for Value {
    fn from(v: Option<&str>) -> Self {
        v.map_or(Value::Null(Kind::Text), |s| Value::Text(s.to_string()))
    }
}

/// Build a parameter list from heterogeneous values.
#[macro_export]
macro_rules! params {
    () => { Vec::<$crate::backend::Value>::new() };
    ($($v:expr),+ $(,)?) => { vec![$($crate::backend::Value::from($v)),+] };
}

/// Conversion out of a result column.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(i) => Some(*i),
            Value::Real(f) => Some(*f as i64),
            Value::Text(s) => s.parse().ok(),
            Value::Null(_) => None,
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Text(s) => Some(s.clone()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Real(f) => Some(f.to_string()),
            Value::Null(_) => None,
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Option<Self> {
        if value.is_null() {
            Some(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

/// One result row with named columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn value(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    pub fn get<T: FromValue>(&self, column: &str) -> Result<T, MemError> {
        let value = self
            .value(column)
            .ok_or_else(|| MemError::Config(format!("missing column {column:?} in result row")))?;
        T::from_value(value)
            .ok_or_else(|| MemError::Config(format!("column {column:?} has unexpected value {value:?}")))
    }
}

/// A statement and its parameters, executed as part of a transaction.
#[derive(Debug, Clone)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// The handful of SQL fragments that differ between engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    /// Predicate true when `column` contains the next bound parameter as a substring.
    pub fn contains(&self, column: &str) -> String {
        match self {
            Dialect::Sqlite => format!("instr({column}, ?) > 0"),
            Dialect::Postgres => format!("strpos({column}, ?) > 0"),
        }
    }

    /// Statement realigning a serial id sequence after rows were written with explicit ids.
    pub fn resync_sequence(&self, table: &str) -> Option<String> {
        match self {
            Dialect::Sqlite => None,
            Dialect::Postgres => Some(format!(
                "SELECT setval(pg_get_serial_sequence('{table}', 'id'), \
                 GREATEST((SELECT COALESCE(MAX(id), 0) FROM {table}), 1))"
            )),
        }
    }
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn dialect(&self) -> Dialect;

    /// Run a statement, returning the number of rows it touched.
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, MemError>;

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, MemError>;

    async fn query_opt(&self, sql: &str, params: &[Value]) -> Result<Option<Row>, MemError> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    /// Run every statement in one transaction; nothing is applied if any fails.
    async fn transaction(&self, statements: &[Statement]) -> Result<Vec<u64>, MemError>;

    async fn close(&self) -> Result<(), MemError>;
}

/// `?, ?, ?` with `n` placeholders, for IN lists.
pub fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_get_by_name() {
        let row = Row::new(
            vec!["id".into(), "title".into(), "subtitle".into()],
            vec![Value::Integer(7), Value::Text("t".into()), Value::Null(Kind::Text)],
        );
        assert_eq!(row.get::<i64>("id").unwrap(), 7);
        assert_eq!(row.get::<String>("title").unwrap(), "t");
        assert_eq!(row.get::<Option<String>>("subtitle").unwrap(), None);
        assert!(row.get::<String>("subtitle").is_err());
        assert!(row.get::<i64>("missing").is_err());
    }

    #[test]
    fn option_params_carry_null_kind() {
        let p = params![None::<i64>, None::<String>, Some(3i64), "x"];
        assert_eq!(p[0], Value::Null(Kind::Integer));
        assert_eq!(p[1], Value::Null(Kind::Text));
        assert_eq!(p[2], Value::Integer(3));
        assert_eq!(p[3], Value::Text("x".into()));
    }

    #[test]
    fn dialect_fragments() {
        assert_eq!(Dialect::Sqlite.contains("files_read"), "instr(files_read, ?) > 0");
        assert_eq!(Dialect::Postgres.contains("files_read"), "strpos(files_read, ?) > 0");
        assert!(Dialect::Sqlite.resync_sequence("observations").is_none());
        assert!(Dialect::Postgres
            .resync_sequence("observations")
            .unwrap()
            .contains("pg_get_serial_sequence('observations'"));
        assert_eq!(placeholders(3), "?, ?, ?");
    }
}
