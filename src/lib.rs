pub mod backend;
pub mod cli;
pub mod config;
pub mod embedded;
pub mod import;
pub mod maintain;
pub mod manager;
pub mod metrics;
pub mod model;
pub mod networked;
pub mod processor;
pub mod queue;
pub mod replicate;
pub mod schema;
pub mod status;
pub mod store;
pub mod timeline;

#[derive(Debug)]
pub enum MemError {
    Database(rusqlite::Error),
    Remote(sqlx::Error),
    Io(std::io::Error),
    Json(serde_json::Error),
    Config(String),
    NotInitialized(&'static str),
    NotFound(String),
    Replication(String),
}

impl std::fmt::Display for MemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemError::Database(e) => write!(f, "database: {e}"),
            MemError::Remote(e) => write!(f, "remote database: {e}"),
            MemError::Io(e) => write!(f, "io: {e}"),
            MemError::Json(e) => write!(f, "json: {e}"),
            MemError::Config(msg) => write!(f, "config: {msg}"),
            MemError::NotInitialized(what) => write!(f, "{what} accessed before initialization"),
            MemError::NotFound(what) => write!(f, "not found: {what}"),
            MemError::Replication(msg) => write!(f, "replication: {msg}"),
        }
    }
}

impl std::error::Error for MemError {}

impl From<rusqlite::Error> for MemError {
    fn from(e: rusqlite::Error) -> Self {
        MemError::Database(e)
    }
}

impl From<sqlx::Error> for MemError {
    fn from(e: sqlx::Error) -> Self {
        MemError::Remote(e)
    }
}

impl From<std::io::Error> for MemError {
    fn from(e: std::io::Error) -> Self {
        MemError::Io(e)
    }
}

impl From<serde_json::Error> for MemError {
    fn from(e: serde_json::Error) -> Self {
        MemError::Json(e)
    }
}

impl From<rusqlite_migration::Error> for MemError {
    fn from(e: rusqlite_migration::Error) -> Self {
        match e {
            rusqlite_migration::Error::RusqliteError { query: _, err } => MemError::Database(err),
            other => MemError::Config(format!("migration: {other}")),
        }
    }
}

/// Current wall-clock time as epoch milliseconds.
pub fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// RFC 3339 rendering of an epoch-millisecond timestamp.
pub fn iso_from_epoch_ms(epoch_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(epoch_ms)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
