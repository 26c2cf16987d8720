//! SQLite driver.
//!
//! Built on rusqlite with tokio-rusqlite for async support. Each connection
//! runs on its own background thread; statements are compiled through
//! rusqlite's per-connection `prepare_cached`, sized to match the pool's
//! statement cache.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::ffi::ErrorCode;
use rusqlite::OpenFlags;
use tokio::sync::OnceCell;
use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};

use super::error::{DriverError, DriverErrorKind, DriverResult};
use super::{Connector, DriverConnection};
use crate::statement::PreparedStatement;
use crate::value::{QueryResult, Row, Value};

/// Opens SQLite connections for the pool.
///
/// For `:memory:` every connection from one connector (and its clones)
/// opens the same private shared-cache database, which lives as long as the
/// connector does.
#[derive(Clone)]
pub struct SqliteConnector {
    /// Database path (or `:memory:`)
    path: String,
    statement_cache_capacity: usize,
    busy_timeout: Duration,
    memory: Option<Arc<SharedMemory>>,
}

struct SharedMemory {
    uri: String,
    /// Keeps the database alive while the pool has no open connections
    keeper: OnceCell<SqliteConnection>,
}

impl std::fmt::Debug for SqliteConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnector")
            .field("path", &self.path)
            .field("statement_cache_capacity", &self.statement_cache_capacity)
            .field("busy_timeout", &self.busy_timeout)
            .finish()
    }
}

impl SqliteConnector {
    pub fn new(path: &str) -> Self {
        let memory = (path == ":memory:").then(|| {
            Arc::new(SharedMemory {
                uri: format!("file:storekit-{}?mode=memory&cache=shared", uuid::Uuid::new_v4().simple()),
                keeper: OnceCell::new(),
            })
        });
        Self {
            path: path.to_string(),
            statement_cache_capacity: 100,
            busy_timeout: Duration::from_millis(5000),
            memory,
        }
    }

    /// Parse a SQLite URL: `sqlite::memory:`, `sqlite://path/to/db` or `sqlite:path`.
    pub fn from_url(url: &str) -> Option<Self> {
        let path = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))?;
        let path = if path.is_empty() { ":memory:" } else { path };
        Some(Self::new(path))
    }

    pub fn statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.statement_cache_capacity = capacity;
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    async fn connect(&self) -> DriverResult<Box<dyn DriverConnection>> {
        let conn = match &self.memory {
            Some(memory) => {
                memory
                    .keeper
                    .get_or_try_init(|| SqliteConnection::open_shared_memory(&memory.uri, 0, self.busy_timeout))
                    .await?;
                SqliteConnection::open_shared_memory(&memory.uri, self.statement_cache_capacity, self.busy_timeout)
                    .await?
            }
            None => SqliteConnection::open(&self.path, self.statement_cache_capacity, self.busy_timeout).await?,
        };
        Ok(Box::new(conn))
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path)
    }
}

/// A SQLite connection.
pub struct SqliteConnection {
    conn: Option<tokio_rusqlite::Connection>,
}

impl SqliteConnection {
    /// Open a SQLite database.
    ///
    /// Enables WAL mode for file-based databases so readers do not block the
    /// single writer.
    pub async fn open(path: &str, statement_cache_capacity: usize, busy_timeout: Duration) -> DriverResult<Self> {
        let is_memory = path == ":memory:";
        let conn = if is_memory {
            tokio_rusqlite::Connection::open_in_memory().await?
        } else {
            tokio_rusqlite::Connection::open(path).await?
        };

        conn.call(move |c| {
            c.set_prepared_statement_cache_capacity(statement_cache_capacity);
            c.busy_timeout(busy_timeout)?;
            if !is_memory {
                c.execute_batch(
                    "PRAGMA journal_mode=WAL;
                     PRAGMA synchronous=NORMAL;",
                )?;
            }
            Ok(())
        })
        .await?;

        Ok(Self { conn: Some(conn) })
    }

    /// Open a named in-memory database shared by every connection that
    /// opens the same URI.
    pub async fn open_shared_memory(
        uri: &str,
        statement_cache_capacity: usize,
        busy_timeout: Duration,
    ) -> DriverResult<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = tokio_rusqlite::Connection::open_with_flags(uri, flags).await?;
        conn.call(move |c| {
            c.set_prepared_statement_cache_capacity(statement_cache_capacity);
            c.busy_timeout(busy_timeout)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn: Some(conn) })
    }

    fn handle(&self) -> DriverResult<&tokio_rusqlite::Connection> {
        self.conn.as_ref().ok_or_else(DriverError::closed)
    }
}

#[async_trait]
impl DriverConnection for SqliteConnection {
    async fn prepare(&mut self, name: &str, sql: &str) -> DriverResult<PreparedStatement> {
        let owned = sql.to_string();
        let (columns, param_count) = self
            .handle()?
            .call(move |conn| {
                let stmt = conn.prepare_cached(&owned)?;
                let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
                Ok((columns, stmt.parameter_count()))
            })
            .await?;

        Ok(PreparedStatement::new(name.to_string(), sql.to_string())
            .with_param_count(param_count)
            .with_columns(columns))
    }

    async fn query(&mut self, stmt: &PreparedStatement, params: &[Value]) -> DriverResult<QueryResult> {
        let sql = stmt.sql.clone();
        let columns = stmt.columns.clone();
        let params: Vec<Value> = params.to_vec();

        self.handle()?
            .call(move |conn| {
                let mut prepared = conn.prepare_cached(&sql)?;
                let params_refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();

                let width = columns.len();
                let mut rows_data = Vec::new();
                let mut rows = prepared.query(params_refs.as_slice())?;
                while let Some(row) = rows.next()? {
                    let mut values = Vec::with_capacity(width);
                    for i in 0..width {
                        values.push(from_value_ref(row.get_ref(i)?));
                    }
                    rows_data.push(Row::new(columns.clone(), values));
                }

                Ok(QueryResult {
                    columns,
                    rows: rows_data,
                    rows_affected: 0,
                })
            })
            .await
            .map_err(DriverError::from)
    }

    async fn execute(&mut self, stmt: &PreparedStatement, params: &[Value]) -> DriverResult<u64> {
        let sql = stmt.sql.clone();
        let params: Vec<Value> = params.to_vec();

        self.handle()?
            .call(move |conn| {
                let mut prepared = conn.prepare_cached(&sql)?;
                let params_refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
                let affected = prepared.execute(params_refs.as_slice())?;
                Ok(affected as u64)
            })
            .await
            .map_err(DriverError::from)
    }

    async fn batch(&mut self, sql: &str) -> DriverResult<()> {
        let sql = sql.to_string();
        self.handle()?
            .call(move |conn| {
                conn.execute_batch(&sql)?;
                Ok(())
            })
            .await
            .map_err(DriverError::from)
    }

    async fn ping(&mut self) -> DriverResult<()> {
        self.handle()?
            .call(|conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
                Ok(())
            })
            .await
            .map_err(DriverError::from)
    }

    async fn close(&mut self) -> DriverResult<()> {
        match self.conn.take() {
            Some(conn) => conn.close().await.map_err(DriverError::from),
            None => Ok(()),
        }
    }

    fn is_closed(&self) -> bool {
        self.conn.is_none()
    }
}

// ============================================================================
// Type conversion
// ============================================================================

fn from_value_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(s) => Value::Text(String::from_utf8_lossy(s).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        use rusqlite::types::Value as Sql;
        match self {
            Value::Null => Ok(ToSqlOutput::Owned(Sql::Null)),
            Value::Bool(b) => Ok(ToSqlOutput::Owned(Sql::Integer(i64::from(*b)))),
            Value::Int(i) => Ok(ToSqlOutput::Owned(Sql::Integer(*i))),
            Value::Float(f) => Ok(ToSqlOutput::Owned(Sql::Real(*f))),
            // Borrow Text and Blob to avoid cloning parameter payloads
            Value::Text(s) => Ok(ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes()))),
            Value::Bytes(b) => Ok(ToSqlOutput::Borrowed(ValueRef::Blob(b))),
            Value::Json(j) => Ok(ToSqlOutput::Owned(Sql::Text(j.to_string()))),
        }
    }
}

// ============================================================================
// Error mapping
// ============================================================================

fn kind_for_code(code: ErrorCode) -> DriverErrorKind {
    match code {
        ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => DriverErrorKind::Busy,
        ErrorCode::OperationInterrupted => DriverErrorKind::StatementTimeout,
        ErrorCode::SystemIoFailure | ErrorCode::CannotOpen => DriverErrorKind::ConnectionReset,
        ErrorCode::ConstraintViolation => DriverErrorKind::ConstraintViolation,
        ErrorCode::TypeMismatch | ErrorCode::ParameterOutOfRange | ErrorCode::TooBig => {
            DriverErrorKind::TypeMismatch
        }
        ErrorCode::PermissionDenied | ErrorCode::AuthorizationForStatementDenied | ErrorCode::ReadOnly => {
            DriverErrorKind::Authorization
        }
        // SQLITE_ERROR: syntax errors, missing tables/columns
        ErrorCode::Unknown => DriverErrorKind::Syntax,
        _ => DriverErrorKind::Other,
    }
}

impl From<rusqlite::Error> for DriverError {
    fn from(e: rusqlite::Error) -> Self {
        let (kind, code) = match &e {
            rusqlite::Error::SqliteFailure(ffi, _) => {
                (kind_for_code(ffi.code), Some(ffi.extended_code.to_string()))
            }
            rusqlite::Error::SqlInputError { error, .. } => {
                (kind_for_code(error.code), Some(error.extended_code.to_string()))
            }
            rusqlite::Error::InvalidParameterCount(..)
            | rusqlite::Error::InvalidParameterName(_)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::ToSqlConversionFailure(_)
            | rusqlite::Error::IntegralValueOutOfRange(..) => (DriverErrorKind::TypeMismatch, None),
            _ => (DriverErrorKind::Other, None),
        };
        let err = DriverError::new(kind, e.to_string());
        let err = match code {
            Some(code) => err.with_code(code),
            None => err,
        };
        err.with_source(e)
    }
}

impl From<tokio_rusqlite::Error> for DriverError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        match e {
            tokio_rusqlite::Error::Rusqlite(inner) => DriverError::from(inner),
            tokio_rusqlite::Error::ConnectionClosed => {
                DriverError::new(DriverErrorKind::ConnectionReset, "connection thread has exited")
            }
            other => DriverError::new(DriverErrorKind::Other, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_memory() -> SqliteConnection {
        SqliteConnection::open(":memory:", 16, Duration::from_millis(100))
            .await
            .unwrap()
    }

    #[test]
    fn test_from_url() {
        assert_eq!(SqliteConnector::from_url("sqlite::memory:").unwrap().path(), ":memory:");
        assert_eq!(SqliteConnector::from_url("sqlite://data/bot.db").unwrap().path(), "data/bot.db");
        assert_eq!(SqliteConnector::from_url("sqlite:bot.db").unwrap().path(), "bot.db");
        assert!(SqliteConnector::from_url("postgres://localhost/bot").is_none());
    }

    #[tokio::test]
    async fn test_prepare_execute_and_query() {
        let mut conn = open_memory().await;
        conn.batch("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, score REAL, data BLOB)")
            .await
            .unwrap();

        let insert = conn
            .prepare("s1", "INSERT INTO users (name, score, data) VALUES (?, ?, ?)")
            .await
            .unwrap();
        assert_eq!(insert.param_count, 3);
        assert!(!insert.returns_rows());

        let affected = conn
            .execute(&insert, &[Value::from("alice"), Value::Float(1.5), Value::Bytes(vec![0xDE, 0xAD])])
            .await
            .unwrap();
        assert_eq!(affected, 1);
        conn.execute(&insert, &[Value::from("bob"), Value::Null, Value::Null])
            .await
            .unwrap();

        let select = conn.prepare("s2", "SELECT id, name, score, data FROM users ORDER BY id").await.unwrap();
        assert_eq!(select.columns.as_slice(), ["id", "name", "score", "data"]);

        let result = conn.query(&select, &[]).await.unwrap();
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[0].get_named("name"), Some(&Value::from("alice")));
        assert_eq!(result.rows[0].get(3), Some(&Value::Bytes(vec![0xDE, 0xAD])));
        assert_eq!(result.rows[1].get(2), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_error_classification() {
        let mut conn = open_memory().await;
        conn.batch("CREATE TABLE guilds (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE)")
            .await
            .unwrap();

        let syntax = conn.prepare("s1", "SELEC nonsense").await.unwrap_err();
        assert_eq!(syntax.kind, DriverErrorKind::Syntax);
        assert!(!syntax.is_transient());

        let missing = conn.prepare("s2", "SELECT * FROM no_such_table").await.unwrap_err();
        assert_eq!(missing.kind, DriverErrorKind::Syntax);

        let insert = conn.prepare("s3", "INSERT INTO guilds (name) VALUES (?)").await.unwrap();
        conn.execute(&insert, &[Value::from("dup")]).await.unwrap();
        let dup = conn.execute(&insert, &[Value::from("dup")]).await.unwrap_err();
        assert_eq!(dup.kind, DriverErrorKind::ConstraintViolation);
        assert!(dup.code.is_some());

        let wrong_arity = conn.execute(&insert, &[]).await.unwrap_err();
        assert_eq!(wrong_arity.kind, DriverErrorKind::TypeMismatch);
    }

    #[tokio::test]
    async fn test_memory_connector_shares_one_database() {
        let connector = SqliteConnector::new(":memory:");
        let mut a = connector.connect().await.unwrap();
        let mut b = connector.connect().await.unwrap();

        a.batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (7);").await.unwrap();
        let select = b.prepare("s1", "SELECT x FROM t").await.unwrap();
        let result = b.query(&select, &[]).await.unwrap();
        assert_eq!(result.rows[0].get(0), Some(&Value::Int(7)));

        // Survives every pooled connection closing
        a.close().await.unwrap();
        b.close().await.unwrap();
        let mut c = connector.connect().await.unwrap();
        let select = c.prepare("s1", "SELECT x FROM t").await.unwrap();
        assert_eq!(c.query(&select, &[]).await.unwrap().rows.len(), 1);

        // Another connector gets its own database
        let mut other = SqliteConnector::new(":memory:").connect().await.unwrap();
        assert!(other.prepare("s1", "SELECT x FROM t").await.is_err());
    }

    #[tokio::test]
    async fn test_ping_and_close() {
        let mut conn = open_memory().await;
        conn.ping().await.unwrap();
        assert!(!conn.is_closed());

        conn.close().await.unwrap();
        assert!(conn.is_closed());
        assert_eq!(conn.ping().await.unwrap_err().kind, DriverErrorKind::Closed);
    }

    #[tokio::test]
    async fn test_json_and_bool_params() {
        let mut conn = open_memory().await;
        conn.batch("CREATE TABLE settings (flag INTEGER, doc TEXT)").await.unwrap();
        let insert = conn.prepare("s1", "INSERT INTO settings VALUES (?, ?)").await.unwrap();
        conn.execute(&insert, &[Value::Bool(true), Value::Json(serde_json::json!({"prefix": "!"}))])
            .await
            .unwrap();

        let select = conn.prepare("s2", "SELECT flag, doc FROM settings").await.unwrap();
        let result = conn.query(&select, &[]).await.unwrap();
        assert_eq!(result.rows[0].get(0).and_then(Value::as_bool), Some(true));
        assert_eq!(result.rows[0].get(1).and_then(Value::as_str), Some(r#"{"prefix":"!"}"#));
    }
}
