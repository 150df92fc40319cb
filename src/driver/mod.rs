/// Driver Boundary
///
/// The execution service talks to a database only through the traits in this
/// module. A driver opens connections against a named DSN; a connection runs
/// statements and hands back a cursor; a cursor describes and yields rows.
/// Drivers that can interrupt a running statement expose an [`AbortHandle`]
/// that is safe to call from another thread.
///
/// Two implementations ship with the crate:
/// - [`sqlite::SqliteDriver`]: the local backend, built on rusqlite
/// - [`scripted::ScriptedDriver`]: wraps the SQLite driver and injects failures
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use std::sync::Arc;
use thiserror::Error;

pub mod scripted;
pub mod sqlite;

/// Errors reported by a driver.
///
/// `Display` yields the backend text unchanged, so callers can classify it.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Backend-reported failure text
    #[error("{0}")]
    Backend(String),

    /// SQLite failures
    #[error("{0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Operation the driver does not implement
    #[error("operation not supported by driver: {0}")]
    Unsupported(&'static str),
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Native column type as reported by the driver, named after the ODBC `SQL_*` types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Numeric,
    Decimal,
    Float,
    Real,
    Double,
    Bit,
    Date,
    Time,
    Timestamp,
    Char,
    VarChar,
    LongVarChar,
    Binary,
    VarBinary,
    /// Any type without a dedicated variant, by ODBC code
    Other(i16),
}

/// Name and native type of one result column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescription {
    pub name: String,
    pub sql_type: SqlType,
}

/// A single cell as produced by a driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Arbitrary-precision decimal kept as its textual form
    Decimal(String),
    Text(String),
    Binary(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
}

/// Creates connections against a named DSN.
pub trait Driver: Send + Sync {
    /// Short driver name used in logs
    fn name(&self) -> &str;

    /// Opens a new connection for `dsn`.
    fn connect(&self, dsn: &str) -> DriverResult<Box<dyn DriverConnection>>;
}

/// A live connection handle.
pub trait DriverConnection: Send {
    /// Selects the working schema for subsequent statements.
    fn use_schema(&mut self, schema: &str) -> DriverResult<()>;

    /// Executes one statement.
    ///
    /// With `max_rows` set, a driver that materializes rows stops after that
    /// many; the cursor then yields at most `max_rows` rows.
    fn execute(&mut self, sql: &str, max_rows: Option<usize>) -> DriverResult<Box<dyn Cursor + '_>>;

    /// Returns a handle able to interrupt a running statement, if supported.
    fn abort_handle(&self) -> Option<Arc<dyn AbortHandle>>;

    /// Releases the connection.
    fn close(self: Box<Self>) -> DriverResult<()>;
}

/// Result of executing a statement.
pub trait Cursor {
    /// Column descriptions, or `None` when the statement produced no result set.
    fn description(&self) -> Option<&[ColumnDescription]>;

    /// Affected row count; `-1` when the driver does not know.
    fn rows_affected(&self) -> i64;

    /// Fetches the next row, `None` once exhausted.
    fn fetch_row(&mut self) -> DriverResult<Option<Vec<Value>>>;
}

/// Interrupts a statement running on another thread.
pub trait AbortHandle: Send + Sync {
    fn abort(&self) -> DriverResult<()>;
}
