/// Query Execution Module
///
/// This module runs one statement on the shared connection and shapes the
/// driver's output into the JSON-ready [`QuerySuccess`] / [`QueryFailure`]
/// pair returned over the protocol.

use super::cancel::{CancelRegistry, CancellationToken};
use super::connection::{ConnectionCore, ConnectionState};
use crate::classifier::{Classifier, ErrorDetails};
use crate::core::{BridgeError, Result};
use crate::driver::{ColumnDescription, SqlType, Value};
use serde::Serialize;
use serde_json::{Map, Number, Value as JsonValue};
use std::time::Instant;
use tracing::debug;

/// One EXECUTE request
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub sql: String,
    /// Opaque correlation id echoed back in the response
    pub result_set_id: String,
    /// Row cap; `None` or `Some(0)` means unlimited
    pub max_rows: Option<usize>,
}

impl QueryRequest {
    pub fn new(sql: &str, result_set_id: &str) -> Self {
        QueryRequest {
            sql: sql.to_string(),
            result_set_id: result_set_id.to_string(),
            max_rows: None,
        }
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = Some(max_rows);
        self
    }

    /// Effective row cap
    pub fn row_cap(&self) -> Option<usize> {
        self.max_rows.filter(|&cap| cap > 0)
    }
}

/// Semantic column type reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Number,
    Boolean,
    Date,
    String,
}

impl From<SqlType> for ColumnType {
    fn from(sql_type: SqlType) -> Self {
        match sql_type {
            SqlType::TinyInt
            | SqlType::SmallInt
            | SqlType::Integer
            | SqlType::BigInt
            | SqlType::Numeric
            | SqlType::Decimal
            | SqlType::Float
            | SqlType::Real
            | SqlType::Double => ColumnType::Number,
            SqlType::Bit => ColumnType::Boolean,
            SqlType::Date | SqlType::Time | SqlType::Timestamp => ColumnType::Date,
            _ => ColumnType::String,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl From<&ColumnDescription> for Column {
    fn from(description: &ColumnDescription) -> Self {
        Column {
            name: description.name.clone(),
            column_type: description.sql_type.into(),
        }
    }
}

/// A result row keyed by column name, in column order
pub type Row = Map<String, JsonValue>;

/// Successful statement outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySuccess {
    pub has_results: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<Column>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Row>>,
    pub row_count: u64,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl QuerySuccess {
    fn without_results(affected: i64, execution_time_ms: u64) -> Self {
        // -1 means the driver does not know
        let row_count = u64::try_from(affected).unwrap_or(0);
        QuerySuccess {
            has_results: false,
            columns: None,
            rows: None,
            row_count,
            execution_time_ms,
            message: Some(format!(
                "Query executed successfully ({} rows affected)",
                row_count
            )),
        }
    }

    fn with_rows(columns: Vec<Column>, rows: Vec<Row>, execution_time_ms: u64) -> Self {
        QuerySuccess {
            has_results: true,
            columns: Some(columns),
            row_count: rows.len() as u64,
            rows: Some(rows),
            execution_time_ms,
            message: None,
        }
    }
}

/// Error type tag used for cancelled statements.
pub const CANCELLED_ERROR_TYPE: &str = "Cancelled";
/// Error type tag used for connection failures.
pub const CONNECTION_ERROR_TYPE: &str = "Connection Error";

/// Failed statement outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryFailure {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

impl QueryFailure {
    /// Failure carrying only a message.
    pub fn message(error: &str) -> Self {
        QueryFailure {
            error: error.to_string(),
            error_type: None,
            error_details: None,
            raw_error: None,
            traceback: None,
            execution_time_ms: None,
            cancelled: false,
        }
    }

    /// Builds the failure payload for `err`, classifying backend text.
    pub fn from_error(err: &BridgeError, classifier: &Classifier, execution_time_ms: u64) -> Self {
        match err {
            BridgeError::Cancelled(_) => QueryFailure {
                error_type: Some(CANCELLED_ERROR_TYPE.to_string()),
                execution_time_ms: Some(execution_time_ms),
                cancelled: true,
                ..QueryFailure::message("Query was cancelled")
            },
            BridgeError::NotConnected => QueryFailure {
                error_type: Some(CONNECTION_ERROR_TYPE.to_string()),
                ..QueryFailure::message(&err.to_string())
            },
            other => {
                let raw = other
                    .raw_text()
                    .map(str::to_string)
                    .unwrap_or_else(|| other.to_string());
                let diagnostic = classifier.classify(&raw);
                QueryFailure {
                    error: diagnostic.message,
                    error_type: Some(diagnostic.error_type),
                    error_details: diagnostic.details,
                    raw_error: Some(raw),
                    traceback: Some(format!("{:?}", other)),
                    execution_time_ms: Some(execution_time_ms),
                    cancelled: false,
                }
            }
        }
    }
}

/// Outcome of an EXECUTE request
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Success(QuerySuccess),
    Failure(QueryFailure),
}

impl QueryResult {
    pub fn is_success(&self) -> bool {
        matches!(self, QueryResult::Success(_))
    }
}

/// Query execution service that operates on the shared connection
pub struct QueryExecutor<'a> {
    core: &'a ConnectionCore,
    registry: Option<&'a CancelRegistry>,
}

impl<'a> QueryExecutor<'a> {
    pub fn new(core: &'a ConnectionCore) -> Self {
        QueryExecutor { core, registry: None }
    }

    /// Binds the in-flight registration in `registry` to the handle that
    /// actually runs the statement.
    pub fn with_registry(mut self, registry: &'a CancelRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Executes one statement under the connection lock.
    ///
    /// # Errors
    ///
    /// - `NotConnected` when the connection is not live
    /// - `Cancelled` when `token` was flagged while the statement ran
    /// - `TransientConnection` for the dead-connection signature
    /// - `Query` for any other driver failure
    pub fn execute(&self, request: &QueryRequest, token: &CancellationToken) -> Result<QuerySuccess> {
        if self.core.state() != ConnectionState::Connected {
            return Err(BridgeError::NotConnected);
        }

        let mut guard = self.core.lock()?;
        let state = &mut *guard;
        if let Some(registry) = self.registry {
            registry.rebind(token, state.abort.clone());
        }
        if token.is_cancelled() {
            return Err(BridgeError::Cancelled(request.result_set_id.clone()));
        }
        let handle = state.handle.as_mut().ok_or(BridgeError::NotConnected)?;

        debug!(result_set_id = %request.result_set_id, "executing statement");
        let started = Instant::now();
        let executed = handle.execute(&request.sql, request.row_cap());
        state.last_activity = Instant::now();

        if token.is_cancelled() {
            return Err(BridgeError::Cancelled(request.result_set_id.clone()));
        }
        let mut cursor = executed.map_err(|err| self.core.execution_error(err))?;

        let Some(description) = cursor.description().map(<[ColumnDescription]>::to_vec) else {
            return Ok(QuerySuccess::without_results(
                cursor.rows_affected(),
                elapsed_ms(started),
            ));
        };

        let cap = row_cap_reached(request.row_cap());
        let mut rows = Vec::new();
        while !cap(rows.len()) {
            match cursor.fetch_row().map_err(|err| self.core.execution_error(err))? {
                Some(values) => rows.push(shape_row(&description, values)),
                None => break,
            }
        }
        let columns = description.iter().map(Column::from).collect();
        Ok(QuerySuccess::with_rows(columns, rows, elapsed_ms(started)))
    }
}

fn row_cap_reached(cap: Option<usize>) -> impl Fn(usize) -> bool {
    move |fetched| cap.map_or(false, |cap| fetched >= cap)
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn shape_row(description: &[ColumnDescription], values: Vec<Value>) -> Row {
    description
        .iter()
        .zip(values)
        .map(|(column, value)| (column.name.clone(), to_json(value)))
        .collect()
}

/// Converts a driver cell to its JSON form.
pub fn to_json(value: Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(b),
        Value::Int(i) => JsonValue::from(i),
        Value::Float(f) => Number::from_f64(f).map_or(JsonValue::Null, JsonValue::Number),
        Value::Decimal(text) => match text.trim().parse::<f64>().ok().and_then(Number::from_f64) {
            Some(number) => JsonValue::Number(number),
            None => JsonValue::String(text),
        },
        Value::Text(text) => JsonValue::String(text),
        Value::Binary(bytes) => JsonValue::String(String::from_utf8_lossy(&bytes).into_owned()),
        Value::Date(date) => JsonValue::String(date.format("%Y-%m-%d").to_string()),
        Value::Time(time) => JsonValue::String(time.format("%H:%M:%S%.f").to_string()),
        Value::Timestamp(ts) => JsonValue::String(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
    }
}
