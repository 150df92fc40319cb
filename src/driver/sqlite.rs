/// SQLite Driver
///
/// The local backend for the execution service. DSN names resolve through the
/// configured DSN table to a database file (or `:memory:`); names that are not
/// configured are opened as paths directly, except [`MOCK_DSN`], which opens
/// the seeded demo database.
use super::{
    AbortHandle, ColumnDescription, Cursor, Driver, DriverConnection, DriverError, DriverResult,
    SqlType, Value,
};
use crate::config::{DsnConfig, MOCK_DSN};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rusqlite::{types::ValueRef, Connection};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Marker that makes a statement on a seeded DSN wait before running.
pub const SLOW_QUERY_MARKER: &str = "SLOW_QUERY";

const DEMO_SCHEMA: &str = "
CREATE TABLE people (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    age INTEGER,
    email TEXT,
    department TEXT
);
INSERT INTO people (name, age, email, department) VALUES
    ('Alice', 30, 'alice@example.com', 'Engineering'),
    ('Bob', 25, 'bob@example.com', 'Sales'),
    ('Charlie', 35, 'charlie@example.com', 'Engineering'),
    ('Diana', 28, 'diana@example.com', 'Marketing'),
    ('Eve', 32, 'eve@example.com', 'Engineering'),
    ('Frank', 29, 'frank@example.com', 'Sales'),
    ('Grace', 26, 'grace@example.com', 'HR'),
    ('Henry', 31, 'henry@example.com', 'Engineering'),
    ('Ivy', 27, 'ivy@example.com', 'Marketing'),
    ('Jack', 33, 'jack@example.com', 'Sales');

CREATE TABLE products (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    category TEXT,
    price REAL,
    stock INTEGER
);
INSERT INTO products (name, category, price, stock) VALUES
    ('Laptop', 'Electronics', 999.99, 50),
    ('Mouse', 'Electronics', 29.99, 200),
    ('Keyboard', 'Electronics', 79.99, 150),
    ('Monitor', 'Electronics', 299.99, 75),
    ('Desk Chair', 'Furniture', 249.99, 30),
    ('Desk', 'Furniture', 399.99, 20),
    ('Notebook', 'Stationery', 4.99, 500),
    ('Pen Set', 'Stationery', 12.99, 300),
    ('Water Bottle', 'Accessories', 19.99, 100),
    ('Backpack', 'Accessories', 49.99, 80);

CREATE TABLE sales (
    id INTEGER PRIMARY KEY,
    product_id INTEGER,
    quantity INTEGER,
    sale_date TEXT,
    revenue REAL,
    FOREIGN KEY (product_id) REFERENCES products(id)
);
INSERT INTO sales (product_id, quantity, sale_date, revenue) VALUES
    (1, 5, '2024-01-15', 4999.95),
    (2, 20, '2024-01-16', 599.80),
    (3, 10, '2024-01-17', 799.90),
    (1, 3, '2024-01-18', 2999.97),
    (5, 2, '2024-01-19', 499.98),
    (7, 50, '2024-01-20', 249.50),
    (8, 30, '2024-01-21', 389.70),
    (4, 5, '2024-01-22', 1499.95),
    (6, 1, '2024-01-23', 399.99),
    (9, 10, '2024-01-24', 199.90);

CREATE TABLE DW_SITES (
    site_id INTEGER PRIMARY KEY,
    site_name TEXT NOT NULL,
    region TEXT,
    active INTEGER DEFAULT 1
);
INSERT INTO DW_SITES (site_name, region, active) VALUES
    ('Site A', 'North', 1),
    ('Site B', 'South', 1),
    ('Site C', 'East', 0),
    ('Site D', 'West', 1),
    ('Site E', 'North', 1);

CREATE VIEW active_sites AS SELECT * FROM DW_SITES WHERE active = 1;
";

/// Driver opening rusqlite connections.
#[derive(Debug, Default, Clone)]
pub struct SqliteDriver {
    dsns: BTreeMap<String, DsnConfig>,
}

impl SqliteDriver {
    /// Creates a driver resolving DSN names through `dsns`.
    pub fn new(dsns: BTreeMap<String, DsnConfig>) -> Self {
        SqliteDriver { dsns }
    }

    /// Resolves a DSN name to the data source that will be opened.
    pub fn resolve(&self, dsn: &str) -> DsnConfig {
        match self.dsns.get(dsn) {
            Some(entry) => entry.clone(),
            None if dsn == MOCK_DSN => DsnConfig::mock(),
            None => DsnConfig::at_path(dsn),
        }
    }
}

impl Driver for SqliteDriver {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn connect(&self, dsn: &str) -> DriverResult<Box<dyn DriverConnection>> {
        let source = self.resolve(dsn);
        debug!(dsn, path = %source.path, seed = source.seed, "opening sqlite connection");

        let conn = if source.path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(&source.path)?
        };
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        if source.seed {
            seed_demo_schema(&conn)?;
        }

        Ok(Box::new(SqliteConnection {
            conn,
            slow_query_delay: source.slow_query_delay(),
            aborted: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// Loads the demo tables unless an earlier connect already did.
fn seed_demo_schema(conn: &Connection) -> DriverResult<()> {
    let seeded: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'people')",
        [],
        |row| row.get(0),
    )?;
    if !seeded {
        conn.execute_batch(DEMO_SCHEMA)?;
        info!("seeded demo schema");
    }
    Ok(())
}

/// A live SQLite connection.
pub struct SqliteConnection {
    conn: Connection,
    slow_query_delay: Option<Duration>,
    aborted: Arc<AtomicBool>,
}

impl SqliteConnection {
    fn attached_schemas(&self) -> DriverResult<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT name FROM pragma_database_list")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// Holds a `SLOW_QUERY` statement back, returning early on abort.
    fn wait_if_slow(&self, sql: &str) -> DriverResult<()> {
        let Some(delay) = self.slow_query_delay else {
            return Ok(());
        };
        if !sql.to_ascii_uppercase().contains(SLOW_QUERY_MARKER) {
            return Ok(());
        }

        debug!(delay_ms = delay.as_millis() as u64, "delaying slow query");
        let deadline = Instant::now() + delay;
        while Instant::now() < deadline {
            if self.aborted.load(Ordering::SeqCst) {
                return Err(DriverError::Backend("interrupted".to_string()));
            }
            thread::sleep(Duration::from_millis(10).min(deadline.saturating_duration_since(Instant::now())));
        }
        Ok(())
    }

    fn run(&mut self, sql: &str, max_rows: Option<usize>) -> DriverResult<Box<dyn Cursor + '_>> {
        self.wait_if_slow(sql)?;

        let mut stmt = self.conn.prepare(sql)?;

        if stmt.column_count() == 0 {
            let changes = stmt.execute([])?;
            // sqlite3_changes() is stale for anything but DML.
            let affected = match StatementType::from_sql(sql) {
                StatementType::Insert | StatementType::Update | StatementType::Delete => {
                    changes as i64
                }
                _ => -1,
            };
            return Ok(Box::new(BufferedCursor::without_results(affected)));
        }

        let declared: Vec<(String, Option<SqlType>)> = stmt
            .columns()
            .iter()
            .map(|col| (col.name().to_string(), col.decl_type().map(sql_type_from_decl)))
            .collect();
        let mut inferred: Vec<Option<SqlType>> = declared.iter().map(|(_, ty)| *ty).collect();

        let mut buffered = VecDeque::new();
        let mut rows = stmt.query([])?;
        while max_rows.map_or(true, |cap| buffered.len() < cap) {
            let Some(row) = rows.next()? else {
                break;
            };
            let mut values = Vec::with_capacity(declared.len());
            for (i, (_, declared_type)) in declared.iter().enumerate() {
                let value_ref = row.get_ref(i)?;
                let sql_type = match declared_type {
                    Some(ty) => *ty,
                    None => {
                        let ty = sql_type_from_value(value_ref);
                        if inferred[i].is_none() && !matches!(value_ref, ValueRef::Null) {
                            inferred[i] = Some(ty);
                        }
                        ty
                    }
                };
                values.push(convert_value(value_ref, sql_type));
            }
            buffered.push_back(values);
        }

        let description = declared
            .into_iter()
            .zip(inferred)
            .map(|((name, _), ty)| ColumnDescription {
                name,
                sql_type: ty.unwrap_or(SqlType::VarChar),
            })
            .collect();

        Ok(Box::new(BufferedCursor::with_rows(description, buffered)))
    }
}

impl DriverConnection for SqliteConnection {
    fn use_schema(&mut self, schema: &str) -> DriverResult<()> {
        let attached = self.attached_schemas()?;
        if !attached.iter().any(|name| name.eq_ignore_ascii_case(schema)) {
            return Err(DriverError::Backend(format!(
                "[SCHEMA_NOT_FOUND] The schema `{}` cannot be found.",
                schema
            )));
        }
        Ok(())
    }

    fn execute(&mut self, sql: &str, max_rows: Option<usize>) -> DriverResult<Box<dyn Cursor + '_>> {
        // An abort only applies to the statement it interrupted.
        let aborted = Arc::clone(&self.aborted);
        let result = self.run(sql, max_rows);
        aborted.store(false, Ordering::SeqCst);
        result
    }

    fn abort_handle(&self) -> Option<Arc<dyn AbortHandle>> {
        Some(Arc::new(SqliteInterrupt {
            handle: self.conn.get_interrupt_handle(),
            aborted: Arc::clone(&self.aborted),
        }))
    }

    fn close(self: Box<Self>) -> DriverResult<()> {
        let SqliteConnection { conn, .. } = *self;
        conn.close().map_err(|(_, e)| DriverError::Sqlite(e))
    }
}

struct SqliteInterrupt {
    handle: rusqlite::InterruptHandle,
    aborted: Arc<AtomicBool>,
}

impl AbortHandle for SqliteInterrupt {
    fn abort(&self) -> DriverResult<()> {
        self.aborted.store(true, Ordering::SeqCst);
        self.handle.interrupt();
        Ok(())
    }
}

/// A cursor over rows already materialized by the driver.
#[derive(Debug, Default)]
pub struct BufferedCursor {
    description: Option<Vec<ColumnDescription>>,
    rows: VecDeque<Vec<Value>>,
    affected: i64,
}

impl BufferedCursor {
    /// Cursor for a statement without a result set.
    pub fn without_results(affected: i64) -> Self {
        BufferedCursor {
            description: None,
            rows: VecDeque::new(),
            affected,
        }
    }

    /// Cursor over a result set.
    pub fn with_rows(description: Vec<ColumnDescription>, rows: VecDeque<Vec<Value>>) -> Self {
        BufferedCursor {
            description: Some(description),
            rows,
            affected: -1,
        }
    }
}

impl Cursor for BufferedCursor {
    fn description(&self) -> Option<&[ColumnDescription]> {
        self.description.as_deref()
    }

    fn rows_affected(&self) -> i64 {
        self.affected
    }

    fn fetch_row(&mut self) -> DriverResult<Option<Vec<Value>>> {
        Ok(self.rows.pop_front())
    }
}

/// Represents different SQL statement types for introspection
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum StatementType {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Drop,
    Alter,
    /// BEGIN/COMMIT/ROLLBACK transaction commands
    Transaction,
    Other,
}

impl StatementType {
    /// Determines the statement type from a SQL string
    ///
    /// Leading comments are skipped, and a `WITH` prefix is typed by the
    /// statement that follows its common table expressions.
    pub(crate) fn from_sql(sql: &str) -> Self {
        let words = top_level_words(sql);
        let mut keyword = words.first().map(String::as_str).unwrap_or("");
        if keyword == "WITH" {
            keyword = words
                .iter()
                .map(String::as_str)
                .find(|word| {
                    matches!(*word, "SELECT" | "VALUES" | "INSERT" | "REPLACE" | "UPDATE" | "DELETE")
                })
                .unwrap_or("WITH");
        }

        match keyword {
            "SELECT" | "WITH" | "VALUES" => StatementType::Select,
            "INSERT" | "REPLACE" => StatementType::Insert,
            "UPDATE" => StatementType::Update,
            "DELETE" => StatementType::Delete,
            "CREATE" => StatementType::Create,
            "DROP" => StatementType::Drop,
            "ALTER" => StatementType::Alter,
            "BEGIN" | "COMMIT" | "ROLLBACK" | "END" => StatementType::Transaction,
            _ => StatementType::Other,
        }
    }
}

/// Uppercased words outside parentheses, comments and quoted text.
fn top_level_words(sql: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut depth = 0usize;
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '-' if chars.peek() == Some(&'-') => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for skipped in chars.by_ref() {
                    if prev == '*' && skipped == '/' {
                        break;
                    }
                    prev = skipped;
                }
            }
            '\'' | '"' | '`' => {
                for skipped in chars.by_ref() {
                    if skipped == c {
                        break;
                    }
                }
            }
            '[' => {
                for skipped in chars.by_ref() {
                    if skipped == ']' {
                        break;
                    }
                }
            }
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            c if c.is_alphabetic() || c == '_' => {
                let mut word = String::from(c);
                while let Some(&next) = chars.peek() {
                    if !(next.is_alphanumeric() || next == '_') {
                        break;
                    }
                    word.push(next);
                    chars.next();
                }
                if depth == 0 {
                    words.push(word.to_ascii_uppercase());
                }
            }
            _ => {}
        }
    }
    words
}

/// Maps a declared SQLite column type to a native SQL type using SQLite's
/// affinity rules, with date/boolean names recognised first.
fn sql_type_from_decl(decl: &str) -> SqlType {
    let upper = decl.to_ascii_uppercase();
    if upper.contains("BOOL") {
        SqlType::Bit
    } else if upper.contains("TIMESTAMP") || upper.contains("DATETIME") {
        SqlType::Timestamp
    } else if upper.contains("DATE") {
        SqlType::Date
    } else if upper.contains("TIME") {
        SqlType::Time
    } else if upper.contains("BIGINT") {
        SqlType::BigInt
    } else if upper.contains("INT") {
        SqlType::Integer
    } else if upper.contains("DEC") || upper.contains("NUMERIC") {
        SqlType::Decimal
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        SqlType::Double
    } else if upper.contains("BLOB") || upper.contains("BINARY") {
        SqlType::VarBinary
    } else {
        SqlType::VarChar
    }
}

fn sql_type_from_value(value: ValueRef<'_>) -> SqlType {
    match value {
        ValueRef::Integer(_) => SqlType::BigInt,
        ValueRef::Real(_) => SqlType::Double,
        ValueRef::Blob(_) => SqlType::VarBinary,
        ValueRef::Null | ValueRef::Text(_) => SqlType::VarChar,
    }
}

fn convert_value(value: ValueRef<'_>, sql_type: SqlType) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) if sql_type == SqlType::Bit => Value::Bool(i != 0),
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(t) => convert_text(String::from_utf8_lossy(t).into_owned(), sql_type),
        ValueRef::Blob(b) => Value::Binary(b.to_vec()),
    }
}

fn convert_text(text: String, sql_type: SqlType) -> Value {
    match sql_type {
        SqlType::Date => match NaiveDate::parse_from_str(&text, "%Y-%m-%d") {
            Ok(date) => Value::Date(date),
            Err(_) => Value::Text(text),
        },
        SqlType::Time => match NaiveTime::parse_from_str(&text, "%H:%M:%S%.f") {
            Ok(time) => Value::Time(time),
            Err(_) => Value::Text(text),
        },
        SqlType::Timestamp => {
            let parsed = NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M:%S%.f"));
            match parsed {
                Ok(ts) => Value::Timestamp(ts),
                Err(_) => Value::Text(text),
            }
        }
        SqlType::Decimal | SqlType::Numeric => Value::Decimal(text),
        _ => Value::Text(text),
    }
}
