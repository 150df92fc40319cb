/// Scripted Driver
///
/// A fault-injecting driver wrapping [`SqliteDriver`]. Statements and connects
/// are delegated to SQLite unless a scripted failure or delay applies, which
/// makes dead connections, failed reconnects and slow statements reproducible
/// without a remote backend.
use super::sqlite::SqliteDriver;
use super::{AbortHandle, Cursor, Driver, DriverConnection, DriverError, DriverResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Which statements an injected failure or delay applies to.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementMatch {
    /// Every statement
    Any,
    /// Statements containing this fragment (case-insensitive)
    Containing(String),
}

impl StatementMatch {
    fn matches(&self, sql: &str) -> bool {
        match self {
            StatementMatch::Any => true,
            StatementMatch::Containing(fragment) => sql
                .to_ascii_lowercase()
                .contains(&fragment.to_ascii_lowercase()),
        }
    }
}

#[derive(Debug)]
struct InjectedFailure {
    target: StatementMatch,
    message: String,
    remaining: usize,
}

#[derive(Debug, Default)]
struct Script {
    connect_failures: Vec<String>,
    statement_failures: Vec<InjectedFailure>,
    delays: Vec<(StatementMatch, Duration)>,
}

impl Script {
    fn take_statement_failure(&mut self, sql: &str) -> Option<String> {
        let failure = self
            .statement_failures
            .iter_mut()
            .find(|f| f.remaining > 0 && f.target.matches(sql))?;
        failure.remaining -= 1;
        Some(failure.message.clone())
    }

    fn delay_for(&self, sql: &str) -> Option<Duration> {
        self.delays
            .iter()
            .find(|(target, _)| target.matches(sql))
            .map(|(_, delay)| *delay)
    }
}

#[derive(Debug, Default)]
struct Counters {
    connects: AtomicUsize,
    closes: AtomicUsize,
    statements: AtomicUsize,
    aborts: AtomicUsize,
}

/// Driver that injects scripted failures in front of SQLite.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDriver {
    inner: SqliteDriver,
    script: Arc<Mutex<Script>>,
    counters: Arc<Counters>,
}

impl ScriptedDriver {
    pub fn new(inner: SqliteDriver) -> Self {
        ScriptedDriver {
            inner,
            script: Arc::default(),
            counters: Arc::default(),
        }
    }

    /// Makes the next `times` connect attempts fail with `message`.
    pub fn fail_connects(&self, times: usize, message: &str) {
        let mut script = lock(&self.script);
        script
            .connect_failures
            .extend(std::iter::repeat(message.to_string()).take(times));
    }

    /// Makes the next `times` statements matching `target` fail with `message`.
    pub fn fail_statements(&self, target: StatementMatch, times: usize, message: &str) {
        lock(&self.script).statement_failures.push(InjectedFailure {
            target,
            message: message.to_string(),
            remaining: times,
        });
    }

    /// Sleeps for `delay` before running statements matching `target`.
    pub fn delay_statements(&self, target: StatementMatch, delay: Duration) {
        lock(&self.script).delays.push((target, delay));
    }

    /// Successful and failed connect attempts so far.
    pub fn connect_count(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    /// Statements submitted to the driver, including failed ones.
    pub fn statement_count(&self) -> usize {
        self.counters.statements.load(Ordering::SeqCst)
    }

    pub fn abort_count(&self) -> usize {
        self.counters.aborts.load(Ordering::SeqCst)
    }
}

impl Driver for ScriptedDriver {
    fn name(&self) -> &str {
        "scripted"
    }

    fn connect(&self, dsn: &str) -> DriverResult<Box<dyn DriverConnection>> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);

        let failure = {
            let mut script = lock(&self.script);
            if script.connect_failures.is_empty() {
                None
            } else {
                Some(script.connect_failures.remove(0))
            }
        };
        if let Some(message) = failure {
            debug!(dsn, "injecting connect failure");
            return Err(DriverError::Backend(message));
        }

        let inner = self.inner.connect(dsn)?;
        Ok(Box::new(ScriptedConnection {
            inner,
            script: Arc::clone(&self.script),
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct ScriptedConnection {
    inner: Box<dyn DriverConnection>,
    script: Arc<Mutex<Script>>,
    counters: Arc<Counters>,
}

impl DriverConnection for ScriptedConnection {
    fn use_schema(&mut self, schema: &str) -> DriverResult<()> {
        self.inner.use_schema(schema)
    }

    fn execute(&mut self, sql: &str, max_rows: Option<usize>) -> DriverResult<Box<dyn Cursor + '_>> {
        self.counters.statements.fetch_add(1, Ordering::SeqCst);

        let (failure, delay) = {
            let mut script = lock(&self.script);
            (script.take_statement_failure(sql), script.delay_for(sql))
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        if let Some(message) = failure {
            debug!(sql, "injecting statement failure");
            return Err(DriverError::Backend(message));
        }

        self.inner.execute(sql, max_rows)
    }

    fn abort_handle(&self) -> Option<Arc<dyn AbortHandle>> {
        Some(Arc::new(CountingAbort {
            inner: self.inner.abort_handle(),
            counters: Arc::clone(&self.counters),
        }))
    }

    fn close(self: Box<Self>) -> DriverResult<()> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close()
    }
}

struct CountingAbort {
    inner: Option<Arc<dyn AbortHandle>>,
    counters: Arc<Counters>,
}

impl AbortHandle for CountingAbort {
    fn abort(&self) -> DriverResult<()> {
        self.counters.aborts.fetch_add(1, Ordering::SeqCst);
        match &self.inner {
            Some(handle) => handle.abort(),
            None => Err(DriverError::Unsupported("abort")),
        }
    }
}

fn lock(script: &Mutex<Script>) -> MutexGuard<'_, Script> {
    script.lock().unwrap_or_else(PoisonError::into_inner)
}
