/// # Test Utilities Module
///
/// Shared fixtures for the unit tests:
/// - Heartbeat settings that never fire, or fire on every tick
/// - Sample data loaded through the shared connection
/// - A scripted-driver session builder
/// - A clonable output buffer for driving the protocol server in-process

use crate::classifier::Classifier;
use crate::config::{Config, HeartbeatConfig};
use crate::core::db::{CancelRegistry, ConnectionCore};
use crate::core::Result;
use crate::driver::scripted::ScriptedDriver;
use crate::driver::Driver;
use crate::session::Session;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Backend text carrying the dead-connection signature.
pub const DEAD_CONNECTION: &str =
    "[Simba][Hardy] (35) Error from server: error code: '0' error message: 'Invalid SessionHandle: SessionHandle [4f1c]'.";

/// Heartbeat that ticks rarely and never finds the connection idle.
pub fn idle_heartbeat() -> HeartbeatConfig {
    HeartbeatConfig {
        interval_secs: 3600.0,
        grace_secs: 0.0,
        keepalive_sql: "SELECT 1".to_string(),
    }
}

/// Heartbeat that ticks every 20ms and sends a keepalive on every tick.
pub fn eager_heartbeat() -> HeartbeatConfig {
    HeartbeatConfig {
        interval_secs: 0.02,
        grace_secs: 0.02,
        keepalive_sql: "SELECT 1".to_string(),
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Creates and fills `people` (10 rows; ages 21..=48 step 3) on the live handle.
pub fn sample_people(core: &ConnectionCore) {
    let mut state = core.lock().unwrap();
    let handle = state.handle.as_mut().expect("connection is open");
    handle
        .execute(
            "CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT, age INTEGER, active BOOLEAN)",
            None,
        )
        .unwrap();
    for i in 1..=10 {
        let sql = format!(
            "INSERT INTO people (id, name, age, active) VALUES ({}, 'Person {}', {}, {})",
            i,
            i,
            18 + i * 3,
            i % 2
        );
        handle.execute(&sql, None).unwrap();
    }
}

/// Opens a session on `:memory:` through `driver` with a quiet heartbeat.
pub fn scripted_session(driver: &ScriptedDriver) -> Result<Session> {
    let config = Config {
        heartbeat: idle_heartbeat(),
        ..Config::default()
    };
    let classifier = Classifier::for_driver(driver.name(), &config.diagnostics);
    Session::open(
        Arc::new(driver.clone()),
        &config,
        ":memory:",
        Arc::new(classifier),
        Arc::new(CancelRegistry::new()),
    )
}

/// Output sink that can be inspected after the server is done with it.
#[derive(Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock().unwrap()).into_owned()
    }

    /// Each written line parsed as JSON.
    pub fn json_lines(&self) -> Vec<serde_json::Value> {
        self.contents()
            .lines()
            .map(|line| serde_json::from_str(line).expect("response line is JSON"))
            .collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.bytes.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::{CancellationToken, QueryExecutor, QueryRequest};

    #[test]
    fn test_sample_people_fixture() {
        let driver = ScriptedDriver::default();
        let session = scripted_session(&driver).unwrap();
        let core = session.manager().core();
        sample_people(core);

        let request = QueryRequest::new("SELECT COUNT(*) AS n, SUM(active) AS a FROM people", "rs");
        let success = QueryExecutor::new(core)
            .execute(&request, &CancellationToken::new("rs"))
            .unwrap();
        let row = &success.rows.unwrap()[0];
        assert_eq!(row["n"], 10);
        assert_eq!(row["a"], 5);
    }

    #[test]
    fn test_wait_until() {
        assert!(wait_until(Duration::from_millis(50), || true));
        assert!(!wait_until(Duration::from_millis(20), || false));
    }

    #[test]
    fn test_shared_buffer_collects_lines() {
        let buffer = SharedBuffer::default();
        let mut writer = buffer.clone();
        writeln!(writer, "{{\"a\":1}}").unwrap();
        writeln!(writer, "{{\"b\":2}}").unwrap();
        assert_eq!(buffer.json_lines().len(), 2);
    }
}
