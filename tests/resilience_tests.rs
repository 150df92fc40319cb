//! Connection-resilience tests
//!
//! The server runs in-process against the scripted driver, so dead
//! connections, failed reconnects and slow statements can be staged. Input is
//! fed line by line through a channel, which lets a test send CANCEL while an
//! EXECUTE is still running.

use serde_json::{json, Value};
use sqlbridge::config::{Config, HeartbeatConfig};
use sqlbridge::driver::scripted::{ScriptedDriver, StatementMatch};
use sqlbridge::protocol::Server;
use std::io::{self, BufReader, Read, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const DEAD_CONNECTION: &str =
    "[Simba][Hardy] (35) Error from server: error code: '0' error message: 'Invalid SessionHandle: SessionHandle [4f1c]'.";

/// Blocking reader over lines pushed through a channel
struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.pending.len() {
            match self.rx.recv() {
                Ok(bytes) => {
                    self.pending = bytes;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[derive(Clone, Default)]
struct Output(Arc<Mutex<Vec<u8>>>);

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Output {
    fn lines(&self) -> Vec<Value> {
        String::from_utf8_lossy(&self.0.lock().unwrap())
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }
}

struct Harness {
    input: Option<Sender<Vec<u8>>>,
    output: Output,
    server: Option<JoinHandle<sqlbridge::core::Result<()>>>,
}

impl Harness {
    fn start(driver: &ScriptedDriver, heartbeat: HeartbeatConfig) -> Self {
        let config = Config {
            heartbeat,
            ..Config::default()
        };
        let (tx, rx) = mpsc::channel();
        let output = Output::default();
        let server_output = output.clone();
        let driver = driver.clone();
        let server = thread::spawn(move || {
            let reader = BufReader::new(ChannelReader {
                rx,
                pending: Vec::new(),
                pos: 0,
            });
            Server::new(Arc::new(driver), config).serve(reader, server_output)
        });
        Harness {
            input: Some(tx),
            output,
            server: Some(server),
        }
    }

    fn send(&self, request: Value) {
        let mut line = request.to_string().into_bytes();
        line.push(b'\n');
        self.input.as_ref().unwrap().send(line).unwrap();
    }

    /// Waits for a response line matching `predicate`.
    fn wait_for<F: Fn(&Value) -> bool>(&self, predicate: F) -> Value {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(found) = self.output.lines().into_iter().find(|line| predicate(line)) {
                return found;
            }
            assert!(Instant::now() < deadline, "timed out; output so far: {:?}", self.output.lines());
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn execute_result(&self, result_set_id: &str) -> Value {
        self.wait_for(|line| {
            line["type"] == "EXECUTE_RESULT" && line["payload"]["resultSetId"] == result_set_id
        })["payload"]
            .clone()
    }

    fn connect(&self) {
        self.send(json!({"type": "CONNECT", "dsn": ":memory:"}));
        let connected = self.wait_for(|line| line["type"] == "CONNECT_RESULT");
        assert_eq!(connected["payload"]["success"], true);
    }

    fn finish(mut self) -> Vec<Value> {
        drop(self.input.take());
        self.server.take().unwrap().join().unwrap().unwrap();
        self.output.lines()
    }
}

fn quiet_heartbeat() -> HeartbeatConfig {
    HeartbeatConfig {
        interval_secs: 3600.0,
        grace_secs: 0.0,
        keepalive_sql: "SELECT 1".to_string(),
    }
}

fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn test_heartbeat_recovers_dead_connection_without_reconnect_request() {
    let driver = ScriptedDriver::default();
    driver.fail_statements(StatementMatch::Containing("keepalive".to_string()), 1, DEAD_CONNECTION);
    let harness = Harness::start(
        &driver,
        HeartbeatConfig {
            interval_secs: 0.02,
            grace_secs: 0.02,
            keepalive_sql: "SELECT 1 AS keepalive".to_string(),
        },
    );
    harness.connect();

    assert!(wait_until(|| driver.connect_count() >= 2));
    harness.send(json!({"type": "EXECUTE", "sql": "SELECT 42 AS answer", "resultSetId": "after"}));
    let result = harness.execute_result("after");
    assert_eq!(result["success"], true);
    assert_eq!(result["rows"][0]["answer"], 42);

    let lines = harness.finish();
    assert!(lines.iter().all(|line| line["type"] != "RECONNECT_RESULT"));
}

#[test]
fn test_transient_failure_is_retried_once() {
    let driver = ScriptedDriver::default();
    driver.fail_statements(StatementMatch::Containing("flaky".to_string()), 1, DEAD_CONNECTION);
    let harness = Harness::start(&driver, quiet_heartbeat());
    harness.connect();

    harness.send(json!({"type": "EXECUTE", "sql": "SELECT 'flaky' AS v", "resultSetId": "rs-1"}));
    let result = harness.execute_result("rs-1");
    assert_eq!(result["success"], true);
    assert_eq!(result["rows"][0]["v"], "flaky");
    assert_eq!(driver.connect_count(), 2);
    harness.finish();
}

#[test]
fn test_two_transient_failures_fail_after_one_retry() {
    let driver = ScriptedDriver::default();
    driver.fail_statements(StatementMatch::Containing("doomed".to_string()), 2, DEAD_CONNECTION);
    let harness = Harness::start(&driver, quiet_heartbeat());
    harness.connect();

    harness.send(json!({"type": "EXECUTE", "sql": "SELECT 'doomed'", "resultSetId": "rs-1"}));
    let result = harness.execute_result("rs-1");
    assert_eq!(result["success"], false);
    assert_eq!(result["rawError"], DEAD_CONNECTION);
    assert!(result["traceback"].as_str().unwrap().contains("TransientConnection"));
    assert_eq!(driver.connect_count(), 2);
    assert_eq!(driver.statement_count(), 2);

    // The reconnected session is still usable.
    harness.send(json!({"type": "EXECUTE", "sql": "SELECT 1", "resultSetId": "rs-2"}));
    assert_eq!(harness.execute_result("rs-2")["success"], true);
    harness.finish();
}

#[test]
fn test_failed_reconnect_request_reports_hint() {
    let driver = ScriptedDriver::default();
    let harness = Harness::start(&driver, quiet_heartbeat());
    harness.connect();

    driver.fail_connects(1, "Could not connect to localhost:10000");
    harness.send(json!({"type": "RECONNECT"}));
    let result = harness.wait_for(|line| line["type"] == "RECONNECT_RESULT");
    assert_eq!(result["payload"]["success"], false);
    assert_eq!(result["payload"]["rawError"], "Could not connect to localhost:10000");
    assert!(result["payload"]["error"].as_str().unwrap().contains("Hint:"));

    harness.send(json!({"type": "RECONNECT"}));
    let lines = harness.finish();
    let reconnects: Vec<&Value> = lines.iter().filter(|l| l["type"] == "RECONNECT_RESULT").collect();
    assert_eq!(reconnects.len(), 2);
    assert_eq!(reconnects[1]["payload"]["success"], true);
}

#[test]
fn test_cancel_while_statement_runs() {
    let driver = ScriptedDriver::default();
    driver.delay_statements(StatementMatch::Containing("slow".to_string()), Duration::from_millis(400));
    let harness = Harness::start(&driver, quiet_heartbeat());
    harness.connect();

    harness.send(json!({"type": "EXECUTE", "sql": "SELECT 'slow'", "resultSetId": "rs-slow"}));
    assert!(wait_until(|| driver.statement_count() >= 1));
    harness.send(json!({"type": "CANCEL", "resultSetId": "rs-slow"}));

    let cancel = harness.wait_for(|line| line["type"] == "CANCEL_RESULT");
    assert_eq!(cancel["payload"]["success"], true);
    assert_eq!(cancel["payload"]["cancelled"], true);

    let result = harness.execute_result("rs-slow");
    assert_eq!(result["success"], false);
    assert_eq!(result["cancelled"], true);
    assert_eq!(result["errorType"], "Cancelled");
    assert_eq!(driver.abort_count(), 1);

    // The next statement is unaffected.
    harness.send(json!({"type": "EXECUTE", "sql": "SELECT 2 AS two", "resultSetId": "rs-next"}));
    assert_eq!(harness.execute_result("rs-next")["rows"][0]["two"], 2);
    harness.finish();
}

#[test]
fn test_cancel_releases_slow_query_on_mock_dsn() {
    let driver = ScriptedDriver::default();
    let harness = Harness::start(&driver, quiet_heartbeat());
    harness.send(json!({"type": "CONNECT", "dsn": "Mock"}));
    let connected = harness.wait_for(|line| line["type"] == "CONNECT_RESULT");
    assert_eq!(connected["payload"]["success"], true);

    let started = Instant::now();
    harness.send(json!({"type": "EXECUTE", "sql": "SELECT * FROM people -- SLOW_QUERY", "resultSetId": "rs-slow"}));
    assert!(wait_until(|| driver.statement_count() >= 1));
    harness.send(json!({"type": "CANCEL", "resultSetId": "rs-slow"}));

    let result = harness.execute_result("rs-slow");
    assert_eq!(result["cancelled"], true);
    assert_eq!(result["errorType"], "Cancelled");
    assert!(started.elapsed() < Duration::from_secs(8));

    harness.send(json!({"type": "EXECUTE", "sql": "SELECT COUNT(*) AS n FROM people", "resultSetId": "rs-count"}));
    assert_eq!(harness.execute_result("rs-count")["rows"][0]["n"], 10);
    harness.finish();
}

#[test]
fn test_cancel_for_other_id_is_ignored() {
    let driver = ScriptedDriver::default();
    driver.delay_statements(StatementMatch::Containing("slow".to_string()), Duration::from_millis(200));
    let harness = Harness::start(&driver, quiet_heartbeat());
    harness.connect();

    harness.send(json!({"type": "EXECUTE", "sql": "SELECT 'slow' AS s", "resultSetId": "rs-slow"}));
    assert!(wait_until(|| driver.statement_count() >= 1));
    harness.send(json!({"type": "CANCEL", "resultSetId": "someone-else"}));

    let cancel = harness.wait_for(|line| line["type"] == "CANCEL_RESULT");
    assert_eq!(cancel["payload"]["cancelled"], false);
    assert_eq!(harness.execute_result("rs-slow")["success"], true);
    assert_eq!(driver.abort_count(), 0);
    harness.finish();
}

#[test]
fn test_end_of_input_releases_connection() {
    let driver = ScriptedDriver::default();
    let harness = Harness::start(&driver, quiet_heartbeat());
    harness.connect();
    let lines = harness.finish();

    assert_eq!(lines.len(), 2);
    assert_eq!(driver.close_count(), 1);
}
