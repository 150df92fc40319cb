/// Retry Module
///
/// Wraps statement execution with one silent reconnect-and-retry when the
/// backend reports the dead-connection signature. Every other failure, a
/// failed reconnect, or a second transient failure goes back to the caller
/// unchanged.

use super::cancel::{CancelRegistry, CancellationToken};
use super::connection::ConnectionManager;
use super::query::{QueryExecutor, QueryRequest, QuerySuccess};
use crate::core::{BridgeError, Result};
use tracing::{info, warn};

/// Retries allowed per request after a transient failure.
pub const MAX_RETRIES: u32 = 1;

/// Runs statements with the single-retry policy.
pub struct RetryCoordinator<'a> {
    manager: &'a mut ConnectionManager,
    registry: &'a CancelRegistry,
}

impl<'a> RetryCoordinator<'a> {
    pub fn new(manager: &'a mut ConnectionManager, registry: &'a CancelRegistry) -> Self {
        RetryCoordinator { manager, registry }
    }

    /// Executes `request`, registered as cancellable under `token` for the
    /// whole call including any retry.
    pub fn execute(&mut self, request: &QueryRequest, token: &CancellationToken) -> Result<QuerySuccess> {
        // The abort handle is bound once the executor holds the connection.
        self.registry.begin(token, None);
        let result = self.execute_with_retry(request, token);
        self.registry.finish(token);
        result
    }

    fn execute_with_retry(&mut self, request: &QueryRequest, token: &CancellationToken) -> Result<QuerySuccess> {
        let mut retries = 0;
        loop {
            let executor = QueryExecutor::new(self.manager.core()).with_registry(self.registry);
            let err = match executor.execute(request, token) {
                Ok(success) => return Ok(success),
                Err(err) => err,
            };
            if !err.is_transient() || retries >= MAX_RETRIES {
                return Err(err);
            }

            retries += 1;
            warn!(
                result_set_id = %request.result_set_id,
                error = %err,
                retry = retries,
                "connection lost during execution, reconnecting"
            );
            if let Err(reconnect_err) = self.manager.reconnect() {
                warn!(error = %reconnect_err, "reconnect before retry failed");
                return Err(err);
            }
            if token.is_cancelled() {
                return Err(BridgeError::Cancelled(request.result_set_id.clone()));
            }
            info!(result_set_id = %request.result_set_id, "retrying statement");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::driver::scripted::{ScriptedDriver, StatementMatch};
    use crate::test_utils::{idle_heartbeat, DEAD_CONNECTION};
    use std::sync::Arc;

    fn connected(driver: &ScriptedDriver) -> ConnectionManager {
        let mut conn_mgr = ConnectionManager::new(
            Arc::new(driver.clone()),
            ConnectionConfig::default(),
            idle_heartbeat(),
        );
        conn_mgr.connect(":memory:", "main").unwrap();
        conn_mgr
    }

    fn run(conn_mgr: &mut ConnectionManager, registry: &CancelRegistry, sql: &str) -> Result<QuerySuccess> {
        let request = QueryRequest::new(sql, "rs-1");
        let token = CancellationToken::new(&request.result_set_id);
        RetryCoordinator::new(conn_mgr, registry).execute(&request, &token)
    }

    #[test]
    fn test_single_transient_failure_is_retried() {
        let driver = ScriptedDriver::default();
        let mut conn_mgr = connected(&driver);
        let registry = CancelRegistry::new();
        driver.fail_statements(StatementMatch::Containing("SELECT 42".to_string()), 1, DEAD_CONNECTION);

        let success = run(&mut conn_mgr, &registry, "SELECT 42 AS answer").unwrap();
        assert_eq!(success.row_count, 1);
        assert_eq!(driver.connect_count(), 2);
        assert_eq!(driver.statement_count(), 2);
        assert!(conn_mgr.heartbeat_running());
        assert_eq!(registry.in_flight(), None);
    }

    #[test]
    fn test_second_transient_failure_is_reported_after_one_retry() {
        let driver = ScriptedDriver::default();
        let mut conn_mgr = connected(&driver);
        let registry = CancelRegistry::new();
        driver.fail_statements(StatementMatch::Any, 2, DEAD_CONNECTION);

        let err = run(&mut conn_mgr, &registry, "SELECT 1").unwrap_err();
        assert!(err.is_transient());
        assert_eq!(driver.statement_count(), 2);
        assert_eq!(driver.connect_count(), 2);
    }

    #[test]
    fn test_ordinary_failure_is_not_retried() {
        let driver = ScriptedDriver::default();
        let mut conn_mgr = connected(&driver);
        let registry = CancelRegistry::new();

        let err = run(&mut conn_mgr, &registry, "SELECT * FROM missing").unwrap_err();
        assert!(matches!(err, BridgeError::Query(_)));
        assert_eq!(driver.connect_count(), 1);
    }

    #[test]
    fn test_failed_reconnect_reports_original_error() {
        let driver = ScriptedDriver::default();
        let mut conn_mgr = connected(&driver);
        let registry = CancelRegistry::new();
        driver.fail_statements(StatementMatch::Any, 1, DEAD_CONNECTION);
        driver.fail_connects(1, "Connection refused");

        match run(&mut conn_mgr, &registry, "SELECT 1") {
            Err(BridgeError::TransientConnection(raw)) => assert_eq!(raw, DEAD_CONNECTION),
            other => panic!("Expected TransientConnection, got {:?}", other),
        }
        assert_eq!(driver.statement_count(), 1);
        assert!(!conn_mgr.is_connected());
    }
}
