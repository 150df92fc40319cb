/// Session Module
///
/// A session is the lifetime of one CONNECT: it owns the connection manager
/// and routes statements through the retry coordinator and the classifier.
/// It is owned by the protocol worker and dropped on CLOSE, on a new CONNECT
/// or at end of input.

use crate::classifier::Classifier;
use crate::config::Config;
use crate::core::db::{
    describe_connect_failure, CancelRegistry, CancellationToken, ConnectionManager, ConnectionState,
    QueryFailure, QueryRequest, QueryResult, RetryCoordinator,
};
use crate::core::{BridgeError, Result};
use crate::driver::Driver;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, info_span, Span};
use uuid::Uuid;

pub struct Session {
    id: Uuid,
    dsn: String,
    manager: ConnectionManager,
    classifier: Arc<Classifier>,
    registry: Arc<CancelRegistry>,
    span: Span,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("dsn", &self.dsn)
            .field("state", &self.manager.state())
            .finish()
    }
}

impl Session {
    /// Connects to `dsn` and starts a session.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Connection` with the raw driver text if the
    /// connection or schema selection fails.
    pub fn open(
        driver: Arc<dyn Driver>,
        config: &Config,
        dsn: &str,
        classifier: Arc<Classifier>,
        registry: Arc<CancelRegistry>,
    ) -> Result<Self> {
        let id = Uuid::new_v4();
        let span = info_span!("session", session_id = %id, dsn);
        let schema = config.schema_for(dsn);

        let mut manager = ConnectionManager::new(
            driver,
            config.connection.clone(),
            config.heartbeat.clone(),
        );
        span.in_scope(|| manager.connect(dsn, &schema))?;
        span.in_scope(|| info!(schema = %schema, "session opened"));

        Ok(Session {
            id,
            dsn: dsn.to_string(),
            manager,
            classifier,
            registry,
            span,
        })
    }

    pub fn dsn(&self) -> &str {
        &self.dsn
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Runs one statement with retry, cancellation and classification.
    pub fn execute(&mut self, request: &QueryRequest) -> QueryResult {
        let _entered = self.span.enter();
        let token = CancellationToken::new(&request.result_set_id);
        let started = Instant::now();

        let outcome = RetryCoordinator::new(&mut self.manager, &self.registry).execute(request, &token);
        match outcome {
            Ok(success) => QueryResult::Success(success),
            Err(err) => {
                let elapsed = crate::core::db::query::elapsed_ms(started);
                QueryResult::Failure(QueryFailure::from_error(&err, &self.classifier, elapsed))
            }
        }
    }

    /// Re-establishes the connection against the same DSN and schema.
    pub fn reconnect(&mut self) -> Result<()> {
        let _entered = self.span.enter();
        self.manager.reconnect()
    }

    /// Failure text for a connect or reconnect error, hint included.
    pub fn connect_failure_message(config: &Config, err: &BridgeError) -> String {
        match err.raw_text() {
            Some(raw) => describe_connect_failure(&config.connection, raw),
            None => err.to_string(),
        }
    }

    /// Stops the heartbeat and releases the connection.
    pub fn close(mut self) {
        let _entered = self.span.clone().entered();
        self.manager.close();
        info!("session closed");
    }
}
