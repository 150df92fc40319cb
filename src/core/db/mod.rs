/// Database Module
///
/// This module provides the connection-resilience layer of sqlbridge,
/// organized into focused submodules.
///
/// ## Architecture
///
/// - **Connection Management** (`connection.rs`): the lock-guarded handle and its lifecycle
/// - **Heartbeat** (`heartbeat.rs`): keepalive statements and in-place recovery on idle connections
/// - **Query Execution** (`query.rs`): runs a statement and shapes the result
/// - **Retry** (`retry.rs`): one silent reconnect-and-retry on a dead connection
/// - **Cancellation** (`cancel.rs`): tokens and the in-flight registry
///
/// ## Error Handling
///
/// All operations report through [`BridgeError`](crate::core::BridgeError);
/// only transient connection loss is recovered here.
pub mod cancel;
pub mod connection;
pub mod heartbeat;
pub mod query;
pub mod retry;

pub use cancel::{CancelOutcome, CancelRegistry, CancellationToken};
pub use connection::{describe_connect_failure, ConnectionCore, ConnectionManager, ConnectionState};
pub use heartbeat::{HeartbeatMonitor, TickOutcome};
pub use query::{
    Column, ColumnType, QueryExecutor, QueryFailure, QueryRequest, QueryResult, QuerySuccess,
    CANCELLED_ERROR_TYPE, CONNECTION_ERROR_TYPE,
};
pub use retry::{RetryCoordinator, MAX_RETRIES};
