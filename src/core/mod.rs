/// Core Module for sqlbridge
///
/// This module contains the connection-resilience machinery: the shared
/// connection handle, the heartbeat monitor, query execution, bounded retry
/// and cancellation, plus the error type they all report through.

pub mod db;
pub mod error;

// Re-export commonly used types for convenience
pub use error::{BridgeError, Result};
