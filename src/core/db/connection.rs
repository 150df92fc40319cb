/// Connection Management Module
///
/// This module owns the single database handle. The handle lives inside
/// [`ConnectionCore`] behind one mutex; the foreground executor and the
/// heartbeat thread both go through that mutex, so they never touch the handle
/// at the same time. [`ConnectionManager`] drives the lifecycle: connect,
/// reconnect and close, starting and stopping the heartbeat around them.

use super::heartbeat::HeartbeatMonitor;
use crate::config::{ConnectionConfig, HeartbeatConfig};
use crate::core::{BridgeError, Result};
use crate::driver::{AbortHandle, Driver, DriverConnection, DriverError};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle of the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}

impl ConnectionState {
    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// State guarded by the connection lock.
pub struct ConnState {
    /// DSN of the last connect; reused by reconnect
    pub dsn: Option<String>,
    /// Working schema selected after every open
    pub schema: String,
    /// Live driver handle (None if disconnected)
    pub handle: Option<Box<dyn DriverConnection>>,
    /// Interrupt handle of the live connection, if the driver has one
    pub abort: Option<Arc<dyn AbortHandle>>,
    /// Last time a statement or keepalive ran on the handle
    pub last_activity: Instant,
}

impl std::fmt::Debug for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnState")
            .field("dsn", &self.dsn)
            .field("schema", &self.schema)
            .field("connected", &self.handle.is_some())
            .field("last_activity", &self.last_activity)
            .finish()
    }
}

/// The lock-guarded connection shared by the executor and the heartbeat.
pub struct ConnectionCore {
    driver: Arc<dyn Driver>,
    settings: ConnectionConfig,
    state: Mutex<ConnState>,
    /// Mirror of the lifecycle state, readable without the lock.
    phase: AtomicU8,
}

impl std::fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCore")
            .field("driver", &self.driver.name())
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionCore {
    pub fn new(driver: Arc<dyn Driver>, settings: ConnectionConfig) -> Self {
        ConnectionCore {
            driver,
            state: Mutex::new(ConnState {
                dsn: None,
                schema: settings.default_schema.clone(),
                handle: None,
                abort: None,
                last_activity: Instant::now(),
            }),
            settings,
            phase: AtomicU8::new(ConnectionState::Disconnected.as_u8()),
        }
    }

    /// Acquires the connection lock.
    pub fn lock(&self) -> Result<MutexGuard<'_, ConnState>> {
        self.state
            .lock()
            .map_err(|_| BridgeError::App("Failed to acquire connection lock".to_string()))
    }

    /// Current lifecycle state, read without taking the lock.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnectionState) {
        self.phase.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Whether `text` carries the dead-connection signature.
    pub fn is_dead_connection(&self, text: &str) -> bool {
        self.settings.is_dead_connection(text)
    }

    /// Splits a statement failure into transient and ordinary query errors.
    pub fn execution_error(&self, err: DriverError) -> BridgeError {
        let text = err.to_string();
        if self.is_dead_connection(&text) {
            BridgeError::TransientConnection(text)
        } else {
            BridgeError::Query(text)
        }
    }

    /// Opens a handle for `dsn`, selects `schema` and marks the connection live.
    ///
    /// Must be called with the lock held; any previous handle must already be
    /// closed.
    pub fn open_locked(&self, state: &mut ConnState, dsn: &str, schema: &str) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        debug!(event = "connect_attempt", dsn, schema, driver = self.driver.name());

        let mut handle = match self.driver.connect(dsn) {
            Ok(handle) => handle,
            Err(err) => {
                self.set_state(ConnectionState::Disconnected);
                warn!(event = "connect_failed", dsn, error = %err);
                return Err(BridgeError::Connection(err.to_string()));
            }
        };

        if let Err(err) = handle.use_schema(schema) {
            self.set_state(ConnectionState::Disconnected);
            warn!(event = "connect_failed", dsn, schema, error = %err);
            if let Err(close_err) = handle.close() {
                debug!(error = %close_err, "closing rejected handle failed");
            }
            return Err(BridgeError::Connection(err.to_string()));
        }

        state.dsn = Some(dsn.to_string());
        state.schema = schema.to_string();
        state.abort = handle.abort_handle();
        state.handle = Some(handle);
        state.last_activity = Instant::now();
        self.set_state(ConnectionState::Connected);
        info!(event = "connected", dsn, schema);
        Ok(())
    }

    /// Releases the handle, if any. Must be called with the lock held.
    pub fn close_locked(&self, state: &mut ConnState) {
        state.abort = None;
        if let Some(handle) = state.handle.take() {
            if let Err(err) = handle.close() {
                debug!(error = %err, "closing handle failed");
            }
            debug!(event = "closed", dsn = state.dsn.as_deref().unwrap_or(""));
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Closes and reopens against the remembered DSN and schema.
    pub fn reopen_locked(&self, state: &mut ConnState) -> Result<()> {
        let dsn = state
            .dsn
            .clone()
            .ok_or_else(|| BridgeError::Connection("No previous connection to re-establish".to_string()))?;
        let schema = state.schema.clone();
        self.close_locked(state);
        self.open_locked(state, &dsn, &schema)
    }
}

/// Connection manager for the session's single connection
#[derive(Debug)]
pub struct ConnectionManager {
    core: Arc<ConnectionCore>,
    heartbeat_config: HeartbeatConfig,
    heartbeat: Option<HeartbeatMonitor>,
}

impl ConnectionManager {
    /// Creates a disconnected manager
    pub fn new(
        driver: Arc<dyn Driver>,
        settings: ConnectionConfig,
        heartbeat_config: HeartbeatConfig,
    ) -> Self {
        ConnectionManager {
            core: Arc::new(ConnectionCore::new(driver, settings)),
            heartbeat_config,
            heartbeat: None,
        }
    }

    pub fn core(&self) -> &Arc<ConnectionCore> {
        &self.core
    }

    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn heartbeat_running(&self) -> bool {
        self.heartbeat.as_ref().map_or(false, HeartbeatMonitor::is_running)
    }

    /// DSN of the current or last connection.
    pub fn dsn(&self) -> Option<String> {
        self.core.lock().ok().and_then(|state| state.dsn.clone())
    }

    /// Opens the connection and starts the heartbeat.
    ///
    /// An existing connection is closed first.
    pub fn connect(&mut self, dsn: &str, schema: &str) -> Result<()> {
        self.stop_heartbeat();
        {
            let mut state = self.core.lock()?;
            self.core.close_locked(&mut state);
            self.core.open_locked(&mut state, dsn, schema)?;
        }
        self.start_heartbeat()
    }

    /// Stops the heartbeat, closes the handle and opens it again against the
    /// same DSN and schema.
    pub fn reconnect(&mut self) -> Result<()> {
        self.stop_heartbeat();
        debug!(event = "reconnect_attempt", source = "foreground");
        let reopened = {
            let mut state = self.core.lock()?;
            self.core.reopen_locked(&mut state)
        };
        match reopened {
            Ok(()) => {
                info!(event = "reconnected", source = "foreground");
                self.start_heartbeat()
            }
            Err(err) => {
                warn!(event = "reconnect_failed", source = "foreground", error = %err);
                Err(err)
            }
        }
    }

    /// Stops the heartbeat and releases the handle. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.stop_heartbeat();
        match self.core.lock() {
            Ok(mut state) => self.core.close_locked(&mut state),
            Err(err) => warn!(error = %err, "could not close connection"),
        }
    }

    fn start_heartbeat(&mut self) -> Result<()> {
        let monitor = HeartbeatMonitor::start(Arc::clone(&self.core), self.heartbeat_config.clone())?;
        self.heartbeat = Some(monitor);
        Ok(())
    }

    fn stop_heartbeat(&mut self) {
        if let Some(mut monitor) = self.heartbeat.take() {
            monitor.stop();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}

/// Failure text for a connect attempt, with the remediation hint appended
/// when the raw text matches the broken-tunnel signature.
pub fn describe_connect_failure(settings: &ConnectionConfig, raw: &str) -> String {
    if settings.is_broken_tunnel(raw) && !settings.tunnel_hint.is_empty() {
        format!("{}\n{}", raw, settings.tunnel_hint)
    } else {
        raw.to_string()
    }
}
