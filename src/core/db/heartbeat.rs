/// Heartbeat Module
///
/// A background thread that keeps an idle connection alive. Every interval it
/// checks how long the handle has been idle; past the idle threshold it sends
/// the keepalive statement under the connection lock. A keepalive failing with the
/// dead-connection signature reopens the handle in place, still under the
/// lock, so the foreground never observes a half-open connection.

use super::connection::{ConnState, ConnectionCore, ConnectionState};
use crate::config::HeartbeatConfig;
use crate::core::Result;
use crate::driver::{DriverConnection, DriverResult};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

/// What a single heartbeat tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Not connected, or the connection was used recently
    Skipped,
    /// Keepalive succeeded
    KeptAlive,
    /// Keepalive failed without the dead-connection signature
    KeepaliveFailed,
    /// Keepalive hit a dead connection and the handle was reopened
    Reconnected,
    /// Keepalive hit a dead connection and reopening failed
    ReconnectFailed,
}

/// Handle to a running heartbeat thread
#[derive(Debug)]
pub struct HeartbeatMonitor {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatMonitor {
    /// Spawns the heartbeat thread for `core`.
    pub fn start(core: Arc<ConnectionCore>, config: HeartbeatConfig) -> Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let interval = config.interval();

        let handle = thread::Builder::new()
            .name("sqlbridge-heartbeat".to_string())
            .spawn(move || {
                debug!(interval_ms = interval.as_millis() as u64, "heartbeat started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            tick(&core, &config);
                        }
                        // Stop requested or the manager went away
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("heartbeat stopped");
            })?;

        Ok(HeartbeatMonitor {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Signals the thread and waits for it. A keepalive in flight finishes first.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("heartbeat thread panicked");
            }
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Runs one heartbeat tick against `core`.
pub fn tick(core: &ConnectionCore, config: &HeartbeatConfig) -> TickOutcome {
    if core.state() != ConnectionState::Connected {
        return TickOutcome::Skipped;
    }
    let mut guard = match core.lock() {
        Ok(guard) => guard,
        Err(err) => {
            warn!(error = %err, "heartbeat could not take connection lock");
            return TickOutcome::Skipped;
        }
    };
    let state: &mut ConnState = &mut guard;

    let idle = state.last_activity.elapsed();
    if idle < config.idle_threshold() {
        return TickOutcome::Skipped;
    }
    let Some(handle) = state.handle.as_mut() else {
        return TickOutcome::Skipped;
    };

    debug!(event = "keepalive_sent", idle_ms = idle.as_millis() as u64);
    let sent = send_keepalive(handle.as_mut(), &config.keepalive_sql);
    state.last_activity = Instant::now();

    match sent {
        Ok(()) => TickOutcome::KeptAlive,
        Err(err) => {
            let text = err.to_string();
            warn!(event = "keepalive_failed", error = %text);
            if !core.is_dead_connection(&text) {
                return TickOutcome::KeepaliveFailed;
            }

            debug!(event = "reconnect_attempt", source = "heartbeat");
            match core.reopen_locked(state) {
                Ok(()) => {
                    info!(event = "reconnected", source = "heartbeat");
                    TickOutcome::Reconnected
                }
                Err(err) => {
                    warn!(event = "reconnect_failed", source = "heartbeat", error = %err);
                    TickOutcome::ReconnectFailed
                }
            }
        }
    }
}

fn send_keepalive(handle: &mut dyn DriverConnection, sql: &str) -> DriverResult<()> {
    let mut cursor = handle.execute(sql, None)?;
    while cursor.fetch_row()?.is_some() {}
    Ok(())
}
