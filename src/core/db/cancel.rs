/// Cancellation Module
///
/// A statement in flight is registered here together with its token and the
/// connection's abort handle. `CANCEL` requests are served from the reader
/// thread while the worker is blocked inside the driver, so the registry has
/// its own small lock and never touches the connection lock.

use crate::driver::AbortHandle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Cancellation flag for one statement, identified by its result-set id.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    result_set_id: Arc<str>,
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new(result_set_id: &str) -> Self {
        CancellationToken {
            result_set_id: Arc::from(result_set_id),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn result_set_id(&self) -> &str {
        &self.result_set_id
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn same_as(&self, other: &CancellationToken) -> bool {
        Arc::ptr_eq(&self.cancelled, &other.cancelled)
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Nothing matching was running
    NotInFlight,
    /// The statement was flagged; `aborted` tells whether the driver
    /// accepted the interrupt
    Signalled {
        result_set_id: String,
        aborted: bool,
    },
}

impl CancelOutcome {
    pub fn cancelled(&self) -> bool {
        matches!(self, CancelOutcome::Signalled { .. })
    }
}

struct InFlight {
    token: CancellationToken,
    abort: Option<Arc<dyn AbortHandle>>,
}

/// Tracks the statement currently in flight.
#[derive(Default)]
pub struct CancelRegistry {
    active: Mutex<Option<InFlight>>,
}

impl std::fmt::Debug for CancelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let active = self.lock().as_ref().map(|in_flight| in_flight.token.clone());
        f.debug_struct("CancelRegistry").field("active", &active).finish()
    }
}

impl CancelRegistry {
    pub fn new() -> Self {
        CancelRegistry::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `token` as the statement in flight.
    pub fn begin(&self, token: &CancellationToken, abort: Option<Arc<dyn AbortHandle>>) {
        *self.lock() = Some(InFlight {
            token: token.clone(),
            abort,
        });
    }

    /// Swaps in the abort handle of a reopened connection.
    pub fn rebind(&self, token: &CancellationToken, abort: Option<Arc<dyn AbortHandle>>) {
        if let Some(in_flight) = self.lock().as_mut() {
            if in_flight.token.same_as(token) {
                in_flight.abort = abort;
            }
        }
    }

    /// Clears the registration of `token`, leaving any newer one alone.
    pub fn finish(&self, token: &CancellationToken) {
        let mut active = self.lock();
        if active
            .as_ref()
            .map_or(false, |in_flight| in_flight.token.same_as(token))
        {
            *active = None;
        }
    }

    pub fn in_flight(&self) -> Option<String> {
        self.lock()
            .as_ref()
            .map(|in_flight| in_flight.token.result_set_id().to_string())
    }

    /// Cancels the statement in flight.
    ///
    /// With `result_set_id` given, only a statement with that id is cancelled.
    pub fn cancel(&self, result_set_id: Option<&str>) -> CancelOutcome {
        let (token, abort) = {
            let active = self.lock();
            match active.as_ref() {
                Some(in_flight)
                    if result_set_id.map_or(true, |id| id == in_flight.token.result_set_id()) =>
                {
                    in_flight.token.cancel();
                    (in_flight.token.clone(), in_flight.abort.clone())
                }
                _ => {
                    debug!(requested = result_set_id.unwrap_or(""), "no matching statement in flight");
                    return CancelOutcome::NotInFlight;
                }
            }
        };

        let aborted = match abort {
            Some(handle) => match handle.abort() {
                Ok(()) => true,
                Err(err) => {
                    warn!(result_set_id = token.result_set_id(), error = %err, "driver abort failed");
                    false
                }
            },
            None => false,
        };
        info!(event = "cancelled", result_set_id = token.result_set_id(), aborted);
        CancelOutcome::Signalled {
            result_set_id: token.result_set_id().to_string(),
            aborted,
        }
    }
}
