//! Graceful restart.
//!
//! A restart is requested through a [`RestartTrigger`], which any number of sources (the watchdog, the request
//! registry, an operator signal) may hold. Only the first request starts a restart sequence; the
//! [`RestartCoordinator`] then hands the listening socket to a replacement process and drains this one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{info, warn};

mod coordinator;
pub use self::coordinator::{drain, DrainOutcome, RestartCoordinator, RestartPhase};

pub mod handoff;

/// Why, and when, a restart sequence began.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RestartState {
    /// Human-readable reason.
    pub reason: String,

    /// When the restart was requested.
    pub triggered_at: DateTime<Utc>,
}

/// An idempotent restart trigger.
///
/// Cloning is cheap, and all clones share the same state. The first call to [`request`][Self::request] records the
/// reason and wakes everyone waiting on [`wait`][Self::wait]; later calls are logged and otherwise ignored.
#[derive(Clone)]
pub struct RestartTrigger {
    state: Arc<watch::Sender<Option<RestartState>>>,
}

impl RestartTrigger {
    /// Creates a new, untriggered `RestartTrigger`.
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self { state: Arc::new(state) }
    }

    /// Requests a restart.
    ///
    /// Returns `true` if this call started the restart sequence, or `false` if one was already in progress.
    pub fn request(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let started = self.state.send_if_modified(|state| match state {
            Some(_) => false,
            None => {
                *state = Some(RestartState {
                    reason: reason.clone(),
                    triggered_at: Utc::now(),
                });
                true
            }
        });

        if started {
            warn!(%reason, "Restart requested.");
        } else {
            info!(%reason, "Restart already in progress. Ignoring request.");
        }
        started
    }

    /// Returns `true` if a restart has been requested.
    pub fn is_triggered(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// Gets the state of the restart sequence, if one has been requested.
    pub fn current(&self) -> Option<RestartState> {
        self.state.borrow().clone()
    }

    /// Waits until a restart has been requested.
    pub async fn wait(&self) -> RestartState {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(Option::is_some).await {
            Ok(state) => state.clone(),
            Err(_) => None,
        };
        if let Some(state) = state {
            return state;
        }

        // The sender lives as long as `self`, so the channel cannot close under us.
        std::future::pending().await
    }
}

impl Default for RestartTrigger {
    fn default() -> Self {
        Self::new()
    }
}
