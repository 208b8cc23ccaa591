use std::{
    fmt::Write as _,
    sync::{
        atomic::{AtomicU16, AtomicU64, Ordering::Relaxed},
        Mutex,
    },
};

use tracing::error;

use super::panic::{CaughtPanic, RecoveredFailure};
use crate::{
    config::RequestConfiguration,
    registry::{RequestId, RequestOutcome, RequestRegistry},
};

/// Where a request is in its lifecycle, as far as failure recovery is concerned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestState {
    /// The handler is running and nothing has been sent.
    Running,

    /// The handler failed before a response was produced, and an error response can still be sent.
    FailureRecovered,

    /// Response headers have been sent, and the body may be streaming.
    ResponseSent,

    /// A failure happened after the response had started, so nothing more can be sent.
    ResponseAlreadyStarted,
}

impl RequestState {
    /// The state after a failure is recovered.
    pub fn on_failure(self) -> Self {
        match self {
            Self::Running | Self::FailureRecovered => Self::FailureRecovered,
            Self::ResponseSent | Self::ResponseAlreadyStarted => Self::ResponseAlreadyStarted,
        }
    }

    /// The state after response headers are sent.
    pub fn on_response(self) -> Self {
        match self {
            Self::Running | Self::FailureRecovered => Self::ResponseSent,
            other => other,
        }
    }
}

/// Retires a request exactly once, when the last reference to it goes away.
///
/// References are held by the tracked response body and by every clone of the request's context, so the request stays
/// in flight for as long as anything may still act on its behalf, regardless of how the handler exited.
pub(crate) struct RequestGuard {
    registry: RequestRegistry,
    id: RequestId,
    status: AtomicU16,
    bytes_written: AtomicU64,
    state: Mutex<RequestState>,
}

impl RequestGuard {
    pub(crate) fn new(registry: RequestRegistry, id: RequestId) -> Self {
        Self {
            registry,
            id,
            status: AtomicU16::new(0),
            bytes_written: AtomicU64::new(0),
            state: Mutex::new(RequestState::Running),
        }
    }

    pub(crate) fn id(&self) -> RequestId {
        self.id
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> RequestState {
        *self.lock_state()
    }

    /// Records a recovered failure, returning the new state.
    pub(crate) fn failure_recovered(&self) -> RequestState {
        let mut state = self.lock_state();
        *state = state.on_failure();
        *state
    }

    pub(crate) fn response_sent(&self, status: u16) {
        self.status.store(status, Relaxed);
        let mut state = self.lock_state();
        *state = state.on_response();
    }

    pub(crate) fn add_bytes_written(&self, len: usize) {
        self.bytes_written.fetch_add(len as u64, Relaxed);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RequestState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        let outcome = RequestOutcome {
            status: self.status.load(Relaxed),
            bytes_written: self.bytes_written.load(Relaxed),
        };
        self.registry.retire_id(self.id, outcome);
    }
}

/// Builds the body to report for a recovered failure, and writes the failure to the log.
///
/// Typed failures carry their own body. Anything else is reported with the configured failure message, or with the
/// panic message itself if none is configured, and optionally the captured backtrace.
pub(crate) async fn failure_body(
    caught: &CaughtPanic, config: &RequestConfiguration, registry: &RequestRegistry, request_id: RequestId,
) -> String {
    let failure = caught.failure();
    let wants_backtrace = config.panic_backtrace_to_log || (config.panic_backtrace_in_response && !failure.is_typed());
    let backtrace = if wants_backtrace {
        backtrace_text(caught, config, registry).await
    } else {
        String::new()
    };

    let mut body = match failure {
        RecoveredFailure::Protocol(e) => e.body().to_string(),
        RecoveredFailure::Close(close) => close.reason().to_string(),
        RecoveredFailure::Generic(message) => {
            if config.panic_http_message.is_empty() {
                format!("PANIC: {}", message)
            } else {
                config.panic_http_message.clone()
            }
        }
    };

    if failure.is_typed() {
        error!(request_id, "PANIC - sending panic'd error to client");
    } else if config.panic_backtrace_in_response {
        error!(request_id, "PANIC - sending backtrace to client");
        body.push_str("\n\n");
        body.push_str(&backtrace);
    } else {
        error!(request_id, "PANIC - sending info to client");
    }

    if config.panic_backtrace_to_log {
        error!(request_id, "PANIC: {}{}", failure.message(), backtrace);
    }

    body
}

async fn backtrace_text(caught: &CaughtPanic, config: &RequestConfiguration, registry: &RequestRegistry) -> String {
    let mut text = match caught.backtrace() {
        Some(backtrace) => backtrace.to_string(),
        None => "<backtrace unavailable>".to_string(),
    };

    if config.panic_backtrace_all_goros {
        text.push_str("\n\n");
        text.push_str(&in_flight_listing(registry).await);
    }
    text
}

/// Lists every in-flight request, one per line.
pub(crate) async fn in_flight_listing(registry: &RequestRegistry) -> String {
    let requests = registry.snapshot().await.collect_all().await;

    let mut listing = format!("{} requests in flight:\n", requests.len());
    for request in requests {
        let _ = writeln!(
            listing,
            "  #{} {} {} ({:.3}s)",
            request.id,
            request.method,
            request.url,
            request.age().as_secs_f64()
        );
    }
    listing
}
