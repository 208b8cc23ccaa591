//! Production-hardening runtime for long-lived HTTP services.
//!
//! This crate keeps track of every in-flight request, recovers from handler failures, watches process resources, and
//! restarts the service without dropping its listening socket when a resource limit is reached or an operator asks
//! for it. [`server::ServiceRunner`] wires all of it together around a service's own routes.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod api;
pub mod config;
pub mod middleware;
pub mod reclaim;
pub mod registry;
pub mod restart;
pub mod server;
pub mod streaming;
pub mod watchdog;

/// Common imports.
pub mod prelude {
    pub use super::config::{
        GracefulRestartConfiguration, RequestConfiguration, ServiceConfiguration, WatchdogConfiguration,
    };
    pub use super::middleware::{CloseMessage, HttpError, RequestContext, RequiredParamsLayer};
    pub use super::restart::{DrainOutcome, RestartTrigger};
    pub use super::server::ServiceRunner;
    pub use super::streaming::{guard_streaming_session, SessionSocket};
}
