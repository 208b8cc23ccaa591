//! High-level application primitives.
//!
//! This crate provides common primitives necessary for bootstrapping a service prior to running, such as initializing
//! logging and metrics, and composing the HTTP API from individual handlers.
#![deny(warnings)]
#![deny(missing_docs)]

#[cfg(feature = "api")]
pub mod api;

#[cfg(feature = "logging")]
pub mod logging;

#[cfg(feature = "metrics")]
pub mod metrics;

/// Common imports.
pub mod prelude {
    #[cfg(feature = "api")]
    pub use super::api::APIBuilder;
    #[cfg(feature = "logging")]
    pub use super::logging::{fatal_and_exit, initialize_logging, LoggingConfiguration};
    #[cfg(feature = "metrics")]
    pub use super::metrics::{initialize_metrics, MetricsAPIHandler};
}
