//! Typed views over the service configuration.
//!
//! Every option is optional: a missing key takes the default documented on its field, and limits default to `0`,
//! which disables them.

use std::{net::SocketAddr, time::Duration};

use bulwark_config::GenericConfiguration;
use bulwark_error::GenericError;
use serde::Deserialize;

const fn default_slow_req_secs() -> f64 {
    10.0
}

const fn default_panic_backtrace_all_goros() -> bool {
    true
}

const fn default_watchdog_secs() -> u64 {
    30
}

const fn default_graceful_poll_msecs() -> u64 {
    500
}

const fn default_graceful_wait_secs() -> u64 {
    60
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_project() -> String {
    "bulwark".to_string()
}

fn default_app() -> String {
    "service".to_string()
}

/// Per-request handling options.
#[derive(Clone, Debug, Deserialize)]
pub struct RequestConfiguration {
    /// Whether to trust `X-Forwarded-For` and `X-Forwarded-Proto` from a fronting proxy.
    ///
    /// Defaults to `false`.
    #[serde(default)]
    pub use_xf_headers: bool,

    /// Requests running longer than this are logged as slow, unless flagged as allowed to be slow. `0` disables the
    /// check.
    ///
    /// Defaults to 10 seconds.
    #[serde(default = "default_slow_req_secs")]
    pub slow_req_secs: f64,

    /// Forces a memory reclaim cycle after every `gc_requests` completed requests.
    ///
    /// Defaults to `0` (disabled).
    #[serde(default)]
    pub gc_requests: u64,

    /// Restarts the service once more than this many requests have completed.
    ///
    /// Defaults to `0` (disabled).
    #[serde(default)]
    pub max_requests: u64,

    /// Only write every Nth access log line.
    ///
    /// Defaults to `0` (every line is written).
    #[serde(default)]
    pub access_log_every: u64,

    /// Fixed body sent to clients when a handler fails unexpectedly, instead of the failure message.
    ///
    /// Defaults to empty (the failure message is sent).
    #[serde(default)]
    pub panic_http_message: String,

    /// Whether to append the captured backtrace to failure responses.
    ///
    /// Defaults to `false`.
    #[serde(default)]
    pub panic_backtrace_in_response: bool,

    /// Whether to log the captured backtrace of a failure.
    ///
    /// Defaults to `false`.
    #[serde(default)]
    pub panic_backtrace_to_log: bool,

    /// Whether backtraces also list every other in-flight request.
    ///
    /// Defaults to `true`.
    #[serde(default = "default_panic_backtrace_all_goros")]
    pub panic_backtrace_all_goros: bool,
}

impl Default for RequestConfiguration {
    fn default() -> Self {
        Self {
            use_xf_headers: false,
            slow_req_secs: default_slow_req_secs(),
            gc_requests: 0,
            max_requests: 0,
            access_log_every: 0,
            panic_http_message: String::new(),
            panic_backtrace_in_response: false,
            panic_backtrace_to_log: false,
            panic_backtrace_all_goros: default_panic_backtrace_all_goros(),
        }
    }
}

impl RequestConfiguration {
    /// Creates a new `RequestConfiguration` from the given configuration.
    pub fn try_from_config(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed::<Self>()?)
    }

    /// Threshold above which a request counts as slow, if enabled.
    pub fn slow_request_threshold(&self) -> Option<Duration> {
        (self.slow_req_secs > 0.0).then(|| Duration::from_secs_f64(self.slow_req_secs))
    }
}

/// Resource watchdog options.
#[derive(Clone, Debug, Deserialize)]
pub struct WatchdogConfiguration {
    /// Sampling period, in seconds.
    ///
    /// Defaults to 30 seconds.
    #[serde(default = "default_watchdog_secs")]
    pub watchdog_secs: u64,

    /// Resident memory limit, in bytes.
    #[serde(default)]
    pub sysmem_bytes_limit: u64,

    /// Live heap limit, in bytes.
    #[serde(default)]
    pub allocmem_bytes_limit: u64,

    /// Open file descriptor limit.
    #[serde(default)]
    pub numfds_limit: u64,

    /// Live task limit.
    #[serde(default)]
    pub numgoros_limit: u64,

    /// Restarts the service once it has been up for longer than this many seconds.
    #[serde(default)]
    pub restart_after_secs: f64,

    /// Restarts the service once more than this many requests have been admitted.
    #[serde(default)]
    pub max_requests: u64,
}

impl Default for WatchdogConfiguration {
    fn default() -> Self {
        Self {
            watchdog_secs: default_watchdog_secs(),
            sysmem_bytes_limit: 0,
            allocmem_bytes_limit: 0,
            numfds_limit: 0,
            numgoros_limit: 0,
            restart_after_secs: 0.0,
            max_requests: 0,
        }
    }
}

impl WatchdogConfiguration {
    /// Creates a new `WatchdogConfiguration` from the given configuration.
    pub fn try_from_config(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed::<Self>()?)
    }

    /// Sampling period. Never shorter than one second.
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.watchdog_secs.max(1))
    }
}

/// Graceful restart options.
#[derive(Clone, Debug, Deserialize)]
pub struct GracefulRestartConfiguration {
    /// How often to check the number of pending requests while draining, in milliseconds.
    ///
    /// Defaults to 500 milliseconds.
    #[serde(default = "default_graceful_poll_msecs")]
    pub graceful_poll_msecs: u64,

    /// Upper bound on waiting for the replacement to take over, and separately on draining, in seconds.
    ///
    /// Defaults to 60 seconds.
    #[serde(default = "default_graceful_wait_secs")]
    pub graceful_wait_secs: u64,
}

impl Default for GracefulRestartConfiguration {
    fn default() -> Self {
        Self {
            graceful_poll_msecs: default_graceful_poll_msecs(),
            graceful_wait_secs: default_graceful_wait_secs(),
        }
    }
}

impl GracefulRestartConfiguration {
    /// Creates a new `GracefulRestartConfiguration` from the given configuration.
    pub fn try_from_config(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed::<Self>()?)
    }

    /// Interval between pending-request checks while draining.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.graceful_poll_msecs.max(1))
    }

    /// Upper bound on the handoff wait and on the drain.
    pub fn wait_limit(&self) -> Duration {
        Duration::from_secs(self.graceful_wait_secs)
    }
}

/// Service-level options.
#[derive(Clone, Debug, Deserialize)]
pub struct ServiceConfiguration {
    /// Project name, used as the first component of metric names.
    ///
    /// Defaults to `bulwark`.
    #[serde(default = "default_project")]
    pub project: String,

    /// Application name, used as the second component of metric names.
    ///
    /// Defaults to `service`.
    #[serde(default = "default_app")]
    pub app: String,

    /// Address to listen on when no listener is inherited.
    ///
    /// Defaults to `0.0.0.0:8080`.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Whether to mount the `/debug/` endpoints.
    ///
    /// Defaults to `false`.
    #[serde(default)]
    pub enable_debug_urls: bool,
}

impl Default for ServiceConfiguration {
    fn default() -> Self {
        Self {
            project: default_project(),
            app: default_app(),
            listen_addr: default_listen_addr(),
            enable_debug_urls: false,
        }
    }
}

impl ServiceConfiguration {
    /// Creates a new `ServiceConfiguration` from the given configuration.
    pub fn try_from_config(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed::<Self>()?)
    }

    /// Prefix applied to every metric name.
    pub fn metrics_prefix(&self) -> String {
        format!("{}.{}", self.project, self.app)
    }
}
