//! Metrics.
//!
//! Installs a `metrics` recorder backed by an in-process registry. Every metric name is prefixed (e.g.
//! `<project>.<app>.http_reqs`), and the current values can be read back at any time, either programmatically with
//! [`snapshot`] or over HTTP through [`MetricsAPIHandler`].

use std::{
    collections::BTreeMap,
    sync::{atomic::Ordering, Arc, OnceLock},
};

use bulwark_api::{
    response::{IntoResponse, Json},
    routing::{get, Router},
    APIHandler,
};
use bulwark_error::{generic_error, GenericError};
use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use metrics_util::registry::{AtomicStorage, Registry};
use serde::Serialize;
use tracing::debug;

static RECORDER_STATE: OnceLock<Arc<State>> = OnceLock::new();

struct State {
    registry: Registry<Key, AtomicStorage>,
    metrics_prefix: String,
}

impl State {
    fn new(metrics_prefix: String) -> Self {
        Self {
            registry: Registry::new(AtomicStorage),
            metrics_prefix,
        }
    }

    fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::default();

        for (key, counter) in self.registry.get_counter_handles() {
            snapshot
                .counters
                .insert(render_key(&key), counter.load(Ordering::Relaxed));
        }

        for (key, gauge) in self.registry.get_gauge_handles() {
            snapshot
                .gauges
                .insert(render_key(&key), f64::from_bits(gauge.load(Ordering::Relaxed)));
        }

        for (key, histogram) in self.registry.get_histogram_handles() {
            snapshot.histograms.insert(render_key(&key), histogram.data().len());
        }

        snapshot
    }
}

struct MetricsRecorder {
    state: Arc<State>,
}

impl MetricsRecorder {
    fn prefix_key(&self, key: &Key) -> Key {
        if self.state.metrics_prefix.is_empty() {
            return key.clone();
        }
        Key::from_parts(
            format!("{}.{}", self.state.metrics_prefix, key.name()),
            key.labels().cloned().collect::<Vec<_>>(),
        )
    }
}

impl Recorder for MetricsRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        let prefixed_key = self.prefix_key(key);
        self.state
            .registry
            .get_or_create_counter(&prefixed_key, |c| c.clone().into())
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        let prefixed_key = self.prefix_key(key);
        self.state
            .registry
            .get_or_create_gauge(&prefixed_key, |g| g.clone().into())
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        let prefixed_key = self.prefix_key(key);
        self.state
            .registry
            .get_or_create_histogram(&prefixed_key, |h| h.clone().into())
    }
}

/// Point-in-time values of every registered metric, keyed by prefixed name (with labels rendered as
/// `name{key=value,...}`).
#[derive(Clone, Debug, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Counter values.
    pub counters: BTreeMap<String, u64>,

    /// Gauge values.
    pub gauges: BTreeMap<String, f64>,

    /// Number of samples currently held by each histogram.
    pub histograms: BTreeMap<String, usize>,
}

fn render_key(key: &Key) -> String {
    let mut labels = key.labels().peekable();
    if labels.peek().is_none() {
        return key.name().to_string();
    }

    let labels = labels
        .map(|label| format!("{}={}", label.key(), label.value()))
        .collect::<Vec<_>>();
    format!("{}{{{}}}", key.name(), labels.join(","))
}

/// Initializes the metrics subsystem for `metrics`.
///
/// The given prefix is used to namespace all metrics that are emitted by the application, and is prepended to all
/// metrics, followed by a period (e.g. `<prefix>.<metric name>`).
///
/// # Errors
///
/// If the metrics subsystem was already initialized, an error will be returned.
pub fn initialize_metrics(metrics_prefix: impl Into<String>) -> Result<(), GenericError> {
    let metrics_prefix = metrics_prefix.into();
    let state = Arc::new(State::new(metrics_prefix.clone()));
    let recorder = MetricsRecorder {
        state: Arc::clone(&state),
    };

    metrics::set_global_recorder(recorder).map_err(|_| generic_error!("Metrics recorder was already installed."))?;
    if RECORDER_STATE.set(state).is_err() {
        return Err(generic_error!("Metrics state was already initialized."));
    }

    debug!(prefix = %metrics_prefix, "Metrics recorder installed.");
    Ok(())
}

/// Takes a snapshot of every metric registered with the global recorder.
///
/// Returns `None` if [`initialize_metrics`] has not been called.
pub fn snapshot() -> Option<MetricsSnapshot> {
    RECORDER_STATE.get().map(|state| state.snapshot())
}

/// An API handler that exposes the current metric values.
///
/// This handler exposes a single route, `/debug/metrics`, which responds with a JSON-encoded [`MetricsSnapshot`].
#[derive(Clone, Default)]
pub struct MetricsAPIHandler;

impl MetricsAPIHandler {
    async fn snapshot_handler() -> impl IntoResponse {
        Json(snapshot().unwrap_or_default())
    }
}

impl APIHandler for MetricsAPIHandler {
    type State = ();

    fn generate_initial_state(&self) -> Self::State {}

    fn generate_routes(&self) -> Router<Self::State> {
        Router::new().route("/debug/metrics", get(Self::snapshot_handler))
    }
}

#[cfg(test)]
mod tests {
    use metrics::{counter, gauge, with_local_recorder};

    use super::*;

    #[test]
    fn prefixes_and_snapshots() {
        let state = Arc::new(State::new("acme.widgets".to_string()));
        let recorder = MetricsRecorder {
            state: Arc::clone(&state),
        };

        with_local_recorder(&recorder, || {
            counter!("http_status.200").increment(3);
            gauge!("current_http_reqs").set(2.0);
            gauge!("mem.sys", "source" => "statm").set(1024.0);
        });

        let snapshot = state.snapshot();
        assert_eq!(snapshot.counters.get("acme.widgets.http_status.200"), Some(&3));
        assert_eq!(snapshot.gauges.get("acme.widgets.current_http_reqs"), Some(&2.0));
        assert_eq!(snapshot.gauges.get("acme.widgets.mem.sys{source=statm}"), Some(&1024.0));
    }

    #[test]
    fn empty_prefix_leaves_names_alone() {
        let state = Arc::new(State::new(String::new()));
        let recorder = MetricsRecorder {
            state: Arc::clone(&state),
        };

        with_local_recorder(&recorder, || counter!("http_reqs").increment(1));

        assert_eq!(state.snapshot().counters.get("http_reqs"), Some(&1));
    }
}
