//! Debug endpoints.

use std::{backtrace::Backtrace, sync::Arc, time::Duration};

use bulwark_api::{
    extract::{Path, Query, State},
    response::{IntoResponse, Json},
    routing::{get, Router},
    APIHandler, StatusCode,
};
use chrono::{DateTime, Utc};
use process_stats::{ProcessSample, Sampler};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::{
    config::ServiceConfiguration,
    middleware::{in_flight_listing, HttpError},
    reclaim::{MemoryReclaim, PauseSummary},
    registry::{InFlightSummary, RequestRegistry},
};

const MAX_TEST_ALLOCATION_KB: usize = 1024 * 1024;

#[derive(Serialize)]
struct ServiceStatus {
    project: String,
    app: String,
    pid: u32,
    start_time: DateTime<Utc>,
    uptime_secs: f64,
    tasks: usize,
    current_requests: u64,
    total_requests: u64,
    requests: Vec<InFlightSummary>,
}

#[derive(Serialize)]
struct MemoryStatus {
    process: ProcessSample,
    reclaim: PauseSummary,
}

#[derive(Deserialize)]
struct MemoryAdjustment {
    #[serde(default)]
    gc_now: u32,

    #[serde(default)]
    gc_percent: u32,
}

#[derive(Deserialize)]
struct TestRequest {
    #[serde(default)]
    secs: u64,

    #[serde(default)]
    kbytes: usize,
}

/// State used by the debug API handler.
#[derive(Clone)]
pub struct DebugState {
    service: Arc<ServiceConfiguration>,
    registry: RequestRegistry,
    reclaim: MemoryReclaim,
    effective_config: Arc<serde_json::Value>,
}

/// An API handler for inspecting a running service.
///
/// This handler registers the following routes:
///
/// - `GET /debug/status`: project, app, process ID, start time, uptime, live task count, and every in-flight request.
/// - `GET /debug/stack`: a backtrace of the thread serving the request, followed by every in-flight request.
/// - `GET /debug/mem`: process memory usage and a summary of recent memory reclaim pauses.
/// - `POST /debug/mem?gc_now=1&gc_percent=N`: runs a memory reclaim cycle, and/or adjusts reclaim tuning.
/// - `GET /debug/config`: the effective configuration, as JSON.
/// - `GET /debug/config/{key}`: a single top-level configuration value.
/// - `GET /debug/test?secs=N&kbytes=N`: a request that takes `secs` seconds and allocates `kbytes` KiB, for exercising
///   the watchdog and slow-request reporting.
///
/// None of these routes are protected, so they should only be mounted when `enable_debug_urls` is set.
pub struct DebugAPIHandler {
    state: DebugState,
}

impl DebugAPIHandler {
    /// Creates a new `DebugAPIHandler`.
    ///
    /// `effective_config` is served as-is by the configuration routes.
    pub fn new(
        service: ServiceConfiguration, registry: RequestRegistry, reclaim: MemoryReclaim,
        effective_config: serde_json::Value,
    ) -> Self {
        Self {
            state: DebugState {
                service: Arc::new(service),
                registry,
                reclaim,
                effective_config: Arc::new(effective_config),
            },
        }
    }

    async fn status_handler(State(state): State<DebugState>) -> Result<impl IntoResponse, HttpError> {
        let stats = state
            .registry
            .stats()
            .await
            .map_err(|e| HttpError::server_error(e.to_string()))?;
        let requests = state
            .registry
            .snapshot()
            .await
            .collect_all()
            .await
            .iter()
            .map(|request| request.summary())
            .collect();

        Ok(Json(ServiceStatus {
            project: state.service.project.clone(),
            app: state.service.app.clone(),
            pid: std::process::id(),
            start_time: stats.started_at_wall,
            uptime_secs: stats.uptime().as_secs_f64(),
            tasks: Handle::current().metrics().num_alive_tasks(),
            current_requests: stats.current_requests,
            total_requests: stats.total_requests,
            requests,
        }))
    }

    async fn stack_handler(State(state): State<DebugState>) -> impl IntoResponse {
        let backtrace = Backtrace::force_capture();
        format!("{}\n\n{}", backtrace, in_flight_listing(&state.registry).await)
    }

    async fn memory_handler(State(state): State<DebugState>) -> impl IntoResponse {
        Json(MemoryStatus {
            process: Sampler.sample(),
            reclaim: state.reclaim.pause_summary(),
        })
    }

    async fn adjust_memory_handler(
        State(state): State<DebugState>, Query(params): Query<MemoryAdjustment>,
    ) -> impl IntoResponse {
        let mut message = String::from("Adjusting memory reclaim\n");

        if params.gc_now > 0 {
            let pause = state.reclaim.run().await;
            info!(?pause, "Ran memory reclaim by request to handler.");
            message.push_str(&format!("Ran memory reclaim by request to handler ({:?})\n", pause));
        }

        if params.gc_percent > 0 {
            match state.reclaim.set_tuning_percentage(params.gc_percent) {
                Some(previous) => {
                    info!(percent = params.gc_percent, previous, "Adjusted memory reclaim tuning.");
                    message.push_str(&format!(
                        "Set reclaim tuning to [{}] was [{}]\n",
                        params.gc_percent, previous
                    ));
                }
                None => message.push_str("Memory reclaim tuning is not supported\n"),
            }
        }

        message
    }

    async fn config_handler(State(state): State<DebugState>) -> impl IntoResponse {
        Json(state.effective_config.as_ref().clone())
    }

    async fn config_key_handler(
        State(state): State<DebugState>, Path(key): Path<String>,
    ) -> Result<impl IntoResponse, HttpError> {
        match state.effective_config.get(&key) {
            Some(value) => Ok(Json(value.clone())),
            None => Err(HttpError::not_found("No such configuration key")),
        }
    }

    async fn test_handler(Query(params): Query<TestRequest>) -> Result<impl IntoResponse, HttpError> {
        if params.kbytes > MAX_TEST_ALLOCATION_KB {
            return Err(HttpError::new(
                StatusCode::BAD_REQUEST,
                format!("kbytes must be at most {}", MAX_TEST_ALLOCATION_KB),
            ));
        }

        debug!(secs = params.secs, kbytes = params.kbytes, "Test request.");
        let allocation = vec![1u8; params.kbytes * 1024];
        tokio::time::sleep(Duration::from_secs(params.secs)).await;
        drop(allocation);

        Ok(format!(
            "Slow request took additional {} secs and allocated additional {} KB\n",
            params.secs, params.kbytes
        ))
    }
}

impl APIHandler for DebugAPIHandler {
    type State = DebugState;

    fn generate_initial_state(&self) -> Self::State {
        self.state.clone()
    }

    fn generate_routes(&self) -> Router<Self::State> {
        Router::new()
            .route("/debug/status", get(Self::status_handler))
            .route("/debug/stack", get(Self::stack_handler))
            .route(
                "/debug/mem",
                get(Self::memory_handler).post(Self::adjust_memory_handler),
            )
            .route("/debug/config", get(Self::config_handler))
            .route("/debug/config/{key}", get(Self::config_key_handler))
            .route("/debug/test", get(Self::test_handler))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering::SeqCst;

    use axum::{body::Body, extract::Request};
    use http_body_util::BodyExt as _;
    use serde_json::json;
    use tower::ServiceExt as _;

    use super::*;
    use crate::{
        config::RequestConfiguration,
        reclaim::test_util::CountingReclaimer,
        registry::{AdmissionRequest, RequestHandle},
        restart::RestartTrigger,
    };

    struct Fixture {
        router: Router,
        registry: RequestRegistry,
        reclaimer: CountingReclaimer,
    }

    fn fixture() -> Fixture {
        let reclaimer = CountingReclaimer::default();
        let reclaim = MemoryReclaim::new(reclaimer.clone());
        let (registry, _) = RequestRegistry::spawn(RequestConfiguration::default(), reclaim.clone(), RestartTrigger::new());

        let service = ServiceConfiguration {
            project: "acme".to_string(),
            app: "widgets".to_string(),
            ..Default::default()
        };
        let config = json!({ "watchdog_secs": 15, "project": "acme" });
        let router = DebugAPIHandler::new(service, registry.clone(), reclaim, config).into_router();

        Fixture {
            router,
            registry,
            reclaimer,
        }
    }

    async fn admit(registry: &RequestRegistry, path: &str) -> RequestHandle {
        registry
            .admit(AdmissionRequest {
                method: http::Method::GET,
                uri: path.parse().unwrap(),
                version: http::Version::HTTP_11,
                headers: http::HeaderMap::new(),
                peer_addr: Some("10.0.0.7:5555".parse().unwrap()),
            })
            .await
            .unwrap()
    }

    async fn call(router: &Router, request: Request) -> (StatusCode, Vec<u8>) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn status_lists_in_flight_requests() {
        let fixture = fixture();
        let _handle = admit(&fixture.registry, "/widgets/7").await;

        let (status, body) = call(&fixture.router, Request::get("/debug/status").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);

        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["project"], "acme");
        assert_eq!(body["app"], "widgets");
        assert_eq!(body["pid"], std::process::id());
        assert_eq!(body["current_requests"], 1);
        assert_eq!(body["requests"][0]["url"], "/widgets/7");
        assert_eq!(body["requests"][0]["remote_ip"], "10.0.0.7");
    }

    #[tokio::test]
    async fn stack_includes_in_flight_listing() {
        let fixture = fixture();
        let _handle = admit(&fixture.registry, "/slow").await;

        let (status, body) = call(&fixture.router, Request::get("/debug/stack").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        let body = String::from_utf8(body).unwrap();
        assert!(body.contains("1 requests in flight:"));
        assert!(body.contains("GET /slow"));
    }

    #[tokio::test]
    async fn memory_can_be_reclaimed_on_demand() {
        let fixture = fixture();

        let request = Request::post("/debug/mem?gc_now=1&gc_percent=40").body(Body::empty()).unwrap();
        let (status, body) = call(&fixture.router, request).await;
        assert_eq!(status, StatusCode::OK);
        let body = String::from_utf8(body).unwrap();
        assert!(body.contains("Ran memory reclaim by request to handler"));
        assert!(body.contains("Set reclaim tuning to [40] was [0]"));
        assert_eq!(fixture.reclaimer.cycles.load(SeqCst), 1);

        let (status, body) = call(&fixture.router, Request::get("/debug/mem").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["reclaim"]["cycles"], 1);
    }

    #[tokio::test]
    async fn config_is_served() {
        let fixture = fixture();

        let (_, body) = call(&fixture.router, Request::get("/debug/config").body(Body::empty()).unwrap()).await;
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body, json!({ "watchdog_secs": 15, "project": "acme" }));

        let request = Request::get("/debug/config/watchdog_secs").body(Body::empty()).unwrap();
        assert_eq!(call(&fixture.router, request).await, (StatusCode::OK, b"15".to_vec()));

        let request = Request::get("/debug/config/nope").body(Body::empty()).unwrap();
        assert_eq!(call(&fixture.router, request).await.0, StatusCode::NOT_FOUND);
    }
}
