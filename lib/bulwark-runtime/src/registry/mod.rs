//! In-flight request registry.
//!
//! The registry is the single authority over which requests are in flight and over the aggregate request counters.
//! It runs as one task that owns all of its state; every other component talks to it by sending it messages through a
//! [`RequestRegistry`] handle, which gives a strict total order over admissions, retirements and snapshots.

use std::{
    collections::HashMap,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::Stream;
use metrics::{counter, gauge, Gauge};
use snafu::Snafu;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{config::RequestConfiguration, reclaim::MemoryReclaim, restart::RestartTrigger};

mod request;
pub use self::request::{
    last_forwarded_hop, AdmissionRequest, AppStats, ClientAddress, InFlightRequest, InFlightSummary, RequestId,
    RequestOutcome,
};

const SNAPSHOT_CHANNEL_LEN: usize = 16;

/// A registry error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum RegistryError {
    /// The registry task is no longer running.
    #[snafu(display("Request registry is no longer running."))]
    Stopped,
}

/// Handle to an admitted request.
///
/// Returned by [`RequestRegistry::admit`], and used to retire the request exactly once.
#[derive(Clone, Debug)]
pub struct RequestHandle {
    id: RequestId,
    client: ClientAddress,
    is_streaming: bool,
}

impl RequestHandle {
    /// Request identifier.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Client address, as derived at admission.
    pub fn client(&self) -> &ClientAddress {
        &self.client
    }

    /// Whether the request was admitted as a streaming session.
    pub fn is_streaming(&self) -> bool {
        self.is_streaming
    }
}

enum Command {
    Admit {
        request: AdmissionRequest,
        reply: oneshot::Sender<RequestHandle>,
    },
    Retire {
        id: RequestId,
        outcome: RequestOutcome,
    },
    MarkStreaming {
        id: RequestId,
    },
    MarkSlowAllowed {
        id: RequestId,
    },
    RecordResponse {
        id: RequestId,
        status: u16,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<InFlightRequest>>,
    },
    Stats {
        reply: oneshot::Sender<AppStats>,
    },
}

/// Handle to the request registry.
///
/// Cloning is cheap, and all clones talk to the same registry task. The task stops once every handle is dropped.
#[derive(Clone)]
pub struct RequestRegistry {
    commands_tx: mpsc::UnboundedSender<Command>,
}

impl RequestRegistry {
    /// Spawns the registry task on the current runtime.
    ///
    /// The reclaim and restart policies applied on retirement are driven by `config`: every `gc_requests` completions
    /// run a cycle of `reclaim`, and once more than `max_requests` requests have completed, `restart` is triggered.
    pub fn spawn(
        config: RequestConfiguration, reclaim: MemoryReclaim, restart: RestartTrigger,
    ) -> (Self, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let runner = Runner {
            config,
            reclaim,
            restart,
            commands_rx,
            next_id: 0,
            open_requests: HashMap::new(),
            stats: AppStats::new(),
            suppressed_access_log_lines: 0,
            telemetry: Telemetry::new(),
        };

        (Self { commands_tx }, tokio::spawn(runner.run()))
    }

    /// Admits a request.
    ///
    /// Returns once the registry has accepted the admission and assigned the request its identifier.
    ///
    /// # Errors
    ///
    /// If the registry task has stopped, an error will be returned.
    pub async fn admit(&self, request: AdmissionRequest) -> Result<RequestHandle, RegistryError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(Command::Admit { request, reply })?;
        reply_rx.await.map_err(|_| RegistryError::Stopped)
    }

    /// Retires a request.
    ///
    /// Retiring a request that is unknown, or was already retired, is logged as a bug and otherwise ignored.
    pub fn retire(&self, handle: &RequestHandle, outcome: RequestOutcome) {
        self.retire_id(handle.id, outcome);
    }

    pub(crate) fn retire_id(&self, id: RequestId, outcome: RequestOutcome) {
        if self.send(Command::Retire { id, outcome }).is_err() {
            debug!(request_id = id, "Registry stopped before request was retired.");
        }
    }

    /// Moves a request into the streaming count, exempting it from slow-request accounting.
    pub fn mark_streaming(&self, handle: &RequestHandle) {
        if self.send(Command::MarkStreaming { id: handle.id }).is_err() {
            debug!(request_id = handle.id, "Registry stopped before request was marked as streaming.");
        }
    }

    /// Exempts a request from slow-request accounting.
    pub fn mark_slow_allowed(&self, handle: &RequestHandle) {
        if self.send(Command::MarkSlowAllowed { id: handle.id }).is_err() {
            debug!(request_id = handle.id, "Registry stopped before request was exempted from slow-request accounting.");
        }
    }

    /// Records the response status of a request, before it is retired.
    pub fn record_response(&self, handle: &RequestHandle, status: u16) {
        if self.send(Command::RecordResponse { id: handle.id, status }).is_err() {
            debug!(request_id = handle.id, "Registry stopped before response status was recorded.");
        }
    }

    /// Takes a snapshot of all in-flight requests.
    ///
    /// The snapshot is produced asynchronously over a dedicated channel, which closes once every request that was in
    /// flight when the registry handled the snapshot has been produced. If the registry has stopped, the snapshot is
    /// empty.
    pub async fn snapshot(&self) -> InFlightRequests {
        let (reply, reply_rx) = oneshot::channel();
        let (requests_tx, requests_rx) = mpsc::channel(SNAPSHOT_CHANNEL_LEN);

        if self.send(Command::Snapshot { reply }).is_ok() {
            if let Ok(requests) = reply_rx.await {
                tokio::spawn(async move {
                    for request in requests {
                        if requests_tx.send(request).await.is_err() {
                            break;
                        }
                    }
                });
            }
        }

        InFlightRequests { requests_rx }
    }

    /// Gets a copy of the aggregate request counters.
    ///
    /// # Errors
    ///
    /// If the registry task has stopped, an error will be returned.
    pub async fn stats(&self) -> Result<AppStats, RegistryError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(Command::Stats { reply })?;
        reply_rx.await.map_err(|_| RegistryError::Stopped)
    }

    fn send(&self, command: Command) -> Result<(), RegistryError> {
        self.commands_tx.send(command).map_err(|_| RegistryError::Stopped)
    }
}

/// A finite, lazily-produced sequence of in-flight requests.
///
/// Consistency across entries is fuzzy: requests may complete while the sequence is being consumed.
pub struct InFlightRequests {
    requests_rx: mpsc::Receiver<InFlightRequest>,
}

impl InFlightRequests {
    /// Gets the next request, or `None` once all have been produced.
    pub async fn next(&mut self) -> Option<InFlightRequest> {
        self.requests_rx.recv().await
    }

    /// Collects every remaining request.
    pub async fn collect_all(mut self) -> Vec<InFlightRequest> {
        let mut requests = Vec::new();
        while let Some(request) = self.next().await {
            requests.push(request);
        }
        requests
    }
}

impl Stream for InFlightRequests {
    type Item = InFlightRequest;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.requests_rx.poll_recv(cx)
    }
}

struct Telemetry {
    total_requests: Gauge,
    current_requests: Gauge,
    current_streaming_requests: Gauge,
}

impl Telemetry {
    fn new() -> Self {
        Self {
            total_requests: gauge!("http_reqs"),
            current_requests: gauge!("current_http_reqs"),
            current_streaming_requests: gauge!("current_ws_reqs"),
        }
    }

    fn update(&self, stats: &AppStats) {
        self.total_requests.set(stats.total_requests as f64);
        self.current_requests.set(stats.current_requests as f64);
        self.current_streaming_requests
            .set(stats.current_streaming_requests as f64);
    }
}

struct Runner {
    config: RequestConfiguration,
    reclaim: MemoryReclaim,
    restart: RestartTrigger,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    next_id: RequestId,
    open_requests: HashMap<RequestId, InFlightRequest>,
    stats: AppStats,
    suppressed_access_log_lines: u64,
    telemetry: Telemetry,
}

impl Runner {
    async fn run(mut self) {
        debug!("Request registry running.");

        while let Some(command) = self.commands_rx.recv().await {
            match command {
                Command::Admit { request, reply } => {
                    let handle = self.admit(request);
                    if reply.send(handle.clone()).is_err() {
                        // The caller went away before learning its identifier, so nobody will ever retire it.
                        self.retire(handle.id, RequestOutcome::default());
                    }
                }
                Command::Retire { id, outcome } => self.retire(id, outcome),
                Command::MarkStreaming { id } => self.mark_streaming(id),
                Command::MarkSlowAllowed { id } => {
                    if let Some(request) = self.open_requests.get_mut(&id) {
                        request.can_be_slow = true;
                    }
                }
                Command::RecordResponse { id, status } => {
                    if let Some(request) = self.open_requests.get_mut(&id) {
                        request.response_status = Some(status);
                    }
                }
                Command::Snapshot { reply } => {
                    let mut requests = self.open_requests.values().cloned().collect::<Vec<_>>();
                    requests.sort_by_key(|request| request.id);
                    let _ = reply.send(requests);
                }
                Command::Stats { reply } => {
                    let _ = reply.send(self.stats);
                }
            }
        }

        debug!("Request registry stopped.");
    }

    fn admit(&mut self, request: AdmissionRequest) -> RequestHandle {
        let id = self.next_id;
        self.next_id += 1;

        let client = ClientAddress::derive(&request, self.config.use_xf_headers);
        let in_flight = InFlightRequest::admit(id, &request, &client);
        let is_streaming = in_flight.is_streaming;
        self.open_requests.insert(id, in_flight);

        self.stats.total_requests += 1;
        self.stats.current_requests += 1;
        if is_streaming {
            self.stats.current_streaming_requests += 1;
        }
        self.telemetry.update(&self.stats);

        RequestHandle {
            id,
            client,
            is_streaming,
        }
    }

    fn mark_streaming(&mut self, id: RequestId) {
        match self.open_requests.get_mut(&id) {
            Some(request) if !request.is_streaming => {
                request.is_streaming = true;
                self.stats.current_streaming_requests += 1;
                self.telemetry.update(&self.stats);
            }
            Some(_) => {}
            None => debug!(request_id = id, "Streaming mark for request that is not in flight."),
        }
    }

    fn retire(&mut self, id: RequestId, outcome: RequestOutcome) {
        let mut request = match self.open_requests.remove(&id) {
            Some(request) => request,
            None => {
                error!(request_id = id, "BUG: retired a request that is not in flight.");
                return;
            }
        };

        self.stats.current_requests -= 1;
        if request.is_streaming {
            self.stats.current_streaming_requests -= 1;
        }
        self.stats.completed_requests += 1;
        self.telemetry.update(&self.stats);

        if outcome.status != 0 {
            request.response_status = Some(outcome.status);
        }
        request.bytes_written = outcome.bytes_written;
        let duration = request.age();

        self.write_access_log(&request, duration);

        // Streaming sessions are long-lived by nature, so none of the time-based policy applies to them.
        if !request.is_streaming {
            let status = request.response_status.unwrap_or_default();
            counter!(format!("http_status.{}", status)).increment(1);

            match self.config.slow_request_threshold() {
                Some(threshold) if duration > threshold && !request.can_be_slow => {
                    warn!(request_id = id, url = %request.url, ?duration, "Slow request.");
                }
                _ => debug!(request_id = id, ?duration, "Request completed."),
            }
        }

        let completed = self.stats.completed_requests;
        if self.config.gc_requests > 0 && completed % self.config.gc_requests == 0 {
            info!(completed, "Forcing memory reclaim after {} requests.", completed);
            let reclaim = self.reclaim.clone();
            tokio::spawn(async move {
                let pause = reclaim.run().await;
                debug!(?pause, "Memory reclaim complete.");
            });
        }

        if self.config.max_requests > 0 && completed > self.config.max_requests {
            self.restart.request(format!(
                "Completed {} requests, more than the limit of {}.",
                completed, self.config.max_requests
            ));
        }
    }

    fn write_access_log(&mut self, request: &InFlightRequest, duration: Duration) {
        if self.config.access_log_every > 0 {
            self.suppressed_access_log_lines += 1;
            if self.suppressed_access_log_lines < self.config.access_log_every {
                return;
            }
        }
        self.suppressed_access_log_lines = 0;

        info!(
            target: "access_log",
            request_id = request.id,
            method = %request.method,
            path = %request.url,
            protocol = ?request.version,
            status = request.response_status.unwrap_or_default(),
            bytes = request.bytes_written,
            client_ip = %request.remote_ip,
            https = request.is_https,
            referrer = request.referrer.as_deref().unwrap_or("-"),
            user_agent = request.user_agent.as_deref().unwrap_or("-"),
            duration_secs = duration.as_secs_f64(),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering::SeqCst;

    use http::{HeaderMap, Method};
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    use super::*;
    use crate::reclaim::test_util::CountingReclaimer;

    fn admission(path: &str) -> AdmissionRequest {
        AdmissionRequest {
            method: Method::GET,
            uri: path.parse().unwrap(),
            version: http::Version::HTTP_11,
            headers: HeaderMap::new(),
            peer_addr: Some("127.0.0.1:40000".parse().unwrap()),
        }
    }

    fn websocket_admission(path: &str) -> AdmissionRequest {
        let mut request = admission(path);
        request.headers.insert(http::header::UPGRADE, "websocket".parse().unwrap());
        request
    }

    fn spawn_registry(config: RequestConfiguration) -> (RequestRegistry, RestartTrigger, CountingReclaimer) {
        let reclaimer = CountingReclaimer::default();
        let trigger = RestartTrigger::new();
        let (registry, _) = RequestRegistry::spawn(config, MemoryReclaim::new(reclaimer.clone()), trigger.clone());
        (registry, trigger, reclaimer)
    }

    fn ok() -> RequestOutcome {
        RequestOutcome {
            status: 200,
            bytes_written: 2,
        }
    }

    #[tokio::test]
    async fn ids_strictly_increase() {
        let (registry, _, _) = spawn_registry(RequestConfiguration::default());

        let mut last = None;
        for _ in 0..10 {
            let handle = registry.admit(admission("/")).await.unwrap();
            if let Some(last) = last {
                assert!(handle.id() > last);
            }
            last = Some(handle.id());
            registry.retire(&handle, ok());
        }
    }

    #[tokio::test]
    async fn counts_track_admissions_and_retirements() {
        let (registry, _, _) = spawn_registry(RequestConfiguration::default());

        let first = registry.admit(admission("/a")).await.unwrap();
        let second = registry.admit(admission("/b")).await.unwrap();
        let stream = registry.admit(websocket_admission("/ws")).await.unwrap();
        assert!(stream.is_streaming());

        let stats = registry.stats().await.unwrap();
        assert_eq!(stats.current_requests, 3);
        assert_eq!(stats.current_streaming_requests, 1);
        assert_eq!(stats.total_requests, 3);

        registry.retire(&first, ok());
        registry.retire(&stream, ok());

        let stats = registry.stats().await.unwrap();
        assert_eq!(stats.current_requests, 1);
        assert_eq!(stats.current_streaming_requests, 0);
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.completed_requests, 2);

        let in_flight = registry.snapshot().await.collect_all().await;
        assert_eq!(in_flight.len(), 1);
        assert_eq!(in_flight[0].id, second.id());
        assert_eq!(in_flight[0].url, "/b");
    }

    #[tokio::test]
    async fn unknown_and_double_retire_are_absorbed() {
        let (registry, _, _) = spawn_registry(RequestConfiguration::default());

        let handle = registry.admit(admission("/")).await.unwrap();
        let other = registry.admit(admission("/other")).await.unwrap();
        registry.retire(&handle, ok());
        registry.retire(&handle, ok());
        registry.retire_id(9999, ok());

        let stats = registry.stats().await.unwrap();
        assert_eq!(stats.current_requests, 1);
        assert_eq!(stats.completed_requests, 1);

        registry.retire(&other, ok());
        assert_eq!(registry.stats().await.unwrap().current_requests, 0);
    }

    #[tokio::test]
    async fn updates_after_registry_stops_are_absorbed() {
        let (registry, task) = RequestRegistry::spawn(
            RequestConfiguration::default(),
            MemoryReclaim::default(),
            RestartTrigger::new(),
        );
        let handle = registry.admit(admission("/ws")).await.unwrap();

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        registry.mark_streaming(&handle);
        registry.mark_slow_allowed(&handle);
        registry.record_response(&handle, 101);
        registry.retire(&handle, ok());

        assert!(matches!(registry.stats().await, Err(RegistryError::Stopped)));
        assert!(matches!(
            registry.admit(admission("/")).await,
            Err(RegistryError::Stopped)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_admit_retire_keeps_count_consistent() {
        let (registry, _, _) = spawn_registry(RequestConfiguration::default());

        let tasks = (0..64)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let handle = registry.admit(admission("/")).await.unwrap();
                    tokio::task::yield_now().await;
                    // Keep every fourth request in flight.
                    if i % 4 != 0 {
                        registry.retire(&handle, ok());
                        None
                    } else {
                        Some(handle)
                    }
                })
            })
            .collect::<Vec<_>>();

        let mut held = Vec::new();
        for task in tasks {
            if let Some(handle) = task.await.unwrap() {
                held.push(handle);
            }
        }

        let stats = registry.stats().await.unwrap();
        let in_flight = registry.snapshot().await.collect_all().await;
        assert_eq!(stats.current_requests, held.len() as u64);
        assert_eq!(in_flight.len(), held.len());
        assert_eq!(stats.total_requests, 64);
    }

    #[tokio::test]
    async fn mark_streaming_moves_request_into_streaming_count() {
        let (registry, _, _) = spawn_registry(RequestConfiguration::default());

        let handle = registry.admit(admission("/upgrade")).await.unwrap();
        registry.mark_streaming(&handle);
        registry.mark_streaming(&handle);
        assert_eq!(registry.stats().await.unwrap().current_streaming_requests, 1);

        registry.retire(&handle, ok());
        assert_eq!(registry.stats().await.unwrap().current_streaming_requests, 0);
    }

    #[tokio::test]
    async fn restart_after_max_requests_exceeded() {
        let config = RequestConfiguration {
            max_requests: 100,
            ..Default::default()
        };
        let (registry, trigger, _) = spawn_registry(config);

        for _ in 0..100 {
            let handle = registry.admit(admission("/")).await.unwrap();
            registry.retire(&handle, ok());
        }
        registry.stats().await.unwrap();
        assert!(!trigger.is_triggered());

        let handle = registry.admit(admission("/")).await.unwrap();
        registry.retire(&handle, ok());
        registry.stats().await.unwrap();
        assert!(trigger.is_triggered());
    }

    #[tokio::test]
    async fn reclaims_every_gc_requests() {
        let config = RequestConfiguration {
            gc_requests: 3,
            ..Default::default()
        };
        let (registry, _, reclaimer) = spawn_registry(config);

        for _ in 0..7 {
            let handle = registry.admit(admission("/")).await.unwrap();
            registry.retire(&handle, ok());
        }
        registry.stats().await.unwrap();

        // Reclaim cycles run on the blocking pool, so give them a moment to land.
        for _ in 0..100 {
            if reclaimer.cycles.load(SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(reclaimer.cycles.load(SeqCst), 2);
    }

    #[tokio::test]
    async fn admission_derives_client_address() {
        let config = RequestConfiguration {
            use_xf_headers: true,
            ..Default::default()
        };
        let (registry, _, _) = spawn_registry(config);

        let mut request = admission("/");
        request
            .headers
            .insert("x-forwarded-for", "203.0.113.9, 198.51.100.1".parse().unwrap());
        request.headers.insert("x-forwarded-proto", "https".parse().unwrap());

        let handle = registry.admit(request).await.unwrap();
        assert_eq!(handle.client().remote_ip, "198.51.100.1");
        assert!(handle.client().is_https);
    }

    #[test]
    fn publishes_gauges_and_status_counters() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let (registry, _, _) = spawn_registry(RequestConfiguration::default());
                let handle = registry.admit(admission("/missing")).await.unwrap();
                registry.retire(
                    &handle,
                    RequestOutcome {
                        status: 404,
                        bytes_written: 0,
                    },
                );
                registry.stats().await.unwrap();
            });
        });

        let values = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, value)| (key.key().name().to_string(), value))
            .collect::<HashMap<_, _>>();

        assert_eq!(values.get("http_status.404"), Some(&DebugValue::Counter(1)));
        assert!(matches!(values.get("http_reqs"), Some(DebugValue::Gauge(v)) if v.into_inner() == 1.0));
        assert!(matches!(values.get("current_http_reqs"), Some(DebugValue::Gauge(v)) if v.into_inner() == 0.0));
    }
}
