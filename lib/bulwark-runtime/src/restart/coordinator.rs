use std::time::Duration;

use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[cfg(unix)]
use super::handoff::ReplacementCommand;
use super::{handoff::ListenerError, RestartTrigger};
use crate::{config::GracefulRestartConfiguration, registry::RequestRegistry};

/// How draining ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DrainOutcome {
    /// Every in-flight request completed.
    Drained,

    /// The wait limit was reached with requests still in flight.
    TimedOut {
        /// Requests still in flight.
        pending: u64,
    },
}

/// Phase of the restart sequence.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RestartPhase {
    /// Serving normally.
    Normal,

    /// Starting the replacement process.
    Spawning,

    /// Waiting for the replacement process to take over the listener.
    Handoff,

    /// No longer accepting connections, waiting for in-flight requests to complete.
    Draining,

    /// Draining finished, and the process should exit.
    Terminal(DrainOutcome),
}

/// Carries out a graceful restart once one is requested.
///
/// On Unix, the listening socket is handed to a freshly spawned replacement process before this process drains. The
/// coordinator listens for `SIGUSR2`, which requests a restart, from the moment it is created, and for `SIGUSR1`, which
/// the replacement sends once it is serving, from the moment a handoff listener is attached.
///
/// Elsewhere, the coordinator only drains.
pub struct RestartCoordinator {
    config: GracefulRestartConfiguration,
    registry: RequestRegistry,
    trigger: RestartTrigger,
    shutdown: CancellationToken,
    phase: watch::Sender<RestartPhase>,
    #[cfg(unix)]
    handoff: Option<Handoff>,
}

#[cfg(unix)]
struct Handoff {
    listener: std::net::TcpListener,
    replacement: ReplacementCommand,
    handoff_signal: tokio::signal::unix::Signal,
}

impl RestartCoordinator {
    /// Creates a new `RestartCoordinator`.
    ///
    /// `shutdown` is cancelled when draining begins, and should stop the server from accepting connections.
    ///
    /// # Errors
    ///
    /// If the restart signal handler cannot be installed, an error will be returned.
    pub fn new(
        config: GracefulRestartConfiguration, registry: RequestRegistry, trigger: RestartTrigger,
        shutdown: CancellationToken,
    ) -> Result<Self, ListenerError> {
        #[cfg(unix)]
        listen_for_restart_signal(trigger.clone())?;

        let (phase, _) = watch::channel(RestartPhase::Normal);
        Ok(Self {
            config,
            registry,
            trigger,
            shutdown,
            phase,
            #[cfg(unix)]
            handoff: None,
        })
    }

    /// Hands the given listener to a replacement process when restarting.
    ///
    /// The replacement is started with the same executable and arguments as this process. Without a listener, the
    /// coordinator only drains.
    ///
    /// # Errors
    ///
    /// If the listener cannot be duplicated, the current executable cannot be determined, or the handoff signal
    /// handler cannot be installed, an error will be returned.
    #[cfg(unix)]
    pub fn with_handoff(self, listener: &tokio::net::TcpListener) -> Result<Self, ListenerError> {
        let replacement = ReplacementCommand::current_process()?;
        self.with_handoff_command(listener, replacement)
    }

    /// Hands the given listener to a replacement process started with `replacement` when restarting.
    ///
    /// # Errors
    ///
    /// If the listener cannot be duplicated, or the handoff signal handler cannot be installed, an error will be
    /// returned.
    #[cfg(unix)]
    pub fn with_handoff_command(
        mut self, listener: &tokio::net::TcpListener, replacement: ReplacementCommand,
    ) -> Result<Self, ListenerError> {
        use std::os::fd::AsFd as _;

        use snafu::ResultExt as _;
        use tokio::signal::unix::{signal, SignalKind};

        let listener = listener
            .as_fd()
            .try_clone_to_owned()
            .map(std::net::TcpListener::from)
            .context(super::handoff::Adopt)?;
        let handoff_signal = signal(SignalKind::user_defined1()).context(super::handoff::Signal)?;

        self.handoff = Some(Handoff {
            listener,
            replacement,
            handoff_signal,
        });
        Ok(self)
    }

    /// Subscribes to phase changes.
    pub fn subscribe(&self) -> watch::Receiver<RestartPhase> {
        self.phase.subscribe()
    }

    /// Waits for a restart to be requested, then carries it out.
    ///
    /// Returns once draining has finished, at which point the process should exit.
    #[cfg_attr(not(unix), allow(unused_mut))]
    pub async fn run(mut self) -> DrainOutcome {
        let state = self.trigger.wait().await;
        info!(reason = %state.reason, "Starting graceful restart.");

        #[cfg(unix)]
        self.hand_off().await;

        self.set_phase(RestartPhase::Draining);
        self.shutdown.cancel();

        let outcome = drain(&self.registry, &self.config).await;
        self.set_phase(RestartPhase::Terminal(outcome));
        outcome
    }

    #[cfg(unix)]
    async fn hand_off(&mut self) {
        let Some(handoff) = self.handoff.as_mut() else {
            info!("No listener to hand off. Draining only.");
            return;
        };

        self.phase.send_replace(RestartPhase::Spawning);
        if let Err(e) = handoff.replacement.spawn(&handoff.listener) {
            error!(error = %e, "Failed to start replacement process. Draining anyway.");
            return;
        }

        self.phase.send_replace(RestartPhase::Handoff);
        let wait_limit = self.config.wait_limit();
        match tokio::time::timeout(wait_limit, handoff.handoff_signal.recv()).await {
            Ok(Some(())) => info!("Replacement process has taken over the listener."),
            _ => error!(?wait_limit, "Replacement process did not take over in time. Draining anyway."),
        }
    }

    fn set_phase(&self, phase: RestartPhase) {
        self.phase.send_replace(phase);
    }
}

#[cfg(unix)]
fn listen_for_restart_signal(trigger: RestartTrigger) -> Result<(), ListenerError> {
    use snafu::ResultExt as _;
    use tokio::signal::unix::{signal, SignalKind};

    let mut restart_signal = signal(SignalKind::user_defined2()).context(super::handoff::Signal)?;
    tokio::spawn(async move {
        while restart_signal.recv().await.is_some() {
            trigger.request("Received SIGUSR2.");
        }
    });
    Ok(())
}

/// Waits for every in-flight request to complete, or for the wait limit to be reached.
///
/// The in-flight count is polled every `graceful_poll_msecs`. Reaching the wait limit is a deliberate, lossy cutover:
/// whatever is still in flight is abandoned.
pub async fn drain(registry: &RequestRegistry, config: &GracefulRestartConfiguration) -> DrainOutcome {
    let deadline = Instant::now() + config.wait_limit();
    let mut poll = tokio::time::interval(config.poll_interval().max(Duration::from_millis(1)));
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        poll.tick().await;

        let pending = match registry.stats().await {
            Ok(stats) => stats.current_requests,
            Err(_) => 0,
        };
        if pending == 0 {
            info!("All requests drained.");
            return DrainOutcome::Drained;
        }
        if Instant::now() >= deadline {
            warn!(
                pending,
                "Graceful wait limit reached with requests still in flight. Exiting anyway."
            );
            return DrainOutcome::TimedOut { pending };
        }

        info!(pending, "Waiting for in-flight requests to complete.");
    }
}

#[cfg(test)]
mod tests {
    use http::{HeaderMap, Method};

    use super::*;
    use crate::{
        config::RequestConfiguration,
        reclaim::MemoryReclaim,
        registry::{AdmissionRequest, RequestHandle, RequestOutcome},
    };

    fn spawn_registry(trigger: &RestartTrigger) -> RequestRegistry {
        RequestRegistry::spawn(RequestConfiguration::default(), MemoryReclaim::default(), trigger.clone()).0
    }

    async fn admit(registry: &RequestRegistry) -> RequestHandle {
        registry
            .admit(AdmissionRequest {
                method: Method::GET,
                uri: "/sleepy".parse().unwrap(),
                version: http::Version::HTTP_11,
                headers: HeaderMap::new(),
                peer_addr: None,
            })
            .await
            .unwrap()
    }

    fn restart_config(wait_secs: u64) -> GracefulRestartConfiguration {
        GracefulRestartConfiguration {
            graceful_poll_msecs: 500,
            graceful_wait_secs: wait_secs,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drain_completes_when_requests_finish() {
        let trigger = RestartTrigger::new();
        let registry = spawn_registry(&trigger);
        let handle = admit(&registry).await;

        let finisher = {
            let registry = registry.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                registry.retire(&handle, RequestOutcome::default());
            })
        };

        let started = Instant::now();
        assert_eq!(drain(&registry, &restart_config(60)).await, DrainOutcome::Drained);
        assert!(started.elapsed() < Duration::from_secs(2));
        finisher.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_times_out_with_slow_request() {
        let trigger = RestartTrigger::new();
        let registry = spawn_registry(&trigger);
        let handle = admit(&registry).await;

        // A handler that takes five seconds, against a two second wait limit.
        let slow = {
            let registry = registry.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                registry.retire(&handle, RequestOutcome::default());
            })
        };

        let started = Instant::now();
        let outcome = drain(&registry, &restart_config(2)).await;
        let elapsed = started.elapsed();

        assert_eq!(outcome, DrainOutcome::TimedOut { pending: 1 });
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_millis(2600));
        slow.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn coordinator_drains_once_triggered() {
        let trigger = RestartTrigger::new();
        let registry = spawn_registry(&trigger);
        let shutdown = CancellationToken::new();

        let coordinator =
            RestartCoordinator::new(restart_config(60), registry.clone(), trigger.clone(), shutdown.clone()).unwrap();
        let mut phases = coordinator.subscribe();
        assert_eq!(*phases.borrow_and_update(), RestartPhase::Normal);
        let run = tokio::spawn(coordinator.run());

        trigger.request("max requests reached");
        assert_eq!(run.await.unwrap(), DrainOutcome::Drained);
        assert!(shutdown.is_cancelled());
        assert_eq!(
            *phases.borrow_and_update(),
            RestartPhase::Terminal(DrainOutcome::Drained)
        );
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn failed_spawn_still_drains() {
        let trigger = RestartTrigger::new();
        let registry = spawn_registry(&trigger);
        let shutdown = CancellationToken::new();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();

        let coordinator = RestartCoordinator::new(restart_config(60), registry, trigger.clone(), shutdown.clone())
            .unwrap()
            .with_handoff_command(&listener, ReplacementCommand::new("/nonexistent/replacement", Vec::<String>::new()))
            .unwrap();

        trigger.request("operator");
        assert_eq!(coordinator.run().await, DrainOutcome::Drained);
        assert!(shutdown.is_cancelled());
    }
}
