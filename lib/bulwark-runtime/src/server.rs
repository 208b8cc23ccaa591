//! Service runner.
//!
//! Wires the request registry, the tracking middleware, the resource watchdog and the restart coordinator around a
//! service's own routes, and serves them until a graceful restart has drained this process.

use std::net::SocketAddr;

use axum::Router;
use bulwark_app::{api::APIBuilder, metrics::MetricsAPIHandler};
use bulwark_config::GenericConfiguration;
use bulwark_error::{ErrorContext as _, GenericError};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    api::DebugAPIHandler,
    config::{GracefulRestartConfiguration, RequestConfiguration, ServiceConfiguration, WatchdogConfiguration},
    middleware::RequestTrackingLayer,
    reclaim::MemoryReclaim,
    registry::RequestRegistry,
    restart::{
        handoff::{acquire_listener, ParentProcess},
        DrainOutcome, RestartCoordinator, RestartTrigger,
    },
    watchdog::ResourceWatchdog,
};

/// Builds and runs a service.
///
/// Logging and metrics are expected to be initialized by the caller beforehand.
pub struct ServiceRunner {
    config: GenericConfiguration,
    routes: Router,
    reclaim: MemoryReclaim,
    trigger: RestartTrigger,
    #[cfg_attr(not(unix), allow(dead_code))]
    handoff: bool,
}

impl ServiceRunner {
    /// Creates a new `ServiceRunner` from the given configuration.
    pub fn new(config: GenericConfiguration) -> Self {
        Self {
            config,
            routes: Router::new(),
            reclaim: MemoryReclaim::default(),
            trigger: RestartTrigger::new(),
            handoff: true,
        }
    }

    /// Adds the service's own routes.
    pub fn with_routes(mut self, routes: Router) -> Self {
        self.routes = self.routes.merge(routes);
        self
    }

    /// Sets how memory is reclaimed.
    pub fn with_memory_reclaim(mut self, reclaim: MemoryReclaim) -> Self {
        self.reclaim = reclaim;
        self
    }

    /// Disables handing the listener to a replacement process on restart.
    ///
    /// A restart then only drains this process.
    pub fn without_handoff(mut self) -> Self {
        self.handoff = false;
        self
    }

    /// Gets the restart trigger shared by every component of the service.
    pub fn restart_trigger(&self) -> RestartTrigger {
        self.trigger.clone()
    }

    /// Acquires the listener and starts every background component, without serving yet.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, or the listener cannot be acquired, an error will be returned.
    pub async fn bind(self) -> Result<BoundService, GenericError> {
        let service_config = ServiceConfiguration::try_from_config(&self.config)?;
        let request_config = RequestConfiguration::try_from_config(&self.config)?;
        let watchdog_config = WatchdogConfiguration::try_from_config(&self.config)?;
        let restart_config = GracefulRestartConfiguration::try_from_config(&self.config)?;

        let (registry, _) = RequestRegistry::spawn(request_config.clone(), self.reclaim.clone(), self.trigger.clone());
        let watchdog = ResourceWatchdog::new(
            watchdog_config,
            registry.clone(),
            self.reclaim.clone(),
            self.trigger.clone(),
        )
        .spawn();

        let acquired = acquire_listener(service_config.listen_addr).await?;
        let local_addr = acquired.listener.local_addr().error_context("Failed to get listener address.")?;

        let shutdown = CancellationToken::new();
        let coordinator = RestartCoordinator::new(restart_config, registry.clone(), self.trigger.clone(), shutdown.clone())?;
        #[cfg(unix)]
        let coordinator = if self.handoff {
            coordinator.with_handoff(&acquired.listener)?
        } else {
            coordinator
        };

        let debug_handler = if service_config.enable_debug_urls {
            let effective_config = self.config.as_json()?;
            Some(DebugAPIHandler::new(
                service_config.clone(),
                registry.clone(),
                self.reclaim.clone(),
                effective_config,
            ))
        } else {
            None
        };
        let metrics_handler = service_config.enable_debug_urls.then_some(MetricsAPIHandler);

        let router = APIBuilder::new()
            .with_router(self.routes)
            .with_optional_handler(debug_handler)
            .with_optional_handler(metrics_handler)
            .build()
            .layer(RequestTrackingLayer::new(registry, request_config));

        Ok(BoundService {
            listener: acquired.listener,
            parent: acquired.parent,
            local_addr,
            router,
            coordinator,
            shutdown,
            watchdog,
        })
    }

    /// Binds, then serves until a graceful restart has drained this process.
    ///
    /// # Errors
    ///
    /// If the service cannot be bound, or the server fails, an error will be returned.
    pub async fn run(self) -> Result<DrainOutcome, GenericError> {
        self.bind().await?.serve().await
    }
}

/// A service that has acquired its listener, but is not serving yet.
pub struct BoundService {
    listener: TcpListener,
    parent: Option<ParentProcess>,
    local_addr: SocketAddr,
    router: Router,
    coordinator: RestartCoordinator,
    shutdown: CancellationToken,
    watchdog: JoinHandle<()>,
}

impl BoundService {
    /// Address the service is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves until a graceful restart has drained this process.
    ///
    /// If the listener was inherited, the outgoing process is told to start draining once this one is serving.
    /// Returns how the drain ended; the caller should then exit.
    ///
    /// # Errors
    ///
    /// If the server fails before a restart was requested, an error will be returned.
    pub async fn serve(self) -> Result<DrainOutcome, GenericError> {
        let Self {
            listener,
            parent,
            local_addr,
            router,
            coordinator,
            shutdown,
            watchdog,
        } = self;

        let server = axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown.clone().cancelled_owned());
        let mut server = tokio::spawn(async move { server.await });
        info!(%local_addr, "Serving.");

        if let Some(parent) = parent {
            if let Err(e) = parent.notify_handoff() {
                warn!(error = %e, "Outgoing process could not be notified. It will drain once its wait limit passes.");
            }
        }

        let restart = coordinator.run();
        tokio::pin!(restart);

        let outcome = tokio::select! {
            outcome = &mut restart => outcome,
            result = &mut server => match result {
                // Draining stops the server from accepting, which can finish it before the drain itself does.
                Ok(Ok(())) if shutdown.is_cancelled() => restart.await,
                result => {
                    watchdog.abort();
                    return match result {
                        Ok(Ok(())) => Err(bulwark_error::generic_error!("Server stopped before a restart was requested.")),
                        Ok(Err(e)) => Err(GenericError::from(e).context("Server failed.")),
                        Err(e) => Err(GenericError::from(e).context("Server task failed.")),
                    };
                }
            },
        };

        // Connections still open past the drain are abandoned along with the process.
        server.abort();
        watchdog.abort();

        match outcome {
            DrainOutcome::Drained => info!("All requests completed. Exiting."),
            DrainOutcome::TimedOut { pending } => error!(pending, "Exiting with requests still in flight."),
        }
        Ok(outcome)
    }
}
