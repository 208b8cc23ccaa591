//! Per-request middleware.
//!
//! [`RequestTrackingLayer`] admits every request into the registry, recovers from handler panics, and retires the
//! request once its response has been fully written (or abandoned). [`RequiredParamsLayer`] rejects requests that are
//! missing required parameters before the handler ever runs.

use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::Arc,
    task::{Context, Poll},
};

use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    response::{IntoResponse as _, Response},
};
use futures::future::BoxFuture;
use http::StatusCode;
use tower::{Layer, Service};
use tracing::warn;

use crate::{
    config::RequestConfiguration,
    registry::{AdmissionRequest, RequestRegistry},
};

mod body;
pub use self::body::TrackedBody;

mod context;
pub use self::context::RequestContext;

mod error;
pub use self::error::{
    close_code_for_status, CloseMessage, HttpError, CLOSE_ABNORMAL, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL,
    CLOSE_POLICY_VIOLATION,
};

mod guard;
pub(crate) use self::guard::{failure_body, in_flight_listing};
pub use self::guard::RequestState;

mod panic;
pub use self::panic::{install_panic_hook, CatchPanic, CaughtPanic, RecoveredFailure};

mod params;
pub use self::params::{RequiredParams, RequiredParamsLayer};

use self::guard::RequestGuard;

/// A layer that tracks every request through the request registry.
#[derive(Clone)]
pub struct RequestTrackingLayer {
    registry: RequestRegistry,
    config: Arc<RequestConfiguration>,
}

impl RequestTrackingLayer {
    /// Creates a new `RequestTrackingLayer`.
    ///
    /// Installs the panic hook, if it is not already installed.
    pub fn new(registry: RequestRegistry, config: RequestConfiguration) -> Self {
        install_panic_hook();
        Self {
            registry,
            config: Arc::new(config),
        }
    }
}

impl<S> Layer<S> for RequestTrackingLayer {
    type Service = RequestTracking<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestTracking {
            inner,
            registry: self.registry.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

/// Service produced by [`RequestTrackingLayer`].
#[derive(Clone)]
pub struct RequestTracking<S> {
    inner: S,
    registry: RequestRegistry,
    config: Arc<RequestConfiguration>,
}

impl<S> Service<Request> for RequestTracking<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(track_request(
            inner,
            self.registry.clone(),
            Arc::clone(&self.config),
            request,
        ))
    }
}

async fn track_request<S>(
    mut inner: S, registry: RequestRegistry, config: Arc<RequestConfiguration>, request: Request,
) -> Result<Response, Infallible>
where
    S: Service<Request, Response = Response, Error = Infallible> + Send + 'static,
    S::Future: Send + 'static,
{
    let peer_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let (mut parts, body) = request.into_parts();

    let handle = match registry.admit(AdmissionRequest::from_parts(&parts, peer_addr)).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!(error = %e, "Rejecting request.");
            return Ok(HttpError::new(StatusCode::SERVICE_UNAVAILABLE, "Service unavailable").into_response());
        }
    };

    let guard = Arc::new(RequestGuard::new(registry.clone(), handle.id()));
    parts
        .extensions
        .insert(RequestContext::new(handle, registry.clone(), Arc::clone(&config), Arc::clone(&guard)));
    let request = Request::from_parts(parts, body);

    let response = match CatchPanic::new(async move { inner.call(request).await }).await {
        Ok(Ok(response)) => response,
        Ok(Err(never)) => match never {},
        Err(caught) => {
            guard.failure_recovered();
            failure_response(&caught, &config, &registry, guard.id()).await
        }
    };

    let status = response.status().as_u16();
    guard.response_sent(status);

    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(parts, Body::new(TrackedBody::new(body, guard))))
}

async fn failure_response(
    caught: &CaughtPanic, config: &RequestConfiguration, registry: &RequestRegistry, request_id: u64,
) -> Response {
    let body = failure_body(caught, config, registry, request_id).await;
    let status = match caught.failure() {
        RecoveredFailure::Protocol(e) => e.status(),
        RecoveredFailure::Close(_) | RecoveredFailure::Generic(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    HttpError::new(status, body).into_response()
}
