use std::sync::Arc;

use axum::extract::FromRequestParts;
use http::request::Parts;

use super::{error::HttpError, guard::RequestGuard};
use crate::{
    config::RequestConfiguration,
    registry::{RequestHandle, RequestId, RequestRegistry},
};

/// Per-request context, available to handlers as an extractor.
///
/// The request stays in flight for as long as any clone of its context is alive. Streaming sessions hold on to it for
/// the lifetime of the session.
#[derive(Clone)]
pub struct RequestContext {
    handle: RequestHandle,
    registry: RequestRegistry,
    config: Arc<RequestConfiguration>,
    _guard: Arc<RequestGuard>,
}

impl RequestContext {
    pub(crate) fn new(
        handle: RequestHandle, registry: RequestRegistry, config: Arc<RequestConfiguration>, guard: Arc<RequestGuard>,
    ) -> Self {
        Self {
            handle,
            registry,
            config,
            _guard: guard,
        }
    }

    /// Request identifier.
    pub fn id(&self) -> RequestId {
        self.handle.id()
    }

    /// Client IP address, taken from trusted forwarding headers when enabled.
    pub fn remote_ip(&self) -> &str {
        &self.handle.client().remote_ip
    }

    /// Whether the client connected over HTTPS.
    pub fn is_https(&self) -> bool {
        self.handle.client().is_https
    }

    /// Exempts this request from slow-request warnings.
    pub fn set_can_be_slow(&self) {
        self.registry.mark_slow_allowed(&self.handle);
    }

    /// Counts this request as a streaming session from now on.
    pub fn mark_streaming(&self) {
        self.registry.mark_streaming(&self.handle);
    }

    pub(crate) fn registry(&self) -> &RequestRegistry {
        &self.registry
    }

    pub(crate) fn config(&self) -> &RequestConfiguration {
        &self.config
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = HttpError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Self>()
            .cloned()
            .ok_or_else(|| HttpError::server_error("Request is not tracked."))
    }
}
