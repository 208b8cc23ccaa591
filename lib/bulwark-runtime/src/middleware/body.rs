use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use axum::body::Body;
use bulwark_error::generic_error;
use bytes::Bytes;
use http_body::{Frame, SizeHint};
use pin_project_lite::pin_project;
use tracing::error;

use super::{guard::RequestGuard, panic::catch_panic};

pin_project! {
    /// A response body that counts the bytes it produces and survives panics raised while it is polled.
    ///
    /// Once the response has started, a failure can no longer be reported to the client: it is logged, and the body is
    /// ended with an error so that the connection is torn down rather than the client seeing a truncated response as
    /// complete.
    pub struct TrackedBody {
        #[pin]
        inner: Body,
        guard: Option<Arc<RequestGuard>>,
        failed: bool,
    }
}

impl TrackedBody {
    pub(crate) fn new(inner: Body, guard: Arc<RequestGuard>) -> Self {
        Self {
            inner,
            guard: Some(guard),
            failed: false,
        }
    }
}

impl http_body::Body for TrackedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        if *this.failed {
            return Poll::Ready(None);
        }

        let inner = this.inner;
        match catch_panic(|| inner.poll_frame(cx)) {
            Ok(Poll::Ready(Some(Ok(frame)))) => {
                if let (Some(data), Some(guard)) = (frame.data_ref(), this.guard.as_ref()) {
                    guard.add_bytes_written(data.len());
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Ok(Poll::Ready(None)) => {
                // Retire as soon as the body is complete, rather than when the connection gets around to dropping it.
                this.guard.take();
                Poll::Ready(None)
            }
            Ok(Poll::Ready(Some(Err(e)))) => {
                *this.failed = true;
                if let Some(guard) = this.guard.take() {
                    let state = guard.failure_recovered();
                    error!(request_id = guard.id(), ?state, error = %e, "Failure after partial response.");
                }
                Poll::Ready(Some(Err(e)))
            }
            Ok(Poll::Pending) => Poll::Pending,
            Err(caught) => {
                *this.failed = true;
                if let Some(guard) = this.guard.take() {
                    let state = guard.failure_recovered();
                    error!(
                        request_id = guard.id(),
                        ?state,
                        error = %caught.failure().message(),
                        "Failure after partial response."
                    );
                }
                Poll::Ready(Some(Err(axum::Error::new(generic_error!(
                    "failure after partial response"
                )))))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.failed || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use futures::StreamExt as _;
    use http_body_util::BodyExt as _;

    use super::*;
    use crate::{
        config::RequestConfiguration,
        middleware::{guard::RequestState, panic::install_panic_hook},
        reclaim::MemoryReclaim,
        registry::{AdmissionRequest, RequestRegistry},
        restart::RestartTrigger,
    };

    async fn tracked(body: Body) -> (RequestRegistry, Arc<RequestGuard>, TrackedBody) {
        let (registry, _) = RequestRegistry::spawn(
            RequestConfiguration::default(),
            MemoryReclaim::default(),
            RestartTrigger::new(),
        );
        let handle = registry
            .admit(AdmissionRequest {
                method: http::Method::GET,
                uri: "/stream".parse().unwrap(),
                version: http::Version::HTTP_11,
                headers: http::HeaderMap::new(),
                peer_addr: None,
            })
            .await
            .unwrap();

        let guard = Arc::new(RequestGuard::new(registry.clone(), handle.id()));
        guard.response_sent(200);
        let body = TrackedBody::new(body, Arc::clone(&guard));
        (registry, guard, body)
    }

    #[tokio::test]
    async fn counts_bytes_and_retires_when_complete() {
        let (registry, guard, body) = tracked(Body::from("hello world")).await;
        drop(guard);

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"hello world");

        let stats = registry.stats().await.unwrap();
        assert_eq!(stats.current_requests, 0);
        assert_eq!(stats.completed_requests, 1);
    }

    #[tokio::test]
    async fn failure_mid_body_ends_stream_without_extra_bytes() {
        install_panic_hook();

        let chunks = futures::stream::iter([1, 2, 3]).map(|i| {
            if i == 2 {
                panic!("lost the upstream");
            }
            Ok::<_, Infallible>(Bytes::from(format!("chunk {}", i)))
        });
        let (registry, guard, mut body) = tracked(Body::from_stream(chunks)).await;

        let first = body.frame().await.unwrap().unwrap();
        assert_eq!(first.into_data().unwrap(), Bytes::from("chunk 1"));

        assert!(body.frame().await.unwrap().is_err());
        assert!(body.frame().await.is_none());
        assert!(http_body::Body::is_end_stream(&body));
        assert_eq!(guard.state(), RequestState::ResponseAlreadyStarted);

        drop(guard);
        drop(body);
        assert_eq!(registry.stats().await.unwrap().current_requests, 0);
    }

    #[tokio::test]
    async fn body_error_mid_stream_is_recorded() {
        let chunks = futures::stream::iter([
            Ok(Bytes::from("part")),
            Err(std::io::Error::other("upstream broke")),
            Ok(Bytes::from("never sent")),
        ]);
        let (registry, guard, mut body) = tracked(Body::from_stream(chunks)).await;

        let first = body.frame().await.unwrap().unwrap();
        assert_eq!(first.into_data().unwrap(), Bytes::from("part"));

        assert!(body.frame().await.unwrap().is_err());
        assert!(body.frame().await.is_none());
        assert_eq!(guard.state(), RequestState::ResponseAlreadyStarted);

        drop(guard);
        drop(body);
        assert_eq!(registry.stats().await.unwrap().current_requests, 0);
    }
}
