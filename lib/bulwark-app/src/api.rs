//! API composition.

use axum::Router;
use bulwark_api::APIHandler;

/// An API builder.
///
/// `APIBuilder` provides a simple and ergonomic builder pattern for constructing a single router from multiple
/// handlers. This allows composing portions of an API, such as the service's own routes and the `/debug/` endpoints,
/// from individual building blocks.
///
/// Serving is left to the caller, which owns the listener and decides how connections are accepted and drained.
#[derive(Default)]
pub struct APIBuilder {
    router: Router,
}

impl APIBuilder {
    /// Create a new `APIBuilder` with an empty router.
    pub fn new() -> Self {
        Self { router: Router::new() }
    }

    /// Adds the given handler to this builder.
    ///
    /// The initial state and routes provided by the handler will be merged into this builder.
    pub fn with_handler<H>(mut self, handler: H) -> Self
    where
        H: APIHandler,
    {
        self.router = self.router.merge(handler.into_router());
        self
    }

    /// Adds the given handler to this builder if it is `Some`.
    pub fn with_optional_handler<H>(self, handler: Option<H>) -> Self
    where
        H: APIHandler,
    {
        match handler {
            Some(handler) => self.with_handler(handler),
            None => self,
        }
    }

    /// Adds a plain router, such as the service's own routes, to this builder.
    pub fn with_router(mut self, router: Router) -> Self {
        self.router = self.router.merge(router);
        self
    }

    /// Consumes the builder, returning the composed router.
    pub fn build(self) -> Router {
        self.router
    }
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request, routing::get};
    use bulwark_api::StatusCode;
    use tower::ServiceExt as _;

    use super::*;

    #[derive(Clone)]
    struct Greeting(&'static str);

    struct GreetingHandler;

    impl APIHandler for GreetingHandler {
        type State = Greeting;

        fn generate_initial_state(&self) -> Self::State {
            Greeting("hello")
        }

        fn generate_routes(&self) -> Router<Self::State> {
            Router::new().route(
                "/greeting",
                get(|axum::extract::State(greeting): axum::extract::State<Greeting>| async move { greeting.0 }),
            )
        }
    }

    #[tokio::test]
    async fn merges_handlers_and_routers() {
        let router = APIBuilder::new()
            .with_handler(GreetingHandler)
            .with_optional_handler(None::<GreetingHandler>)
            .with_router(Router::new().route("/ping", get(|| async { "pong" })))
            .build();

        let response = router
            .clone()
            .oneshot(Request::get("/greeting").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(Request::get("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
