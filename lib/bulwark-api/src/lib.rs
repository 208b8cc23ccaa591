//! Building blocks shared by every HTTP surface: the [`APIHandler`] trait and the axum types handlers are written
//! against.
pub use axum::response;
pub use axum::routing;
use axum::Router;
pub use http::StatusCode;

pub mod extract {
    pub use axum::extract::*;
    pub use axum_extra::extract::Query;
}

// An API handler.
//
// API handlers define the initial state and routes for a portion of an API. The builder merges each handler's routes,
// with its state applied, into a single stateless router.
pub trait APIHandler {
    type State: Clone + Send + Sync + 'static;

    fn generate_initial_state(&self) -> Self::State;
    fn generate_routes(&self) -> Router<Self::State>;

    /// Resolves this handler into a stateless router.
    fn into_router(self) -> Router
    where
        Self: Sized,
    {
        let state = self.generate_initial_state();
        self.generate_routes().with_state(state)
    }
}
