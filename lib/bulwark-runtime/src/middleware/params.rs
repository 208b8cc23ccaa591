use std::{
    collections::HashSet,
    convert::Infallible,
    sync::Arc,
    task::{Context, Poll},
};

use axum::{
    body::Body,
    extract::{RawPathParams, Request},
    response::{IntoResponse as _, Response},
    RequestPartsExt as _,
};
use futures::future::BoxFuture;
use http::{header, request::Parts};
use tower::{Layer, Service};

use super::error::HttpError;

const MAX_FORM_BODY_LEN: usize = 2 * 1024 * 1024;

/// A layer that rejects requests missing any of a set of parameters, before the handler runs.
///
/// Parameters may be supplied in the path, in the query string, or in a URL-encoded form body. The first missing
/// parameter, in the order given, is reported with a `400 Bad Request`. Apply it with `route_layer` so that path
/// parameters are available.
#[derive(Clone)]
pub struct RequiredParamsLayer {
    params: Arc<[String]>,
}

impl RequiredParamsLayer {
    /// Creates a new `RequiredParamsLayer` requiring the given parameters.
    pub fn new<I, P>(params: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        Self {
            params: params.into_iter().map(Into::into).collect(),
        }
    }
}

impl<S> Layer<S> for RequiredParamsLayer {
    type Service = RequiredParams<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequiredParams {
            inner,
            params: Arc::clone(&self.params),
        }
    }
}

/// Service produced by [`RequiredParamsLayer`].
#[derive(Clone)]
pub struct RequiredParams<S> {
    inner: S,
    params: Arc<[String]>,
}

impl<S> Service<Request> for RequiredParams<S>
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
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let params = Arc::clone(&self.params);

        Box::pin(async move {
            if params.is_empty() {
                return inner.call(request).await;
            }

            let (mut parts, body) = request.into_parts();
            let (present, body) = match collect_present_params(&mut parts, body).await {
                Ok(collected) => collected,
                Err(e) => return Ok(e.into_response()),
            };

            if let Some(missing) = params.iter().find(|param| !present.contains(param.as_str())) {
                return Ok(HttpError::missing_parameter(missing).into_response());
            }

            inner.call(Request::from_parts(parts, body)).await
        })
    }
}

async fn collect_present_params(parts: &mut Parts, body: Body) -> Result<(HashSet<String>, Body), HttpError> {
    let mut present = HashSet::new();

    if let Ok(path_params) = parts.extract::<RawPathParams>().await {
        present.extend(path_params.iter().map(|(name, _)| name.to_string()));
    }

    if let Some(query) = parts.uri.query() {
        present.extend(url::form_urlencoded::parse(query.as_bytes()).map(|(name, _)| name.into_owned()));
    }

    if !is_form_body(parts) {
        return Ok((present, body));
    }

    let bytes = axum::body::to_bytes(body, MAX_FORM_BODY_LEN)
        .await
        .map_err(|e| HttpError::bad_request(format!("Failed to read form body: {}", e)))?;
    present.extend(url::form_urlencoded::parse(&bytes).map(|(name, _)| name.into_owned()));

    Ok((present, Body::from(bytes)))
}

fn is_form_body(parts: &Parts) -> bool {
    parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"))
}

#[cfg(test)]
mod tests {
    use axum::{routing::get, Router};
    use http::StatusCode;
    use http_body_util::BodyExt as _;
    use tower::ServiceExt as _;

    use super::*;

    fn router() -> Router {
        Router::new()
            .route("/hello", get(|| async { "hi" }).post(|body: String| async move { body }))
            .route("/users/{user}", get(|| async { "user" }))
            .route_layer(RequiredParamsLayer::new(["user", "greeting"]))
    }

    async fn send(request: Request) -> (StatusCode, String) {
        let response = router().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn missing_parameter_is_rejected() {
        let request = Request::get("/hello?user=ada").body(Body::empty()).unwrap();
        let (status, body) = send(request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Missing required parameter: greeting\r\n");
    }

    #[tokio::test]
    async fn first_missing_parameter_is_reported() {
        let request = Request::get("/hello").body(Body::empty()).unwrap();
        let (_, body) = send(request).await;
        assert_eq!(body, "Missing required parameter: user\r\n");
    }

    #[tokio::test]
    async fn query_path_and_form_parameters_count() {
        let request = Request::get("/hello?user=ada&greeting=").body(Body::empty()).unwrap();
        assert_eq!(send(request).await, (StatusCode::OK, "hi".to_string()));

        let request = Request::get("/users/ada?greeting=hey").body(Body::empty()).unwrap();
        assert_eq!(send(request).await, (StatusCode::OK, "user".to_string()));

        let request = Request::post("/hello?user=ada")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("greeting=hello"))
            .unwrap();
        assert_eq!(send(request).await, (StatusCode::OK, "greeting=hello".to_string()));
    }
}
