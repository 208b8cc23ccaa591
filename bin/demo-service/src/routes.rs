use std::{convert::Infallible, time::Duration};

use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocketUpgrade},
        Query,
    },
    http::StatusCode,
    response::Response,
    routing::get,
    Router,
};
use bulwark_runtime::{
    middleware::{HttpError, RequestContext, RequiredParamsLayer},
    streaming::{guard_streaming_session, SessionSocket},
};
use bytes::Bytes;
use futures::StreamExt as _;
use serde::Deserialize;
use tokio::time::sleep;

/// Builds the demo routes.
pub fn routes() -> Router {
    let greeting = Router::new()
        .route("/hello", get(hello))
        .route_layer(RequiredParamsLayer::new(["name"]));

    Router::new()
        .merge(greeting)
        .route("/slow", get(slow))
        .route("/conflict", get(conflict))
        .route("/panic", get(fail))
        .route("/countdown", get(countdown))
        .route("/echo", get(echo))
}

#[derive(Deserialize)]
struct Greeting {
    name: String,
}

async fn hello(ctx: RequestContext, Query(greeting): Query<Greeting>) -> String {
    format!("Hello, {}! (from {})\n", greeting.name, ctx.remote_ip())
}

#[derive(Deserialize)]
struct Pause {
    #[serde(default)]
    secs: u64,
}

async fn slow(ctx: RequestContext, Query(pause): Query<Pause>) -> String {
    ctx.set_can_be_slow();
    sleep(Duration::from_secs(pause.secs)).await;
    format!("Slept for {} secs\n", pause.secs)
}

async fn conflict() -> Result<String, HttpError> {
    Err(HttpError::new(StatusCode::CONFLICT, "Widget already exists"))
}

async fn fail() -> &'static str {
    panic!("demo handler failure")
}

async fn countdown() -> Body {
    let lines = futures::stream::iter((1..=5).rev()).then(|n| async move {
        sleep(Duration::from_millis(200)).await;
        Ok::<_, Infallible>(Bytes::from(format!("{}\n", n)))
    });
    Body::from_stream(lines)
}

async fn echo(ctx: RequestContext, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| guard_streaming_session(ctx, socket, echo_session))
}

async fn echo_session(socket: SessionSocket) -> Result<(), HttpError> {
    while let Some(message) = socket.recv().await {
        match message {
            Message::Text(text) if text.as_str() == "panic" => panic!("echo session asked to fail"),
            Message::Text(text) => socket.send_text(format!("echo: {}", text.as_str())).await?,
            Message::Binary(_) => return Err(HttpError::bad_request("Binary frames are not supported")),
            _ => {}
        }
    }
    Ok(())
}
