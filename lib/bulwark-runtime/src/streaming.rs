//! Guarded streaming sessions.
//!
//! A streaming session is a long-lived websocket conversation that follows an HTTP upgrade. Its failures cannot be
//! reported with an HTTP response, so they are reported with a close frame instead.

use std::{future::Future, sync::Arc, time::Duration};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    config::RequestConfiguration,
    middleware::{
        failure_body, CatchPanic, CaughtPanic, CloseMessage, HttpError, RecoveredFailure, RequestContext, CLOSE_ABNORMAL,
    },
    registry::{RequestId, RequestRegistry},
};

const CLOSE_WAIT: Duration = Duration::from_secs(1);

// Close frames are control frames, whose payload is limited to 125 bytes, two of which are the close code.
const MAX_CLOSE_REASON_LEN: usize = 123;

/// The websocket handed to a streaming session.
///
/// Cloning is cheap, and all clones share the same socket. Each operation holds the socket for its duration, so a
/// pending `recv` blocks `send` from other clones until a message arrives.
#[derive(Clone)]
pub struct SessionSocket {
    inner: Arc<Mutex<WebSocket>>,
}

impl SessionSocket {
    /// Sends a message to the peer.
    ///
    /// # Errors
    ///
    /// If the message cannot be sent, an error will be returned.
    pub async fn send(&self, message: Message) -> Result<(), HttpError> {
        self.inner
            .lock()
            .await
            .send(message)
            .await
            .map_err(|e| HttpError::server_error(format!("Failed to send websocket message: {}", e)))
    }

    /// Sends a text message to the peer.
    ///
    /// # Errors
    ///
    /// If the message cannot be sent, an error will be returned.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), HttpError> {
        self.send(Message::Text(text.into().into())).await
    }

    /// Receives the next message from the peer.
    ///
    /// Returns `None` once the peer has closed the connection, or the connection has failed.
    pub async fn recv(&self) -> Option<Message> {
        match self.inner.lock().await.recv().await {
            Some(Ok(Message::Close(_))) | None => None,
            Some(Ok(message)) => Some(message),
            Some(Err(e)) => {
                debug!(error = %e, "Websocket receive failed.");
                None
            }
        }
    }

    async fn close(&self, close: CloseMessage) {
        let mut socket = self.inner.lock().await;

        let frame = CloseFrame {
            code: close.code(),
            reason: truncate_reason(close.reason()).into(),
        };
        if let Err(e) = socket.send(Message::Close(Some(frame))).await {
            debug!(error = %e, "Failed to send websocket close frame.");
            return;
        }

        let wait_for_peer = async {
            while let Some(Ok(message)) = socket.recv().await {
                if matches!(message, Message::Close(_)) {
                    break;
                }
            }
        };
        if tokio::time::timeout(CLOSE_WAIT, wait_for_peer).await.is_err() {
            debug!("Peer did not acknowledge websocket close in time.");
        }
    }
}

/// Runs a streaming session for an upgraded request, and closes the socket when it ends.
///
/// The request is counted as streaming, and remains in flight, until the session ends. The close frame reflects how
/// the session ended:
///
/// - success closes normally
/// - an [`HttpError`], returned or raised, closes with the code for its status class and its body as the reason
/// - a raised [`CloseMessage`] is sent as-is
/// - anything else closes abnormally, reported the same way as a failed HTTP request
pub async fn guard_streaming_session<F, Fut>(ctx: RequestContext, socket: WebSocket, session: F)
where
    F: FnOnce(SessionSocket) -> Fut,
    Fut: Future<Output = Result<(), HttpError>>,
{
    ctx.mark_streaming();

    let socket = SessionSocket {
        inner: Arc::new(Mutex::new(socket)),
    };
    let session_socket = socket.clone();
    let outcome = CatchPanic::new(async move { session(session_socket).await }).await;

    let close = closing_message(outcome, ctx.config(), ctx.registry(), ctx.id()).await;
    debug!(request_id = ctx.id(), code = close.code(), "Streaming session ended.");
    socket.close(close).await;
}

async fn closing_message(
    outcome: Result<Result<(), HttpError>, CaughtPanic>, config: &RequestConfiguration, registry: &RequestRegistry,
    request_id: RequestId,
) -> CloseMessage {
    match outcome {
        Ok(Ok(())) => CloseMessage::normal(),
        Ok(Err(e)) => CloseMessage::from(e),
        Err(caught) => {
            let reason = failure_body(&caught, config, registry, request_id).await;
            let code = match caught.failure() {
                RecoveredFailure::Protocol(e) => e.close_code(),
                RecoveredFailure::Close(close) => close.code(),
                RecoveredFailure::Generic(_) => CLOSE_ABNORMAL,
            };
            CloseMessage::new(code, reason)
        }
    }
}

fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON_LEN {
        return reason.to_string();
    }

    let mut end = MAX_CLOSE_REASON_LEN;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

#[cfg(test)]
mod tests {
    use http::StatusCode;

    use super::*;
    use crate::{
        middleware::{install_panic_hook, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION},
        reclaim::MemoryReclaim,
        restart::RestartTrigger,
    };

    async fn close_for<Fut>(session: Fut) -> CloseMessage
    where
        Fut: Future<Output = Result<(), HttpError>>,
    {
        install_panic_hook();
        let (registry, _) = RequestRegistry::spawn(
            RequestConfiguration::default(),
            MemoryReclaim::default(),
            RestartTrigger::new(),
        );
        let outcome = CatchPanic::new(session).await;
        closing_message(outcome, &RequestConfiguration::default(), &registry, 1).await
    }

    #[tokio::test]
    async fn successful_session_closes_normally() {
        let close = close_for(async { Ok(()) }).await;
        assert_eq!(close.code(), CLOSE_NORMAL);
    }

    #[tokio::test]
    async fn returned_errors_close_by_status_class() {
        let close = close_for(async { Err(HttpError::bad_request("bad frame")) }).await;
        assert_eq!(close, CloseMessage::new(CLOSE_POLICY_VIOLATION, "bad frame"));

        let close = close_for(async { Err(HttpError::new(StatusCode::BAD_GATEWAY, "upstream gone")) }).await;
        assert_eq!(close.code(), CLOSE_INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn raised_failures_are_classified() {
        let close = close_for(async {
            std::panic::panic_any(CloseMessage::new(4000, "kicked"));
        })
        .await;
        assert_eq!(close, CloseMessage::new(4000, "kicked"));

        let close = close_for(async {
            std::panic::panic_any(HttpError::server_error("store offline"));
        })
        .await;
        assert_eq!(close, CloseMessage::new(CLOSE_INTERNAL_ERROR, "store offline"));

        let close = close_for(async {
            panic!("lost track of the session");
        })
        .await;
        assert_eq!(close, CloseMessage::new(CLOSE_ABNORMAL, "PANIC: lost track of the session"));
    }

    #[test]
    fn reasons_fit_in_a_control_frame() {
        assert_eq!(truncate_reason("short"), "short");

        let long = "é".repeat(100);
        let truncated = truncate_reason(&long);
        assert!(truncated.len() <= MAX_CLOSE_REASON_LEN);
        assert!(long.starts_with(&truncated));
    }
}
