use std::{
    any::Any,
    backtrace::Backtrace,
    cell::{Cell, RefCell},
    future::Future,
    panic::{self, AssertUnwindSafe, PanicHookInfo},
    pin::Pin,
    sync::Once,
    task::{Context, Poll},
};

use pin_project_lite::pin_project;

use super::error::{CloseMessage, HttpError};

thread_local! {
    static GUARDED_POLL_DEPTH: Cell<usize> = const { Cell::new(0) };
    static LAST_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static INSTALL_HOOK: Once = Once::new();

/// Installs the process-wide panic hook used by the request guards.
///
/// Panics raised while a guarded future or body is being polled have their backtrace captured for the guard to report,
/// and are not printed by the default hook. All other panics go to the previously installed hook. Idempotent.
pub fn install_panic_hook() {
    INSTALL_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info: &PanicHookInfo<'_>| {
            if GUARDED_POLL_DEPTH.with(Cell::get) > 0 {
                let backtrace = Backtrace::force_capture();
                LAST_BACKTRACE.with(|last| *last.borrow_mut() = Some(backtrace));
            } else {
                previous(info);
            }
        }));
    });
}

fn take_backtrace() -> Option<Backtrace> {
    LAST_BACKTRACE.with(|last| last.borrow_mut().take())
}

struct GuardedPoll;

impl GuardedPoll {
    fn enter() -> Self {
        GUARDED_POLL_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self
    }
}

impl Drop for GuardedPoll {
    fn drop(&mut self) {
        GUARDED_POLL_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Runs `f`, turning a panic into a [`CaughtPanic`].
pub(crate) fn catch_panic<T>(f: impl FnOnce() -> T) -> Result<T, CaughtPanic> {
    let guard = GuardedPoll::enter();
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    drop(guard);

    result.map_err(|payload| CaughtPanic::new(payload, take_backtrace()))
}

/// A failure recovered from a panic, classified by what was raised.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RecoveredFailure {
    /// An [`HttpError`], which carries its own status and body.
    Protocol(HttpError),

    /// A [`CloseMessage`] for a streaming session.
    Close(CloseMessage),

    /// Anything else, described by its message.
    Generic(String),
}

impl RecoveredFailure {
    /// Returns `true` if the failure carries its own response.
    pub fn is_typed(&self) -> bool {
        !matches!(self, Self::Generic(_))
    }

    /// Human-readable description.
    pub fn message(&self) -> String {
        match self {
            Self::Protocol(e) => e.to_string(),
            Self::Close(close) => close.to_string(),
            Self::Generic(message) => message.clone(),
        }
    }
}

/// A panic caught at one of the request guard's unwind boundaries.
pub struct CaughtPanic {
    failure: RecoveredFailure,
    backtrace: Option<Backtrace>,
}

impl CaughtPanic {
    fn new(payload: Box<dyn Any + Send>, backtrace: Option<Backtrace>) -> Self {
        Self {
            failure: classify_payload(payload),
            backtrace,
        }
    }

    /// The classified failure.
    pub fn failure(&self) -> &RecoveredFailure {
        &self.failure
    }

    /// The backtrace captured when the panic was raised, if the panic hook was installed.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_ref()
    }
}

fn classify_payload(payload: Box<dyn Any + Send>) -> RecoveredFailure {
    let payload = match payload.downcast::<HttpError>() {
        Ok(e) => return RecoveredFailure::Protocol(*e),
        Err(payload) => payload,
    };
    let payload = match payload.downcast::<CloseMessage>() {
        Ok(close) => return RecoveredFailure::Close(*close),
        Err(payload) => payload,
    };

    let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else if let Some(e) = payload.downcast_ref::<bulwark_error::GenericError>() {
        e.to_string()
    } else {
        "Unrecognised error".to_string()
    };
    RecoveredFailure::Generic(message)
}

pin_project! {
    /// A future that resolves to an error, instead of unwinding, if polling the inner future panics.
    pub struct CatchPanic<F> {
        #[pin]
        inner: F,
    }
}

impl<F> CatchPanic<F> {
    /// Wraps the given future.
    pub fn new(inner: F) -> Self {
        Self { inner }
    }
}

impl<F> Future for CatchPanic<F>
where
    F: Future,
{
    type Output = Result<F::Output, CaughtPanic>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = self.project().inner;
        match catch_panic(|| inner.poll(cx)) {
            Ok(Poll::Ready(output)) => Poll::Ready(Ok(output)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(caught) => Poll::Ready(Err(caught)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn classifies_payloads() {
        install_panic_hook();

        let caught = CatchPanic::new(async { std::panic::panic_any(HttpError::not_found("gone")) })
            .await
            .err()
            .unwrap();
        assert_eq!(caught.failure(), &RecoveredFailure::Protocol(HttpError::not_found("gone")));
        assert!(caught.failure().is_typed());

        let caught = CatchPanic::new(async { std::panic::panic_any(CloseMessage::new(4000, "bye")) })
            .await
            .err()
            .unwrap();
        assert_eq!(caught.failure(), &RecoveredFailure::Close(CloseMessage::new(4000, "bye")));

        let caught = CatchPanic::new(async { panic!("widget {} exploded", 7) })
            .await
            .err()
            .unwrap();
        assert_eq!(caught.failure(), &RecoveredFailure::Generic("widget 7 exploded".to_string()));
        assert!(caught.backtrace().is_some());

        let caught = CatchPanic::new(async { panic!("static message") }).await.err().unwrap();
        assert_eq!(caught.failure().message(), "static message");

        let caught = CatchPanic::new(async { std::panic::panic_any(42u8) }).await.err().unwrap();
        assert_eq!(caught.failure().message(), "Unrecognised error");
    }

    #[tokio::test]
    async fn passes_through_completed_futures() {
        let value = CatchPanic::new(async { 5 }).await.ok().unwrap();
        assert_eq!(value, 5);
        assert_eq!(GUARDED_POLL_DEPTH.with(Cell::get), 0);
    }
}
