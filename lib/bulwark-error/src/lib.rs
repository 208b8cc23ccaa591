//! Error primitives shared across the workspace.
//!
//! Libraries that need callers to match on failure modes define their own `snafu` error enums. Everything else, and
//! every binary entrypoint, deals in [`GenericError`]: an opaque error that carries a chain of causes and renders
//! them all when logged with `{:?}`.
#![deny(warnings)]
#![deny(missing_docs)]

use std::fmt::Display;

/// An opaque error with an optional chain of source errors.
pub type GenericError = anyhow::Error;

/// A `Result` whose error type is [`GenericError`].
pub type GenericResult<T> = Result<T, GenericError>;

/// Constructs a [`GenericError`].
///
/// Accepts a string literal, a format string with arguments (same rules as `std::format!`), or any value implementing
/// `Debug` and `Display`. When given an existing `std::error::Error`, its source chain is preserved.
#[macro_export]
macro_rules! generic_error {
    // Forwards to `anyhow!`. Kept as our own macro so call sites don't depend on `anyhow` directly.
    ($msg:literal $(,)?) => { $crate::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::_anyhow!($fmt, $($arg)*) };
}

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

pub(crate) mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}

/// Attaches human-readable context to a fallible result, converting it into a [`GenericError`].
///
/// This wraps `anyhow::Context` under different method names so that it can be imported alongside
/// `snafu::ResultExt` without the two colliding.
pub trait ErrorContext<T, E>: private::Sealed {
    /// Wraps the error value with additional context.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wraps the error value with context that is only built if an error actually occurred.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    Result<T, E>: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        <Self as anyhow::Context<T, E>>::context(self, context)
    }

    fn with_error_context<C, F>(self, context: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        <Self as anyhow::Context<T, E>>::with_context(self, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_is_rendered_before_source() {
        let result: Result<(), std::io::Error> = Err(std::io::Error::other("disk on fire"));
        let err = result.error_context("Failed to write pidfile.").unwrap_err();

        let rendered = format!("{:?}", err);
        assert!(rendered.starts_with("Failed to write pidfile."));
        assert!(rendered.contains("disk on fire"));
    }

    #[test]
    fn lazy_context_only_built_on_error() {
        let result: Result<u32, std::io::Error> = Ok(7);
        let value = result
            .with_error_context(|| -> String { panic!("context should not be evaluated") })
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn macro_formats_arguments() {
        let err = generic_error!("pid {} is still alive", 42);
        assert_eq!(err.to_string(), "pid 42 is still alive");
    }
}
