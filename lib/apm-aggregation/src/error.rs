//! Error types.

use std::{fmt::Display, time::Duration};

use snafu::Snafu;

/// A generic error.
pub type GenericError = anyhow::Error;

/// Constructs a [`GenericError`] from a string literal, a format string, or an existing error value.
#[macro_export]
macro_rules! generic_error {
    ($msg:literal $(,)?) => { $crate::error::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::error::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::error::_anyhow!($fmt, $($arg)*) };
}

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}

// NOTE: This wraps `anyhow::Context` so the extension methods don't collide with `snafu::ResultExt`.

/// Attaches context to the error value of a `Result`.
pub trait ErrorContext<T, E>: private::Sealed {
    /// Wraps the error value with additional context.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wraps the error value with additional context that is evaluated only once an error occurs.
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

/// An event could not be aggregated.
#[derive(Clone, Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum IngestError {
    /// A field required to derive the aggregation key was missing or empty.
    #[snafu(display("event is missing required field '{}'", field))]
    InvalidEvent {
        /// Name of the offending field.
        field: &'static str,
    },

    /// The aggregator has already performed its final flush.
    #[snafu(display("aggregator '{}' is stopped", aggregator))]
    Stopped {
        /// Name of the aggregator.
        aggregator: &'static str,
    },
}

/// A batch of documents could not be published.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum PublishError {
    /// The sink rejected the batch.
    #[snafu(display("sink rejected batch: {}", source))]
    Rejected {
        /// Underlying error reported by the sink.
        source: GenericError,
    },

    /// The sink did not accept the batch within the configured timeout.
    #[snafu(display("publish did not complete within {:?}", timeout))]
    TimedOut {
        /// The timeout that elapsed.
        timeout: Duration,
    },
}

impl From<GenericError> for PublishError {
    fn from(source: GenericError) -> Self {
        Self::Rejected { source }
    }
}
