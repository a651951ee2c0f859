//! Subscriber side of the event bus.

use crate::BoxFuture;
use crate::event::Event;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Classification of a failed delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// A dependency errored; a later attempt may succeed
    Transient,
    /// The payload itself cannot be processed
    Permanent,
    /// The invocation exceeded its execution budget
    TimedOut,
}

impl FailureKind {
    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::TimedOut => "timed_out",
        }
    }

    /// Inverse of [`as_str`](Self::as_str).
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "transient" => Some(Self::Transient),
            "permanent" => Some(Self::Permanent),
            "timed_out" => Some(Self::TimedOut),
            _ => None,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by an [`EventHandler`].
///
/// Every kind is retried by the router up to the subscription's attempt
/// bound; the kind is carried into logs, metrics and the dead-letter envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} failure: {message}")]
pub struct HandlerError {
    kind: FailureKind,
    message: String,
}

impl HandlerError {
    /// Build an error of an explicit kind.
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A failure that may succeed on retry.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    /// A failure caused by the payload itself.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, message)
    }

    /// The invocation ran past `budget`.
    #[must_use]
    pub fn timed_out(budget: Duration) -> Self {
        Self::new(
            FailureKind::TimedOut,
            format!("invocation exceeded {}ms", budget.as_millis()),
        )
    }

    /// Failure classification.
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        self.kind
    }

    /// Human-readable cause.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// A subscriber invoked by the router once per delivery attempt.
///
/// Handlers may be invoked more than once for the same event and concurrently
/// for different events; every side effect must be safe to repeat.
///
/// # Dyn Compatibility
///
/// Returns boxed futures so the router can store `Arc<dyn EventHandler>`.
pub trait EventHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Process one event.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`] when the attempt failed; the router decides
    /// whether to retry or dead-letter.
    fn handle<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, Result<(), HandlerError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = HandlerError::permanent("missing id");
        assert_eq!(err.to_string(), "permanent failure: missing id");
        assert_eq!(err.kind(), FailureKind::Permanent);
    }

    #[test]
    fn timed_out_reports_budget() {
        let err = HandlerError::timed_out(Duration::from_millis(250));
        assert_eq!(err.kind(), FailureKind::TimedOut);
        assert!(err.message().contains("250ms"));
    }

    #[test]
    fn failure_kind_labels_parse_back() {
        for kind in [FailureKind::Transient, FailureKind::Permanent, FailureKind::TimedOut] {
            assert_eq!(FailureKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(FailureKind::parse("fatal"), None);
    }
}
