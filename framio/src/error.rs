// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type alias that all framio public API functions can use.
pub type Result<T> = std::result::Result<T, FramioError>;

/// Composite error type to encompass all terminal outcomes a task can
/// surface to its consumer.
///
/// Cancellation is deliberately a separate variant rather than a flavor of
/// fault: combinators and timeout helpers need to distinguish "was cancelled"
/// from "failed" and choose to suppress or rethrow accordingly. See
/// [`TaskHandle::suppress_cancellation`].
///
/// [`TaskHandle::suppress_cancellation`]: crate::TaskHandle::suppress_cancellation
#[derive(Error, Debug, Clone)]
pub enum FramioError {
    /// The task faulted. Holds the error captured at the point the fault was
    /// first observed; it surfaces only when the result is consumed.
    #[error("task faulted: {0}")]
    Faulted(Arc<dyn std::error::Error + Send + Sync + 'static>),

    /// The task observed its cancellation token and stopped.
    #[error("task was canceled")]
    Canceled,

    /// A [`timeout`] wrapper expired before the wrapped task completed.
    ///
    /// [`timeout`]: crate::FrameScheduler::timeout
    #[error("task timed out after {0:?}")]
    TimedOut(Duration),
}

impl FramioError {
    /// Captures an arbitrary error as a task fault.
    pub fn fault(err: impl std::error::Error + Send + Sync + 'static) -> FramioError {
        FramioError::Faulted(Arc::new(err))
    }

    /// Whether this is a fault (as opposed to a cancellation or timeout).
    pub fn is_fault(&self) -> bool {
        matches!(self, FramioError::Faulted(_))
    }

    /// Whether this is a cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, FramioError::Canceled)
    }
}

/// A panic captured while running user code on behalf of a task, converted
/// into an error so it can be stored as a fault instead of unwinding through
/// the frame loop.
#[derive(Debug)]
pub(crate) struct Panicked {
    pub(crate) message: String,
}

impl fmt::Display for Panicked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panicked: {}", self.message)
    }
}

impl std::error::Error for Panicked {}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io;

    #[test]
    fn fault_display_includes_source() {
        let err = FramioError::fault(io::Error::new(io::ErrorKind::Other, "disk on fire"));
        let s = format!("{}", err);
        assert_eq!(s, "task faulted: disk on fire");
        assert!(err.is_fault());
        assert!(!err.is_canceled());
    }

    #[test]
    fn canceled_is_not_a_fault() {
        let err = FramioError::Canceled;
        assert!(err.is_canceled());
        assert!(!err.is_fault());
    }

    #[test]
    fn panic_payloads_downcast() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("boom".to_string())), "boom");
        assert_eq!(panic_message(Box::new(42_u32)), "opaque panic payload");
    }
}
