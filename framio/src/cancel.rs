// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Cooperative cancellation.
//!
//! Cancellation in framio is sampled, never preemptive: frame-driven
//! promises check their token at the top of every tick, and layered helpers
//! subscribe a continuation so they observe cancellation the moment it is
//! requested. Cancellation is a terminal state of its own
//! ([`FramioError::Canceled`]), distinct from a fault.
//!
//! [`FramioError::Canceled`]: crate::FramioError::Canceled

use crate::error::FramioError;
use crate::handle::observe;
use crate::source::{impl_completion_source, CompletionCore};
use crate::waker_fn::waker_fn;
use crate::TaskHandle;
use smallvec::SmallVec;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Waker;

#[derive(Debug)]
struct CancelState {
    canceled: AtomicBool,
    watchers: Mutex<SmallVec<[Waker; 4]>>,
}

/// The requesting side of a cancellation pair.
///
/// # Examples
///
/// ```
/// use framio::CancelSource;
///
/// let source = CancelSource::new();
/// let token = source.token();
/// assert!(!token.is_canceled());
/// source.cancel();
/// assert!(token.is_canceled());
/// ```
#[derive(Clone, Debug)]
pub struct CancelSource {
    inner: Arc<CancelState>,
}

impl CancelSource {
    /// Creates a new cancellation source with no cancellation requested.
    pub fn new() -> CancelSource {
        CancelSource {
            inner: Arc::new(CancelState {
                canceled: AtomicBool::new(false),
                watchers: Mutex::new(SmallVec::new()),
            }),
        }
    }

    /// A token observing this source.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            inner: Some(self.inner.clone()),
        }
    }

    /// Requests cancellation. Idempotent; the first call wakes every watcher
    /// registered so far.
    pub fn cancel(&self) {
        if self.inner.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        let watchers = mem::take(&mut *self.inner.watchers.lock().unwrap());
        for waker in watchers {
            wake!(waker);
        }
    }

    /// Whether cancellation was requested.
    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// A sampled cancellation token.
///
/// The default token ([`CancelToken::never`]) can never be canceled and
/// costs nothing to check; frame promise constructors take it when no
/// cancellation is wanted.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Option<Arc<CancelState>>,
}

impl CancelToken {
    /// A token that is never canceled.
    pub fn never() -> CancelToken {
        CancelToken { inner: None }
    }

    /// Samples the token.
    pub fn is_canceled(&self) -> bool {
        match &self.inner {
            Some(inner) => inner.canceled.load(Ordering::SeqCst),
            None => false,
        }
    }

    /// Registers `waker` to fire when cancellation is requested; fires it
    /// immediately if it already was. A never-token registers nothing.
    pub(crate) fn watch(&self, waker: &Waker) {
        let inner = match &self.inner {
            Some(inner) => inner,
            None => return,
        };
        {
            let mut watchers = inner.watchers.lock().unwrap();
            if !inner.canceled.load(Ordering::SeqCst) {
                watchers.push(waker.clone());
                return;
            }
        }
        wake!(waker.clone());
    }
}

struct AttachNode<T> {
    core: CompletionCore<T>,
}

impl_completion_source!(AttachNode<T> => T);

/// Races `task` against an external cancellation token: whichever reaches the
/// forwarding core first decides the outcome. The loser's completion lands in
/// the no-op path and is discarded; in particular the inner task keeps
/// running fire-and-forget after the token wins.
pub(crate) fn attach_external<T: Send + 'static>(
    task: TaskHandle<T>,
    token: CancelToken,
) -> TaskHandle<T> {
    if token.is_canceled() {
        task.detach();
        return TaskHandle::from_error(FramioError::Canceled);
    }

    let node = Arc::new(AttachNode {
        core: CompletionCore::new(),
    });
    let handle_token = node.core.version();

    let forward = node.clone();
    observe(task, move |outcome| {
        forward.core.try_complete(outcome);
    });

    let canceler = node.clone();
    token.watch(&waker_fn(move || {
        canceler.core.try_set_canceled();
    }));

    TaskHandle::from_source(node, handle_token)
}

impl<T> fmt::Debug for AttachNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachNode").field("core", &self.core).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::source::{TaskCompletionSource, TaskStatus};
    use futures_lite::future::block_on;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn never_token_is_inert() {
        let token = CancelToken::never();
        assert!(!token.is_canceled());
        token.watch(&crate::waker_fn::dummy_waker());

        let default_token = CancelToken::default();
        assert!(!default_token.is_canceled());
    }

    #[test]
    fn cancel_wakes_watchers_once() {
        let source = CancelSource::new();
        let token = source.token();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        token.watch(&waker_fn(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        source.cancel();
        source.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn watch_after_cancel_fires_immediately() {
        let source = CancelSource::new();
        source.cancel();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        source.token().watch(&waker_fn(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn token_winning_the_race_cancels_the_task() {
        // the wrapped task resolves *after* the token fires; the canceled
        // outcome must stick even though a successful result arrives later
        let source = TaskCompletionSource::new();
        let cancel = CancelSource::new();
        let wrapped = source.task().attach_cancellation(cancel.token());

        cancel.cancel();
        source.try_set_result(100);

        assert_eq!(wrapped.status(), TaskStatus::Canceled);
        assert!(block_on(wrapped).unwrap_err().is_canceled());
    }

    #[test]
    fn completion_before_cancellation_wins() {
        let source = TaskCompletionSource::new();
        let cancel = CancelSource::new();
        let wrapped = source.task().attach_cancellation(cancel.token());

        source.try_set_result(7);
        cancel.cancel();

        assert_eq!(block_on(wrapped).unwrap(), 7);
    }

    #[test]
    fn already_canceled_token_short_circuits() {
        let cancel = CancelSource::new();
        cancel.cancel();

        let source: TaskCompletionSource<u32> = TaskCompletionSource::new();
        let wrapped = source.task().attach_cancellation(cancel.token());
        assert_eq!(wrapped.status(), TaskStatus::Canceled);
    }

    #[test]
    fn fault_propagates_through_attachment() {
        let source: TaskCompletionSource<u32> = TaskCompletionSource::new();
        let cancel = CancelSource::new();
        let wrapped = source.task().attach_cancellation(cancel.token());

        source.try_set_faulted(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(block_on(wrapped).unwrap_err().is_fault());
    }
}
