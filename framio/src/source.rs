// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! The versioned completion core: the state machine every promise in this
//! crate is built around.
//!
//! A [`CompletionCore`] records a pending/succeeded/faulted/canceled outcome,
//! holds at most one continuation ([`Waker`]), and carries a generation
//! counter (the *version*) that is bumped every time the owning node is
//! recycled through its pool. A consumer presents the token it was issued at
//! creation time; a stale token fails fast instead of reading the result of
//! the wrong task generation.

use crate::error::FramioError;
use crate::Result;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::task::Waker;

/// The observable state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Not complete yet.
    Pending,
    /// Completed with a value.
    Succeeded,
    /// Completed with a captured error.
    Faulted,
    /// Completed by observing cancellation.
    Canceled,
}

impl TaskStatus {
    /// Whether the task has reached any terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Pending)
    }
}

/// The completion-source contract a [`TaskHandle`] consumes.
///
/// Every operation takes the token issued when the handle was created;
/// presenting a stale token is a usage error and panics.
///
/// [`TaskHandle`]: crate::TaskHandle
pub(crate) trait CompletionSource<T>: Send + Sync {
    fn status(&self, token: u16) -> TaskStatus;
    fn register(&self, waker: &Waker, token: u16);
    fn take_result(self: Arc<Self>, token: u16) -> Result<T>;
}

/// Delegates the [`CompletionSource`] contract to a node's embedded `core`
/// field. Pooled nodes write `take_result` by hand instead, since consuming
/// the result is what returns them to their pool.
macro_rules! impl_completion_source {
    ($node:ident => $out:ty) => {
        impl crate::source::CompletionSource<$out> for $node {
            fn status(&self, token: u16) -> crate::source::TaskStatus {
                self.core.status(token)
            }

            fn register(&self, waker: &std::task::Waker, token: u16) {
                self.core.register(waker, token)
            }

            fn take_result(self: std::sync::Arc<Self>, token: u16) -> crate::Result<$out> {
                self.core.take_result(token)
            }
        }
    };
    ($node:ident < $($g:ident),+ > => $out:ty) => {
        impl<$($g: Send + 'static),+> crate::source::CompletionSource<$out> for $node<$($g),+> {
            fn status(&self, token: u16) -> crate::source::TaskStatus {
                self.core.status(token)
            }

            fn register(&self, waker: &std::task::Waker, token: u16) {
                self.core.register(waker, token)
            }

            fn take_result(self: std::sync::Arc<Self>, token: u16) -> crate::Result<$out> {
                self.core.take_result(token)
            }
        }
    };
}

pub(crate) use impl_completion_source;

struct Inner<T> {
    version: u16,
    status: TaskStatus,
    outcome: Option<Result<T>>,
    consumed: bool,
    waker: Option<Waker>,
}

impl<T> Inner<T> {
    fn check_token(&self, token: u16) {
        if token != self.version {
            panic!(
                "stale task token: promise already recycled or reset \
                 (handle generation {}, promise generation {})",
                token, self.version
            );
        }
    }
}

/// The central completion state machine.
///
/// All transitions go through one mutex so completion may arrive from any
/// thread; the continuation is invoked after the lock is released, so a
/// continuation never runs concurrently with another on the same core.
pub(crate) struct CompletionCore<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> CompletionCore<T> {
    pub(crate) fn new() -> CompletionCore<T> {
        CompletionCore {
            inner: Mutex::new(Inner {
                version: 0,
                status: TaskStatus::Pending,
                outcome: None,
                consumed: false,
                waker: None,
            }),
        }
    }

    /// The token to hand out with newly issued handles.
    pub(crate) fn version(&self) -> u16 {
        self.inner.lock().unwrap().version
    }

    /// Transitions Pending to the terminal state implied by `outcome`.
    ///
    /// Returns `false` if the core is already terminal; fan-in combinators
    /// rely on this to race multiple branches onto one core.
    pub(crate) fn try_complete(&self, outcome: Result<T>) -> bool {
        let waker = {
            let mut inner = self.inner.lock().unwrap();
            if inner.status != TaskStatus::Pending {
                return false;
            }
            inner.status = match &outcome {
                Ok(_) => TaskStatus::Succeeded,
                Err(FramioError::Canceled) => TaskStatus::Canceled,
                Err(_) => TaskStatus::Faulted,
            };
            inner.outcome = Some(outcome);
            inner.waker.take()
        };
        if let Some(waker) = waker {
            wake!(waker);
        }
        true
    }

    pub(crate) fn try_set_result(&self, value: T) -> bool {
        self.try_complete(Ok(value))
    }

    pub(crate) fn try_set_faulted(
        &self,
        err: Arc<dyn std::error::Error + Send + Sync + 'static>,
    ) -> bool {
        self.try_complete(Err(FramioError::Faulted(err)))
    }

    pub(crate) fn try_set_canceled(&self) -> bool {
        self.try_complete(Err(FramioError::Canceled))
    }

    /// The status for this generation. Panics on a stale token.
    pub(crate) fn status(&self, token: u16) -> TaskStatus {
        let inner = self.inner.lock().unwrap();
        inner.check_token(token);
        inner.status
    }

    /// The status of the current generation, whatever it is. Producer-side
    /// probe; consumers go through [`CompletionCore::status`].
    pub(crate) fn current_status(&self) -> TaskStatus {
        self.inner.lock().unwrap().status
    }

    /// Stores `waker` as the single pending continuation, replacing any
    /// previous registration. If the core is already terminal the waker is
    /// invoked immediately instead of stored, which resolves the
    /// complete-then-subscribe race without deadlocking the caller.
    pub(crate) fn register(&self, waker: &Waker, token: u16) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.check_token(token);
            if inner.status == TaskStatus::Pending {
                inner.waker = Some(waker.clone());
                return;
            }
        }
        wake!(waker.clone());
    }

    /// Consumes the stored outcome. Valid at most once per generation;
    /// consuming a pending or already-consumed core is a programming error
    /// and panics rather than returning garbage.
    pub(crate) fn take_result(&self, token: u16) -> Result<T> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_token(token);
        if inner.status == TaskStatus::Pending {
            panic!("task result taken before completion");
        }
        if inner.consumed {
            panic!("task result already consumed for this generation");
        }
        inner.consumed = true;
        match inner.outcome.take() {
            Some(outcome) => outcome,
            None => unreachable!(),
        }
    }

    /// Clears all fields and bumps the version, invalidating every token
    /// issued for the previous generation. Called only on the pool return
    /// path, after the result has been consumed.
    pub(crate) fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.version = inner.version.wrapping_add(1);
        inner.status = TaskStatus::Pending;
        inner.outcome = None;
        inner.consumed = false;
        inner.waker = None;
    }
}

impl<T> fmt::Debug for CompletionCore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("CompletionCore")
            .field("version", &inner.version)
            .field("status", &inner.status)
            .field("consumed", &inner.consumed)
            .finish()
    }
}

struct SourceNode<T> {
    core: CompletionCore<T>,
}

impl_completion_source!(SourceNode<T> => T);

/// The producer side of an externally completed task.
///
/// Whatever event the task represents (a network reply, a job finishing on a
/// worker thread) calls one of the `try_set_*` methods, from any thread; the
/// task obtained from [`task`] resolves with that outcome. The first terminal
/// transition wins and later ones report `false`.
///
/// # Examples
///
/// ```
/// use framio::TaskCompletionSource;
/// use futures_lite::future;
///
/// let source = TaskCompletionSource::new();
/// let task = source.task();
/// assert!(source.try_set_result(7));
/// assert!(!source.try_set_canceled());
/// assert_eq!(future::block_on(task).unwrap(), 7);
/// ```
///
/// [`task`]: TaskCompletionSource::task
pub struct TaskCompletionSource<T> {
    node: Arc<SourceNode<T>>,
}

impl<T: Send + 'static> TaskCompletionSource<T> {
    /// Creates a new, pending completion source.
    pub fn new() -> TaskCompletionSource<T> {
        TaskCompletionSource {
            node: Arc::new(SourceNode {
                core: CompletionCore::new(),
            }),
        }
    }

    /// The task resolved by this source.
    ///
    /// May be called more than once, but only one of the returned handles may
    /// consume the result; the others panic if polled to completion.
    pub fn task(&self) -> crate::TaskHandle<T> {
        crate::TaskHandle::from_source(self.node.clone(), self.node.core.version())
    }

    /// Completes the task with `value`. Reports `false` if the task already
    /// reached a terminal state.
    pub fn try_set_result(&self, value: T) -> bool {
        self.node.core.try_set_result(value)
    }

    /// Completes the task with a captured fault.
    pub fn try_set_faulted(&self, err: impl std::error::Error + Send + Sync + 'static) -> bool {
        self.node.core.try_set_faulted(Arc::new(err))
    }

    /// Completes the task as canceled.
    pub fn try_set_canceled(&self) -> bool {
        self.node.core.try_set_canceled()
    }

    /// The current status of the task this source resolves.
    pub fn status(&self) -> TaskStatus {
        self.node.core.current_status()
    }
}

impl<T: Send + 'static> Default for TaskCompletionSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for TaskCompletionSource<T> {
    fn clone(&self) -> Self {
        TaskCompletionSource {
            node: self.node.clone(),
        }
    }
}

impl<T> fmt::Debug for TaskCompletionSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCompletionSource")
            .field("core", &self.node.core)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::waker_fn::waker_fn;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn probe() -> (Waker, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        (
            waker_fn(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
            hits,
        )
    }

    #[test]
    fn first_terminal_transition_wins() {
        let core: CompletionCore<u32> = CompletionCore::new();
        assert!(core.try_set_result(1));
        assert!(!core.try_set_result(2));
        assert!(!core.try_set_canceled());
        assert_eq!(core.status(0), TaskStatus::Succeeded);
        assert_eq!(core.take_result(0).unwrap(), 1);
    }

    #[test]
    fn register_then_complete_fires_continuation_once() {
        let core: CompletionCore<()> = CompletionCore::new();
        let (waker, hits) = probe();
        core.register(&waker, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(core.try_set_result(()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // the continuation slot was drained; a second transition attempt
        // neither succeeds nor fires anything
        assert!(!core.try_set_canceled());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn complete_then_register_fires_immediately() {
        let core: CompletionCore<()> = CompletionCore::new();
        assert!(core.try_set_canceled());
        let (waker, hits) = probe();
        core.register(&waker, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reregistration_replaces_the_continuation() {
        let core: CompletionCore<()> = CompletionCore::new();
        let (stale, stale_hits) = probe();
        let (live, live_hits) = probe();
        core.register(&stale, 0);
        core.register(&live, 0);
        core.try_set_result(());
        assert_eq!(stale_hits.load(Ordering::SeqCst), 0);
        assert_eq!(live_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "already consumed")]
    fn double_consumption_panics() {
        let core: CompletionCore<u32> = CompletionCore::new();
        core.try_set_result(3);
        let _ = core.take_result(0);
        let _ = core.take_result(0);
    }

    #[test]
    #[should_panic(expected = "taken before completion")]
    fn taking_a_pending_result_panics() {
        let core: CompletionCore<u32> = CompletionCore::new();
        let _ = core.take_result(0);
    }

    #[test]
    #[should_panic(expected = "stale task token")]
    fn stale_token_is_rejected_after_reset() {
        let core: CompletionCore<u32> = CompletionCore::new();
        let token = core.version();
        core.try_set_result(9);
        let _ = core.take_result(token);
        core.reset();
        // the old generation's token must not read the new generation
        let _ = core.status(token);
    }

    #[test]
    fn reset_clears_state_and_bumps_version() {
        let core: CompletionCore<u32> = CompletionCore::new();
        core.try_set_result(5);
        let _ = core.take_result(0);
        core.reset();
        assert_eq!(core.version(), 1);
        assert_eq!(core.status(1), TaskStatus::Pending);
        assert!(core.try_set_result(6));
        assert_eq!(core.take_result(1).unwrap(), 6);
    }

    #[test]
    fn faults_surface_on_consumption() {
        let core: CompletionCore<u32> = CompletionCore::new();
        core.try_set_faulted(Arc::new(io::Error::new(io::ErrorKind::Other, "oops")));
        assert_eq!(core.status(0), TaskStatus::Faulted);
        let err = core.take_result(0).unwrap_err();
        assert!(err.is_fault());
    }

    #[test]
    fn completion_source_cross_thread() {
        let source = TaskCompletionSource::new();
        let producer = source.clone();
        let join = std::thread::spawn(move || {
            assert!(producer.try_set_result("done"));
        });
        join.join().unwrap();
        assert_eq!(source.status(), TaskStatus::Succeeded);
    }
}
