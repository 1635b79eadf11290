// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use crate::error::FramioError;
use crate::source::{CompletionSource, TaskStatus};
use crate::waker_fn::waker_fn;
use crate::Result;
use lazy_static::lazy_static;
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};

enum State<T> {
    Ready(Result<T>),
    Source {
        source: Arc<dyn CompletionSource<T>>,
        token: u16,
    },
    Consumed,
}

pub(crate) enum HandleParts<T> {
    Ready(Result<T>),
    Pending {
        source: Arc<dyn CompletionSource<T>>,
        token: u16,
    },
}

/// A handle that awaits the outcome of a task.
///
/// A handle is a small value referencing either an immediate outcome or a
/// pending promise plus the generation token valid when the handle was
/// issued. It is a standard [`Future`] resolving to `Result<T>`: `Ok` for
/// success, [`FramioError::Canceled`] for cancellation, and
/// [`FramioError::Faulted`] carrying the captured error for a fault.
///
/// The result may be consumed exactly once. Consumption is tied to ownership
/// of the handle, so this is mostly enforced by the compiler; a promise that
/// was recycled out from under a stale handle is caught at run time by the
/// generation token and panics.
///
/// # Examples
///
/// ```
/// use framio::TaskHandle;
/// use futures_lite::future;
///
/// let task = TaskHandle::from_result(3);
/// assert_eq!(future::block_on(task).unwrap(), 3);
/// ```
#[must_use = "tasks do nothing unless awaited, detached, or combined"]
pub struct TaskHandle<T = ()> {
    state: State<T>,
}

impl<T> Unpin for TaskHandle<T> {}

impl<T> TaskHandle<T> {
    /// A task that is already complete with `value`.
    pub fn from_result(value: T) -> TaskHandle<T> {
        TaskHandle {
            state: State::Ready(Ok(value)),
        }
    }

    /// A task that is already terminal with `err`.
    pub fn from_error(err: FramioError) -> TaskHandle<T> {
        TaskHandle {
            state: State::Ready(Err(err)),
        }
    }

    pub(crate) fn from_source(source: Arc<dyn CompletionSource<T>>, token: u16) -> TaskHandle<T> {
        TaskHandle {
            state: State::Source { source, token },
        }
    }

    /// The current status of this task.
    ///
    /// Panics if the result was already consumed, or if the underlying
    /// promise was recycled (stale token).
    pub fn status(&self) -> TaskStatus {
        match &self.state {
            State::Ready(Ok(_)) => TaskStatus::Succeeded,
            State::Ready(Err(FramioError::Canceled)) => TaskStatus::Canceled,
            State::Ready(Err(_)) => TaskStatus::Faulted,
            State::Source { source, token } => source.status(*token),
            State::Consumed => panic!("status queried on a consumed task"),
        }
    }

    /// Whether the task has reached a terminal state.
    pub fn is_completed(&self) -> bool {
        self.status().is_terminal()
    }

    pub(crate) fn into_parts(self) -> HandleParts<T> {
        let mut this = self;
        match mem::replace(&mut this.state, State::Consumed) {
            State::Ready(outcome) => HandleParts::Ready(outcome),
            State::Source { source, token } => HandleParts::Pending { source, token },
            State::Consumed => panic!("consumed task handed to a combinator"),
        }
    }
}

impl<T: 'static> TaskHandle<T> {
    /// Discards this task, fire-and-forget style.
    ///
    /// The task keeps running; its result is consumed by a no-op continuation
    /// when it completes (recycling the promise as usual). A fault that would
    /// otherwise go unobserved is reported to the process-wide sink; see
    /// [`set_unobserved_fault_hook`]. Cancellation is not reported; a
    /// discarded task being cancelled is unremarkable.
    pub fn detach(self) {
        observe(self, |outcome| {
            if let Err(err) = &outcome {
                if err.is_fault() {
                    report_unobserved_fault(err);
                }
            }
        });
    }

    /// Awaits the task, converting a cancellation into `Ok(None)` instead of
    /// an error. Faults still propagate.
    ///
    /// # Examples
    ///
    /// ```
    /// use framio::{FramioError, TaskHandle};
    /// use futures_lite::future;
    ///
    /// let task: TaskHandle<u32> = TaskHandle::from_error(FramioError::Canceled);
    /// assert_eq!(future::block_on(task.suppress_cancellation()).unwrap(), None);
    /// ```
    pub async fn suppress_cancellation(self) -> Result<Option<T>> {
        match self.await {
            Ok(value) => Ok(Some(value)),
            Err(FramioError::Canceled) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl<T: Send + 'static> TaskHandle<T> {
    /// Races this task against an external cancellation token.
    ///
    /// If the token fires first, the returned task reports
    /// [`FramioError::Canceled`] even if this task later completes; the inner
    /// task keeps running fire-and-forget.
    pub fn attach_cancellation(self, token: crate::CancelToken) -> TaskHandle<T> {
        crate::cancel::attach_external(self, token)
    }
}

impl TaskHandle<()> {
    /// A unit task that is already complete.
    pub fn completed() -> TaskHandle<()> {
        TaskHandle::from_result(())
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match mem::replace(&mut self.state, State::Consumed) {
            State::Ready(outcome) => Poll::Ready(outcome),
            State::Consumed => panic!("task polled after completion"),
            State::Source { source, token } => {
                if source.status(token).is_terminal() {
                    return Poll::Ready(source.take_result(token));
                }
                // If the promise completes between the status probe and this
                // registration, register wakes us right back up.
                source.register(cx.waker(), token);
                self.state = State::Source { source, token };
                Poll::Pending
            }
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match &self.state {
            State::Consumed => None,
            _ => Some(self.status()),
        };
        f.debug_struct("TaskHandle").field("status", &status).finish()
    }
}

/// Routes a task's eventual outcome into `f`, consuming the result.
///
/// An already-complete task is recorded synchronously; a pending one gets
/// `f` registered as its continuation. Either way `f` runs exactly once, and
/// consumption recycles pooled promises as usual.
pub(crate) fn observe<T: 'static>(
    task: TaskHandle<T>,
    f: impl Fn(Result<T>) + Send + Sync + 'static,
) {
    match task.into_parts() {
        HandleParts::Ready(outcome) => f(outcome),
        HandleParts::Pending { source, token } => {
            let consumer = source.clone();
            source.register(
                &waker_fn(move || f(consumer.clone().take_result(token))),
                token,
            );
        }
    }
}

lazy_static! {
    static ref UNOBSERVED_FAULT_HOOK: RwLock<Option<Box<dyn Fn(&FramioError) + Send + Sync>>> =
        RwLock::new(None);
}

/// Installs the process-wide sink for faults discarded via
/// [`TaskHandle::detach`]. Until one is installed, unobserved faults are
/// logged at `error` level.
pub fn set_unobserved_fault_hook(hook: impl Fn(&FramioError) + Send + Sync + 'static) {
    *UNOBSERVED_FAULT_HOOK.write().unwrap() = Some(Box::new(hook));
}

pub(crate) fn report_unobserved_fault(err: &FramioError) {
    let hook = UNOBSERVED_FAULT_HOOK.read().unwrap();
    match &*hook {
        Some(hook) => hook(err),
        None => log::error!("unobserved task fault: {}", err),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::source::TaskCompletionSource;
    use crate::waker_fn::dummy_waker;
    use futures_lite::future::block_on;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn poll_once<T>(task: &mut TaskHandle<T>) -> Poll<Result<T>> {
        let waker = dummy_waker();
        let mut cx = Context::from_waker(&waker);
        Pin::new(task).poll(&mut cx)
    }

    #[test]
    fn immediate_task_resolves_without_suspension() {
        let mut task = TaskHandle::from_result(11);
        assert_eq!(task.status(), TaskStatus::Succeeded);
        match poll_once(&mut task) {
            Poll::Ready(Ok(v)) => assert_eq!(v, 11),
            _ => panic!("expected a synchronous result"),
        }
        assert!(TaskHandle::completed().is_completed());
        block_on(TaskHandle::completed()).unwrap();
    }

    #[test]
    #[should_panic(expected = "polled after completion")]
    fn polling_a_consumed_task_panics() {
        let mut task = TaskHandle::from_result(());
        let _ = poll_once(&mut task);
        let _ = poll_once(&mut task);
    }

    #[test]
    fn pending_task_suspends_then_resolves() {
        let source = TaskCompletionSource::new();
        let mut task = source.task();
        assert_eq!(task.status(), TaskStatus::Pending);
        assert!(poll_once(&mut task).is_pending());

        source.try_set_result("ready");
        match poll_once(&mut task) {
            Poll::Ready(Ok(v)) => assert_eq!(v, "ready"),
            _ => panic!("expected completion"),
        }
    }

    #[test]
    fn completion_from_another_thread_wakes_the_awaiter() {
        let source = TaskCompletionSource::new();
        let task = source.task();
        let join = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            source.try_set_result(21);
        });
        assert_eq!(block_on(task).unwrap(), 21);
        join.join().unwrap();
    }

    #[test]
    fn canceled_task_surfaces_canceled() {
        let source: TaskCompletionSource<u32> = TaskCompletionSource::new();
        let task = source.task();
        source.try_set_canceled();
        assert_eq!(task.status(), TaskStatus::Canceled);
        assert!(block_on(task).unwrap_err().is_canceled());
    }

    #[test]
    fn suppress_cancellation_maps_outcomes() {
        let ok: TaskHandle<u32> = TaskHandle::from_result(5);
        assert_eq!(block_on(ok.suppress_cancellation()).unwrap(), Some(5));

        let canceled: TaskHandle<u32> = TaskHandle::from_error(FramioError::Canceled);
        assert_eq!(block_on(canceled.suppress_cancellation()).unwrap(), None);

        let faulted: TaskHandle<u32> =
            TaskHandle::from_error(FramioError::fault(io::Error::new(io::ErrorKind::Other, "x")));
        assert!(block_on(faulted.suppress_cancellation()).is_err());
    }

    #[test]
    fn detach_reports_unobserved_faults() {
        static SEEN: Mutex<Vec<String>> = Mutex::new(Vec::new());
        static INSTALLS: AtomicUsize = AtomicUsize::new(0);
        if INSTALLS.fetch_add(1, Ordering::SeqCst) == 0 {
            set_unobserved_fault_hook(|err| {
                SEEN.lock().unwrap().push(err.to_string());
            });
        }

        let source: TaskCompletionSource<u32> = TaskCompletionSource::new();
        let task = source.task();
        task.detach();
        source.try_set_faulted(io::Error::new(io::ErrorKind::Other, "lost fault"));

        let seen = SEEN.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("lost fault"));
    }

    #[test]
    fn detach_of_successful_task_is_silent() {
        // consumes the result through the no-op path without panicking
        let source = TaskCompletionSource::new();
        let task = source.task();
        task.detach();
        source.try_set_result(1);
        assert_eq!(source.status(), TaskStatus::Succeeded);
    }
}
