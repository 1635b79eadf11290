// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use crate::cancel::CancelToken;
use crate::error::{panic_message, Panicked};
use crate::frame::FrameDriver;
use crate::pool::NodePool;
use crate::source::{impl_completion_source, CompletionCore, CompletionSource};
use crate::Result;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

// Every promise here follows the same tick contract: cancellation is checked
// first, then the wait condition; exactly one terminal transition, and false
// stops the scheduling. None of them ever completes on the tick they were
// created on (registration is staged), so even a zero wait suspends once.

struct TickState {
    remaining: u32,
    cancel: CancelToken,
}

/// Waits a number of ticks of its phase. `remaining == 0` means "complete on
/// the next tick", which is what yield/next-frame amount to.
pub(crate) struct TickNode {
    core: CompletionCore<()>,
    state: Mutex<TickState>,
    pool: Weak<NodePool<TickNode>>,
}

impl TickNode {
    pub(crate) fn create(
        pool: &Arc<NodePool<TickNode>>,
        remaining: u32,
        cancel: CancelToken,
    ) -> (Arc<TickNode>, u16) {
        let node = pool.try_pop().unwrap_or_else(|| {
            Arc::new(TickNode {
                core: CompletionCore::new(),
                state: Mutex::new(TickState {
                    remaining: 0,
                    cancel: CancelToken::never(),
                }),
                pool: Arc::downgrade(pool),
            })
        });
        {
            let mut state = node.state.lock().unwrap();
            state.remaining = remaining;
            state.cancel = cancel;
        }
        let token = node.core.version();
        (node, token)
    }
}

impl FrameDriver for TickNode {
    fn advance(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.cancel.is_canceled() {
            drop(state);
            self.core.try_set_canceled();
            return false;
        }
        if state.remaining == 0 {
            drop(state);
            self.core.try_set_result(());
            false
        } else {
            state.remaining -= 1;
            true
        }
    }
}

impl CompletionSource<()> for TickNode {
    fn status(&self, token: u16) -> crate::TaskStatus {
        self.core.status(token)
    }

    fn register(&self, waker: &std::task::Waker, token: u16) {
        self.core.register(waker, token)
    }

    fn take_result(self: Arc<Self>, token: u16) -> Result<()> {
        let outcome = self.core.take_result(token);
        if let Some(pool) = self.pool.upgrade() {
            self.core.reset();
            pool.try_push(self);
        }
        outcome
    }
}

struct DelayState {
    deadline: Instant,
    cancel: CancelToken,
}

/// Waits until a wall-clock deadline, observed at tick granularity.
pub(crate) struct DelayNode {
    core: CompletionCore<()>,
    state: Mutex<DelayState>,
    pool: Weak<NodePool<DelayNode>>,
}

impl DelayNode {
    pub(crate) fn create(
        pool: &Arc<NodePool<DelayNode>>,
        duration: Duration,
        cancel: CancelToken,
    ) -> (Arc<DelayNode>, u16) {
        let node = pool.try_pop().unwrap_or_else(|| {
            Arc::new(DelayNode {
                core: CompletionCore::new(),
                state: Mutex::new(DelayState {
                    deadline: Instant::now(),
                    cancel: CancelToken::never(),
                }),
                pool: Arc::downgrade(pool),
            })
        });
        {
            let mut state = node.state.lock().unwrap();
            state.deadline = Instant::now() + duration;
            state.cancel = cancel;
        }
        let token = node.core.version();
        (node, token)
    }
}

impl FrameDriver for DelayNode {
    fn advance(&self) -> bool {
        let state = self.state.lock().unwrap();
        if state.cancel.is_canceled() {
            drop(state);
            self.core.try_set_canceled();
            return false;
        }
        if Instant::now() >= state.deadline {
            drop(state);
            self.core.try_set_result(());
            false
        } else {
            true
        }
    }
}

impl CompletionSource<()> for DelayNode {
    fn status(&self, token: u16) -> crate::TaskStatus {
        self.core.status(token)
    }

    fn register(&self, waker: &std::task::Waker, token: u16) {
        self.core.register(waker, token)
    }

    fn take_result(self: Arc<Self>, token: u16) -> Result<()> {
        let outcome = self.core.take_result(token);
        if let Some(pool) = self.pool.upgrade() {
            self.core.reset();
            pool.try_push(self);
        }
        outcome
    }
}

struct PredicateState {
    predicate: Box<dyn FnMut() -> bool + Send>,
    cancel: CancelToken,
}

/// Waits until a user predicate reports true.
///
/// Not pooled: the boxed predicate forces an allocation per use anyway. A
/// panic inside the predicate is captured as a fault instead of unwinding
/// through the frame loop.
pub(crate) struct PredicateNode {
    core: CompletionCore<()>,
    state: Mutex<PredicateState>,
}

impl PredicateNode {
    pub(crate) fn create(
        predicate: impl FnMut() -> bool + Send + 'static,
        cancel: CancelToken,
    ) -> (Arc<PredicateNode>, u16) {
        let node = Arc::new(PredicateNode {
            core: CompletionCore::new(),
            state: Mutex::new(PredicateState {
                predicate: Box::new(predicate),
                cancel,
            }),
        });
        let token = node.core.version();
        (node, token)
    }
}

impl FrameDriver for PredicateNode {
    fn advance(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.cancel.is_canceled() {
            drop(state);
            self.core.try_set_canceled();
            return false;
        }
        match panic::catch_unwind(AssertUnwindSafe(|| (state.predicate)())) {
            Ok(false) => true,
            Ok(true) => {
                drop(state);
                self.core.try_set_result(());
                false
            }
            Err(payload) => {
                drop(state);
                self.core.try_set_faulted(Arc::new(Panicked {
                    message: panic_message(payload),
                }));
                false
            }
        }
    }
}

impl_completion_source!(PredicateNode => ());
