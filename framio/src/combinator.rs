// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Fan-in combinators: aggregate N concurrent tasks into one.
//!
//! [`when_all`] resolves once every input has, with the results in input
//! order regardless of completion order; the first fault or cancellation
//! wins and short-circuits. [`when_any`] resolves with the first input to
//! complete, whatever its outcome.
//!
//! Both accept either a `Vec` of same-typed handles or a tuple (arity 2
//! through 8) of heterogeneously typed handles; the tuple impls are a thin
//! macro-generated wrapper over the same record-and-count algorithm. Inputs
//! that are already complete are recorded synchronously, so an aggregate of
//! finished tasks resolves without suspending at all.
//!
//! Losing branches are fire-and-forget: their continuations still fire, but
//! land in a no-op completion path and their outcomes are discarded.

use crate::handle::observe;
use crate::source::{impl_completion_source, CompletionCore};
use crate::Result;
use crate::TaskHandle;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A group of tasks a fan-in combinator can aggregate.
///
/// Implemented for `Vec<TaskHandle<T>>` and for tuples of handles up to
/// arity 8. Use through [`when_all`] / [`when_any`].
pub trait FanIn {
    /// What [`when_all`] resolves with.
    type AllOutput;
    /// What [`when_any`] resolves with.
    type AnyOutput;

    /// See [`when_all`].
    fn all(self) -> TaskHandle<Self::AllOutput>;
    /// See [`when_any`].
    fn any(self) -> TaskHandle<Self::AnyOutput>;
}

/// Aggregates a group of tasks into one that resolves when every input has.
///
/// Results preserve input order regardless of completion order. If any input
/// faults or is canceled, the aggregate completes with that outcome
/// immediately; the remaining inputs keep running fire-and-forget and their
/// results are discarded.
///
/// For a `Vec` group the output is `Vec<T>`; for a tuple group it is the
/// tuple of results. An empty `Vec` resolves immediately.
///
/// # Examples
///
/// ```
/// use framio::{when_all, TaskHandle};
/// use futures_lite::future;
///
/// let sum = when_all((TaskHandle::from_result(2), TaskHandle::from_result("three")));
/// let (a, b) = future::block_on(sum).unwrap();
/// assert_eq!((a, b), (2, "three"));
/// ```
pub fn when_all<G: FanIn>(group: G) -> TaskHandle<G::AllOutput> {
    group.all()
}

/// Aggregates a group of tasks into one that resolves with the first input
/// to complete, including a first completion that is a fault or a
/// cancellation, which then becomes the aggregate outcome.
///
/// For a `Vec` group the output is `(winning_index, value)`. For a tuple
/// group it is `(winning_index, slots)` where exactly the winning slot of
/// `slots` is `Some` and every other slot is `None`.
///
/// Panics on an empty `Vec`: a task that can never complete is never what
/// the caller meant.
///
/// # Examples
///
/// ```
/// use framio::{when_any, TaskCompletionSource};
/// use futures_lite::future;
///
/// let slow: TaskCompletionSource<u32> = TaskCompletionSource::new();
/// let fast = TaskCompletionSource::new();
/// let race = when_any((slow.task(), fast.task()));
///
/// fast.try_set_result("first!");
/// let (winner, (a, b)) = future::block_on(race).unwrap();
/// assert_eq!(winner, 1);
/// assert_eq!(a, None);
/// assert_eq!(b, Some("first!"));
/// ```
pub fn when_any<G: FanIn>(group: G) -> TaskHandle<G::AnyOutput> {
    group.any()
}

struct AllVecNode<T> {
    core: CompletionCore<Vec<T>>,
    slots: Mutex<Vec<Option<T>>>,
    remaining: AtomicUsize,
}

impl_completion_source!(AllVecNode<T> => Vec<T>);

impl<T: Send + 'static> AllVecNode<T> {
    fn record(&self, index: usize, outcome: Result<T>) {
        match outcome {
            Ok(value) => {
                self.slots.lock().unwrap()[index] = Some(value);
                if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let values = {
                        let mut slots = self.slots.lock().unwrap();
                        slots
                            .iter_mut()
                            .map(|slot| match slot.take() {
                                Some(value) => value,
                                None => unreachable!(),
                            })
                            .collect()
                    };
                    self.core.try_set_result(values);
                }
            }
            Err(err) => {
                // first fault or cancellation wins; the rest land here too
                // and are discarded by the failed try_complete
                self.core.try_complete(Err(err));
            }
        }
    }
}

struct AnyVecNode<T> {
    core: CompletionCore<(usize, T)>,
    completed: AtomicUsize,
}

impl_completion_source!(AnyVecNode<T> => (usize, T));

impl<T: Send + 'static> AnyVecNode<T> {
    fn record(&self, index: usize, outcome: Result<T>) {
        if self.completed.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        self.core.try_complete(outcome.map(|value| (index, value)));
    }
}

impl<T: Send + 'static> FanIn for Vec<TaskHandle<T>> {
    type AllOutput = Vec<T>;
    type AnyOutput = (usize, T);

    fn all(self) -> TaskHandle<Vec<T>> {
        let node = Arc::new(AllVecNode {
            core: CompletionCore::new(),
            slots: Mutex::new((0..self.len()).map(|_| None).collect()),
            remaining: AtomicUsize::new(self.len()),
        });
        let token = node.core.version();
        if self.is_empty() {
            node.core.try_set_result(Vec::new());
            return TaskHandle::from_source(node, token);
        }
        for (index, task) in self.into_iter().enumerate() {
            let node = node.clone();
            observe(task, move |outcome| node.record(index, outcome));
        }
        TaskHandle::from_source(node, token)
    }

    fn any(self) -> TaskHandle<(usize, T)> {
        assert!(!self.is_empty(), "when_any requires at least one task");
        let node = Arc::new(AnyVecNode {
            core: CompletionCore::new(),
            completed: AtomicUsize::new(0),
        });
        let token = node.core.version();
        for (index, task) in self.into_iter().enumerate() {
            let node = node.clone();
            observe(task, move |outcome| node.record(index, outcome));
        }
        TaskHandle::from_source(node, token)
    }
}

macro_rules! fan_in_tuple {
    ($all:ident, $any:ident, $len:expr, $(($T:ident, $idx:tt)),+) => {
        struct $all<$($T),+> {
            core: CompletionCore<($($T,)+)>,
            slots: Mutex<($(Option<$T>,)+)>,
            remaining: AtomicUsize,
        }

        impl_completion_source!($all<$($T),+> => ($($T,)+));

        impl<$($T: Send + 'static),+> $all<$($T),+> {
            fn complete_if_done(&self) {
                if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let values = {
                        let mut slots = self.slots.lock().unwrap();
                        ($(
                            match slots.$idx.take() {
                                Some(value) => value,
                                None => unreachable!(),
                            },
                        )+)
                    };
                    self.core.try_set_result(values);
                }
            }
        }

        struct $any<$($T),+> {
            core: CompletionCore<(usize, ($(Option<$T>,)+))>,
            slots: Mutex<Option<($(Option<$T>,)+)>>,
            completed: AtomicUsize,
        }

        impl_completion_source!($any<$($T),+> => (usize, ($(Option<$T>,)+)));

        impl<$($T: Send + 'static),+> FanIn for ($(TaskHandle<$T>,)+) {
            type AllOutput = ($($T,)+);
            type AnyOutput = (usize, ($(Option<$T>,)+));

            fn all(self) -> TaskHandle<Self::AllOutput> {
                let node = Arc::new($all {
                    core: CompletionCore::new(),
                    slots: Mutex::new(($(Option::<$T>::None,)+)),
                    remaining: AtomicUsize::new($len),
                });
                let token = node.core.version();
                $(
                    {
                        let node = node.clone();
                        observe(self.$idx, move |outcome: Result<$T>| match outcome {
                            Ok(value) => {
                                node.slots.lock().unwrap().$idx = Some(value);
                                node.complete_if_done();
                            }
                            Err(err) => {
                                node.core.try_complete(Err(err));
                            }
                        });
                    }
                )+
                TaskHandle::from_source(node, token)
            }

            fn any(self) -> TaskHandle<Self::AnyOutput> {
                let node = Arc::new($any {
                    core: CompletionCore::new(),
                    slots: Mutex::new(Some(($(Option::<$T>::None,)+))),
                    completed: AtomicUsize::new(0),
                });
                let token = node.core.version();
                $(
                    {
                        let node = node.clone();
                        observe(self.$idx, move |outcome: Result<$T>| {
                            if node.completed.fetch_add(1, Ordering::AcqRel) != 0 {
                                return;
                            }
                            match outcome {
                                Ok(value) => {
                                    let mut slots = match node.slots.lock().unwrap().take() {
                                        Some(slots) => slots,
                                        None => unreachable!(),
                                    };
                                    slots.$idx = Some(value);
                                    node.core.try_set_result(($idx, slots));
                                }
                                Err(err) => {
                                    node.core.try_complete(Err(err));
                                }
                            }
                        });
                    }
                )+
                TaskHandle::from_source(node, token)
            }
        }
    };
}

fan_in_tuple!(AllTuple2, AnyTuple2, 2, (T1, 0), (T2, 1));
fan_in_tuple!(AllTuple3, AnyTuple3, 3, (T1, 0), (T2, 1), (T3, 2));
fan_in_tuple!(AllTuple4, AnyTuple4, 4, (T1, 0), (T2, 1), (T3, 2), (T4, 3));
fan_in_tuple!(AllTuple5, AnyTuple5, 5, (T1, 0), (T2, 1), (T3, 2), (T4, 3), (T5, 4));
fan_in_tuple!(AllTuple6, AnyTuple6, 6, (T1, 0), (T2, 1), (T3, 2), (T4, 3), (T5, 4), (T6, 5));
fan_in_tuple!(
    AllTuple7,
    AnyTuple7,
    7,
    (T1, 0),
    (T2, 1),
    (T3, 2),
    (T4, 3),
    (T5, 4),
    (T6, 5),
    (T7, 6)
);
fan_in_tuple!(
    AllTuple8,
    AnyTuple8,
    8,
    (T1, 0),
    (T2, 1),
    (T3, 2),
    (T4, 3),
    (T5, 4),
    (T6, 5),
    (T7, 6),
    (T8, 7)
);
