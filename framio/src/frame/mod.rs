// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! The frame scheduler and the promises it drives.
//!
//! A host engine advances its world in discrete phases, once per frame.
//! [`FrameScheduler`] models that tick source explicitly: the host (or a
//! test) calls [`run_frame`] or [`tick`], and every registered
//! [`FrameDriver`] is advanced once per tick of its phase. Promises built on
//! top of it (yield, frame delays, wall-clock delays, predicate waits) are
//! plain [`TaskHandle`]s and can be awaited from any executor.
//!
//! Drivers registered during a tick are staged and first advanced on the
//! *next* tick of their phase. Every frame promise therefore suspends at
//! least once; even a zero-frame delay completes on the following scheduling
//! pass, never synchronously.
//!
//! # Examples
//!
//! ```
//! use framio::{CancelToken, FrameScheduler, Phase};
//! use futures_lite::future;
//!
//! let scheduler = FrameScheduler::new();
//! let task = scheduler.delay_frames(Phase::Update, 0, CancelToken::never());
//! assert!(!task.is_completed());
//!
//! scheduler.run_frame();
//! future::block_on(task).unwrap();
//! ```
//!
//! [`run_frame`]: FrameScheduler::run_frame
//! [`tick`]: FrameScheduler::tick

mod promise;

use crate::cancel::{CancelSource, CancelToken};
use crate::combinator::when_any;
use crate::error::FramioError;
use crate::pool::NodePool;
use crate::Result;
use crate::TaskHandle;
use promise::{DelayNode, PredicateNode, TickNode};
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One discrete invocation point within a frame.
///
/// [`FrameScheduler::run_frame`] ticks the phases in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Before the world updates.
    EarlyUpdate,
    /// The main update pass.
    Update,
    /// After the world has updated.
    LateUpdate,
}

impl Phase {
    /// All phases, in the order a frame runs them.
    pub const ALL: [Phase; 3] = [Phase::EarlyUpdate, Phase::Update, Phase::LateUpdate];

    fn index(self) -> usize {
        match self {
            Phase::EarlyUpdate => 0,
            Phase::Update => 1,
            Phase::LateUpdate => 2,
        }
    }
}

/// Something advanced once per tick of a phase.
///
/// `advance` returns `true` to stay scheduled. Returning `false` deregisters
/// the driver; a promise does so after performing exactly one terminal
/// transition on its completion core.
pub trait FrameDriver: Send + Sync {
    /// Advances one tick. `false` means "done, stop scheduling me".
    fn advance(&self) -> bool;
}

#[derive(Default)]
struct PhaseQueue {
    running: Vec<Arc<dyn FrameDriver>>,
    incoming: Vec<Arc<dyn FrameDriver>>,
}

const DEFAULT_POOL_CAPACITY: usize = 256;

/// Configures and builds a [`FrameScheduler`].
///
/// # Examples
///
/// ```
/// use framio::FrameSchedulerBuilder;
///
/// let scheduler = FrameSchedulerBuilder::new().pool_capacity(64).make();
/// assert_eq!(scheduler.frame(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct FrameSchedulerBuilder {
    pool_capacity: usize,
}

impl FrameSchedulerBuilder {
    /// Creates a builder with default settings.
    pub fn new() -> FrameSchedulerBuilder {
        FrameSchedulerBuilder {
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }

    /// How many recycled promise nodes each per-type pool may hold. Nodes
    /// returned beyond this ceiling are dropped instead of pooled.
    pub fn pool_capacity(mut self, capacity: usize) -> FrameSchedulerBuilder {
        self.pool_capacity = capacity;
        self
    }

    /// Builds the scheduler.
    pub fn make(self) -> FrameScheduler {
        FrameScheduler {
            phases: [
                Mutex::new(PhaseQueue::default()),
                Mutex::new(PhaseQueue::default()),
                Mutex::new(PhaseQueue::default()),
            ],
            frame: AtomicU64::new(0),
            tick_pool: Arc::new(NodePool::new(self.pool_capacity)),
            delay_pool: Arc::new(NodePool::new(self.pool_capacity)),
        }
    }
}

impl Default for FrameSchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The injected tick source driving all frame-bound promises.
///
/// The host calls [`run_frame`] once per frame (or [`tick`] per phase, for
/// finer control). Everything else, promise state, pooling and completion,
/// is internal to the drivers the scheduler advances.
///
/// [`run_frame`]: FrameScheduler::run_frame
/// [`tick`]: FrameScheduler::tick
pub struct FrameScheduler {
    phases: [Mutex<PhaseQueue>; 3],
    frame: AtomicU64,
    tick_pool: Arc<NodePool<TickNode>>,
    delay_pool: Arc<NodePool<DelayNode>>,
}

impl FrameScheduler {
    /// Creates a scheduler with default settings.
    pub fn new() -> FrameScheduler {
        FrameSchedulerBuilder::new().make()
    }

    /// Registers a driver to be advanced once per tick of `phase`, starting
    /// with the next tick.
    pub fn register(&self, phase: Phase, driver: Arc<dyn FrameDriver>) {
        self.phases[phase.index()].lock().unwrap().incoming.push(driver);
    }

    /// Advances every driver registered for `phase` once, removing the ones
    /// that report completion. Drivers registered while the tick runs are
    /// staged for the next one.
    pub fn tick(&self, phase: Phase) {
        let mut run = {
            let mut queue = self.phases[phase.index()].lock().unwrap();
            let mut run = mem::take(&mut queue.running);
            run.append(&mut queue.incoming);
            run
        };
        run.retain(|driver| driver.advance());

        let mut queue = self.phases[phase.index()].lock().unwrap();
        run.append(&mut queue.running);
        queue.running = run;
    }

    /// Ticks all phases in order and advances the frame counter.
    pub fn run_frame(&self) {
        for phase in Phase::ALL {
            self.tick(phase);
        }
        self.frame.fetch_add(1, Ordering::Relaxed);
    }

    /// How many frames have fully run.
    pub fn frame(&self) -> u64 {
        self.frame.load(Ordering::Relaxed)
    }

    /// How many drivers are currently scheduled (or staged) for `phase`.
    pub fn pending(&self, phase: Phase) -> usize {
        let queue = self.phases[phase.index()].lock().unwrap();
        queue.running.len() + queue.incoming.len()
    }

    /// Completes on the next tick of `phase`.
    pub fn yield_now(&self, phase: Phase) -> TaskHandle<()> {
        self.delay_frames(phase, 0, CancelToken::never())
    }

    /// Completes on the next frame's update pass.
    pub fn next_frame(&self) -> TaskHandle<()> {
        self.delay_frames(Phase::Update, 0, CancelToken::never())
    }

    /// Completes on the `(frames + 1)`-th tick of `phase` after creation;
    /// `frames == 0` completes on the immediately following tick.
    /// Cancellation is observed on the next tick boundary.
    pub fn delay_frames(&self, phase: Phase, frames: u32, cancel: CancelToken) -> TaskHandle<()> {
        let (node, token) = TickNode::create(&self.tick_pool, frames, cancel);
        self.register(phase, node.clone());
        TaskHandle::from_source(node, token)
    }

    /// Completes on the first tick of `phase` at which `duration` has
    /// elapsed. A zero duration completes on the following tick, never
    /// synchronously.
    pub fn delay(&self, phase: Phase, duration: Duration, cancel: CancelToken) -> TaskHandle<()> {
        let (node, token) = DelayNode::create(&self.delay_pool, duration, cancel);
        self.register(phase, node.clone());
        TaskHandle::from_source(node, token)
    }

    /// Completes on the first tick of `phase` at which `predicate` reports
    /// true. A panic inside the predicate faults the task instead of
    /// unwinding through the frame loop.
    pub fn wait_until(
        &self,
        phase: Phase,
        predicate: impl FnMut() -> bool + Send + 'static,
        cancel: CancelToken,
    ) -> TaskHandle<()> {
        let (node, token) = PredicateNode::create(predicate, cancel);
        self.register(phase, node.clone());
        TaskHandle::from_source(node, token)
    }

    /// Completes on the first tick of `phase` at which `predicate` reports
    /// false.
    pub fn wait_while(
        &self,
        phase: Phase,
        mut predicate: impl FnMut() -> bool + Send + 'static,
        cancel: CancelToken,
    ) -> TaskHandle<()> {
        self.wait_until(phase, move || !predicate(), cancel)
    }

    /// Awaits `task`, failing with [`FramioError::TimedOut`] if it does not
    /// complete within `duration`.
    ///
    /// Timeout is layered, not a core primitive: the task races a cancellable
    /// delay on the update phase. Whichever side loses is left fire-and-forget,
    /// but the delay is canceled once the task wins, so no pending timer
    /// leaks beyond the next tick.
    pub async fn timeout<T: Send + 'static>(
        &self,
        duration: Duration,
        task: TaskHandle<T>,
    ) -> Result<T> {
        let guard = CancelSource::new();
        let timer = self.delay(Phase::Update, duration, guard.token());
        match when_any((task, timer)).await {
            Ok((0, (Some(value), _))) => {
                guard.cancel();
                Ok(value)
            }
            Ok(_) => Err(FramioError::TimedOut(duration)),
            Err(err) => {
                guard.cancel();
                Err(err)
            }
        }
    }
}

impl Default for FrameScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FrameScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameScheduler")
            .field("frame", &self.frame())
            .field("early_update", &self.pending(Phase::EarlyUpdate))
            .field("update", &self.pending(Phase::Update))
            .field("late_update", &self.pending(Phase::LateUpdate))
            .finish()
    }
}
