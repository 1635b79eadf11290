// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020
// Datadog, Inc.
//
//! # Framio - cooperative tasks for frame-driven applications in Rust.
//!
//! ## What is Framio
//!
//! Framio is a library providing allocation-reduced, cooperatively scheduled
//! task primitives for programs organized around a per-frame update loop:
//! game engines, simulations, interactive tools. Instead of parking threads
//! or spinning up a general-purpose runtime, work suspends on lightweight
//! task handles and resumes when a frame tick, an external completion event,
//! or a fan-in combinator fires its continuation.
//!
//! The core pieces:
//!
//! * a **versioned completion core** behind every promise: one terminal
//!   transition (succeeded / faulted / canceled), one registered
//!   continuation, and a generation token that catches stale handles after a
//!   promise is recycled;
//! * **pooled promise nodes**: frame-bound promises are drawn from per-type
//!   free lists and returned when their result is consumed, so a steady
//!   state of yields and delays allocates nothing per await;
//! * a **[`FrameScheduler`]** the host drives once per frame, advancing
//!   every registered promise through its phase ticks;
//! * **fan-in combinators** ([`when_all`], [`when_any`]) aggregating many
//!   tasks into one, whether frame-bound or externally completed, possibly
//!   from other threads.
//!
//! ## Rust `async`
//!
//! Task handles are ordinary [`Future`]s: await them from whatever executor
//! the rest of your program uses, or poll them by hand. Nothing here spawns
//! threads; the host's frame loop is the only scheduler frame promises need.
//!
//! ```
//! use framio::{when_all, CancelToken, FrameScheduler, Phase};
//! use futures_lite::future;
//!
//! let scheduler = FrameScheduler::new();
//! let short = scheduler.delay_frames(Phase::Update, 0, CancelToken::never());
//! let long = scheduler.delay_frames(Phase::Update, 2, CancelToken::never());
//! let both = when_all(vec![short, long]);
//!
//! while !both.is_completed() {
//!     scheduler.run_frame();
//! }
//! future::block_on(both).unwrap();
//! ```
//!
//! ## Cancellation and timeouts
//!
//! Cancellation is cooperative and sampled: frame promises check their
//! [`CancelToken`] at the top of every tick, and it is a terminal state of
//! its own rather than a flavor of error. Timeouts are layered on top as a
//! race between the task and a cancellable delay; see
//! [`FrameScheduler::timeout`].
//!
//! ## Stale handles
//!
//! Recycling promises means a handle can outlive its promise's generation.
//! Every handle carries the generation token it was issued with, and a
//! promise rejects any operation presenting a stale token by panicking:
//! consuming a task twice or touching a recycled promise is a programming
//! error, and failing loudly beats silently reading another task's result.
//!
//! [`Future`]: std::future::Future

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
#![cfg_attr(doc, deny(rustdoc::broken_intra_doc_links))]

/// Call [`Waker::wake()`] and log to `error` if panicked.
///
/// [`Waker::wake()`]: std::task::Waker::wake
macro_rules! wake {
    ($waker:expr $(,)?) => {{
        use log::error;

        if let Err(x) = std::panic::catch_unwind(|| $waker.wake()) {
            error!("Panic while calling waker! {:?}", x);
        }
    }};
}

mod cancel;
mod combinator;
mod error;
mod frame;
mod handle;
mod pool;
mod source;
mod waker_fn;

pub use crate::cancel::{CancelSource, CancelToken};
pub use crate::combinator::{when_all, when_any, FanIn};
pub use crate::error::{FramioError, Result};
pub use crate::frame::{FrameDriver, FrameScheduler, FrameSchedulerBuilder, Phase};
pub use crate::handle::{set_unobserved_fault_hook, TaskHandle};
pub use crate::source::{TaskCompletionSource, TaskStatus};

pub mod prelude {
    //! Re-exports the types almost every framio program touches.
    pub use crate::{
        when_all, when_any, CancelSource, CancelToken, FramioError, FrameScheduler, Phase,
        TaskCompletionSource, TaskHandle, TaskStatus,
    };
}
