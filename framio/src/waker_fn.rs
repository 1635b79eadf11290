// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use std::sync::Arc;
use std::task::{Wake, Waker};

/// Creates a waker that invokes a closure.
///
/// Fan-in combinators and fire-and-forget handles register these on a
/// completion core as their continuation: the core guarantees at most one
/// invocation per generation, so the closure may consume the result.
pub(crate) fn waker_fn<F: Fn() + Send + Sync + 'static>(f: F) -> Waker {
    struct Helper<F>(F);

    impl<F: Fn() + Send + Sync + 'static> Wake for Helper<F> {
        fn wake(self: Arc<Self>) {
            (self.0)();
        }

        fn wake_by_ref(self: &Arc<Self>) {
            (self.0)();
        }
    }

    Waker::from(Arc::new(Helper(f)))
}

/// Creates a waker that does nothing.
///
/// This [`Waker`] is useful for polling a `Future` to check whether it is
/// `Ready`, without doing any additional work.
#[cfg(test)]
pub(crate) fn dummy_waker() -> Waker {
    use std::task::{RawWaker, RawWakerVTable};

    fn raw_waker() -> RawWaker {
        // the pointer is never dereferenced, so null is ok
        RawWaker::new(std::ptr::null::<()>(), vtable())
    }

    fn vtable() -> &'static RawWakerVTable {
        &RawWakerVTable::new(|_| raw_waker(), |_| {}, |_| {}, |_| {})
    }

    unsafe { Waker::from_raw(raw_waker()) }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn waker_fn_invokes_closure() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let waker = waker_fn(move || {
            h.fetch_add(1, Ordering::Relaxed);
        });

        waker.wake_by_ref();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        waker.wake();
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn dummy_waker_is_inert() {
        let waker = dummy_waker();
        waker.wake_by_ref();
        waker.clone().wake();
    }
}
