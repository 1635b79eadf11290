// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use framio::prelude::*;
use futures_lite::future::block_on;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn a_frame_loop_drives_mixed_waits_to_completion() {
    let scheduler = FrameScheduler::new();
    let loading: TaskCompletionSource<&str> = TaskCompletionSource::new();

    let warmup = scheduler.delay_frames(Phase::EarlyUpdate, 1, CancelToken::never());
    let settle = scheduler.delay_frames(Phase::LateUpdate, 3, CancelToken::never());
    let everything = when_all((warmup, settle, loading.task()));

    scheduler.run_frame();
    assert!(!everything.is_completed());

    loading.try_set_result("assets");
    for _ in 0..4 {
        scheduler.run_frame();
    }

    let ((), (), assets) = block_on(everything).unwrap();
    assert_eq!(assets, "assets");
}

#[test]
fn the_first_completion_wins_the_race() {
    let scheduler = FrameScheduler::new();
    let input: TaskCompletionSource<char> = TaskCompletionSource::new();
    let deadline = scheduler.delay_frames(Phase::Update, 60, CancelToken::never());
    let race = when_any((input.task(), deadline));

    scheduler.run_frame();
    input.try_set_result('q');
    scheduler.run_frame();

    let (winner, (key, timed_out)) = block_on(race).unwrap();
    assert_eq!(winner, 0);
    assert_eq!(key, Some('q'));
    assert_eq!(timed_out, None);
}

#[test]
fn cancellation_reaches_a_frame_promise_on_its_next_tick() {
    let scheduler = FrameScheduler::new();
    let cancel = CancelSource::new();
    let wait = scheduler.delay_frames(Phase::Update, 600, cancel.token());

    scheduler.run_frame();
    cancel.cancel();
    scheduler.run_frame();

    match block_on(wait) {
        Err(FramioError::Canceled) => {}
        other => panic!("expected cancellation, got {:?}", other),
    }
}

#[test]
fn timeouts_fire_while_the_frame_loop_runs() {
    let scheduler = Arc::new(FrameScheduler::new());
    let never: TaskCompletionSource<u32> = TaskCompletionSource::new();

    let stop = Arc::new(AtomicBool::new(false));
    let ticker = {
        let scheduler = scheduler.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                scheduler.run_frame();
                std::thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let outcome = block_on(scheduler.timeout(Duration::from_millis(20), never.task()));
    assert!(matches!(outcome, Err(FramioError::TimedOut(_))));

    stop.store(true, Ordering::SeqCst);
    ticker.join().unwrap();
}

#[test]
fn suppressed_cancellation_reads_as_absence() {
    let scheduler = FrameScheduler::new();
    let cancel = CancelSource::new();
    let wait = scheduler.delay_frames(Phase::Update, 10, cancel.token());

    cancel.cancel();
    scheduler.run_frame();

    assert_eq!(block_on(wait.suppress_cancellation()).unwrap(), None);
}
