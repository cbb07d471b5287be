use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tasktimer::{Deadline, TimerConfig, TimerController, TimerError, TimerState};

fn running_timer() -> TimerController {
    let timer = TimerController::with_config(TimerConfig {
        poll_interval: Duration::from_millis(100),
        ..TimerConfig::default()
    });
    timer.init().expect("timer should start");
    timer
}

#[test]
fn test_timer_lifecycle() {
    let timer = TimerController::new();
    assert_eq!(timer.state(), TimerState::Uninitialized);
    assert!(matches!(timer.delay_process(0, || ()), Err(TimerError::Stopped)));

    timer.init().unwrap();
    timer.init().unwrap();
    assert_eq!(timer.state(), TimerState::Running);

    timer.stop();
    timer.stop();
    assert_eq!(timer.state(), TimerState::Closed);
    assert!(matches!(timer.init(), Err(TimerError::Stopped)), "Closed timers stay closed");
}

#[test]
fn test_timer_delay_returns_result() {
    let timer = running_timer();
    let start = Instant::now();

    let completion = timer.delay_process(50, || "done").unwrap();
    assert_eq!(completion.wait().unwrap(), "done");
    assert!(start.elapsed() >= Duration::from_millis(50), "Callback fired early");
}

#[test]
fn test_timer_rejects_negative_delay() {
    let timer = running_timer();
    assert!(matches!(
        timer.delay_process(-1, || ()),
        Err(TimerError::NegativeDelay(-1))
    ));
    assert!(matches!(
        timer.cycle_process(0, || ()),
        Err(TimerError::InvalidInterval(0))
    ));
}

#[test]
fn test_timer_fires_in_deadline_order() {
    let timer = running_timer();
    let order = Arc::new(Mutex::new(Vec::new()));

    let completions: Vec<_> = [120, 20, 80, 0, 50]
        .into_iter()
        .map(|delay| {
            let order = order.clone();
            timer
                .delay_process(delay, move || order.lock().unwrap().push(delay))
                .unwrap()
        })
        .collect();

    for completion in completions {
        completion.wait().unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec![0, 20, 50, 80, 120]);
}

#[test]
fn test_timer_earlier_submission_preempts_armed_deadline() {
    let timer = running_timer();
    let late = timer.delay_process(2_000, || ()).unwrap();

    let start = Instant::now();
    timer.delay_process(10, || ()).unwrap().wait().unwrap();
    assert!(
        start.elapsed() < Duration::from_millis(1_000),
        "A newer, earlier deadline should re-arm the OS timer"
    );

    timer.stop();
    assert!(matches!(late.wait(), Err(TimerError::Canceled)));
}

#[test]
fn test_timer_random_delays_fire_exactly_once() {
    const COUNT: usize = 1_000;

    let timer = running_timer();
    let fired = Arc::new(AtomicUsize::new(0));
    let late = Arc::new(AtomicUsize::new(0));
    let mut rng = rand::rng();

    let completions: Vec<_> = (0..COUNT)
        .map(|_| {
            let delay: i64 = rng.random_range(0..8_000);
            let due = Deadline::now().after_millis(delay);
            let fired = fired.clone();
            let late = late.clone();
            timer
                .delay_process(delay, move || {
                    if Deadline::now() < due {
                        late.fetch_add(1, Ordering::Relaxed);
                    }
                    fired.fetch_add(1, Ordering::Relaxed)
                })
                .unwrap()
        })
        .collect();

    for completion in completions {
        completion.wait().unwrap();
    }

    assert_eq!(fired.load(Ordering::Relaxed), COUNT);
    assert_eq!(late.load(Ordering::Relaxed), 0, "No callback may fire before its deadline");
    assert_eq!(timer.pending(), 0);
}

#[test]
fn test_timer_stop_discards_pending() {
    let timer = running_timer();
    let fired = Arc::new(AtomicUsize::new(0));

    let completions: Vec<_> = (0..100)
        .map(|_| {
            let fired = fired.clone();
            timer
                .delay_process(500, move || {
                    fired.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap()
        })
        .collect();

    timer.stop();
    thread::sleep(Duration::from_millis(700));

    assert_eq!(fired.load(Ordering::Relaxed), 0, "Nothing may fire after stop");
    for completion in completions {
        assert!(matches!(completion.wait(), Err(TimerError::Canceled)));
    }
    assert!(matches!(timer.delay_process(0, || ()), Err(TimerError::Stopped)));
}

#[test]
fn test_timer_cycle_until_canceled() {
    let timer = running_timer();
    let ticks = Arc::new(AtomicUsize::new(0));

    let handle = {
        let ticks = ticks.clone();
        timer
            .cycle_process(20, move || {
                ticks.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap()
    };

    while handle.fired() < 3 {
        thread::sleep(Duration::from_millis(5));
    }
    handle.cancel();
    assert!(handle.is_canceled());

    // Let an in-flight firing settle.
    thread::sleep(Duration::from_millis(50));
    let settled = ticks.load(Ordering::Relaxed);
    thread::sleep(Duration::from_millis(100));

    assert_eq!(ticks.load(Ordering::Relaxed), settled, "Canceled cycle kept firing");
    assert_eq!(handle.fired() as usize, settled);
    assert_eq!(timer.pending(), 0);
}

#[test]
fn test_timer_panicking_callback_does_not_kill_thread() {
    let timer = running_timer();
    let boom = timer.delay_process(0, || -> u8 { panic!("boom") }).unwrap();
    assert!(matches!(boom.wait(), Err(TimerError::Canceled)));

    assert_eq!(timer.delay_process(10, || 9).unwrap().wait().unwrap(), 9);
}
