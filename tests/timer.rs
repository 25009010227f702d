use mini_runloop::{RunLoop, Timer};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

#[test]
fn repeating_timer_fires_on_each_boundary_until_stopped() {
    let run_loop = RunLoop::new().unwrap();
    let start = Instant::now();
    let fires = Rc::new(RefCell::new(Vec::new()));

    let timer = Rc::new(Timer::new(&run_loop));
    let record = fires.clone();
    timer.start(
        Duration::from_millis(100),
        Duration::from_millis(50),
        move || record.borrow_mut().push(start.elapsed()),
    );

    let stopped_at = Rc::new(Cell::new(None));
    let canceller = Timer::new(&run_loop);
    let target = timer.clone();
    let stamp = stopped_at.clone();
    canceller.start(Duration::from_millis(225), Duration::ZERO, move || {
        target.stop();
        stamp.set(Some(start.elapsed()));
    });

    // Keep running past the cancel to show nothing fires afterwards.
    let finisher = Timer::new(&run_loop);
    let handle = run_loop.clone();
    finisher.start(Duration::from_millis(350), Duration::ZERO, move || {
        handle.stop()
    });

    run_loop.run();

    // Each fire reschedules from when it ran, so a loaded machine may push
    // the third fire past the cancel.
    let fires = fires.borrow();
    assert!((2..=3).contains(&fires.len()), "fired at {fires:?}");
    for (i, at) in fires.iter().enumerate() {
        let boundary = Duration::from_millis(100 + 50 * i as u64);
        assert!(*at >= boundary, "fire {i} at {at:?}, before {boundary:?}");
    }
    let stopped_at = stopped_at.get().expect("canceller never fired");
    assert!(
        fires.iter().all(|at| *at <= stopped_at),
        "fired after stop at {stopped_at:?}: {fires:?}"
    );
    assert!(!timer.is_active());
}

#[test]
fn one_shot_timer_fires_after_timeout() {
    let run_loop = RunLoop::new().unwrap();
    let start = Instant::now();
    let fired = Rc::new(RefCell::new(None));

    let timer = Timer::new(&run_loop);
    let slot = fired.clone();
    let handle = run_loop.clone();
    timer.start(Duration::from_millis(50), Duration::ZERO, move || {
        *slot.borrow_mut() = Some(start.elapsed());
        handle.stop();
    });
    run_loop.run();

    let elapsed = fired.borrow().expect("timer never fired");
    assert!(
        elapsed >= Duration::from_millis(50),
        "timer should wait at least its timeout"
    );
    assert!(!timer.is_active());
}

#[test]
fn timers_with_equal_timeouts_fire_in_start_order() {
    let run_loop = RunLoop::new().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    let timers: Vec<Timer> = (0..4)
        .map(|i| {
            let timer = Timer::new(&run_loop);
            let order = order.clone();
            timer.start(Duration::ZERO, Duration::ZERO, move || {
                order.borrow_mut().push(i)
            });
            timer
        })
        .collect();

    run_loop.run_once();

    assert_eq!(*order.borrow(), [0, 1, 2, 3]);
    assert!(timers.iter().all(|timer| !timer.is_active()));
}
