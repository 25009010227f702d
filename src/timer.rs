//! Cancellable, optionally repeating callbacks on a [`RunLoop`].
//!
//! ```ignore
//! let timer = Timer::new(&run_loop);
//! timer.start(Duration::from_millis(100), Duration::from_millis(50), || {
//!     println!("tick");
//! });
//! ```

use crate::run_loop::{RunLoop, Runnable, RunnableId, WeakRunLoop};

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
    time::{Duration, Instant},
};

/// Fires a task once after a timeout, then every `repeat` interval unless
/// `repeat` is zero. Dropping the timer stops it.
pub struct Timer {
    inner: Rc<TimerImpl>,
}

#[derive(Clone, Copy)]
struct Schedule {
    due: Instant,
    repeat: Duration,
    /// Bumped by every `start`/`stop`, so a firing can tell whether its own
    /// task changed the schedule.
    generation: u64,
}

struct TimerImpl {
    id: RunnableId,
    run_loop: WeakRunLoop,
    this: Weak<TimerImpl>,
    schedule: Cell<Schedule>,
    task: RefCell<Option<Box<dyn FnMut()>>>,
}

impl Timer {
    pub fn new(run_loop: &RunLoop) -> Self {
        let id = run_loop.next_runnable_id();
        let run_loop = run_loop.downgrade();
        let inner = Rc::new_cyclic(|this| TimerImpl {
            id,
            run_loop,
            this: this.clone(),
            schedule: Cell::new(Schedule {
                due: Instant::now(),
                repeat: Duration::ZERO,
                generation: 0,
            }),
            task: RefCell::new(None),
        });
        Self { inner }
    }

    /// Schedules `task` to run after `timeout`, replacing any previous schedule.
    pub fn start<F>(&self, timeout: Duration, repeat: Duration, task: F)
    where
        F: FnMut() + 'static,
    {
        self.inner.start(timeout, repeat, Box::new(task));
    }

    /// Safe to call repeatedly, and from inside the timer's own task.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Whether the timer is waiting to fire.
    pub fn is_active(&self) -> bool {
        self.inner.task.borrow().is_some()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let schedule = self.inner.schedule.get();
        f.debug_struct("Timer")
            .field("id", &self.inner.id)
            .field("active", &self.is_active())
            .field("repeat", &schedule.repeat)
            .finish()
    }
}

impl TimerImpl {
    fn start(&self, timeout: Duration, repeat: Duration, task: Box<dyn FnMut()>) {
        self.stop();

        let mut schedule = self.schedule.get();
        schedule.due = deadline(timeout);
        schedule.repeat = repeat;
        self.schedule.set(schedule);

        self.register(task);
    }

    fn stop(&self) {
        let mut schedule = self.schedule.get();
        schedule.generation = schedule.generation.wrapping_add(1);
        self.schedule.set(schedule);

        let task = self.task.borrow_mut().take();
        if let Some(run_loop) = self.run_loop.upgrade() {
            run_loop.remove_runnable(self.id);
        }
        drop(task);
    }

    /// Stores `task` and adds the timer to its loop. Without a loop the task
    /// is dropped and the timer stays idle.
    fn register(&self, task: Box<dyn FnMut()>) {
        let (Some(run_loop), Some(this)) = (self.run_loop.upgrade(), self.this.upgrade()) else {
            return;
        };
        *self.task.borrow_mut() = Some(task);
        run_loop.add_runnable(self.id, this);
    }
}

/// `now + after`, saturating to a point that is never reached in practice.
fn deadline(after: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(after)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

impl Runnable for TimerImpl {
    fn due_time(&self) -> Instant {
        self.schedule.get().due
    }

    fn run(&self) {
        let generation = self.schedule.get().generation;
        let task = self.task.borrow_mut().take();
        let Some(mut task) = task else {
            return;
        };

        task();

        let mut schedule = self.schedule.get();
        if schedule.generation != generation {
            // The task stopped or restarted this timer.
            return;
        }
        if schedule.repeat.is_zero() {
            schedule.generation = schedule.generation.wrapping_add(1);
            self.schedule.set(schedule);
            return;
        }

        schedule.due = deadline(schedule.repeat);
        self.schedule.set(schedule);
        self.register(task);
    }
}
