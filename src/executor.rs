//! Local futures driven by a [`RunLoop`].
//!
//! Futures spawned here never leave the loop thread, so they need not be
//! `Send`. Their wakers are, though: waking a task records its id on the
//! loop's shared ready list and wakes the loop, which is how completions
//! from network threads reach the loop.

use crate::run_loop::{RunLoop, Shared};

use futures::{future::LocalBoxFuture, FutureExt};
use rustc_hash::FxHashMap;
use std::{
    cell::{Cell, RefCell},
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll, Waker},
};

pub(crate) type TaskId = u64;

/// The spawned futures of one loop, keyed by task id.
#[derive(Default)]
pub(crate) struct Executor {
    tasks: RefCell<FxHashMap<TaskId, LocalBoxFuture<'static, ()>>>,
    next_id: Cell<TaskId>,
}

impl Executor {
    pub(crate) fn spawn(&self, future: impl Future<Output = ()> + 'static, shared: &Arc<Shared>) {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.tasks.borrow_mut().insert(id, future.boxed_local());
        shared.schedule(id);
    }

    /// Polls every task woken since the last call.
    pub(crate) fn run_ready(&self, shared: &Arc<Shared>) {
        for id in shared.take_woken() {
            // Taken out while polled so the future may spawn more tasks.
            let future = self.tasks.borrow_mut().remove(&id);
            let Some(mut future) = future else {
                continue;
            };

            let waker = task_waker(id, shared);
            let mut cx = Context::from_waker(&waker);
            if future.as_mut().poll(&mut cx).is_pending() {
                self.tasks.borrow_mut().insert(id, future);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.tasks.borrow().len()
    }
}

fn task_waker(id: TaskId, shared: &Arc<Shared>) -> Waker {
    let shared = Arc::downgrade(shared);
    waker_fn::waker_fn(move || {
        if let Some(shared) = shared.upgrade() {
            shared.schedule(id);
        }
    })
}

impl RunLoop {
    /// Runs `future` on this loop. It is first polled during the next drive step.
    pub fn spawn_local<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.executor().spawn(future, self.shared());
    }

    /// Drives the loop until `future` resolves.
    ///
    /// Timers, posted closures and spawned futures keep running in the
    /// meantime. A stop request does not interrupt `block_on`.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let notified = Arc::new(AtomicBool::new(true));
        let waker = {
            let notified = notified.clone();
            let shared = Arc::downgrade(self.shared());
            waker_fn::waker_fn(move || {
                notified.store(true, Ordering::Release);
                if let Some(shared) = shared.upgrade() {
                    shared.wake();
                }
            })
        };
        let mut cx = Context::from_waker(&waker);
        pin_utils::pin_mut!(future);

        self.enter(|| {
            let mut events = Vec::new();
            loop {
                if notified.swap(false, Ordering::AcqRel) {
                    if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                        return output;
                    }
                }

                self.drive();

                if !notified.load(Ordering::Acquire) {
                    self.sleep(&mut events);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::{RunLoop, Timer};
    use futures::channel::oneshot;
    use std::{cell::Cell, rc::Rc, thread, time::Duration};

    #[test]
    fn spawned_future_runs_on_next_step() {
        let run_loop = RunLoop::new().unwrap();
        let done = Rc::new(Cell::new(false));
        let flag = done.clone();

        run_loop.spawn_local(async move { flag.set(true) });
        assert!(!done.get());
        run_loop.run_once();

        assert!(done.get());
        assert_eq!(run_loop.executor().len(), 0);
    }

    #[test]
    fn block_on_returns_value_sent_from_another_thread() {
        let run_loop = RunLoop::new().unwrap();
        let (tx, rx) = oneshot::channel();

        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            tx.send(7).unwrap();
        });

        assert_eq!(run_loop.block_on(rx), Ok(7));
        sender.join().unwrap();
    }

    #[test]
    fn block_on_keeps_timers_running() {
        let run_loop = RunLoop::new().unwrap();
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);

        let timer = Timer::new(&run_loop);
        timer.start(Duration::from_millis(5), Duration::ZERO, move || {
            if let Some(tx) = tx.take() {
                let _ = tx.send("fired");
            }
        });

        assert_eq!(run_loop.block_on(rx), Ok("fired"));
        assert!(!timer.is_active());
    }

    #[test]
    fn pending_task_is_polled_again_when_woken() {
        let run_loop = RunLoop::new().unwrap();
        let (tx, rx) = oneshot::channel::<u8>();
        let got = Rc::new(Cell::new(None));
        let slot = got.clone();

        run_loop.spawn_local(async move { slot.set(rx.await.ok()) });
        run_loop.run_once();
        assert_eq!(run_loop.executor().len(), 1);

        tx.send(3).unwrap();
        run_loop.run_once();

        assert_eq!(got.get(), Some(3));
        assert_eq!(run_loop.executor().len(), 0);
    }
}
