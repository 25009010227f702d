//! A per-thread cooperative scheduler.
//!
//! A [`RunLoop`] owns every piece of deferred work registered on its thread:
//! [`Runnable`]s ordered by due time, closures posted from other threads, and
//! local futures spawned with [`RunLoop::spawn_local`]. One drive step runs
//! everything that is ready; between steps the loop sleeps on a
//! [`polling::Poller`] until the earliest due time or until some thread calls
//! [`RunLoopHandle::wake`].
//!
//! `RunLoop` is `!Send`. The only way to touch a loop from another thread is a
//! [`RunLoopHandle`], which can post closures, wake the loop and stop it.

use crate::error::{Error, Result};
use crate::executor::{Executor, TaskId};

use polling::{Event, Poller};
use rustc_hash::FxHashMap;
use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, VecDeque},
    fmt,
    rc::{Rc, Weak},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Instant,
};
use tracing::{trace, warn};

scoped_tls::scoped_thread_local!(static CURRENT: RunLoop);

/// A unit of deferred work with a due time.
///
/// The loop removes a runnable from its pending set right before calling
/// [`Runnable::run`]. A runnable that wants to fire again registers itself
/// anew, typically from inside `run`.
pub trait Runnable {
    fn due_time(&self) -> Instant;

    fn run(&self);
}

/// Identity of a runnable within one [`RunLoop`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunnableId(u64);

type PendingKey = (Instant, u64);

struct PendingEntry {
    key: PendingKey,
    runnable: Rc<dyn Runnable>,
}

/// Runnables ordered by `(due time, registration sequence)`.
#[derive(Default)]
struct PendingSet {
    order: BTreeMap<PendingKey, RunnableId>,
    entries: FxHashMap<RunnableId, PendingEntry>,
    next_seq: u64,
}

impl PendingSet {
    /// Inserts `runnable`, or re-keys it if its due time moved. Re-adding with
    /// an unchanged due time keeps its place among ties.
    ///
    /// Returns the runnable it replaced, which the caller must drop only after
    /// releasing the set.
    fn insert(
        &mut self,
        id: RunnableId,
        runnable: Rc<dyn Runnable>,
    ) -> (Instant, Option<Rc<dyn Runnable>>) {
        let due = runnable.due_time();

        if let Some(entry) = self.entries.get_mut(&id) {
            let replaced = std::mem::replace(&mut entry.runnable, runnable);
            if entry.key.0 != due {
                self.order.remove(&entry.key);
                entry.key = (due, self.next_seq);
                self.next_seq += 1;
                self.order.insert(entry.key, id);
            }
            return (due, Some(replaced));
        }

        let key = (due, self.next_seq);
        self.next_seq += 1;
        self.order.insert(key, id);
        self.entries.insert(id, PendingEntry { key, runnable });
        (due, None)
    }

    fn remove(&mut self, id: RunnableId) -> Option<Rc<dyn Runnable>> {
        let entry = self.entries.remove(&id)?;
        self.order.remove(&entry.key);
        Some(entry.runnable)
    }

    /// Snapshot of everything due at `now`, in firing order.
    fn due(&self, now: Instant) -> Vec<(PendingKey, RunnableId)> {
        self.order
            .range(..=(now, u64::MAX))
            .map(|(key, id)| (*key, *id))
            .collect()
    }

    /// Removes `id` only if it is still registered under the snapshotted key.
    fn take_if_current(&mut self, key: PendingKey, id: RunnableId) -> Option<Rc<dyn Runnable>> {
        match self.entries.get(&id) {
            Some(entry) if entry.key == key => self.remove(id),
            _ => None,
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.order.keys().next().map(|(due, _)| *due)
    }

    fn contains(&self, id: RunnableId) -> bool {
        self.entries.contains_key(&id)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

type Posted = Box<dyn FnOnce() + Send>;

/// The thread-safe half of a loop: everything another thread may touch.
pub(crate) struct Shared {
    poller: Poller,
    posted: Mutex<VecDeque<Posted>>,
    woken: Mutex<VecDeque<TaskId>>,
    stopped: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn new() -> Result<Self> {
        Ok(Self {
            poller: Poller::new().map_err(Error::WakePrimitive)?,
            posted: Mutex::new(VecDeque::new()),
            woken: Mutex::new(VecDeque::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub(crate) fn wake(&self) {
        if let Err(err) = self.poller.notify() {
            warn!(%err, "failed to wake run loop");
        }
    }

    fn post(&self, task: Posted) {
        lock(&self.posted).push_back(task);
        self.wake();
    }

    /// Marks a local task as ready to be polled. Called from wakers, so any thread.
    pub(crate) fn schedule(&self, task: TaskId) {
        lock(&self.woken).push_back(task);
        self.wake();
    }

    pub(crate) fn take_woken(&self) -> VecDeque<TaskId> {
        std::mem::take(&mut *lock(&self.woken))
    }

    fn take_posted(&self) -> VecDeque<Posted> {
        std::mem::take(&mut *lock(&self.posted))
    }

    fn has_ready_work(&self) -> bool {
        !lock(&self.posted).is_empty() || !lock(&self.woken).is_empty()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wake();
    }
}

struct Inner {
    pending: RefCell<PendingSet>,
    next_runnable: Cell<u64>,
    executor: Executor,
    shared: Arc<Shared>,
}

/// Handle to the run loop of the current thread. Cloning it is cheap and all
/// clones drive the same loop.
#[derive(Clone)]
pub struct RunLoop {
    inner: Rc<Inner>,
}

/// Non-owning reference to a [`RunLoop`], held by things the loop itself owns.
#[derive(Clone)]
pub(crate) struct WeakRunLoop(Weak<Inner>);

impl WeakRunLoop {
    pub(crate) fn upgrade(&self) -> Option<RunLoop> {
        self.0.upgrade().map(|inner| RunLoop { inner })
    }
}

impl RunLoop {
    pub fn new() -> Result<Self> {
        Ok(Self {
            inner: Rc::new(Inner {
                pending: RefCell::new(PendingSet::default()),
                next_runnable: Cell::new(0),
                executor: Executor::default(),
                shared: Arc::new(Shared::new()?),
            }),
        })
    }

    /// The loop being driven on this thread, if any.
    pub fn current() -> Option<RunLoop> {
        if CURRENT.is_set() {
            Some(CURRENT.with(RunLoop::clone))
        } else {
            None
        }
    }

    pub fn handle(&self) -> RunLoopHandle {
        RunLoopHandle {
            shared: self.inner.shared.clone(),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakRunLoop {
        WeakRunLoop(Rc::downgrade(&self.inner))
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.inner.shared
    }

    pub(crate) fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    pub fn next_runnable_id(&self) -> RunnableId {
        let id = self.inner.next_runnable.get();
        self.inner.next_runnable.set(id + 1);
        RunnableId(id)
    }

    /// Registers `runnable` under `id`, keyed by its current due time.
    ///
    /// Adding an id that is already pending replaces the registration: it
    /// keeps its position when the due time is unchanged and is re-keyed
    /// otherwise. The sleep deadline is recomputed before every sleep, so a
    /// new earliest due time is always honoured.
    pub fn add_runnable(&self, id: RunnableId, runnable: Rc<dyn Runnable>) {
        let (due, replaced) = self.inner.pending.borrow_mut().insert(id, runnable);
        trace!(?id, ?due, "runnable added");
        // The old runnable may own timers that deregister on drop.
        drop(replaced);
    }

    /// Deregisters `id`. Returns whether it was pending.
    pub fn remove_runnable(&self, id: RunnableId) -> bool {
        let removed = self.inner.pending.borrow_mut().remove(id);
        removed.is_some()
    }

    pub fn is_pending(&self, id: RunnableId) -> bool {
        self.inner.pending.borrow().contains(id)
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    /// Runs `task` on this loop during the next drive step.
    pub fn invoke<F>(&self, task: F)
    where
        F: FnOnce() + 'static,
    {
        let id = self.next_runnable_id();
        self.add_runnable(
            id,
            Rc::new(Deferred {
                due: Instant::now(),
                task: RefCell::new(Some(Box::new(task))),
            }),
        );
    }

    /// Drives the loop until [`RunLoop::stop`] or [`RunLoopHandle::stop`] is
    /// called. A stop requested before `run` makes it return after one step.
    pub fn run(&self) {
        self.enter(|| {
            let mut events = Vec::new();
            loop {
                self.drive();
                if self.inner.shared.stopped.load(Ordering::SeqCst) {
                    break;
                }
                self.sleep(&mut events);
            }
        });
        self.inner.shared.stopped.store(false, Ordering::SeqCst);
    }

    /// One non-blocking drive step.
    pub fn run_once(&self) {
        self.enter(|| self.drive());
    }

    pub fn stop(&self) {
        self.inner.shared.stop();
    }

    /// Binds this loop as the thread's current loop for the duration of `f`.
    pub(crate) fn enter<R>(&self, f: impl FnOnce() -> R) -> R {
        if CURRENT.is_set() {
            let same = CURRENT.with(|current| current == self);
            assert!(same, "another RunLoop is already running on this thread");
            return f();
        }
        CURRENT.set(self, f)
    }

    /// Posted closures first, then woken futures, then due runnables.
    pub(crate) fn drive(&self) {
        for task in self.inner.shared.take_posted() {
            task();
        }

        self.inner.executor.run_ready(&self.inner.shared);

        let now = Instant::now();
        let due = self.inner.pending.borrow().due(now);
        if !due.is_empty() {
            trace!(count = due.len(), "running due runnables");
        }
        for (key, id) in due {
            // Anything removed or re-keyed by an earlier runnable in this
            // step is left for the next one.
            let runnable = self.inner.pending.borrow_mut().take_if_current(key, id);
            if let Some(runnable) = runnable {
                runnable.run();
            }
        }
    }

    /// Blocks until the next due time, or until woken.
    pub(crate) fn sleep(&self, events: &mut Vec<Event>) {
        if self.inner.shared.has_ready_work() {
            return;
        }

        let timeout = self
            .inner
            .pending
            .borrow()
            .next_due()
            .map(|due| due.saturating_duration_since(Instant::now()));
        trace!(?timeout, "run loop sleeping");

        events.clear();
        if let Err(err) = self.inner.shared.poller.wait(events, timeout) {
            warn!(%err, "run loop wait failed");
        }
    }
}

impl PartialEq for RunLoop {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for RunLoop {}

impl fmt::Debug for RunLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLoop")
            .field("pending", &self.pending_len())
            .finish_non_exhaustive()
    }
}

/// Work queued with [`RunLoop::invoke`]: due immediately, runs once.
struct Deferred {
    due: Instant,
    task: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl Runnable for Deferred {
    fn due_time(&self) -> Instant {
        self.due
    }

    fn run(&self) {
        let task = self.task.borrow_mut().take();
        if let Some(task) = task {
            task();
        }
    }
}

/// Cross-thread handle to a [`RunLoop`].
#[derive(Clone)]
pub struct RunLoopHandle {
    shared: Arc<Shared>,
}

impl RunLoopHandle {
    /// Queues `task` to run on the loop thread and wakes the loop.
    pub fn invoke<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.post(Box::new(task));
    }

    pub fn wake(&self) {
        self.shared.wake();
    }

    pub fn stop(&self) {
        self.shared.stop();
    }
}

impl fmt::Debug for RunLoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLoopHandle").finish_non_exhaustive()
    }
}
