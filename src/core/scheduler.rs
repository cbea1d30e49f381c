//! Time-ordered task dispatcher with a deferred-callback queue.
//!
//! The scheduler owns two independently locked structures:
//!
//! - the **task set**, a map from `(due, sequence)` to [`Task`], which also
//!   records which tasks are currently scheduled;
//! - the **deferred queue**, callbacks that run once on the next tick.
//!
//! A single dispatch thread (see [`Scheduler::start`]) repeatedly calls
//! [`Scheduler::tick`] and sleeps on a condition variable in between. Hosts
//! that own their own loop may call `tick` directly instead.
//!
//! Task bodies and deferred callbacks always run without any scheduler lock
//! held, so they are free to install tasks or enqueue more callbacks.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace};

use crate::config::SchedulerConfig;
use crate::core::task::{next_grid_time, next_recurring_time, Schedule, Task, TaskId, TaskKind};
use crate::core::SchedulerError;

type DeferredFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;
type TaskKey = (Instant, u64);

/// Time-ordered set of installed tasks.
#[derive(Default)]
struct TaskSet {
    queue: BTreeMap<TaskKey, Task>,
    scheduled: HashMap<TaskId, TaskKey>,
    // Tasks popped for execution whose body has not returned yet.
    firing: HashSet<TaskId>,
    seq: u64,
    // Set whenever the dispatch thread should re-evaluate before sleeping.
    wake_pending: bool,
}

impl TaskSet {
    fn remove(&mut self, id: TaskId) -> bool {
        match self.scheduled.remove(&id) {
            Some(key) => {
                self.queue.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Insert and report whether the task became the earliest entry.
    fn insert(&mut self, task: &Task, when: Instant) -> bool {
        self.remove(task.id());
        let key = (when, self.seq);
        self.seq = self.seq.wrapping_add(1);
        task.set_due(when);
        self.scheduled.insert(task.id(), key);
        self.queue.insert(key, task.clone());
        self.queue.first_key_value().is_some_and(|(k, _)| *k == key)
    }

    fn pop_due(&mut self, now: Instant) -> Option<(Instant, Task)> {
        let (&key, _) = self.queue.first_key_value()?;
        if key.0 > now {
            return None;
        }
        let (_, task) = self.queue.pop_first()?;
        self.scheduled.remove(&task.id());
        self.firing.insert(task.id());
        Some((key.0, task))
    }

    fn next_due(&self) -> Option<Instant> {
        self.queue.first_key_value().map(|(k, _)| k.0)
    }
}

/// Counters describing scheduler activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tasks currently installed.
    pub scheduled_tasks: usize,
    /// Deferred callbacks waiting for the next tick.
    pub pending_deferred: usize,
    /// Task bodies executed.
    pub fired_tasks: u64,
    /// Deferred callbacks executed.
    pub deferred_run: u64,
    /// Task bodies or deferred callbacks that returned an error.
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    fired_tasks: AtomicU64,
    deferred_run: AtomicU64,
    failures: AtomicU64,
}

struct SchedulerInner {
    config: SchedulerConfig,
    epoch: Instant,
    tasks: Mutex<TaskSet>,
    wake: Condvar,
    deferred: Mutex<Vec<DeferredFn>>,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    counters: Counters,
}

/// Shared handle to a task scheduler.
///
/// Cloning is cheap; every clone drives the same task set. The dispatch
/// thread only holds a weak reference, so it exits on its own once every
/// handle is dropped.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl Scheduler {
    /// Create a stopped scheduler.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                epoch: Instant::now(),
                tasks: Mutex::new(TaskSet::default()),
                wake: Condvar::new(),
                deferred: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                thread: Mutex::new(None),
                counters: Counters::default(),
            }),
        }
    }

    /// Scheduler configuration.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// The scheduler's notion of the current time.
    #[must_use]
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Reference point for recurring task phase offsets.
    #[must_use]
    pub fn epoch(&self) -> Instant {
        self.inner.epoch
    }

    /// Whether the dispatch thread is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Install (or move) `task` on the timeline.
    ///
    /// Reinstalling a scheduled task replaces its previous entry.
    ///
    /// # Errors
    ///
    /// `SchedulerError::MissingSchedule` when `Schedule::Previous` is used on
    /// a non-recurring task that was never installed, and
    /// `SchedulerError::DeadlineOverflow` when the due time cannot be
    /// represented (e.g. `Schedule::After(Duration::MAX)`). The task is left
    /// where it was in both cases.
    pub fn install_task(&self, task: &Task, schedule: Schedule) -> Result<(), SchedulerError> {
        let now = self.now();
        let when = match schedule {
            Schedule::At(when) => Some(when),
            Schedule::After(delta) => now.checked_add(delta),
            Schedule::Previous => match (task.due(), task.kind()) {
                (Some(due), _) => Some(due),
                (None, TaskKind::Recurring { interval, offset }) => {
                    next_grid_time(self.inner.epoch, now, interval, offset)
                }
                (None, _) => return Err(SchedulerError::MissingSchedule(task.id())),
            },
        };
        let when = when.ok_or(SchedulerError::DeadlineOverflow(task.id()))?;
        self.insert(task, when);
        Ok(())
    }

    /// Remove `task` from the timeline. Returns whether it was scheduled.
    ///
    /// Suspending a recurring task from inside its own body (or while it is
    /// firing on the dispatch thread) also prevents its reinstallation.
    pub fn suspend_task(&self, task: &Task) -> bool {
        let mut set = self.inner.tasks.lock();
        set.firing.remove(&task.id());
        let removed = set.remove(task.id());
        if removed {
            trace!(task_id = task.id(), task = task.name(), "task suspended");
        }
        removed
    }

    /// Put a suspended task back at its previous due time.
    ///
    /// # Errors
    ///
    /// `SchedulerError::MissingSchedule` if the task was never installed.
    pub fn resume_task(&self, task: &Task) -> Result<(), SchedulerError> {
        self.install_task(task, Schedule::Previous)
    }

    /// Whether `task` is currently on the timeline.
    #[must_use]
    pub fn is_scheduled(&self, task: &Task) -> bool {
        self.inner.tasks.lock().scheduled.contains_key(&task.id())
    }

    /// Run `f` once after `delay`; the scheduler drops it afterwards.
    ///
    /// A delay too large to fall on the clock never fires; the returned task
    /// is not scheduled.
    pub fn call_later<F>(&self, name: impl Into<String>, delay: Duration, f: F) -> Task
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        match self.now().checked_add(delay) {
            Some(when) => self.call_at(name, when, f),
            None => {
                let task = Task::one_shot_delete(name, || Ok(()));
                debug!(task_id = task.id(), task = task.name(), ?delay, "delay out of range, not scheduled");
                task
            }
        }
    }

    /// Run `f` once at `when`; the scheduler drops it afterwards.
    pub fn call_at<F>(&self, name: impl Into<String>, when: Instant, f: F) -> Task
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let mut once = Some(f);
        let task = Task::one_shot_delete(name, move || once.take().map_or(Ok(()), |f| f()));
        self.insert(&task, when);
        task
    }

    /// Queue `f` to run once on the next tick, after due tasks.
    pub fn deferred<F>(&self, f: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.inner.deferred.lock().push(Box::new(f));
        self.wake();
    }

    fn insert(&self, task: &Task, when: Instant) {
        let mut set = self.inner.tasks.lock();
        let earliest = set.insert(task, when);
        trace!(task_id = task.id(), task = task.name(), earliest, "task installed");
        if earliest {
            set.wake_pending = true;
            self.inner.wake.notify_one();
        }
    }

    fn wake(&self) {
        let mut set = self.inner.tasks.lock();
        set.wake_pending = true;
        self.inner.wake.notify_one();
    }

    /// Run one dispatch iteration and return how long the caller may sleep.
    ///
    /// Every task due at the start of the tick fires in due order, then a
    /// snapshot of the deferred queue is drained. Callbacks queued during the
    /// drain wait for the next tick.
    pub fn tick(&self) -> Duration {
        let now = self.now();
        loop {
            let Some((due, task)) = self.inner.tasks.lock().pop_due(now) else {
                break;
            };
            self.fire(due, &task);
        }

        let batch = std::mem::take(&mut *self.inner.deferred.lock());
        for f in batch {
            self.inner.counters.deferred_run.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = f() {
                self.inner.counters.failures.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "deferred callback failed");
            }
        }

        let mut sleep = self.inner.config.max_spin();
        if let Some(next) = self.inner.tasks.lock().next_due() {
            sleep = sleep.min(next.saturating_duration_since(self.now()));
        }
        if !self.inner.deferred.lock().is_empty() {
            sleep = sleep.min(self.inner.config.deferred_spin());
        }
        sleep
    }

    fn fire(&self, due: Instant, task: &Task) {
        trace!(task_id = task.id(), task = task.name(), "task firing");
        self.inner.counters.fired_tasks.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = task.run() {
            self.inner.counters.failures.fetch_add(1, Ordering::Relaxed);
            error!(task_id = task.id(), task = task.name(), error = %e, "task failed");
        }

        let mut set = self.inner.tasks.lock();
        let still_live = set.firing.remove(&task.id());
        if let TaskKind::Recurring { interval, .. } = task.kind() {
            // Not reinstalled if suspended or explicitly reinstalled by its body.
            if still_live && !set.scheduled.contains_key(&task.id()) {
                match next_recurring_time(due, self.now(), interval) {
                    Some(next) => {
                        set.insert(task, next);
                    }
                    None => debug!(task_id = task.id(), task = task.name(), "next run out of range"),
                }
            }
        }
    }

    /// Spawn the dispatch thread.
    ///
    /// # Errors
    ///
    /// `SchedulerError::AlreadyRunning` if started twice, or
    /// `SchedulerError::Spawn` if the OS refuses the thread.
    pub fn start(&self) -> Result<(), SchedulerError> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(SchedulerError::AlreadyRunning);
        }
        let weak = Arc::downgrade(&self.inner);
        let spawned = thread::Builder::new()
            .name(self.inner.config.thread_name.clone())
            .spawn(move || dispatch_loop(&weak));
        match spawned {
            Ok(handle) => {
                *self.inner.thread.lock() = Some(handle);
                info!(
                    thread = %self.inner.config.thread_name,
                    max_spin_ms = self.inner.config.max_spin_ms,
                    "scheduler started"
                );
                Ok(())
            }
            Err(e) => {
                self.inner.running.store(false, Ordering::Release);
                Err(SchedulerError::Spawn(e))
            }
        }
    }

    /// Stop the dispatch thread and join it.
    ///
    /// Installed tasks stay installed; a later `start` picks them up again.
    /// Calling `stop` from a task body signals the loop without joining.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.wake();
        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                debug!("scheduler stop requested from dispatch thread");
                return;
            }
            if handle.join().is_err() {
                error!("scheduler dispatch thread panicked");
            }
        }
        info!("scheduler stopped");
    }

    /// Snapshot of activity counters.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let scheduled_tasks = self.inner.tasks.lock().queue.len();
        let pending_deferred = self.inner.deferred.lock().len();
        SchedulerStats {
            scheduled_tasks,
            pending_deferred,
            fired_tasks: self.inner.counters.fired_tasks.load(Ordering::Relaxed),
            deferred_run: self.inner.counters.deferred_run.load(Ordering::Relaxed),
            failures: self.inner.counters.failures.load(Ordering::Relaxed),
        }
    }
}

fn dispatch_loop(weak: &Weak<SchedulerInner>) {
    debug!("scheduler dispatch loop entered");
    loop {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        if !inner.running.load(Ordering::Acquire) {
            break;
        }
        let scheduler = Scheduler { inner };
        let sleep = scheduler.tick();

        let inner = &scheduler.inner;
        let mut set = inner.tasks.lock();
        if !set.wake_pending && !sleep.is_zero() && inner.running.load(Ordering::Acquire) {
            let _ = inner.wake.wait_for(&mut set, sleep);
        }
        set.wake_pending = false;
    }
    debug!("scheduler dispatch loop exited");
}
