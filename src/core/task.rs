//! Schedulable units of work.
//!
//! A [`Task`] is a cheap, clonable handle around a body closure. The
//! [`Scheduler`](crate::core::Scheduler) holds a clone while the task is
//! installed and drops it after firing, unless the task is recurring.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Identifier assigned to every task at construction.
pub type TaskId = u64;

/// Smallest interval a recurring task accepts.
pub const MIN_RECURRING_INTERVAL: Duration = Duration::from_millis(1);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// How a task behaves once it has fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Fires once, then stays with its creator until explicitly reinstalled.
    OneShot,
    /// Fires once, then the scheduler forgets it.
    OneShotSelfDelete,
    /// Fires every `interval`, aligned to `offset` past the scheduler epoch.
    Recurring {
        /// Distance between consecutive fire times.
        interval: Duration,
        /// Phase of the fire grid relative to the scheduler epoch.
        offset: Duration,
    },
}

/// Where an installed task should land on the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Absolute fire time.
    At(Instant),
    /// Delay relative to the scheduler's current time.
    After(Duration),
    /// Reuse the task's previous due time (recurring tasks fall back to their grid).
    Previous,
}

type TaskBody = Box<dyn FnMut() -> anyhow::Result<()> + Send>;

struct TaskInner {
    id: TaskId,
    kind: TaskKind,
    name: String,
    body: Mutex<TaskBody>,
    // Only touched while the scheduler's task-set lock is held.
    due: Mutex<Option<Instant>>,
}

/// Handle to a schedulable body.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    fn with_kind<F>(kind: TaskKind, name: impl Into<String>, body: F) -> Self
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            inner: Arc::new(TaskInner {
                id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                name: name.into(),
                body: Mutex::new(Box::new(body)),
                due: Mutex::new(None),
            }),
        }
    }

    /// A task that fires once and can be reinstalled by its owner.
    pub fn one_shot<F>(name: impl Into<String>, body: F) -> Self
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        Self::with_kind(TaskKind::OneShot, name, body)
    }

    /// A task that fires once and is then discarded by the scheduler.
    pub fn one_shot_delete<F>(name: impl Into<String>, body: F) -> Self
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        Self::with_kind(TaskKind::OneShotSelfDelete, name, body)
    }

    /// A phase-locked recurring task with zero offset.
    ///
    /// Intervals below [`MIN_RECURRING_INTERVAL`] are raised to it.
    pub fn recurring<F>(name: impl Into<String>, interval: Duration, body: F) -> Self
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        Self::recurring_with_offset(name, interval, Duration::ZERO, body)
    }

    /// A phase-locked recurring task firing at `epoch + offset + k * interval`.
    pub fn recurring_with_offset<F>(
        name: impl Into<String>,
        interval: Duration,
        offset: Duration,
        body: F,
    ) -> Self
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        let interval = interval.max(MIN_RECURRING_INTERVAL);
        let offset = Duration::from_nanos(
            u64::try_from(offset.as_nanos() % interval.as_nanos()).unwrap_or(0),
        );
        Self::with_kind(TaskKind::Recurring { interval, offset }, name, body)
    }

    /// Task identifier.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// Task kind.
    #[must_use]
    pub fn kind(&self) -> TaskKind {
        self.inner.kind
    }

    /// Name used in log output.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Last resolved due time, if the task was ever installed.
    #[must_use]
    pub fn due(&self) -> Option<Instant> {
        *self.inner.due.lock()
    }

    pub(crate) fn set_due(&self, when: Instant) {
        *self.inner.due.lock() = Some(when);
    }

    pub(crate) fn run(&self) -> anyhow::Result<()> {
        let mut body = self.inner.body.lock();
        (body)()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .finish_non_exhaustive()
    }
}

/// Next point on the `epoch + offset + k * interval` grid strictly after `now`.
///
/// `None` if that point is past what `Instant` can represent.
pub(crate) fn next_grid_time(
    epoch: Instant,
    now: Instant,
    interval: Duration,
    offset: Duration,
) -> Option<Instant> {
    let origin = epoch.checked_add(offset)?;
    if now < origin {
        return Some(origin);
    }
    let elapsed = now.duration_since(origin).as_nanos();
    let step = interval.as_nanos().max(1);
    let slots = elapsed / step + 1;
    origin.checked_add(nanos(slots.checked_mul(step)?)?)
}

/// Phase-locked successor of `due`: `due + interval`, skipping slots that are
/// already in the past relative to `now`.
///
/// `None` if the successor is past what `Instant` can represent.
pub(crate) fn next_recurring_time(
    due: Instant,
    now: Instant,
    interval: Duration,
) -> Option<Instant> {
    let next = due.checked_add(interval)?;
    if next > now {
        return Some(next);
    }
    let behind = now.duration_since(due).as_nanos();
    let step = interval.as_nanos().max(1);
    due.checked_add(nanos((behind / step + 1).checked_mul(step)?)?)
}

fn nanos(n: u128) -> Option<Duration> {
    u64::try_from(n).ok().map(Duration::from_nanos)
}
