//! One-shot timer service used for release deferrals and directive watchdogs
//!
//! Managers only depend on the [`Timer`] trait. [`TokioTimer`] backs it with
//! spawned sleep tasks; [`ManualTimer`] is a virtual clock that fires callbacks
//! only when advanced, which keeps tests deterministic.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::{Error, Result};

/// Callback fired when a timer expires
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Identifier returned by [`Timer::schedule`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    /// Raw numeric value
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Schedules one-shot callbacks
pub trait Timer: Send + Sync {
    /// Fire `callback` once after `delay`
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerId;

    /// Cancel a scheduled callback; unknown or already fired ids are ignored
    fn cancel(&self, id: TimerId);
}

/// Timer backed by the Tokio runtime
pub struct TokioTimer {
    handle: Handle,
    next_id: AtomicU64,
    tasks: Arc<Mutex<HashMap<TimerId, JoinHandle<()>>>>,
}

impl TokioTimer {
    /// Create a timer that spawns onto the given runtime
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            next_id: AtomicU64::new(1),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a timer bound to the runtime of the calling context
    ///
    /// # Errors
    ///
    /// Returns error if called outside a Tokio runtime
    pub fn from_current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| Error::Config(format!("no tokio runtime: {e}")))
    }

    /// Number of timers that have not fired or been cancelled
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Timer for TokioTimer {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let tasks = Arc::clone(&self.tasks);

        // Hold the map lock until the handle is stored so a zero delay
        // cannot fire before the task is registered
        let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let live = tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id)
                .is_some();
            if live {
                callback();
            }
        });
        guard.insert(id, task);
        id
    }

    fn cancel(&self, id: TimerId) {
        let task = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, task) in tasks.drain() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for TokioTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioTimer")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_id: u64,
    queue: BTreeMap<(Duration, TimerId), TimerCallback>,
    deadlines: HashMap<TimerId, Duration>,
}

/// Virtual clock timer; callbacks fire only from [`ManualTimer::advance`]
#[derive(Default)]
pub struct ManualTimer {
    state: Mutex<ManualState>,
}

impl ManualTimer {
    /// Create a timer with the clock at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time
    #[must_use]
    pub fn now(&self) -> Duration {
        self.lock().now
    }

    /// Number of scheduled callbacks that have not fired
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    /// Move the clock forward, firing every callback that falls due in
    /// deadline order
    ///
    /// Callbacks may schedule further timers; those fire too if they fall
    /// inside the advanced window.
    pub fn advance(&self, by: Duration) {
        let target = self.lock().now + by;
        loop {
            let due = {
                let mut state = self.lock();
                let next = state
                    .queue
                    .first_key_value()
                    .map(|(key, _)| *key)
                    .filter(|(deadline, _)| *deadline <= target);
                next.and_then(|key| {
                    state.now = key.0;
                    state.deadlines.remove(&key.1);
                    state.queue.remove(&key)
                })
            };
            match due {
                Some(callback) => callback(),
                None => break,
            }
        }
        self.lock().now = target;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Timer for ManualTimer {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerId {
        let mut state = self.lock();
        state.next_id += 1;
        let id = TimerId(state.next_id);
        let deadline = state.now + delay;
        state.queue.insert((deadline, id), callback);
        state.deadlines.insert(id, deadline);
        id
    }

    fn cancel(&self, id: TimerId) {
        let mut state = self.lock();
        if let Some(deadline) = state.deadlines.remove(&id) {
            state.queue.remove(&(deadline, id));
        }
    }
}

impl std::fmt::Debug for ManualTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ManualTimer")
            .field("now", &state.now)
            .field("pending", &state.queue.len())
            .finish()
    }
}
