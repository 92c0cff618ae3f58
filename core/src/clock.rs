//! Time sources and deferred task scheduling
//!
//! This module provides the two time-related seams of the breaker:
//! - `Clock`: monotonic time used to derive the circuit state
//! - `Timer`: deferred execution used to re-run an operation after the retry delay
//!
//! Implementations:
//! - `MonotonicClock`: `Instant`-anchored clock (immune to NTP clock skew)
//! - `ThreadTimer`: one sleeping thread per armed task, no runtime required
//! - `TokioTimer`: tokio task per armed task (requires the `tokio` feature)
//! - `ManualClock`: deterministic clock and timer for tests

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// A task deferred by a [`Timer`]
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Monotonic time source
pub trait Clock: Send + Sync + fmt::Debug {
    /// Time elapsed since the clock's anchor
    fn now(&self) -> Duration;
}

/// Scheduler for deferred tasks
pub trait Timer: Send + Sync + fmt::Debug {
    /// Run `task` once `delay` has elapsed
    ///
    /// The returned handle can cancel the task as long as it has not started.
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle;
}

/// Cancellation handle for a task armed on a [`Timer`]
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prevent the task from running if it has not fired yet
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Clock anchored on the `Instant` it was created at
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start_time: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Timer that parks a dedicated thread for each armed task
///
/// Retries are rare (they only happen while the dependency is failing), so a
/// short-lived thread per retry keeps the breaker free of any runtime
/// dependency.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadTimer;

impl ThreadTimer {
    pub fn new() -> Self {
        Self
    }
}

impl Timer for ThreadTimer {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let handle = TimerHandle::new();
        let armed = handle.clone();

        std::thread::spawn(move || {
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            if !armed.is_cancelled() {
                task();
            }
        });

        handle
    }
}

/// Timer backed by a tokio runtime
#[cfg(feature = "tokio")]
#[derive(Debug, Clone)]
pub struct TokioTimer {
    runtime: tokio::runtime::Handle,
}

#[cfg(feature = "tokio")]
impl TokioTimer {
    /// Create a timer spawning onto the given runtime
    pub fn new(runtime: tokio::runtime::Handle) -> Self {
        Self { runtime }
    }

    /// Create a timer spawning onto the runtime of the calling context
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

#[cfg(feature = "tokio")]
impl Timer for TokioTimer {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let handle = TimerHandle::new();
        let armed = handle.clone();

        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if !armed.is_cancelled() {
                task();
            }
        });

        handle
    }
}

struct PendingTask {
    due: Duration,
    seq: u64,
    handle: TimerHandle,
    task: TimerTask,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_seq: u64,
    pending: Vec<PendingTask>,
}

/// Deterministic clock and timer for tests
///
/// Time only moves when [`ManualClock::advance`] is called, which also runs
/// every armed task that has become due, in due order. Tasks run outside of
/// the internal lock, so they may arm further tasks.
///
/// # Example
///
/// ```rust
/// use serial_breaker::{Clock, ManualClock, Timer};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::time::Duration;
///
/// let clock = ManualClock::new();
/// let fired = Arc::new(AtomicBool::new(false));
/// let flag = fired.clone();
///
/// clock.schedule(Duration::from_secs(1), Box::new(move || flag.store(true, Ordering::SeqCst)));
/// clock.advance(Duration::from_millis(999));
/// assert!(!fired.load(Ordering::SeqCst));
///
/// clock.advance(Duration::from_millis(1));
/// assert!(fired.load(Ordering::SeqCst));
/// assert_eq!(clock.now(), Duration::from_secs(1));
/// ```
#[derive(Default)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward and run every task that became due
    pub fn advance(&self, by: Duration) {
        let target = {
            let mut state = self.lock();
            state.now += by;
            state.now
        };

        while let Some(pending) = self.pop_due(target) {
            if !pending.handle.is_cancelled() {
                (pending.task)();
            }
        }
    }

    /// Run tasks that are already due without moving time
    pub fn run_pending(&self) {
        self.advance(Duration::ZERO);
    }

    /// Number of armed tasks that have not run yet
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    fn pop_due(&self, target: Duration) -> Option<PendingTask> {
        let mut state = self.lock();
        let index = state
            .pending
            .iter()
            .enumerate()
            .filter(|(_, p)| p.due <= target)
            .min_by_key(|(_, p)| (p.due, p.seq))
            .map(|(i, _)| i)?;
        Some(state.pending.swap_remove(index))
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ManualClock")
            .field("now", &state.now)
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.lock().now
    }
}

impl Timer for ManualClock {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let handle = TimerHandle::new();
        let mut state = self.lock();
        let due = state.now + delay;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.push(PendingTask {
            due,
            seq,
            handle: handle.clone(),
            task,
        });
        handle
    }
}
