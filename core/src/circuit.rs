//! Queueing circuit breaker
//!
//! The breaker serializes operations through a FIFO queue, keeping at most one
//! of them in flight. Failed attempts are retried after a fixed delay until
//! the failure count reaches `retries`, at which point the circuit opens and
//! every queued operation is short-circuited through its fallback until
//! `reset_timeout` has elapsed since the last failure. The next operation is
//! then executed as a half-open probe: a success closes the circuit, a
//! failure opens it again.
//!
//! The circuit state is never stored. It is derived from the failure count,
//! the time of the last failure and the current time on every read.

use crate::{
    builder::CircuitBuilder,
    callbacks::Callbacks,
    clock::{Clock, MonotonicClock, ThreadTimer, Timer},
    operation::{FnOperation, Operation},
};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of consecutive failures tolerated before the circuit opens
    pub retries: usize,

    /// Cooldown after the last failure before a half-open probe is allowed
    pub reset_timeout: Duration,

    /// Pause between a failed attempt and the next one while closed
    pub retry_delay: Duration,

    /// Jitter factor for retry_delay (0.0 = fixed delay, 1.0 = full jitter)
    /// Uses chrono-machines formula: delay * (1 - jitter + rand * jitter)
    pub jitter_factor: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retries: 3,
            reset_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_secs(1),
            jitter_factor: 0.0,
        }
    }
}

impl Config {
    /// Delay before the next attempt of a failed operation
    pub fn next_retry_delay(&self) -> Duration {
        if self.jitter_factor > 0.0 {
            let delay_ms = u64::try_from(self.retry_delay.as_millis()).unwrap_or(u64::MAX);
            let policy = chrono_machines::Policy {
                max_attempts: 1,
                base_delay_ms: delay_ms,
                multiplier: 1.0,
                max_delay_ms: delay_ms,
            };
            let jittered_ms = policy.calculate_delay(1, self.jitter_factor);
            Duration::from_millis(jittered_ms as u64)
        } else {
            self.retry_delay
        }
    }
}

/// Circuit state, derived on every read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Calls are executed, failures are retried
    Closed,
    /// Calls are short-circuited through their fallback
    Open,
    /// The next call is executed as a recovery probe
    HalfOpen,
}

impl State {
    /// Derive the state from the failure bookkeeping
    ///
    /// Once the cooldown has elapsed the circuit reports `HalfOpen`, even
    /// though the failure count is still at or above the threshold.
    pub fn evaluate(
        config: &Config,
        failure_count: usize,
        last_failure_time: Option<Duration>,
        now: Duration,
    ) -> Self {
        if failure_count < config.retries {
            return State::Closed;
        }

        if let Some(last_failure) = last_failure_time
            && now.saturating_sub(last_failure) > config.reset_timeout
        {
            return State::HalfOpen;
        }

        State::Open
    }

    pub fn name(self) -> &'static str {
        match self {
            State::Closed => "Closed",
            State::Open => "Open",
            State::HalfOpen => "HalfOpen",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The operation whose command has been issued but not yet answered
struct InFlight<E> {
    /// Dispatch id, used to discard retries armed for an earlier operation
    id: u64,
    operation: Arc<dyn Operation<E>>,
}

/// Mutable breaker bookkeeping, guarded by a single mutex
struct Ledger<E> {
    failure_count: usize,
    last_failure_time: Option<Duration>,
    last_error: Option<Arc<E>>,
    queue: VecDeque<Arc<dyn Operation<E>>>,
    current: Option<InFlight<E>>,
    next_id: u64,
    /// A thread is inside `run_next`; nested calls leave the work to it
    draining: bool,
}

impl<E> Ledger<E> {
    fn new() -> Self {
        Self {
            failure_count: 0,
            last_failure_time: None,
            last_error: None,
            queue: VecDeque::new(),
            current: None,
            next_id: 0,
            draining: false,
        }
    }
}

struct Shared<E> {
    name: String,
    config: Config,
    clock: Arc<dyn Clock>,
    timer: Arc<dyn Timer>,
    callbacks: Callbacks,
    ledger: Mutex<Ledger<E>>,
}

/// What `failure()` decided to do once the failure was recorded
enum Recovery<E> {
    /// Nothing was in flight
    Idle,
    Retry {
        id: u64,
        attempt: usize,
    },
    Trip {
        id: u64,
        operation: Arc<dyn Operation<E>>,
        error: Arc<E>,
    },
}

/// Circuit breaker guarding a single dependency
///
/// The handle is cheap to clone; clones share the same queue and counters.
/// `schedule`, `success` and `failure` may be called from any thread: all
/// mutations are serialized internally, and operation callbacks are invoked
/// without holding the internal lock.
pub struct CircuitBreaker<E> {
    shared: Arc<Shared<E>>,
}

impl<E> Clone for CircuitBreaker<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E: Send + Sync + 'static> CircuitBreaker<E> {
    /// Create a new circuit breaker (use builder() for more options)
    pub fn new(name: String, config: Config) -> Self {
        Self::from_parts(
            name,
            config,
            Arc::new(MonotonicClock::new()),
            Arc::new(ThreadTimer::new()),
            Callbacks::new(),
        )
    }

    /// Assemble a circuit breaker from its collaborators (used by builder)
    pub(crate) fn from_parts(
        name: String,
        config: Config,
        clock: Arc<dyn Clock>,
        timer: Arc<dyn Timer>,
        callbacks: Callbacks,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                config,
                clock,
                timer,
                callbacks,
                ledger: Mutex::new(Ledger::new()),
            }),
        }
    }

    /// Create a new circuit breaker builder
    pub fn builder(name: impl Into<String>) -> CircuitBuilder<E> {
        CircuitBuilder::new(name)
    }

    /// Queue an operation
    ///
    /// Operations start in the order they were scheduled. Every scheduled
    /// operation eventually has either its command or its fallback invoked.
    pub fn schedule<O>(&self, operation: O)
    where
        O: Operation<E> + 'static,
    {
        self.schedule_shared(Arc::new(operation));
    }

    /// Queue an operation that is already shared
    pub fn schedule_shared(&self, operation: Arc<dyn Operation<E>>) {
        let queued = {
            let mut ledger = self.lock();
            ledger.queue.push_back(operation);
            ledger.queue.len()
        };
        debug!(circuit = %self.shared.name, queued, "operation scheduled");

        self.run_next();
    }

    /// Queue a closure pair as an operation
    pub fn schedule_fn<C, F>(&self, command: C, fallback: F)
    where
        C: Fn(&CircuitBreaker<E>) + Send + Sync + 'static,
        F: Fn(&CircuitBreaker<E>, Option<&E>) + Send + Sync + 'static,
    {
        self.schedule(FnOperation::new(command, fallback));
    }

    /// Report that the in-flight operation succeeded
    ///
    /// Forgives every recorded failure, whatever the current state, and
    /// starts the next queued operation.
    pub fn success(&self) {
        let previous = {
            let mut ledger = self.lock();
            let previous = self.state_of(&ledger);
            ledger.failure_count = 0;
            ledger.last_failure_time = None;
            ledger.last_error = None;
            ledger.current = None;
            previous
        };

        if previous != State::Closed {
            debug!(circuit = %self.shared.name, from = %previous, "circuit closed");
            self.shared.callbacks.trigger_close(&self.shared.name);
        }

        self.run_next();
    }

    /// Report that the in-flight operation failed
    ///
    /// While the circuit stays closed the same operation is executed again
    /// after the retry delay. Once the failure count reaches the threshold
    /// the operation is tripped through its fallback and the circuit opens.
    pub fn failure(&self, error: E) {
        let (opened, failures, recovery) = {
            let mut ledger = self.lock();
            let previous = self.state_of(&ledger);
            let error = Arc::new(error);
            ledger.last_error = Some(Arc::clone(&error));
            ledger.last_failure_time = Some(self.shared.clock.now());
            ledger.failure_count += 1;

            let state = self.state_of(&ledger);
            let recovery = match (&ledger.current, state) {
                (None, _) => Recovery::Idle,
                (Some(in_flight), State::Closed) => Recovery::Retry {
                    id: in_flight.id,
                    attempt: ledger.failure_count,
                },
                (Some(in_flight), State::Open | State::HalfOpen) => Recovery::Trip {
                    id: in_flight.id,
                    operation: Arc::clone(&in_flight.operation),
                    error,
                },
            };
            (
                state == State::Open && previous != State::Open,
                ledger.failure_count,
                recovery,
            )
        };

        if opened {
            warn!(circuit = %self.shared.name, failures, "circuit opened");
            self.shared.callbacks.trigger_open(&self.shared.name);
        }

        match recovery {
            Recovery::Idle => {
                debug!(circuit = %self.shared.name, "failure reported with nothing in flight");
            }
            Recovery::Retry { id, attempt } => self.arm_retry(id, attempt),
            Recovery::Trip {
                id,
                operation,
                error,
            } => {
                debug!(circuit = %self.shared.name, "tripping in-flight operation");
                operation.on_tripped(self, Some(&*error));
                self.release(id);
                self.run_next();
            }
        }
    }

    /// Current circuit state
    ///
    /// For observability only: scheduling is the way to issue calls.
    pub fn state(&self) -> State {
        let ledger = self.lock();
        self.state_of(&ledger)
    }

    /// Get current state name
    pub fn state_name(&self) -> &'static str {
        self.state().name()
    }

    /// Check if circuit is closed
    pub fn is_closed(&self) -> bool {
        self.state() == State::Closed
    }

    /// Check if circuit is open
    pub fn is_open(&self) -> bool {
        self.state() == State::Open
    }

    /// Check if circuit is half-open
    pub fn is_half_open(&self) -> bool {
        self.state() == State::HalfOpen
    }

    /// Consecutive failures since the last success
    pub fn failure_count(&self) -> usize {
        self.lock().failure_count
    }

    /// Last reported failure, cleared by a success
    pub fn last_error(&self) -> Option<Arc<E>> {
        self.lock().last_error.clone()
    }

    /// Number of operations waiting behind the in-flight one
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether an operation is currently in flight
    pub fn is_busy(&self) -> bool {
        self.lock().current.is_some()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Start queued operations until one is in flight or the queue is empty
    ///
    /// While the circuit is open, operations are tripped one after another in
    /// queue order without waiting for any timer. An operation that reports
    /// its outcome synchronously from `execute` does not recurse: the nested
    /// call returns at once and this loop starts the next operation.
    fn run_next(&self) {
        {
            let mut ledger = self.lock();
            if ledger.draining {
                return;
            }
            ledger.draining = true;
        }
        let _guard = DrainGuard(self);

        loop {
            let (id, operation, state, last_error) = {
                let mut ledger = self.lock();
                if ledger.current.is_some() {
                    ledger.draining = false;
                    return;
                }
                let Some(operation) = ledger.queue.pop_front() else {
                    ledger.draining = false;
                    return;
                };

                let id = ledger.next_id;
                ledger.next_id += 1;
                ledger.current = Some(InFlight {
                    id,
                    operation: Arc::clone(&operation),
                });
                let state = self.state_of(&ledger);
                (id, operation, state, ledger.last_error.clone())
            };

            match state {
                State::Closed => {
                    debug!(circuit = %self.shared.name, "executing operation");
                    operation.execute(self);
                }
                State::HalfOpen => {
                    debug!(circuit = %self.shared.name, "executing half-open probe");
                    self.shared.callbacks.trigger_half_open(&self.shared.name);
                    operation.execute(self);
                }
                State::Open => {
                    debug!(circuit = %self.shared.name, "circuit open, tripping operation");
                    operation.on_tripped(self, last_error.as_deref());
                    self.release(id);
                }
            }
        }
    }

    fn arm_retry(&self, id: u64, attempt: usize) {
        let delay = self.shared.config.next_retry_delay();
        debug!(
            circuit = %self.shared.name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "retrying operation"
        );

        let shared = Arc::downgrade(&self.shared);
        // Retries are never cancelled: a stale one is discarded when it fires
        let _handle = self.shared.timer.schedule(
            delay,
            Box::new(move || {
                if let Some(shared) = shared.upgrade() {
                    CircuitBreaker { shared }.fire_retry(id);
                }
            }),
        );
    }

    fn fire_retry(&self, id: u64) {
        let operation = {
            let ledger = self.lock();
            match &ledger.current {
                Some(in_flight) if in_flight.id == id => Arc::clone(&in_flight.operation),
                _ => {
                    debug!(circuit = %self.shared.name, "discarding stale retry");
                    return;
                }
            }
        };

        operation.execute(self);
    }

    /// Clear the in-flight slot if it still holds the given dispatch
    fn release(&self, id: u64) {
        let mut ledger = self.lock();
        if ledger.current.as_ref().is_some_and(|in_flight| in_flight.id == id) {
            ledger.current = None;
        }
    }

    fn state_of(&self, ledger: &Ledger<E>) -> State {
        State::evaluate(
            &self.shared.config,
            ledger.failure_count,
            ledger.last_failure_time,
            self.shared.clock.now(),
        )
    }

    fn lock(&self) -> MutexGuard<'_, Ledger<E>> {
        self.shared
            .ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<E: Send + Sync + 'static> fmt::Debug for CircuitBreaker<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (state, failure_count, queued) = {
            let ledger = self.lock();
            (self.state_of(&ledger), ledger.failure_count, ledger.queue.len())
        };
        f.debug_struct("CircuitBreaker")
            .field("name", &self.shared.name)
            .field("config", &self.shared.config)
            .field("state", &state)
            .field("failure_count", &failure_count)
            .field("queued", &queued)
            .field("callbacks", &self.shared.callbacks)
            .finish()
    }
}

/// Clears the draining flag if an operation panics mid-drain
struct DrainGuard<'a, E>(&'a CircuitBreaker<E>);

impl<E> Drop for DrainGuard<'_, E> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let mut ledger = self
                .0
                .shared
                .ledger
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            ledger.draining = false;
        }
    }
}
