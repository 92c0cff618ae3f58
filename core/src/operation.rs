//! Units of work scheduled on a circuit breaker
//!
//! An operation pairs a command (the guarded call) with a fallback (the
//! notification sent when the call is short-circuited). The breaker decides
//! which of the two runs.

use crate::circuit::CircuitBreaker;
use std::fmt;

/// A guarded unit of work
///
/// `execute` starts the call and must eventually report exactly one outcome
/// on the breaker it receives: [`CircuitBreaker::success`] or
/// [`CircuitBreaker::failure`]. It may be invoked several times for the same
/// operation when failed attempts are retried, but never concurrently.
///
/// `on_tripped` is invoked instead of `execute` when the circuit is open, or
/// once retries are exhausted. It receives the last recorded failure, if any.
///
/// # Examples
///
/// ```rust
/// use serial_breaker::{CircuitBreaker, Operation};
///
/// struct Ping;
///
/// impl Operation<String> for Ping {
///     fn execute(&self, breaker: &CircuitBreaker<String>) {
///         // Report the outcome of the real call
///         breaker.success();
///     }
///
///     fn on_tripped(&self, _breaker: &CircuitBreaker<String>, error: Option<&String>) {
///         eprintln!("ping skipped, last error: {:?}", error);
///     }
/// }
///
/// let breaker = CircuitBreaker::<String>::builder("ping").build();
/// breaker.schedule(Ping);
/// assert!(breaker.is_closed());
/// ```
pub trait Operation<E>: Send + Sync {
    /// Run the guarded call
    fn execute(&self, breaker: &CircuitBreaker<E>);

    /// Notify that the call was not (or no longer) attempted
    fn on_tripped(&self, breaker: &CircuitBreaker<E>, error: Option<&E>);
}

/// Closure-backed operation
///
/// Allows using plain closures where a dedicated `Operation` type would be
/// overkill.
pub struct FnOperation<C, F> {
    command: C,
    fallback: F,
}

impl<C, F> FnOperation<C, F> {
    /// Create an operation from a command and a fallback closure
    pub fn new<E>(command: C, fallback: F) -> Self
    where
        C: Fn(&CircuitBreaker<E>) + Send + Sync,
        F: Fn(&CircuitBreaker<E>, Option<&E>) + Send + Sync,
    {
        Self { command, fallback }
    }
}

impl<E, C, F> Operation<E> for FnOperation<C, F>
where
    C: Fn(&CircuitBreaker<E>) + Send + Sync,
    F: Fn(&CircuitBreaker<E>, Option<&E>) + Send + Sync,
{
    fn execute(&self, breaker: &CircuitBreaker<E>) {
        (self.command)(breaker)
    }

    fn on_tripped(&self, breaker: &CircuitBreaker<E>, error: Option<&E>) {
        (self.fallback)(breaker, error)
    }
}

impl<C, F> fmt::Debug for FnOperation<C, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnOperation")
            .field("command", &"<closure>")
            .field("fallback", &"<closure>")
            .finish()
    }
}
