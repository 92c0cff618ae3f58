//! SerialBreaker - Queueing circuit breaker for unreliable dependencies
//!
//! This crate provides a circuit breaker that sits in front of a single
//! remote dependency:
//! - FIFO queue of operations with at most one call in flight
//! - Transparent retries with a fixed delay while the circuit is closed
//! - Fail-fast fallbacks while open, half-open probe after a cooldown
//! - State derived from failure bookkeeping and an injected monotonic clock
//! - Provider adapter mapping trips to `ResourceError::ServiceUnavailable`
//!
//! # Example
//!
//! ```rust
//! use serial_breaker::CircuitBreaker;
//! use std::time::Duration;
//!
//! let circuit = CircuitBreaker::<String>::builder("payment_api")
//!     .retries(3)
//!     .retry_delay(Duration::from_millis(200))
//!     .reset_timeout(Duration::from_secs(10))
//!     .on_open(|name| println!("Circuit {} opened!", name))
//!     .build();
//!
//! // The command reports its outcome; the fallback runs if the call is short-circuited
//! circuit.schedule_fn(
//!     |breaker| {
//!         // Your service call here
//!         breaker.success();
//!     },
//!     |_breaker, last_error| println!("skipped, last error: {:?}", last_error),
//! );
//!
//! assert!(circuit.is_closed());
//! ```

pub mod builder;
pub mod callbacks;
pub mod circuit;
pub mod clock;
pub mod errors;
pub mod operation;
pub mod provider;

pub use builder::CircuitBuilder;
pub use callbacks::Callbacks;
pub use circuit::{CircuitBreaker, Config, State};
#[cfg(feature = "tokio")]
pub use clock::TokioTimer;
pub use clock::{Clock, ManualClock, MonotonicClock, ThreadTimer, Timer, TimerHandle, TimerTask};
pub use errors::ResourceError;
pub use operation::{FnOperation, Operation};
pub use provider::{
    CircuitBreakerProvider, Completion, ResourceProvider, ResourceResponse, ResourceResult,
};
