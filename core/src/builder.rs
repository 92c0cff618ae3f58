//! Builder API for ergonomic circuit breaker configuration

use crate::{
    callbacks::Callbacks,
    circuit::{CircuitBreaker, Config},
    clock::{Clock, ManualClock, MonotonicClock, ThreadTimer, Timer},
};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Builder for creating circuit breakers with fluent API
pub struct CircuitBuilder<E> {
    name: String,
    config: Config,
    clock: Option<Arc<dyn Clock>>,
    timer: Option<Arc<dyn Timer>>,
    callbacks: Callbacks,
    _error: PhantomData<fn() -> E>,
}

impl<E: Send + Sync + 'static> CircuitBuilder<E> {
    /// Create a new builder for a circuit with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: Config::default(),
            clock: None,
            timer: None,
            callbacks: Callbacks::new(),
            _error: PhantomData,
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the number of consecutive failures tolerated before opening
    pub fn retries(mut self, retries: usize) -> Self {
        self.config.retries = retries;
        self
    }

    /// Set the cooldown before a half-open probe is allowed
    ///
    /// # Panics
    ///
    /// Panics if `timeout` is zero.
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        assert!(!timeout.is_zero(), "Reset timeout must be greater than 0");
        self.config.reset_timeout = timeout;
        self
    }

    /// Set the reset timeout in seconds
    ///
    /// # Panics
    ///
    /// Panics if `seconds` is not a positive, finite number.
    pub fn reset_timeout_secs(self, seconds: f64) -> Self {
        assert!(
            seconds.is_finite() && seconds > 0.0,
            "Reset timeout must be greater than 0"
        );
        self.reset_timeout(Duration::from_secs_f64(seconds))
    }

    /// Set the pause between retries of a failed operation
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    /// Set the retry delay in seconds (negative values count as zero)
    pub fn retry_delay_secs(self, seconds: f64) -> Self {
        let seconds = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
        self.retry_delay(Duration::from_secs_f64(seconds))
    }

    /// Set the jitter factor (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: delay * (1 - jitter + rand * jitter)
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.config.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Set a custom time source
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set a custom scheduler for retries
    pub fn timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Drive both time and retries from a [`ManualClock`]
    ///
    /// # Examples
    ///
    /// ```rust
    /// use serial_breaker::{CircuitBreaker, ManualClock};
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// let clock = Arc::new(ManualClock::new());
    /// let breaker = CircuitBreaker::<String>::builder("api")
    ///     .retries(1)
    ///     .reset_timeout(Duration::from_secs(5))
    ///     .manual_clock(clock.clone())
    ///     .build();
    ///
    /// breaker.failure("timeout".to_string());
    /// assert!(breaker.is_open());
    ///
    /// clock.advance(Duration::from_secs(6));
    /// assert!(breaker.is_half_open());
    /// ```
    pub fn manual_clock(mut self, clock: Arc<ManualClock>) -> Self {
        self.clock = Some(clock.clone());
        self.timer = Some(clock);
        self
    }

    /// Set callback for when circuit opens
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_open = Some(Arc::new(f));
        self
    }

    /// Set callback for when circuit closes
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    /// Set callback for when a half-open probe is issued
    pub fn on_half_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_half_open = Some(Arc::new(f));
        self
    }

    /// Build the circuit breaker
    pub fn build(self) -> CircuitBreaker<E> {
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));
        let timer = self.timer.unwrap_or_else(|| Arc::new(ThreadTimer::new()));

        CircuitBreaker::from_parts(self.name, self.config, clock, timer, self.callbacks)
    }
}
