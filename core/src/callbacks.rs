//! Callback system for circuit breaker state changes

use std::fmt;
use std::sync::Arc;

/// Callback invoked with the circuit name
pub type CircuitCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Callbacks for circuit breaker events
///
/// Callbacks run on the thread that caused the event, never while the breaker
/// holds its internal lock.
#[derive(Clone, Default)]
pub struct Callbacks {
    /// A failure tripped the circuit (closed or half-open → open)
    pub on_open: Option<CircuitCallback>,
    /// A success closed a circuit that was open or half-open
    pub on_close: Option<CircuitCallback>,
    /// A half-open probe is about to be executed
    pub on_half_open: Option<CircuitCallback>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report that a failure opened the circuit
    pub fn trigger_open(&self, circuit: &str) {
        notify(self.on_open.as_ref(), circuit);
    }

    /// Report that a success closed the circuit
    pub fn trigger_close(&self, circuit: &str) {
        notify(self.on_close.as_ref(), circuit);
    }

    /// Report that a half-open probe is starting
    pub fn trigger_half_open(&self, circuit: &str) {
        notify(self.on_half_open.as_ref(), circuit);
    }

    /// Events that have an observer attached
    fn registered(&self) -> Vec<&'static str> {
        [
            ("open", self.on_open.is_some()),
            ("close", self.on_close.is_some()),
            ("half_open", self.on_half_open.is_some()),
        ]
        .into_iter()
        .filter_map(|(event, set)| set.then_some(event))
        .collect()
    }
}

fn notify(callback: Option<&CircuitCallback>, circuit: &str) {
    if let Some(callback) = callback {
        callback(circuit);
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("registered", &self.registered())
            .finish()
    }
}
