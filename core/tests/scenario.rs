//! End-to-end breaker lifecycle driven by a manual clock

use serial_breaker::{
    CircuitBreaker, CircuitBreakerProvider, Completion, ManualClock, Operation, ResourceError,
    ResourceProvider, ResourceResponse, ResourceResult, State,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

/// Operation that records dispatches and reports nothing by itself
struct Recorder {
    label: &'static str,
    events: Arc<Mutex<Vec<String>>>,
}

impl Operation<ResourceError> for Recorder {
    fn execute(&self, _breaker: &CircuitBreaker<ResourceError>) {
        self.events.lock().unwrap().push(format!("{} command", self.label));
    }

    fn on_tripped(
        &self,
        _breaker: &CircuitBreaker<ResourceError>,
        _error: Option<&ResourceError>,
    ) {
        self.events.lock().unwrap().push(format!("{} fallback", self.label));
    }
}

fn breaker(clock: &Arc<ManualClock>) -> CircuitBreaker<ResourceError> {
    CircuitBreaker::builder("scenario")
        .retries(2)
        .retry_delay(Duration::ZERO)
        .reset_timeout(Duration::from_secs(5))
        .manual_clock(clock.clone())
        .build()
}

#[test]
fn open_half_open_closed_lifecycle() {
    let clock = Arc::new(ManualClock::new());
    let circuit = breaker(&clock);
    let events = Arc::new(Mutex::new(Vec::new()));
    let recorder = |label| Recorder {
        label,
        events: events.clone(),
    };

    circuit.schedule(recorder("op1"));
    circuit.failure(ResourceError::BadStatus { status: 500 });
    assert_eq!(circuit.state(), State::Closed);
    clock.run_pending();
    circuit.failure(ResourceError::BadStatus { status: 500 });
    assert_eq!(circuit.state(), State::Open);

    circuit.schedule(recorder("op2"));
    assert_eq!(
        *events.lock().unwrap(),
        vec!["op1 command", "op1 command", "op1 fallback", "op2 fallback"]
    );

    clock.advance(Duration::from_secs(5) + Duration::from_millis(1));
    assert_eq!(circuit.state(), State::HalfOpen);

    circuit.schedule(recorder("op3"));
    assert_eq!(events.lock().unwrap().last().unwrap(), "op3 command");

    circuit.success();
    assert_eq!(circuit.state(), State::Closed);
    assert_eq!(circuit.failure_count(), 0);
}

/// Resource requested through the provider
#[derive(Debug, Clone, Copy)]
struct StatusEndpoint;

/// Provider whose calls the test answers by hand
#[derive(Default)]
struct PendingProvider {
    pending: Mutex<Vec<Completion>>,
    calls: AtomicUsize,
}

impl PendingProvider {
    fn answer(&self, result: ResourceResult) {
        let completion = self.pending.lock().unwrap().remove(0);
        completion(result);
    }
}

impl ResourceProvider<StatusEndpoint> for Arc<PendingProvider> {
    fn request(&self, _resource: StatusEndpoint, completion: Completion) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().unwrap().push(completion);
    }
}

fn request(
    provider: &CircuitBreakerProvider<Arc<PendingProvider>>,
) -> mpsc::Receiver<ResourceResult> {
    let (tx, rx) = mpsc::channel();
    provider.request(
        StatusEndpoint,
        Box::new(move |result: ResourceResult| {
            let _ = tx.send(result);
        }),
    );
    rx
}

#[test]
fn provider_lifecycle_surfaces_only_service_unavailable() {
    let clock = Arc::new(ManualClock::new());
    let inner = Arc::new(PendingProvider::default());
    let provider = CircuitBreakerProvider::with_breaker(inner.clone(), breaker(&clock));

    let first = request(&provider);
    let queued = request(&provider);
    assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

    inner.answer(Err(ResourceError::other("connection reset")));
    clock.run_pending();
    assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    assert!(first.try_recv().is_err(), "failure below threshold is hidden");

    inner.answer(Err(ResourceError::BadStatus { status: 503 }));

    // The in-flight request and the one queued behind it both fail fast
    assert!(matches!(
        first.try_recv().unwrap(),
        Err(ResourceError::ServiceUnavailable)
    ));
    assert!(matches!(
        queued.try_recv().unwrap(),
        Err(ResourceError::ServiceUnavailable)
    ));
    assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    assert!(provider.breaker().is_open());

    clock.advance(Duration::from_secs(6));
    let probe = request(&provider);
    let behind_probe = request(&provider);
    assert_eq!(inner.calls.load(Ordering::SeqCst), 3);

    inner.answer(Ok(ResourceResponse::new("pong", 200)));
    assert_eq!(probe.try_recv().unwrap().unwrap().status_code, 200);
    assert!(provider.breaker().is_closed());

    // The next queued request starts as soon as the probe succeeds
    assert_eq!(inner.calls.load(Ordering::SeqCst), 4);
    inner.answer(Ok(ResourceResponse::new("pong", 201)));
    assert_eq!(behind_probe.try_recv().unwrap().unwrap().status_code, 201);
}
