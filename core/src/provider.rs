//! Resource providers guarded by a circuit breaker
//!
//! A [`ResourceProvider`] turns a resource description into one asynchronous
//! call whose completion is invoked exactly once. [`CircuitBreakerProvider`]
//! wraps any provider so that its calls go through a breaker: failures are
//! retried transparently, and once the circuit trips every pending or new
//! request resolves with [`ResourceError::ServiceUnavailable`].

use crate::{circuit::CircuitBreaker, errors::ResourceError, operation::Operation};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Successful response of a resource call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceResponse {
    pub data: Vec<u8>,
    pub status_code: u16,
}

impl ResourceResponse {
    pub fn new(data: impl Into<Vec<u8>>, status_code: u16) -> Self {
        Self {
            data: data.into(),
            status_code,
        }
    }
}

impl fmt::Display for ResourceResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status_code)
    }
}

/// Outcome of a resource call
pub type ResourceResult = Result<ResourceResponse, ResourceError>;

/// Completion invoked exactly once per request
pub type Completion = Box<dyn FnOnce(ResourceResult) + Send + 'static>;

/// Uniform interface for issuing requests against resources of type `R`
pub trait ResourceProvider<R>: Send + Sync {
    /// Issue a request; `completion` must be invoked exactly once
    fn request(&self, resource: R, completion: Completion);
}

/// Provider that routes every request of `P` through a circuit breaker
///
/// # Examples
///
/// ```rust
/// use serial_breaker::{
///     CircuitBreakerProvider, Completion, ResourceError, ResourceProvider, ResourceResponse,
/// };
/// use std::sync::mpsc;
///
/// struct Echo;
///
/// impl ResourceProvider<u16> for Echo {
///     fn request(&self, status: u16, completion: Completion) {
///         if (200..300).contains(&status) {
///             completion(Ok(ResourceResponse::new("ok", status)));
///         } else {
///             completion(Err(ResourceError::BadStatus { status }));
///         }
///     }
/// }
///
/// let provider = CircuitBreakerProvider::new(Echo);
/// let (tx, rx) = mpsc::channel();
/// provider.request(200_u16, Box::new(move |result| {
///     let _ = tx.send(result);
/// }));
///
/// let response = rx.recv().unwrap().unwrap();
/// assert_eq!(response.to_string(), "200");
/// ```
pub struct CircuitBreakerProvider<P> {
    inner: Arc<P>,
    breaker: CircuitBreaker<ResourceError>,
}

impl<P> CircuitBreakerProvider<P> {
    /// Wrap `inner` in a breaker with the default configuration
    pub fn new(inner: P) -> Self {
        Self::with_breaker(inner, CircuitBreaker::builder("resource_provider").build())
    }

    /// Wrap `inner` in the given breaker
    pub fn with_breaker(inner: P, breaker: CircuitBreaker<ResourceError>) -> Self {
        Self {
            inner: Arc::new(inner),
            breaker,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker<ResourceError> {
        &self.breaker
    }
}

impl<P> fmt::Debug for CircuitBreakerProvider<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerProvider")
            .field("breaker", &self.breaker)
            .finish_non_exhaustive()
    }
}

impl<R, P> ResourceProvider<R> for CircuitBreakerProvider<P>
where
    R: Clone + Send + Sync + 'static,
    P: ResourceProvider<R> + 'static,
{
    fn request(&self, resource: R, completion: Completion) {
        self.breaker.schedule(GuardedRequest {
            provider: Arc::clone(&self.inner),
            resource,
            completion: CompletionSlot::new(completion),
        });
    }
}

/// Take-once holder for a completion shared across retried attempts
#[derive(Clone)]
struct CompletionSlot(Arc<Mutex<Option<Completion>>>);

impl CompletionSlot {
    fn new(completion: Completion) -> Self {
        Self(Arc::new(Mutex::new(Some(completion))))
    }

    fn resolve(&self, result: ResourceResult) {
        let completion = self
            .0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(completion) = completion {
            completion(result);
        }
    }
}

/// One request, as an operation on the breaker
struct GuardedRequest<P, R> {
    provider: Arc<P>,
    resource: R,
    completion: CompletionSlot,
}

impl<P, R> Operation<ResourceError> for GuardedRequest<P, R>
where
    R: Clone + Send + Sync + 'static,
    P: ResourceProvider<R> + 'static,
{
    fn execute(&self, breaker: &CircuitBreaker<ResourceError>) {
        let breaker = breaker.clone();
        let completion = self.completion.clone();

        self.provider.request(
            self.resource.clone(),
            Box::new(move |result: ResourceResult| match result {
                Ok(response) => {
                    breaker.success();
                    completion.resolve(Ok(response));
                }
                Err(error) => breaker.failure(error),
            }),
        );
    }

    fn on_tripped(&self, breaker: &CircuitBreaker<ResourceError>, error: Option<&ResourceError>) {
        debug!(
            circuit = %breaker.name(),
            last_error = ?error,
            "request short-circuited"
        );
        self.completion.resolve(Err(ResourceError::ServiceUnavailable));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum SampleRequest {
        Success,
        InternalServerError,
    }

    /// Provider answering synchronously from a script, then with the
    /// resource's nominal outcome once the script is exhausted
    #[derive(Default)]
    struct ScriptedProvider {
        script: Mutex<VecDeque<ResourceResult>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn with_script(script: Vec<ResourceResult>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ResourceProvider<SampleRequest> for Arc<ScriptedProvider> {
        fn request(&self, resource: SampleRequest, completion: Completion) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let scripted = self.script.lock().unwrap().pop_front();
            let result = scripted.unwrap_or(match resource {
                SampleRequest::Success => Ok(ResourceResponse::new("payload", 200)),
                SampleRequest::InternalServerError => {
                    Err(ResourceError::BadStatus { status: 500 })
                }
            });
            completion(result);
        }
    }

    fn guarded(
        inner: Arc<ScriptedProvider>,
        retries: usize,
    ) -> (CircuitBreakerProvider<Arc<ScriptedProvider>>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let breaker = CircuitBreaker::builder("provider_test")
            .retries(retries)
            .retry_delay(Duration::from_millis(100))
            .reset_timeout(Duration::from_secs(5))
            .manual_clock(clock.clone())
            .build();
        (CircuitBreakerProvider::with_breaker(inner, breaker), clock)
    }

    fn collect() -> (Completion, mpsc::Receiver<ResourceResult>) {
        let (tx, rx) = mpsc::channel();
        (
            Box::new(move |result: ResourceResult| {
                let _ = tx.send(result);
            }),
            rx,
        )
    }

    #[test]
    fn test_response_displays_status() {
        let response = ResourceResponse::new(vec![1, 2, 3], 204);
        assert_eq!(response.to_string(), "204");
        assert_eq!(response.data, vec![1, 2, 3]);
    }

    #[test]
    fn test_success_passes_through() {
        let inner = Arc::new(ScriptedProvider::default());
        let (provider, _clock) = guarded(inner.clone(), 3);
        let (completion, rx) = collect();

        provider.request(SampleRequest::Success, completion);

        let response = rx.try_recv().unwrap().unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.data, b"payload".to_vec());
        assert!(rx.try_recv().is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failures_below_threshold_are_hidden() {
        let inner = Arc::new(ScriptedProvider::with_script(vec![
            Err(ResourceError::BadStatus { status: 502 }),
            Err(ResourceError::NoData),
        ]));
        let (provider, clock) = guarded(inner.clone(), 3);
        let (completion, rx) = collect();

        provider.request(SampleRequest::Success, completion);
        assert!(rx.try_recv().is_err());

        clock.advance(Duration::from_millis(100));
        assert!(rx.try_recv().is_err());
        clock.advance(Duration::from_millis(100));

        let response = rx.try_recv().unwrap().unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
        assert!(provider.breaker().is_closed());
        assert_eq!(provider.breaker().failure_count(), 0);
    }

    #[test]
    fn test_exhausted_retries_resolve_service_unavailable() {
        let inner = Arc::new(ScriptedProvider::default());
        let (provider, clock) = guarded(inner.clone(), 2);
        let (completion, rx) = collect();

        provider.request(SampleRequest::InternalServerError, completion);
        clock.advance(Duration::from_millis(100));

        let error = rx.try_recv().unwrap().unwrap_err();
        assert!(error.is_service_unavailable());
        assert!(rx.try_recv().is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert!(provider.breaker().is_open());

        // Triggering error is kept for diagnostics
        let last_error = provider.breaker().last_error().unwrap();
        assert!(matches!(*last_error, ResourceError::BadStatus { status: 500 }));
    }

    #[test]
    fn test_open_circuit_fails_fast_without_calling_provider() {
        let inner = Arc::new(ScriptedProvider::default());
        let (provider, clock) = guarded(inner.clone(), 1);
        let (first, first_rx) = collect();
        provider.request(SampleRequest::InternalServerError, first);
        assert!(first_rx.try_recv().unwrap().is_err());

        let (second, second_rx) = collect();
        provider.request(SampleRequest::Success, second);

        assert!(matches!(
            second_rx.try_recv().unwrap(),
            Err(ResourceError::ServiceUnavailable)
        ));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        // After the cooldown a probe goes through and closes the circuit
        clock.advance(Duration::from_secs(6));
        let (third, third_rx) = collect();
        provider.request(SampleRequest::Success, third);

        assert!(third_rx.try_recv().unwrap().is_ok());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert!(provider.breaker().is_closed());
    }

    /// Provider completing on a worker thread, tracking concurrency
    #[derive(Default)]
    struct ThreadedProvider {
        started: Mutex<Vec<u16>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl ResourceProvider<u16> for Arc<ThreadedProvider> {
        fn request(&self, status: u16, completion: Completion) {
            let provider = Arc::clone(self);
            provider.started.lock().unwrap().push(status);
            let now_active = provider.active.fetch_add(1, Ordering::SeqCst) + 1;
            provider.max_active.fetch_max(now_active, Ordering::SeqCst);

            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(2));
                provider.active.fetch_sub(1, Ordering::SeqCst);
                completion(Ok(ResourceResponse::new(Vec::new(), status)));
            });
        }
    }

    #[test]
    fn test_requests_completed_on_other_threads_stay_serialized() {
        let inner = Arc::new(ThreadedProvider::default());
        let provider = CircuitBreakerProvider::new(inner.clone());
        let (tx, rx) = mpsc::channel();

        for status in 200..220u16 {
            let tx = tx.clone();
            provider.request(
                status,
                Box::new(move |result: ResourceResult| {
                    let _ = tx.send(result.map(|response| response.status_code));
                }),
            );
        }

        let mut statuses: Vec<u16> = (0..20)
            .map(|_| {
                rx.recv_timeout(Duration::from_secs(5))
                    .expect("every request completes")
                    .expect("every request succeeds")
            })
            .collect();
        statuses.sort_unstable();

        assert_eq!(statuses, (200..220).collect::<Vec<_>>());
        assert_eq!(
            *inner.started.lock().unwrap(),
            (200..220).collect::<Vec<_>>()
        );
        assert_eq!(inner.max_active.load(Ordering::SeqCst), 1);
    }
}
