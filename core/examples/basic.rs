//! Basic circuit breaker usage example
//!
//! Run with `RUST_LOG=debug cargo run --example basic` to see the breaker's
//! own log events.

use serial_breaker::{
    CircuitBreaker, CircuitBreakerProvider, Completion, ResourceError, ResourceProvider,
    ResourceResponse, ResourceResult,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Sample endpoints, named after the status code they answer with
#[derive(Debug, Clone, Copy)]
enum SampleRequest {
    Success = 200,
    NotFound = 404,
    InternalServerError = 500,
}

/// Fake transport that answers on a worker thread, and can be taken down
struct FlakyService {
    down: AtomicBool,
}

impl ResourceProvider<SampleRequest> for Arc<FlakyService> {
    fn request(&self, resource: SampleRequest, completion: Completion) {
        let down = self.down.load(Ordering::SeqCst);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            let status = resource as u16;
            if down {
                completion(Err(ResourceError::other("connection refused")));
            } else if (200..300).contains(&status) {
                completion(Ok(ResourceResponse::new(b"{}".to_vec(), status)));
            } else {
                completion(Err(ResourceError::BadStatus { status }));
            }
        });
    }
}

fn call<P>(provider: &P, resource: SampleRequest)
where
    P: ResourceProvider<SampleRequest>,
{
    let (tx, rx) = mpsc::channel();
    provider.request(
        resource,
        Box::new(move |result: ResourceResult| {
            let _ = tx.send(result);
        }),
    );

    match rx.recv_timeout(Duration::from_secs(5)) {
        Ok(Ok(response)) => println!("✓ {:?}: Success: {}", resource, response),
        Ok(Err(e)) => println!("✗ {:?}: Error: {}", resource, e),
        Err(_) => println!("✗ {:?}: no answer", resource),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Circuit Breaker Basic Example ===\n");

    let service = Arc::new(FlakyService {
        down: AtomicBool::new(false),
    });
    let breaker = CircuitBreaker::builder("sample_api")
        .retries(2)
        .retry_delay(Duration::from_millis(50))
        .reset_timeout(Duration::from_millis(500))
        .on_open(|name| println!("🔴 Circuit '{}' opened!", name))
        .on_close(|name| println!("🟢 Circuit '{}' closed!", name))
        .on_half_open(|name| println!("🟡 Circuit '{}' half-open, testing...", name))
        .build();
    let provider = CircuitBreakerProvider::with_breaker(service.clone(), breaker);

    println!("Initial state: {}\n", provider.breaker().state_name());

    println!("--- Successful call ---");
    call(&provider, SampleRequest::Success);
    println!("State: {}\n", provider.breaker().state_name());

    println!("--- Failing endpoint (retried, then tripped) ---");
    call(&provider, SampleRequest::NotFound);
    println!("State: {}\n", provider.breaker().state_name());

    println!("--- Attempting call while open ---");
    call(&provider, SampleRequest::Success);
    println!();

    println!("--- Waiting for the reset timeout ---");
    std::thread::sleep(Duration::from_millis(600));
    println!("State: {}\n", provider.breaker().state_name());

    println!("--- Probe while the service is down ---");
    service.down.store(true, Ordering::SeqCst);
    call(&provider, SampleRequest::InternalServerError);
    println!("State: {}\n", provider.breaker().state_name());

    println!("--- Probe after recovery ---");
    service.down.store(false, Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(600));
    call(&provider, SampleRequest::Success);
    println!("State: {}", provider.breaker().state_name());
}
