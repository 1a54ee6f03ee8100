use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskgate::{AdmissionConfig, AdmissionController, AdmissionError, AdmissionLayer, Decision, ManualClock};
use tower::{service_fn, ServiceBuilder, ServiceExt};

fn ten_per_second(clock: &ManualClock) -> AdmissionController<ManualClock> {
    let config = AdmissionConfig::default().capacity(10).refill_period(Duration::from_secs(1));
    AdmissionController::with_clock(config, clock.clone()).unwrap()
}

#[test]
fn burst_of_ten_then_denied_then_refilled() {
    let clock = ManualClock::new();
    let limiter = ten_per_second(&clock);

    for i in 0..10 {
        assert!(limiter.allow("203.0.113.7"), "request {i} should be admitted");
    }
    assert!(!limiter.allow("203.0.113.7"));

    clock.advance(Duration::from_secs(1));
    assert!(limiter.allow("203.0.113.7"));
    assert!(!limiter.allow("203.0.113.7"));
}

#[test]
fn partial_period_credits_nothing() {
    let clock = ManualClock::new();
    let limiter = ten_per_second(&clock);
    for _ in 0..10 {
        limiter.allow("c");
    }

    clock.advance(Duration::from_millis(999));
    assert_eq!(limiter.check("c"), Decision::Denied { retry_after: Duration::from_millis(1) });

    clock.advance(Duration::from_millis(1));
    assert_eq!(limiter.check("c"), Decision::Allowed { remaining: 0 });
}

#[test]
fn clients_do_not_share_buckets() {
    let clock = ManualClock::new();
    let limiter = ten_per_second(&clock);
    while limiter.allow("198.51.100.1") {}

    assert!(limiter.allow("198.51.100.2"));
    assert_eq!(limiter.tokens("198.51.100.2"), Some(9));
    assert_eq!(limiter.tokens("198.51.100.1"), Some(0));
}

#[test]
fn long_idle_never_overfills() {
    let clock = ManualClock::new();
    let limiter = ten_per_second(&clock);
    limiter.allow("c");

    clock.advance(Duration::from_secs(3600));
    assert_eq!(limiter.check("c"), Decision::Allowed { remaining: 9 });
    let admitted = (0..20).filter(|_| limiter.allow("c")).count();
    assert_eq!(admitted, 9);
}

#[test]
fn concurrent_callers_never_overdraw() {
    let clock = ManualClock::new();
    let limiter = Arc::new(ten_per_second(&clock));
    let admitted = Arc::new(AtomicUsize::new(0));

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let limiter = limiter.clone();
            let admitted = admitted.clone();
            std::thread::spawn(move || {
                for _ in 0..25 {
                    if limiter.allow("shared") {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(admitted.load(Ordering::SeqCst), 10);
    let stats = limiter.stats();
    assert_eq!(stats.allowed, 10);
    assert_eq!(stats.denied, 190);
}

#[test]
fn idle_clients_are_forgotten_and_come_back_full() {
    let clock = ManualClock::new();
    let config = AdmissionConfig::default()
        .capacity(10)
        .refill_period(Duration::from_secs(1))
        .idle_ttl(Duration::from_secs(10));
    let limiter = AdmissionController::with_clock(config, clock.clone()).unwrap();

    for _ in 0..10 {
        limiter.allow("idle");
    }
    limiter.allow("busy");

    clock.advance(Duration::from_secs(10));
    assert!(limiter.allow("busy"));
    // "idle" has been quiet for the full TTL; "busy" was just seen.
    assert_eq!(limiter.evict_idle(), 1);
    assert_eq!(limiter.stats().tracked_clients, 1);
    assert_eq!(limiter.stats().evicted, 1);

    assert_eq!(limiter.check("idle"), Decision::Allowed { remaining: 9 });
}

#[test]
fn ttl_shorter_than_full_refill_is_refused() {
    let config = AdmissionConfig::default()
        .capacity(10)
        .refill_period(Duration::from_secs(1))
        .idle_ttl(Duration::from_secs(5));
    assert!(AdmissionController::new(config).is_err());
}

#[tokio::test]
async fn layer_rejects_before_reaching_the_service() {
    let clock = ManualClock::new();
    let config = AdmissionConfig::default().capacity(2).refill_period(Duration::from_secs(1));
    let limiter = Arc::new(AdmissionController::with_clock(config, clock.clone()).unwrap());
    let calls = Arc::new(AtomicUsize::new(0));

    let svc = {
        let calls = calls.clone();
        ServiceBuilder::new()
            .layer(AdmissionLayer::new(limiter.clone(), |req: &(&'static str, &'static str)| {
                req.0.to_string()
            }))
            .service(service_fn(move |req: (&'static str, &'static str)| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, std::convert::Infallible>(format!("queued {}", req.1)) }
            }))
    };

    let peer = "192.0.2.10";
    assert_eq!(svc.clone().oneshot((peer, "a")).await.unwrap(), "queued a");
    assert_eq!(svc.clone().oneshot((peer, "b")).await.unwrap(), "queued b");
    let err = svc.clone().oneshot((peer, "c")).await.unwrap_err();
    assert!(err.is_rejected());
    assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));
    assert!(matches!(err, AdmissionError::Rejected { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    assert!(svc.clone().oneshot(("192.0.2.11", "d")).await.is_ok());
    clock.advance(Duration::from_secs(1));
    assert!(svc.oneshot((peer, "e")).await.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}
