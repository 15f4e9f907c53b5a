//! Exponential backoff schedule and jitter bounds.

use std::sync::Arc;
use std::time::Duration;

use callwarden::orchestrator::retry::{Backoff, FixedJitter, JitterSource, RandomJitter};

fn fixed(base_ms: u64, cap_ms: u64, jitter_ms: u64, fixed_ms: u64) -> Backoff {
    Backoff::new(
        Duration::from_millis(base_ms),
        Duration::from_millis(cap_ms),
        Duration::from_millis(jitter_ms),
    )
    .with_jitter_source(Arc::new(FixedJitter(Duration::from_millis(fixed_ms))))
}

#[test]
fn delay_doubles_per_retry() {
    let backoff = fixed(100, 10_000, 0, 0);
    assert_eq!(backoff.delay(0), Duration::from_millis(100));
    assert_eq!(backoff.delay(1), Duration::from_millis(200));
    assert_eq!(backoff.delay(2), Duration::from_millis(400));
    assert_eq!(backoff.delay(3), Duration::from_millis(800));
}

#[test]
fn delay_is_capped_before_jitter() {
    let backoff = fixed(100, 1_000, 50, 50);
    assert_eq!(backoff.delay(10), Duration::from_millis(1_050));
    assert_eq!(backoff.delay(31), Duration::from_millis(1_050));
    assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(1_050));
    assert_eq!(backoff.cap(), Duration::from_millis(1_000));
}

#[test]
fn fixed_jitter_is_clamped_to_maximum() {
    let jitter = FixedJitter(Duration::from_millis(900));
    assert_eq!(
        jitter.jitter(Duration::from_millis(100)),
        Duration::from_millis(100)
    );
}

#[test]
fn random_jitter_stays_within_bounds() {
    let max = Duration::from_millis(25);
    for _ in 0..200 {
        assert!(RandomJitter.jitter(max) <= max);
    }
    assert_eq!(RandomJitter.jitter(Duration::ZERO), Duration::ZERO);
}

#[test]
fn random_backoff_stays_above_exponential_floor() {
    let backoff = Backoff::new(
        Duration::from_millis(10),
        Duration::from_secs(60),
        Duration::from_millis(5),
    );
    for n in 0..6 {
        let floor = Duration::from_millis(10 * 2u64.pow(n));
        let delay = backoff.delay(n);
        assert!(delay >= floor, "delay({n}) = {delay:?} below {floor:?}");
        assert!(delay <= floor + Duration::from_millis(5));
    }
}
