//! End-to-end behavior of memoizers on the in-process backend

mod support;

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use memora_common::testing::init_test_tracing;
use memora_common::MockClock;
use memora_domain::{ArgValue, CallArgs, CallError};
use support::{Counter, MemoryFixture};

fn counted(calls: &Counter, value: u64) -> impl Fn() -> Result<u64, String> + Clone {
    let calls = calls.clone();
    move || {
        calls.bump();
        Ok(value)
    }
}

#[test]
fn test_repeated_call_hits_cache() {
    init_test_tracing();
    let clock = MockClock::new();
    let fixture = MemoryFixture::new(&clock);
    let memo = fixture.memoizer::<u64>("orders::total", 60.0);
    let calls = Counter::default();
    let compute = counted(&calls, 42);

    let first = memo.call_blocking(CallArgs::new().arg("order", 7), compute.clone()).unwrap();
    let second = memo.call_blocking(CallArgs::new().arg("order", 7), compute).unwrap();

    assert_eq!((first, second), (42, 42));
    assert_eq!(calls.count(), 1);
}

#[test]
fn test_entry_expires_strictly_after_ttl() {
    let clock = MockClock::new();
    let fixture = MemoryFixture::new(&clock);
    let memo = fixture.memoizer::<u64>("orders::expiry", 10.0);
    let calls = Counter::default();
    let compute = counted(&calls, 1);
    let args = || CallArgs::new().arg("order", 1);

    memo.call_blocking(args(), compute.clone()).unwrap();
    clock.advance(Duration::from_secs(10));
    memo.call_blocking(args(), compute.clone()).unwrap();
    assert_eq!(calls.count(), 1, "still fresh exactly at the deadline");

    clock.advance_millis(1);
    memo.call_blocking(args(), compute).unwrap();
    assert_eq!(calls.count(), 2);
}

#[test]
fn test_arguments_select_entries() {
    let clock = MockClock::new();
    let fixture = MemoryFixture::new(&clock);
    let memo = fixture.memoizer::<u64>("math::double", 60.0);
    let calls = Counter::default();

    for n in [5_u64, 10, 5] {
        let calls = calls.clone();
        let value = memo
            .call_blocking(CallArgs::new().arg("n", n), move || {
                calls.bump();
                Ok::<_, String>(n * 2)
            })
            .unwrap();
        assert_eq!(value, n * 2);
    }

    assert_eq!(calls.count(), 2);
}

#[test]
fn test_sequence_order_matters_set_order_does_not() {
    let clock = MockClock::new();
    let fixture = MemoryFixture::new(&clock);
    let memo = fixture.memoizer::<u64>("shapes::area", 60.0);

    let seq_a = memo.key_for(&CallArgs::new().arg("xs", vec![1, 2, 3])).unwrap();
    let seq_b = memo.key_for(&CallArgs::new().arg("xs", vec![3, 2, 1])).unwrap();
    assert_ne!(seq_a, seq_b);

    let set_a: HashSet<i64> = [1, 2, 3].into_iter().collect();
    let set_b: HashSet<i64> = [3, 1, 2].into_iter().collect();
    let set_a = memo.key_for(&CallArgs::new().arg("xs", set_a)).unwrap();
    let set_b = memo.key_for(&CallArgs::new().arg("xs", set_b)).unwrap();
    assert_eq!(set_a, set_b);

    let map_ab = ArgValue::map([("a", 1), ("b", 2)]);
    let map_ba = ArgValue::map([("b", 2), ("a", 1)]);
    let map_ab = memo.key_for(&CallArgs::new().arg("m", map_ab)).unwrap();
    let map_ba = memo.key_for(&CallArgs::new().arg("m", map_ba)).unwrap();
    assert_ne!(map_ab, map_ba, "map insertion order is part of the key");

    let sorted: BTreeMap<&str, i64> = [("b", 2), ("a", 1)].into_iter().collect();
    let sorted = memo.key_for(&CallArgs::new().arg("m", sorted)).unwrap();
    assert_eq!(sorted, map_ab);
}

#[test]
fn test_skip_cache_recomputes_and_overwrites() {
    let clock = MockClock::new();
    let fixture = MemoryFixture::new(&clock);
    let memo = fixture.memoizer::<u64>("quotes::latest", 60.0);
    let calls = Counter::default();
    let next = {
        let calls = calls.clone();
        move || Ok::<_, String>(calls.bump() as u64)
    };

    let first = memo.call_blocking(CallArgs::new().arg("sym", "ACME"), next.clone()).unwrap();
    let forced = memo
        .call_blocking(CallArgs::new().arg("sym", "ACME").arg("skip_cache", true), next.clone())
        .unwrap();
    let cached = memo.call_blocking(CallArgs::new().arg("sym", "ACME"), next).unwrap();

    assert_eq!((first, forced, cached), (1, 2, 2));
}

#[test]
fn test_failures_are_not_cached() {
    let clock = MockClock::new();
    let fixture = MemoryFixture::new(&clock);
    let memo = fixture.memoizer::<u64>("flaky::fetch", 60.0);
    let calls = Counter::default();
    let flaky = {
        let calls = calls.clone();
        move || match calls.bump() {
            1 => Err("upstream timed out".to_string()),
            _ => Ok(9),
        }
    };

    let err = memo.call_blocking(CallArgs::new(), flaky.clone()).unwrap_err();
    assert!(matches!(err, CallError::Computation(ref msg) if msg == "upstream timed out"));

    assert_eq!(memo.call_blocking(CallArgs::new(), flaky).unwrap(), 9);
    assert_eq!(calls.count(), 2);
}

#[test]
fn test_ignored_fields_share_an_entry() {
    let clock = MockClock::new();
    let fixture = MemoryFixture::new(&clock);
    let memo = fixture
        .builder::<u64>("users::profile")
        .ttl_secs(60.0)
        .ignore_fields(["request_id"])
        .build()
        .unwrap();
    let calls = Counter::default();
    let compute = counted(&calls, 3);

    memo.call_blocking(CallArgs::new().arg("id", 1).arg("request_id", "a"), compute.clone())
        .unwrap();
    memo.call_blocking(CallArgs::new().arg("id", 1).arg("request_id", "b"), compute).unwrap();

    assert_eq!(calls.count(), 1);
}

#[test]
fn test_concurrent_threads_compute_once() {
    let clock = MockClock::new();
    let fixture = MemoryFixture::new(&clock);
    let memo = fixture.memoizer::<u64>("reports::slow", 60.0);
    let calls = Counter::default();
    let barrier = Arc::new(Barrier::new(5));

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let memo = memo.clone();
            let calls = calls.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                memo.call_blocking(CallArgs::new().arg("id", 1), move || {
                    calls.bump();
                    std::thread::sleep(Duration::from_millis(100));
                    Ok::<_, String>(11)
                })
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap().unwrap(), 11);
    }
    assert_eq!(calls.count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_tasks_compute_once() {
    let clock = MockClock::new();
    let fixture = MemoryFixture::new(&clock);
    let memo = fixture.memoizer::<u64>("reports::slow_async", 60.0);
    let calls = Counter::default();

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let memo = memo.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                memo.call(CallArgs::new().arg("id", 1), move || {
                    let calls = calls.clone();
                    async move {
                        calls.bump();
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, String>(12)
                    }
                })
                .await
            })
        })
        .collect();

    for result in futures::future::join_all(tasks).await {
        assert_eq!(result.unwrap().unwrap(), 12);
    }
    assert_eq!(calls.count(), 1);
}

#[test]
fn test_invalidate_forces_recompute() {
    let clock = MockClock::new();
    let fixture = MemoryFixture::new(&clock);
    let memo = fixture.memoizer::<u64>("catalog::item", 60.0);
    let calls = Counter::default();
    let compute = counted(&calls, 5);
    let args = CallArgs::new().arg("sku", "X-1");

    memo.call_blocking(args.clone(), compute.clone()).unwrap();
    memo.invalidate_blocking(&args).unwrap();
    memo.call_blocking(args, compute).unwrap();

    assert_eq!(calls.count(), 2);
}

#[test]
fn test_sweeper_reclaims_expired_entries() {
    let clock = MockClock::new();
    let fixture = MemoryFixture::new(&clock);
    let memo = fixture.memoizer::<u64>("sessions::token", 1.0);

    for id in 0..3 {
        memo.call_blocking(CallArgs::new().arg("id", id), || Ok::<_, String>(0)).unwrap();
    }
    assert_eq!(fixture.store.len(), 3);

    clock.advance(Duration::from_millis(1_001));
    assert_eq!(fixture.store.sweep_once(), 3);
    assert!(fixture.store.is_empty());
}
