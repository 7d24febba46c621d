use super::common::{FakeLifecycle, pool_info, scheduler, settle, spec};
use mcp_fleet::config::{ServerSpec, SpecKey, Strategy};
use mcp_fleet::error::Error;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_concurrent_cold_start_runs_once() {
    let lifecycle = FakeLifecycle::gated();
    let svc = ServerSpec {
        max_concurrent: 3,
        ..spec("svc")
    };
    let key = SpecKey::of(&svc);
    let scheduler = scheduler(lifecycle.clone(), &[svc]);

    let callers: Vec<_> = (0..3)
        .map(|_| {
            let scheduler = scheduler.clone();
            let key = key.clone();
            tokio::spawn(async move { scheduler.acquire(&key, "").await })
        })
        .collect();
    settle().await;
    assert_eq!(lifecycle.starts(), 1);
    assert_eq!(pool_info(&scheduler, &key).pending_starts, 1);

    lifecycle.open(1);
    let mut ids = Vec::new();
    for caller in callers {
        ids.push(caller.await.unwrap().unwrap().id().to_string());
    }
    assert_eq!(ids, vec!["svc-1"; 3]);
    assert_eq!(lifecycle.starts(), 1);

    let info = pool_info(&scheduler, &key);
    assert_eq!(info.instances.len(), 1);
    assert_eq!(info.instances[0].busy_count, 3);
    assert_eq!(info.pending_starts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_start_lets_followers_retry() {
    let lifecycle = FakeLifecycle::gated();
    lifecycle.fail_next(1);
    let svc = ServerSpec {
        max_concurrent: 3,
        ..spec("svc")
    };
    let key = SpecKey::of(&svc);
    let scheduler = scheduler(lifecycle.clone(), &[svc]);

    let callers: Vec<_> = (0..4)
        .map(|_| {
            let scheduler = scheduler.clone();
            let key = key.clone();
            tokio::spawn(async move { scheduler.acquire(&key, "").await })
        })
        .collect();
    settle().await;
    assert_eq!(lifecycle.starts(), 1);
    lifecycle.open(2);

    let mut ok = 0;
    let mut failed = 0;
    for caller in callers {
        match caller.await.unwrap() {
            Ok(_) => ok += 1,
            Err(Error::Lifecycle(_)) => failed += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    // The three followers regroup behind a single retry
    assert_eq!((ok, failed), (3, 1));
    assert_eq!(lifecycle.starts(), 2);
    let info = pool_info(&scheduler, &key);
    assert_eq!(info.instances.len(), 1);
    assert_eq!(info.instances[0].busy_count, 3);
}

#[tokio::test(start_paused = true)]
async fn test_singleton_waits_for_release() {
    let lifecycle = FakeLifecycle::new();
    let svc = ServerSpec {
        strategy: Strategy::Singleton,
        ..spec("solo")
    };
    let key = SpecKey::of(&svc);
    let scheduler = scheduler(lifecycle.clone(), &[svc]);

    let first = scheduler.acquire(&key, "").await.unwrap();
    let waiter = {
        let scheduler = scheduler.clone();
        let key = key.clone();
        tokio::spawn(async move { scheduler.acquire(&key, "").await })
    };
    settle().await;
    assert!(!waiter.is_finished());
    assert_eq!(lifecycle.starts(), 1);

    scheduler.release(&first);
    let second = waiter.await.unwrap().unwrap();
    assert_eq!(second.id(), first.id());
    assert_eq!(lifecycle.starts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_leader_does_not_cancel_shared_start() {
    let lifecycle = FakeLifecycle::gated();
    let svc = spec("svc");
    let key = SpecKey::of(&svc);
    let scheduler = scheduler(lifecycle.clone(), &[svc]);

    let leader = {
        let scheduler = scheduler.clone();
        let key = key.clone();
        tokio::spawn(async move {
            tokio::time::timeout(Duration::from_millis(50), scheduler.acquire(&key, "")).await
        })
    };
    settle().await;
    let follower = {
        let scheduler = scheduler.clone();
        let key = key.clone();
        tokio::spawn(async move { scheduler.acquire(&key, "").await })
    };
    settle().await;

    // The leader gives up while the start is still gated
    assert!(leader.await.unwrap().is_err());

    lifecycle.open(1);
    let instance = follower.await.unwrap().unwrap();
    assert_eq!(instance.id(), "svc-1");
    assert_eq!(lifecycle.starts(), 1);
    assert_eq!(lifecycle.cancelled_starts.load(Ordering::SeqCst), 0);
    assert_eq!(pool_info(&scheduler, &key).instances.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_spec_supersedes_start_in_flight() {
    let lifecycle = FakeLifecycle::gated();
    let svc = spec("svc");
    let key = SpecKey::of(&svc);
    let scheduler = scheduler(lifecycle.clone(), &[svc]);

    let leader = {
        let scheduler = scheduler.clone();
        let key = key.clone();
        tokio::spawn(async move { scheduler.acquire(&key, "").await })
    };
    settle().await;
    let follower = {
        let scheduler = scheduler.clone();
        let key = key.clone();
        tokio::spawn(async move { scheduler.acquire(&key, "").await })
    };
    settle().await;

    scheduler.stop_spec(&key, "operator request").await.unwrap();
    let err = follower.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::NoCapacity(_)));

    lifecycle.open(1);
    let err = leader.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::NoCapacity(_)));

    // The late instance was stopped, never registered
    assert_eq!(lifecycle.stops(), 1);
    assert!(pool_info(&scheduler, &key).instances.is_empty());

    // The pool serves new acquisitions afterwards
    lifecycle.open(1);
    let instance = scheduler.acquire(&key, "").await.unwrap();
    assert_eq!(instance.id(), "svc-2");
}

#[tokio::test(start_paused = true)]
async fn test_stop_all_cancels_start_in_flight() {
    let lifecycle = FakeLifecycle::gated();
    let svc = spec("svc");
    let key = SpecKey::of(&svc);
    let scheduler = scheduler(lifecycle.clone(), &[svc]);

    let caller = {
        let scheduler = scheduler.clone();
        let key = key.clone();
        tokio::spawn(async move { scheduler.acquire(&key, "").await })
    };
    settle().await;

    scheduler.stop_all().await;
    assert!(caller.await.unwrap().is_err());
    assert_eq!(lifecycle.cancelled_starts.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.pool_count(), 0);
}
