use super::common::{FakeLifecycle, pool_info, scheduler, spec, stateful};
use mcp_fleet::config::{ServerSpec, SpecKey, Strategy};
use mcp_fleet::error::Error;
use mcp_fleet::server::InstanceState;
use std::time::Duration;

#[tokio::test]
async fn test_acquire_starts_then_reuses() {
    let lifecycle = FakeLifecycle::new();
    let svc = spec("svc");
    let key = SpecKey::of(&svc);
    let scheduler = scheduler(lifecycle.clone(), &[svc]);

    let first = scheduler.acquire(&key, "").await.unwrap();
    assert_eq!(first.id(), "svc-1");
    scheduler.release(&first);

    let second = scheduler.acquire(&key, "").await.unwrap();
    assert_eq!(second.id(), "svc-1");
    assert_eq!(lifecycle.starts(), 1);
    scheduler.release(&second);
}

#[tokio::test(start_paused = true)]
async fn test_busy_count_and_idle_reap_end_to_end() {
    let lifecycle = FakeLifecycle::new();
    let svc = ServerSpec {
        max_concurrent: 2,
        idle_seconds: 10,
        ..spec("svc")
    };
    let key = SpecKey::of(&svc);
    let scheduler = scheduler(lifecycle.clone(), &[svc]);

    let a = scheduler.acquire(&key, "").await.unwrap();
    let b = scheduler.acquire(&key, "").await.unwrap();
    assert_eq!(a.id(), b.id());
    assert_eq!(a.busy_count(), 2);
    assert_eq!(a.state(), InstanceState::Busy);

    scheduler.release(&a);
    assert_eq!(a.busy_count(), 1);
    assert_eq!(a.state(), InstanceState::Busy);

    scheduler.release(&b);
    assert_eq!(a.busy_count(), 0);
    assert_eq!(a.state(), InstanceState::Ready);

    // Not idle long enough yet
    tokio::time::advance(Duration::from_secs(5)).await;
    scheduler.reap_idle().await;
    assert_eq!(pool_info(&scheduler, &key).instances.len(), 1);

    tokio::time::advance(Duration::from_secs(6)).await;
    scheduler.reap_idle().await;
    assert_eq!(pool_info(&scheduler, &key).instances.len(), 0);
    assert_eq!(lifecycle.stops(), 1);
    assert_eq!(a.state(), InstanceState::Stopped);
}

#[tokio::test]
async fn test_release_never_goes_below_zero() {
    let lifecycle = FakeLifecycle::new();
    let svc = spec("svc");
    let key = SpecKey::of(&svc);
    let scheduler = scheduler(lifecycle, &[svc]);

    let instance = scheduler.acquire(&key, "").await.unwrap();
    scheduler.release(&instance);
    scheduler.release(&instance);
    assert_eq!(instance.busy_count(), 0);
    assert_eq!(instance.state(), InstanceState::Ready);
}

#[tokio::test]
async fn test_sticky_binding_persists() {
    let lifecycle = FakeLifecycle::new();
    let svc = stateful("mem", 1, 0);
    let key = SpecKey::of(&svc);
    let scheduler = scheduler(lifecycle.clone(), &[svc]);

    let first = scheduler.acquire(&key, "session-a").await.unwrap();
    assert_eq!(first.sticky_key(), "session-a");
    scheduler.release(&first);

    let again = scheduler.acquire(&key, "session-a").await.unwrap();
    assert_eq!(again.id(), first.id());
    scheduler.release(&again);

    // Another session may not share the bound instance
    let other = scheduler.acquire(&key, "session-b").await.unwrap();
    assert_ne!(other.id(), first.id());
    assert_eq!(other.sticky_key(), "session-b");
    assert_eq!(lifecycle.starts(), 2);
    scheduler.release(&other);
}

#[tokio::test]
async fn test_saturated_sticky_instance_is_reported_busy() {
    let lifecycle = FakeLifecycle::new();
    let svc = stateful("mem", 1, 0);
    let key = SpecKey::of(&svc);
    let scheduler = scheduler(lifecycle.clone(), &[svc]);

    let held = scheduler.acquire(&key, "session-a").await.unwrap();
    let err = scheduler.acquire(&key, "session-a").await.unwrap_err();
    match err {
        Error::StickyBusy {
            spec_key,
            routing_key,
        } => {
            assert_eq!(spec_key, key);
            assert_eq!(routing_key, "session-a");
        }
        other => panic!("expected StickyBusy, got {other:?}"),
    }
    assert_eq!(lifecycle.starts(), 1);

    scheduler.release(&held);
    let again = scheduler.acquire(&key, "session-a").await.unwrap();
    assert_eq!(again.id(), held.id());
}

#[tokio::test]
async fn test_empty_routing_key_does_not_bind() {
    let lifecycle = FakeLifecycle::new();
    let svc = stateful("mem", 2, 0);
    let key = SpecKey::of(&svc);
    let scheduler = scheduler(lifecycle, &[svc]);

    let instance = scheduler.acquire(&key, "").await.unwrap();
    assert_eq!(instance.sticky_key(), "");
    scheduler.release(&instance);
}

#[tokio::test]
async fn test_unknown_spec_key() {
    let lifecycle = FakeLifecycle::new();
    let scheduler = scheduler(lifecycle.clone(), &[spec("svc")]);
    let missing = SpecKey::of(&spec("missing"));

    let err = scheduler.acquire(&missing, "").await.unwrap_err();
    assert!(matches!(err, Error::UnknownSpecKey(k) if k == missing));
    assert_eq!(lifecycle.starts(), 0);
    assert_eq!(scheduler.pool_count(), 0);
}

#[tokio::test]
async fn test_acquire_ready_never_starts() {
    let lifecycle = FakeLifecycle::new();
    let svc = spec("svc");
    let key = SpecKey::of(&svc);
    let scheduler = scheduler(lifecycle.clone(), &[svc]);

    let err = scheduler.acquire_ready(&key, "").await.unwrap_err();
    assert!(matches!(err, Error::NoReadyInstance(_)));
    assert_eq!(lifecycle.starts(), 0);
}

#[tokio::test]
async fn test_equal_load_rotates_round_robin() {
    let lifecycle = FakeLifecycle::new();
    let svc = ServerSpec {
        max_concurrent: 4,
        ..spec("svc")
    };
    let key = SpecKey::of(&svc);
    let scheduler = scheduler(lifecycle, &[svc]);
    scheduler.set_desired_min_ready(&key, 3).await.unwrap();

    let mut visited = Vec::new();
    for _ in 0..4 {
        let instance = scheduler.acquire_ready(&key, "").await.unwrap();
        visited.push(instance.id().to_string());
        scheduler.release(&instance);
    }
    assert_eq!(visited, vec!["svc-1", "svc-2", "svc-3", "svc-1"]);
}

#[tokio::test]
async fn test_least_loaded_instance_wins() {
    let lifecycle = FakeLifecycle::new();
    let svc = ServerSpec {
        max_concurrent: 4,
        ..spec("svc")
    };
    let key = SpecKey::of(&svc);
    let scheduler = scheduler(lifecycle, &[svc]);
    scheduler.set_desired_min_ready(&key, 2).await.unwrap();

    let a = scheduler.acquire_ready(&key, "").await.unwrap();
    let b = scheduler.acquire_ready(&key, "").await.unwrap();
    let c = scheduler.acquire_ready(&key, "").await.unwrap();
    assert_eq!(a.id(), "svc-1");
    assert_eq!(b.id(), "svc-2");
    assert_eq!(c.id(), "svc-1");

    // svc-1 holds two calls, svc-2 one
    let d = scheduler.acquire_ready(&key, "").await.unwrap();
    assert_eq!(d.id(), "svc-2");

    scheduler.release(&b);
    scheduler.release(&d);
    let e = scheduler.acquire_ready(&key, "").await.unwrap();
    assert_eq!(e.id(), "svc-2");
}

#[tokio::test]
async fn test_singleton_min_ready_is_capped() {
    let lifecycle = FakeLifecycle::new();
    let svc = ServerSpec {
        strategy: Strategy::Singleton,
        ..spec("solo")
    };
    let key = SpecKey::of(&svc);
    let scheduler = scheduler(lifecycle.clone(), &[svc]);

    scheduler.set_desired_min_ready(&key, 3).await.unwrap();
    let info = pool_info(&scheduler, &key);
    assert_eq!(info.desired_min_ready, 1);
    assert_eq!(info.instances.len(), 1);
    assert_eq!(lifecycle.starts(), 1);
}

#[tokio::test]
async fn test_pool_status_reports_counts() {
    let lifecycle = FakeLifecycle::new();
    let svc = ServerSpec {
        max_concurrent: 2,
        ..spec("svc")
    };
    let key = SpecKey::of(&svc);
    let scheduler = scheduler(lifecycle, &[svc]);
    scheduler.set_desired_min_ready(&key, 2).await.unwrap();
    let held = scheduler.acquire(&key, "").await.unwrap();

    let info = pool_info(&scheduler, &key);
    assert_eq!(info.server_name, "svc");
    assert_eq!(info.strategy, Strategy::Stateless);
    assert_eq!(info.pending_starts, 0);
    assert_eq!(info.stats.total, 2);
    assert_eq!(info.stats.busy, 1);
    assert_eq!(info.stats.ready, 1);

    scheduler.release(&held);
}

#[tokio::test]
async fn test_stop_all_stops_everything() {
    let lifecycle = FakeLifecycle::new();
    let a = spec("a");
    let b = spec("b");
    let (key_a, key_b) = (SpecKey::of(&a), SpecKey::of(&b));
    let scheduler = scheduler(lifecycle.clone(), &[a, b]);
    scheduler.set_desired_min_ready(&key_a, 2).await.unwrap();
    scheduler.set_desired_min_ready(&key_b, 1).await.unwrap();

    scheduler.stop_all().await;
    assert_eq!(lifecycle.stops(), 3);
    assert_eq!(scheduler.pool_count(), 0);
    assert!(scheduler.get_pool_status().is_empty());
}
