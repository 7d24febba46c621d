use super::common::{FakeLifecycle, pool_info, scheduler, spec};
use mcp_fleet::config::SpecKey;
use mcp_fleet::error::Error;
use mcp_fleet::server::InstanceState;

#[tokio::test]
async fn test_min_ready_reaches_target() {
    let lifecycle = FakeLifecycle::new();
    let svc = spec("svc");
    let key = SpecKey::of(&svc);
    let scheduler = scheduler(lifecycle.clone(), &[svc]);

    scheduler.set_desired_min_ready(&key, 3).await.unwrap();

    let info = pool_info(&scheduler, &key);
    assert_eq!(info.desired_min_ready, 3);
    assert_eq!(info.instances.len(), 3);
    assert!(info.instances.iter().all(|i| i.state == InstanceState::Ready));
    assert_eq!(info.pending_starts, 0);
    assert_eq!(lifecycle.starts(), 3);

    // Already satisfied
    scheduler.set_desired_min_ready(&key, 2).await.unwrap();
    assert_eq!(lifecycle.starts(), 3);
}

#[tokio::test]
async fn test_min_ready_failures_are_reported() {
    let lifecycle = FakeLifecycle::new();
    lifecycle.fail_next(2);
    let svc = spec("svc");
    let key = SpecKey::of(&svc);
    let scheduler = scheduler(lifecycle.clone(), &[svc]);

    let err = scheduler.set_desired_min_ready(&key, 3).await.unwrap_err();
    assert!(matches!(err, Error::MinReady(_)));
    assert_eq!(lifecycle.starts(), 3);
    assert_eq!(pool_info(&scheduler, &key).instances.len(), 1);
}

#[tokio::test]
async fn test_panicking_start_recovers() {
    let lifecycle = FakeLifecycle::new();
    lifecycle.panic_next(1);
    let svc = spec("svc");
    let key = SpecKey::of(&svc);
    let scheduler = scheduler(lifecycle.clone(), &[svc]);

    let err = scheduler.set_desired_min_ready(&key, 1).await.unwrap_err();
    assert!(matches!(err, Error::StartPanicked(msg) if msg.contains("lifecycle exploded")));

    let info = pool_info(&scheduler, &key);
    assert!(info.instances.is_empty());
    assert_eq!(info.pending_starts, 0);

    scheduler.set_desired_min_ready(&key, 1).await.unwrap();
    assert_eq!(pool_info(&scheduler, &key).instances.len(), 1);
    assert_eq!(lifecycle.starts(), 2);
}

#[tokio::test]
async fn test_panicking_coordinated_start_is_reported() {
    let lifecycle = FakeLifecycle::new();
    lifecycle.panic_next(1);
    let svc = spec("svc");
    let key = SpecKey::of(&svc);
    let scheduler = scheduler(lifecycle.clone(), &[svc]);

    let err = scheduler.acquire(&key, "").await.unwrap_err();
    assert!(matches!(err, Error::StartPanicked(_)));
    assert_eq!(pool_info(&scheduler, &key).pending_starts, 0);

    let instance = scheduler.acquire(&key, "").await.unwrap();
    assert_eq!(instance.id(), "svc-2");
}

#[tokio::test]
async fn test_min_ready_on_unknown_key() {
    let lifecycle = FakeLifecycle::new();
    let scheduler = scheduler(lifecycle, &[spec("svc")]);
    let missing = SpecKey::of(&spec("missing"));

    let err = scheduler.set_desired_min_ready(&missing, 1).await.unwrap_err();
    assert!(matches!(err, Error::UnknownSpecKey(_)));
}
