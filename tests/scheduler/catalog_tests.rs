use super::common::{FakeLifecycle, pool_info, registry, scheduler, settle, spec};
use mcp_fleet::config::{CatalogDiff, ServerSpec, SpecKey};
use mcp_fleet::error::Error;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_removed_spec_drops_its_pool() {
    let lifecycle = FakeLifecycle::new();
    let (a, b) = (spec("a"), spec("b"));
    let (key_a, key_b) = (SpecKey::of(&a), SpecKey::of(&b));
    let scheduler = scheduler(lifecycle.clone(), &[a.clone(), b.clone()]);
    scheduler.set_desired_min_ready(&key_a, 1).await.unwrap();
    scheduler.set_desired_min_ready(&key_b, 2).await.unwrap();
    assert_eq!(scheduler.pool_count(), 2);

    let old = registry(&[a.clone(), b]);
    let new = registry(&[a]);
    let diff = CatalogDiff::between(&old, &new);
    scheduler
        .apply_catalog_diff(&CancellationToken::new(), &diff, new)
        .await
        .unwrap();

    assert_eq!(scheduler.pool_count(), 1);
    assert_eq!(lifecycle.stops(), 2);
    assert!(scheduler.spec(&key_b).is_none());
    let err = scheduler.acquire(&key_b, "").await.unwrap_err();
    assert!(matches!(err, Error::UnknownSpecKey(_)));
    assert_eq!(pool_info(&scheduler, &key_a).instances.len(), 1);
}

#[tokio::test]
async fn test_updated_spec_is_used_by_live_pool() {
    let lifecycle = FakeLifecycle::new();
    let before = spec("svc");
    let after = ServerSpec {
        max_concurrent: 2,
        ..before.clone()
    };
    let key = SpecKey::of(&before);
    let scheduler = scheduler(lifecycle.clone(), &[before.clone()]);

    let first = scheduler.acquire(&key, "").await.unwrap();

    let old = registry(&[before]);
    let new = registry(&[after]);
    let diff = CatalogDiff::between(&old, &new);
    assert_eq!(diff.updated_spec_keys, vec![key.clone()]);
    scheduler
        .apply_catalog_diff(&CancellationToken::new(), &diff, new)
        .await
        .unwrap();

    // The running instance now takes a second call
    let second = scheduler.acquire(&key, "").await.unwrap();
    assert_eq!(second.id(), first.id());
    assert_eq!(lifecycle.starts(), 1);
    assert_eq!(scheduler.spec(&key).unwrap().max_concurrent, 2);
}

#[tokio::test]
async fn test_added_spec_becomes_acquirable() {
    let lifecycle = FakeLifecycle::new();
    let (a, b) = (spec("a"), spec("b"));
    let key_b = SpecKey::of(&b);
    let scheduler = scheduler(lifecycle.clone(), &[a.clone()]);
    assert!(scheduler.acquire(&key_b, "").await.is_err());

    let old = registry(&[a.clone()]);
    let new = registry(&[a, b]);
    let diff = CatalogDiff::between(&old, &new);
    scheduler
        .apply_catalog_diff(&CancellationToken::new(), &diff, new)
        .await
        .unwrap();

    let instance = scheduler.acquire(&key_b, "").await.unwrap();
    assert_eq!(instance.id(), "b-1");
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_apply_finishes_stops_in_background() {
    let lifecycle = FakeLifecycle::new();
    let (a, b) = (spec("a"), spec("b"));
    let key_b = SpecKey::of(&b);
    let scheduler = scheduler(lifecycle.clone(), &[a.clone(), b.clone()]);
    scheduler.set_desired_min_ready(&key_b, 2).await.unwrap();

    let old = registry(&[a.clone(), b]);
    let new = registry(&[a]);
    let diff = CatalogDiff::between(&old, &new);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = scheduler
        .apply_catalog_diff(&cancel, &diff, new)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled(_)));

    // Pool entry and registry are updated regardless
    assert_eq!(scheduler.pool_count(), 0);
    assert!(scheduler.spec(&key_b).is_none());

    settle().await;
    assert_eq!(lifecycle.stops(), 2);
}

#[tokio::test]
async fn test_removed_spec_is_not_recreated_while_stopping() {
    let lifecycle = FakeLifecycle::stop_gated();
    let (a, b) = (spec("a"), spec("b"));
    let key_a = SpecKey::of(&a);
    let scheduler = scheduler(lifecycle.clone(), &[a.clone(), b.clone()]);
    scheduler.set_desired_min_ready(&key_a, 1).await.unwrap();

    let old = registry(&[a, b.clone()]);
    let new = registry(&[b]);
    let diff = CatalogDiff::between(&old, &new);
    let apply = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            scheduler
                .apply_catalog_diff(&CancellationToken::new(), &diff, new)
                .await
        })
    };
    settle().await;
    // The stop of a-1 is still in progress
    assert_eq!(lifecycle.stops(), 1);
    assert!(!apply.is_finished());

    let err = scheduler.acquire(&key_a, "").await.unwrap_err();
    assert!(matches!(err, Error::UnknownSpecKey(_)));
    assert_eq!(scheduler.pool_count(), 0);

    lifecycle.open_stops(1);
    apply.await.unwrap().unwrap();
    assert_eq!(scheduler.pool_count(), 0);
    assert_eq!(lifecycle.starts(), 1);
    assert!(scheduler.get_pool_status().is_empty());
}

#[tokio::test]
async fn test_cancel_lets_running_stop_finish() {
    let lifecycle = FakeLifecycle::stop_gated();
    let b = spec("b");
    let key_b = SpecKey::of(&b);
    let scheduler = scheduler(lifecycle.clone(), &[b.clone()]);
    scheduler.set_desired_min_ready(&key_b, 2).await.unwrap();

    let old = registry(&[b]);
    let new = registry(&[]);
    let diff = CatalogDiff::between(&old, &new);
    let cancel = CancellationToken::new();
    let apply = {
        let scheduler = scheduler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.apply_catalog_diff(&cancel, &diff, new).await })
    };
    settle().await;
    assert_eq!(lifecycle.stops(), 1);

    cancel.cancel();
    let err = apply.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Cancelled(_)));

    lifecycle.open_stops(2);
    settle().await;
    // Each instance is stopped exactly once
    assert_eq!(lifecycle.stops(), 2);
}

#[tokio::test]
async fn test_removal_of_unused_spec_is_a_noop() {
    let lifecycle = FakeLifecycle::new();
    let (a, b) = (spec("a"), spec("b"));
    let scheduler = scheduler(lifecycle.clone(), &[a.clone(), b.clone()]);

    let old = registry(&[a.clone(), b]);
    let new = registry(&[a]);
    let diff = CatalogDiff::between(&old, &new);
    scheduler
        .apply_catalog_diff(&CancellationToken::new(), &diff, new)
        .await
        .unwrap();

    assert_eq!(scheduler.pool_count(), 0);
    assert_eq!(lifecycle.stops(), 0);
}
