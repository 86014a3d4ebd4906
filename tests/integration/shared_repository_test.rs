//! Integration tests for several instances sharing one key directory
//!
//! Each instance has its own repository handle, manager and provider, the
//! way separate processes would, and all of them read the same files.

use chrono::{Duration, Utc};
use keyring_config::KeyRingConfig;
use keyring_rotation::{
    build_key_ring_provider, CacheableKeyRingProvider, KeyRingProvider, LocalKeyRepository,
    ManualClock, MasterKeyProtector, RotationScheduler, SigningAlgorithm,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn config(algorithm: &str) -> KeyRingConfig {
    KeyRingConfig {
        algorithm: algorithm.to_string(),
        rotation_period_days: 20,
        propagation_window_hours: 72,
        refresh_period_hours: 1,
        ..KeyRingConfig::default()
    }
}

async fn instance(
    dir: &Path,
    config: &KeyRingConfig,
    protector: &Arc<MasterKeyProtector>,
    clock: &Arc<ManualClock>,
) -> KeyRingProvider {
    let repository = Arc::new(LocalKeyRepository::new(dir).await.unwrap());
    build_key_ring_provider(config, repository, protector.clone(), clock.clone()).unwrap()
}

struct Cluster {
    dir: TempDir,
    a: KeyRingProvider,
    b: KeyRingProvider,
    clock: Arc<ManualClock>,
}

async fn cluster(algorithm: &str) -> Cluster {
    keyring_logging::init_test_logging();
    let dir = TempDir::new().unwrap();
    let config = config(algorithm);
    let protector = Arc::new(MasterKeyProtector::generate());
    let clock = Arc::new(ManualClock::new(Utc::now()));

    let a = instance(dir.path(), &config, &protector, &clock).await;
    let b = instance(dir.path(), &config, &protector, &clock).await;
    Cluster {
        dir,
        a,
        b,
        clock,
    }
}

#[tokio::test]
async fn test_second_instance_adopts_existing_key() {
    let c = cluster("EdDSA").await;

    let ring_a = c.a.get_current_key_ring().await.unwrap();
    let ring_b = c.b.get_current_key_ring().await.unwrap();

    assert_eq!(ring_a.default_key_id(), ring_b.default_key_id());
    assert_eq!(c.b.manager().get_all_keys().await.unwrap().len(), 1);

    let signature = ring_a.signing_credential().sign(b"id-token").unwrap();
    assert!(ring_b.verify(ring_a.default_key_id(), b"id-token", &signature));
}

#[tokio::test]
async fn test_rs256_keys_round_trip_through_disk() {
    let c = cluster("RS256").await;

    let ring_a = c.a.get_current_key_ring().await.unwrap();
    let credential = ring_a.signing_credential();
    assert_eq!(credential.algorithm(), SigningAlgorithm::Rs256);
    assert_eq!(credential.descriptor().key_size, 2048);

    let signature = credential.sign(b"access-token").unwrap();
    let ring_b = c.b.get_current_key_ring().await.unwrap();
    let validation = ring_b
        .validation_keys()
        .into_iter()
        .find(|k| k.key_id == credential.key_id())
        .unwrap();
    assert!(validation.verify(b"access-token", &signature));
}

#[tokio::test]
async fn test_rotation_propagates_before_switchover() {
    let c = cluster("EdDSA").await;
    let scheduler = RotationScheduler::new(c.a.clone(), std::time::Duration::from_secs(3600));

    let old = c.a.get_current_key_ring().await.unwrap();
    c.b.get_current_key_ring().await.unwrap();
    let old_expiry = old.default_key().expiration_date;

    // Enter the propagation window: instance A lines up the successor
    c.clock.set(old_expiry - Duration::hours(48));
    let check = scheduler.run_once().await.unwrap();
    let successor = check.rotated.unwrap();

    // Instance B refreshes on its own schedule and still signs with the old key
    let ring_b = c.b.get_current_key_ring().await.unwrap();
    assert_eq!(ring_b.default_key_id(), old.default_key_id());
    assert!(!ring_b.rotation_due());

    // Both switch at the old key's expiration
    c.clock.set(old_expiry);
    let ring_a = c.a.get_current_key_ring().await.unwrap();
    let ring_b = c.b.get_current_key_ring().await.unwrap();
    assert_eq!(ring_a.default_key_id(), successor);
    assert_eq!(ring_b.default_key_id(), successor);

    // Tokens signed with the old key keep validating through the grace period
    assert!(ring_b.valid_key_ids().any(|id| id == old.default_key_id()));
    c.clock.set(old_expiry + Duration::hours(73));
    let ring_b = c.b.get_current_key_ring().await.unwrap();
    assert!(ring_b.valid_key_ids().all(|id| id != old.default_key_id()));
}

#[tokio::test]
async fn test_revocation_reaches_other_instance_on_refresh() {
    let c = cluster("EdDSA").await;

    let ring = c.a.get_current_key_ring().await.unwrap();
    let compromised = ring.default_key_id().to_string();
    c.b.get_current_key_ring().await.unwrap();

    c.a.revoke_key(&compromised).await.unwrap();
    let ring_a = c.a.get_current_key_ring().await.unwrap();
    assert_ne!(ring_a.default_key_id(), compromised);

    // B keeps its cached ring until told otherwise
    let ring_b = c.b.get_current_key_ring().await.unwrap();
    assert_eq!(ring_b.default_key_id(), compromised);

    c.b.invalidate_cache();
    let ring_b = c.b.get_current_key_ring().await.unwrap();
    assert_eq!(ring_b.default_key_id(), ring_a.default_key_id());
    assert!(ring_b.valid_key_ids().all(|id| id != compromised));
}

#[tokio::test]
async fn test_corrupt_file_is_skipped() {
    let c = cluster("EdDSA").await;
    let ring = c.a.get_current_key_ring().await.unwrap();

    let dir = c.dir.path();
    tokio::fs::write(dir.join("garbage.json"), b"{ not json").await.unwrap();

    c.b.invalidate_cache();
    let ring_b = c.b.get_current_key_ring().await.unwrap();
    assert_eq!(ring_b.default_key_id(), ring.default_key_id());
    assert_eq!(ring_b.valid_key_ids().count(), 1);
}

#[tokio::test]
async fn test_scheduler_purges_retired_keys_from_disk() {
    let c = cluster("EdDSA").await;
    let scheduler = RotationScheduler::new(c.a.clone(), std::time::Duration::from_secs(3600))
        .with_purge(true);

    let first = c.a.get_current_key_ring().await.unwrap();
    let expiry = first.default_key().expiration_date;
    c.clock.set(expiry - Duration::hours(1));
    scheduler.run_once().await.unwrap();

    // Past expiration + propagation (3 days) + retention (30 days)
    c.clock.set(expiry + Duration::days(34));
    let check = scheduler.run_once().await.unwrap();
    assert!(check.purged.contains(&first.default_key_id().to_string()));

    let remaining = c.b.manager().get_all_keys().await.unwrap();
    assert!(remaining.iter().all(|r| r.id != first.default_key_id()));
}
