//! Load tests for the key ring provider
//!
//! These tests simulate token-issuing traffic:
//! - Many concurrent readers of a warm cache
//! - A burst of readers arriving while the cache is cold
//!
//! Run the heavy variant with: cargo test --test load_test --release -- --ignored

use chrono::{Duration, Utc};
use futures::future::join_all;
use keyring_config::KeyRingConfig;
use keyring_rotation::{
    build_key_ring_provider, CacheableKeyRingProvider, KeyRingProvider, LocalKeyRepository,
    ManualClock, MasterKeyProtector,
};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;

async fn provider(dir: &TempDir, clock: Arc<ManualClock>) -> KeyRingProvider {
    let config = KeyRingConfig {
        algorithm: "EdDSA".to_string(),
        ..KeyRingConfig::default()
    };
    let repository = Arc::new(LocalKeyRepository::new(dir.path()).await.unwrap());
    build_key_ring_provider(
        &config,
        repository,
        Arc::new(MasterKeyProtector::generate()),
        clock,
    )
    .unwrap()
}

async fn sign_concurrently(provider: &KeyRingProvider, tasks: usize, per_task: usize) -> usize {
    let handles = (0..tasks).map(|i| {
        let provider = provider.clone();
        tokio::spawn(async move {
            let mut signed = 0;
            for j in 0..per_task {
                let ring = provider.get_current_key_ring().await.unwrap();
                let payload = format!("token-{}-{}", i, j);
                let signature = ring.signing_credential().sign(payload.as_bytes()).unwrap();
                assert!(ring.verify(ring.default_key_id(), payload.as_bytes(), &signature));
                signed += 1;
            }
            signed
        })
    });

    join_all(handles).await.into_iter().map(|r| r.unwrap()).sum()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cold_burst_creates_single_key() {
    let dir = TempDir::new().unwrap();
    let provider = provider(&dir, Arc::new(ManualClock::new(Utc::now()))).await;

    let signed = sign_concurrently(&provider, 64, 4).await;

    assert_eq!(signed, 256);
    assert_eq!(provider.manager().get_all_keys().await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_burst_across_cache_expiry() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let provider = provider(&dir, clock.clone()).await;

    let before = provider.get_current_key_ring().await.unwrap();
    clock.advance(Duration::hours(25));

    let rings = join_all((0..64).map(|_| {
        let provider = provider.clone();
        tokio::spawn(async move { provider.get_current_key_ring().await.unwrap() })
    }))
    .await;

    for ring in rings {
        assert_eq!(ring.unwrap().default_key_id(), before.default_key_id());
    }
    assert_eq!(provider.manager().get_all_keys().await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore] // Throughput check, run manually in release mode
async fn test_warm_cache_throughput() {
    let dir = TempDir::new().unwrap();
    let provider = provider(&dir, Arc::new(ManualClock::new(Utc::now()))).await;
    provider.get_current_key_ring().await.unwrap();

    let start = Instant::now();
    let signed = sign_concurrently(&provider, 100, 1000).await;
    let elapsed = start.elapsed();
    let per_second = signed as f64 / elapsed.as_secs_f64();

    println!("Signed {} tokens in {:?} ({:.0}/s)", signed, elapsed, per_second);
    assert!(per_second > 1000.0, "Throughput too low: {:.2} tokens/second", per_second);
}
