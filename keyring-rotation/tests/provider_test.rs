//! Key ring provider behaviour against a repository that can be slowed
//! down, counted and broken on demand

use async_trait::async_trait;
use chrono::{Duration, Utc};
use keyring_rotation::{
    CacheableKeyRingProvider, Ed25519EncryptorConfiguration, InMemoryKeyRepository, KeyError,
    KeyId, KeyManager, KeyRecord, KeyRepository, KeyResult, KeyRing, KeyRingProvider,
    KeyRotationOptions, ManualClock, MasterKeyProtector,
};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

#[derive(Default)]
struct InstrumentedRepository {
    inner: InMemoryKeyRepository,
    list_calls: AtomicUsize,
    create_calls: AtomicUsize,
    list_delay_ms: AtomicU64,
    failing: AtomicBool,
}

impl InstrumentedRepository {
    fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    fn set_list_delay(&self, millis: u64) {
        self.list_delay_ms.store(millis, Ordering::SeqCst);
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> KeyResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(KeyError::Repository("backing store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyRepository for InstrumentedRepository {
    async fn create(&self, record: &KeyRecord) -> KeyResult<()> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.create(record).await
    }

    async fn list_all(&self) -> KeyResult<Vec<KeyRecord>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.list_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        self.check()?;
        self.inner.list_all().await
    }

    async fn revoke(&self, key_id: &KeyId) -> KeyResult<()> {
        self.check()?;
        self.inner.revoke(key_id).await
    }

    async fn delete(&self, key_id: &KeyId) -> KeyResult<()> {
        self.check()?;
        self.inner.delete(key_id).await
    }
}

type Setup = (KeyRingProvider, Arc<InstrumentedRepository>, Arc<ManualClock>);

fn setup() -> Setup {
    setup_with(|options| options)
}

fn setup_with(configure: impl FnOnce(KeyRotationOptions) -> KeyRotationOptions) -> Setup {
    let repo = Arc::new(InstrumentedRepository::default());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let protector = Arc::new(MasterKeyProtector::generate());
    let options = configure(
        KeyRotationOptions::new(Arc::new(Ed25519EncryptorConfiguration::new(protector)))
            .with_rotation_period(Duration::days(30))
            .with_propagation_window(Duration::days(3))
            .with_refresh_period(Duration::hours(1))
            .with_failure_retry_interval(Duration::minutes(2)),
    );
    let manager = Arc::new(KeyManager::new(repo.clone(), Arc::new(options), clock.clone()));
    (KeyRingProvider::new(manager), repo, clock)
}

#[tokio::test]
async fn test_repeated_calls_hit_cache() {
    let (provider, repo, clock) = setup();

    let first = provider.get_current_key_ring().await.unwrap();
    for _ in 0..10 {
        clock.advance(Duration::minutes(1));
        let ring = provider.get_current_key_ring().await.unwrap();
        assert!(Arc::ptr_eq(&first, &ring));
    }

    assert_eq!(repo.list_calls(), 1);
    assert_eq!(repo.create_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cold_start_refreshes_once() {
    let (provider, repo, _clock) = setup();
    repo.set_list_delay(50);

    let mut handles = Vec::new();
    for _ in 0..32 {
        let provider = provider.clone();
        handles.push(tokio::spawn(async move {
            provider.get_current_key_ring().await
        }));
    }

    let mut default_ids = Vec::new();
    for handle in handles {
        let ring = handle.await.unwrap().unwrap();
        default_ids.push(ring.default_key_id().to_string());
    }

    default_ids.dedup();
    assert_eq!(default_ids.len(), 1);
    assert_eq!(repo.list_calls(), 1);
    assert_eq!(repo.create_calls(), 1);
}

/// Start `callers` concurrent lookups and collect their results
async fn concurrent_lookups(
    provider: &KeyRingProvider,
    callers: usize,
) -> Vec<KeyResult<Arc<KeyRing>>> {
    let handles: Vec<_> = (0..callers)
        .map(|_| {
            let provider = provider.clone();
            tokio::spawn(async move { provider.get_current_key_ring().await })
        })
        .collect();

    let mut results = Vec::with_capacity(callers);
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    results
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cold_start_against_broken_repository_lists_once() {
    let (provider, repo, _clock) = setup();
    repo.set_failing(true);
    repo.set_list_delay(50);

    let results = concurrent_lookups(&provider, 16).await;

    assert!(results
        .iter()
        .all(|r| matches!(r, Err(KeyError::KeyRingUnavailable(_)))));
    assert_eq!(repo.list_calls(), 1);
    assert_eq!(repo.create_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cold_start_with_activation_delay_lists_once() {
    let (provider, repo, _clock) =
        setup_with(|options| options.with_new_key_activation_delay(Duration::minutes(5)));
    repo.set_list_delay(50);

    let results = concurrent_lookups(&provider, 16).await;

    assert!(results
        .iter()
        .all(|r| matches!(r, Err(KeyError::KeyRingUnavailable(_)))));
    assert_eq!(repo.list_calls(), 1);
    assert_eq!(repo.create_calls(), 1);

    // A later caller refreshes again but finds the pending key
    assert_err!(provider.get_current_key_ring().await);
    assert_eq!(repo.list_calls(), 2);
    assert_eq!(repo.create_calls(), 1);
}

#[tokio::test]
async fn test_cold_start_with_broken_repository_is_unavailable() {
    let (provider, repo, _clock) = setup();
    repo.set_failing(true);

    let result = provider.get_current_key_ring().await;
    assert!(matches!(result, Err(KeyError::KeyRingUnavailable(_))));
    assert!(provider.cached_key_ring().is_none());
}

#[tokio::test]
async fn test_failed_refresh_serves_previous_ring_until_retry() {
    let (provider, repo, clock) = setup();
    let first = provider.get_current_key_ring().await.unwrap();

    repo.set_failing(true);
    clock.advance(Duration::hours(2));

    let stale = assert_ok!(provider.get_current_key_ring().await);
    assert!(Arc::ptr_eq(&first, &stale));
    assert_eq!(repo.list_calls(), 2);

    // Inside the retry interval the previous ring is served without I/O
    clock.advance(Duration::minutes(1));
    assert_ok!(provider.get_current_key_ring().await);
    assert_eq!(repo.list_calls(), 2);

    clock.advance(Duration::minutes(1));
    assert_ok!(provider.get_current_key_ring().await);
    assert_eq!(repo.list_calls(), 3);

    repo.set_failing(false);
    clock.advance(Duration::minutes(2));
    let fresh = provider.get_current_key_ring().await.unwrap();
    assert!(!Arc::ptr_eq(&first, &fresh));
    assert_eq!(first.default_key_id(), fresh.default_key_id());
}

#[tokio::test]
async fn test_store_outage_after_expiry_recovers_with_new_key() {
    let (provider, repo, clock) = setup();
    provider.get_current_key_ring().await.unwrap();

    // The only key is now expired and the repository cannot be read
    repo.set_failing(true);
    clock.advance(Duration::days(31));

    // The last ring is all there is
    let ring = assert_ok!(provider.get_current_key_ring().await);
    assert_eq!(ring.validation_keys().len(), 1);

    repo.set_failing(false);
    clock.advance(Duration::minutes(3));
    let ring = provider.get_current_key_ring().await.unwrap();
    assert!(ring.default_key().is_within_window(clock_now(&clock)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_callers_get_stale_ring_while_refresh_runs() {
    let (provider, repo, clock) = setup();
    let first = provider.get_current_key_ring().await.unwrap();

    clock.advance(Duration::hours(2));
    repo.set_list_delay(300);

    let refreshing = {
        let provider = provider.clone();
        tokio::spawn(async move { provider.get_current_key_ring().await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // Returns immediately with the ring that is still within its window
    let stale = tokio::time::timeout(
        std::time::Duration::from_millis(100),
        provider.get_current_key_ring(),
    )
    .await
    .expect("stale ring should be served without waiting")
    .unwrap();
    assert!(Arc::ptr_eq(&first, &stale));

    let refreshed = refreshing.await.unwrap().unwrap();
    assert!(!Arc::ptr_eq(&first, &refreshed));
    assert_eq!(repo.list_calls(), 2);
}

#[tokio::test]
async fn test_abandoned_call_still_completes_refresh() {
    let (provider, repo, _clock) = setup();
    repo.set_list_delay(100);

    let abandoned = tokio::time::timeout(
        std::time::Duration::from_millis(10),
        provider.get_current_key_ring(),
    )
    .await;
    assert_err!(abandoned);

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert!(provider.cached_key_ring().is_some());

    let ring = provider.get_current_key_ring().await.unwrap();
    let cached = provider.cached_key_ring().unwrap();
    assert!(Arc::ptr_eq(&ring, &cached));
    assert_eq!(repo.list_calls(), 1);
    assert_eq!(repo.create_calls(), 1);
}

#[tokio::test]
async fn test_revoked_key_leaves_validation_set() {
    let (provider, _repo, _clock) = setup();
    let first = provider.get_current_key_ring().await.unwrap();
    let signature = first.signing_credential().sign(b"payload").unwrap();
    let revoked = first.default_key_id().to_string();

    provider.revoke_key(&revoked).await.unwrap();

    let ring = provider.get_current_key_ring().await.unwrap();
    assert_ne!(ring.default_key_id(), revoked);
    assert!(!ring.verify(&revoked, b"payload", &signature));
}

#[tokio::test]
async fn test_external_invalidation_picks_up_other_instance_keys() {
    let (provider, repo, clock) = setup();
    let first = provider.get_current_key_ring().await.unwrap();

    // Another instance wrote a newer key straight to the shared store
    let other = KeyManager::new(repo.clone(), provider.manager().options().clone(), clock.clone());
    clock.advance(Duration::seconds(5));
    let now = clock_now(&clock);
    let record = other.create_new_key(now, now + Duration::days(30)).await.unwrap();

    let cached = provider.get_current_key_ring().await.unwrap();
    assert!(Arc::ptr_eq(&first, &cached));

    provider.invalidate_cache();
    let ring = provider.get_current_key_ring().await.unwrap();
    assert_eq!(ring.default_key_id(), record.id);
    assert!(ring.valid_key_ids().any(|id| id == first.default_key_id()));
}

fn clock_now(clock: &ManualClock) -> chrono::DateTime<Utc> {
    use keyring_rotation::Clock;
    clock.now()
}
