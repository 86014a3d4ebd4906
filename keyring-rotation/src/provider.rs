//! Cacheable key ring provider
//!
//! Single entry point for token code. Serves the cached [`KeyRing`] without
//! I/O while it is fresh and rebuilds it behind a single-flight gate when it
//! is not.
//!
//! ```text
//! get_current_key_ring
//!   ├─ fresh cache?             → cached ring (lock-free)
//!   ├─ refresh already running? → stale ring if its default is still in window,
//!   │                             otherwise wait for the running refresh and reuse its result
//!   └─ refresh (spawned task, holds the gate)
//!        list_all → resolve ─ NoDefaultKeyAvailable → create key → resolve again
//!        → swap cache          (failure: keep serving the previous ring)
//! ```
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::clock::Clock;
use crate::error::{KeyError, KeyResult};
use crate::key_manager::KeyManager;
use crate::key_ring::{KeyRing, SigningCredential, ValidationKey};
use crate::key_types::{KeyId, KeyRecord};
use crate::options::KeyRotationOptions;
use crate::resolver::{DefaultKeyResolver, KeyState, ResolutionResult};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

/// Lower bound of the random factor applied to the refresh period, so a
/// fleet started together does not refresh in lockstep
const REFRESH_JITTER_MIN: f64 = 0.8;

/// Source of the current key ring
#[async_trait]
pub trait CacheableKeyRingProvider: Send + Sync {
    async fn get_current_key_ring(&self) -> KeyResult<Arc<KeyRing>>;

    /// Force the next `get_current_key_ring` to refresh
    fn invalidate_cache(&self);
}

struct CachedRing {
    ring: Arc<KeyRing>,
    /// May be pushed past the ring's own expiry when serving it stale
    expires_at: DateTime<Utc>,
    manager_generation: u64,
    invalidation: u64,
}

/// Result of the last refresh, kept for callers that queued behind it
struct RefreshOutcome {
    epoch: u64,
    invalidation: u64,
    result: Result<Arc<KeyRing>, String>,
}

struct ProviderInner {
    manager: Arc<KeyManager>,
    resolver: DefaultKeyResolver,
    options: Arc<KeyRotationOptions>,
    clock: Arc<dyn Clock>,
    cache: ArcSwapOption<CachedRing>,
    invalidation: AtomicU64,
    refresh_gate: Arc<Mutex<()>>,
    /// Bumped by every completed refresh, while the gate is still held
    refresh_epoch: AtomicU64,
    last_outcome: ArcSwapOption<RefreshOutcome>,
}

/// Key ring provider backed by a [`KeyManager`]. Cheap to clone; clones
/// share the cache.
#[derive(Clone)]
pub struct KeyRingProvider {
    inner: Arc<ProviderInner>,
}

impl KeyRingProvider {
    pub fn new(manager: Arc<KeyManager>) -> Self {
        let options = manager.options().clone();
        let clock = manager.clock().clone();
        Self {
            inner: Arc::new(ProviderInner {
                resolver: DefaultKeyResolver::new(options.clone()),
                manager,
                options,
                clock,
                cache: ArcSwapOption::const_empty(),
                invalidation: AtomicU64::new(0),
                refresh_gate: Arc::new(Mutex::new(())),
                refresh_epoch: AtomicU64::new(0),
                last_outcome: ArcSwapOption::const_empty(),
            }),
        }
    }

    pub fn manager(&self) -> &Arc<KeyManager> {
        &self.inner.manager
    }

    /// Last ring produced, fresh or not, without waiting on anything
    pub fn cached_key_ring(&self) -> Option<Arc<KeyRing>> {
        self.inner.cache.load_full().map(|c| c.ring.clone())
    }

    /// Current signing credential
    pub async fn signing_credential(&self) -> KeyResult<SigningCredential> {
        Ok(self.get_current_key_ring().await?.signing_credential())
    }

    /// Current validation keys
    pub async fn validation_keys(&self) -> KeyResult<Vec<ValidationKey>> {
        Ok(self.get_current_key_ring().await?.validation_keys())
    }

    /// Create a successor to the current default key, activated when the
    /// default expires. Used by the rotation scheduler.
    pub async fn schedule_successor(&self) -> KeyResult<KeyRecord> {
        let _gate = self.inner.refresh_gate.clone().lock_owned().await;
        let now = self.inner.clock.now();
        let earliest = now + self.inner.options.new_key_activation_delay;

        let activation = match self.inner.cache.load_full() {
            Some(cached) if cached.ring.default_key().expiration_date > earliest => {
                cached.ring.default_key().expiration_date
            }
            _ => earliest,
        };

        let record = self.inner.create_key(activation).await?;
        self.invalidate_cache();
        Ok(record)
    }

    /// Create a key that becomes the default right away (after the
    /// configured activation delay). The previous default keeps verifying
    /// until it expires.
    pub async fn rotate_now(&self) -> KeyResult<KeyRecord> {
        let _gate = self.inner.refresh_gate.clone().lock_owned().await;
        let activation = self.inner.clock.now() + self.inner.options.new_key_activation_delay;
        let record = self.inner.create_key(activation).await?;
        self.invalidate_cache();
        Ok(record)
    }

    /// Revoke a key and drop the cached ring
    pub async fn revoke_key(&self, key_id: &KeyId) -> KeyResult<()> {
        self.inner.manager.revoke_key(key_id).await?;
        self.invalidate_cache();
        Ok(())
    }
}

#[async_trait]
impl CacheableKeyRingProvider for KeyRingProvider {
    async fn get_current_key_ring(&self) -> KeyResult<Arc<KeyRing>> {
        let now = self.inner.clock.now();
        if let Some(ring) = self.inner.fresh_ring(now) {
            return Ok(ring);
        }
        let seen_epoch = self.inner.refresh_epoch.load(Ordering::Acquire);

        let guard = match self.inner.refresh_gate.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                if let Some(ring) = self.inner.usable_stale_ring(now) {
                    debug!(default_key = %ring.default_key_id(), "Refresh in progress, serving cached key ring");
                    return Ok(ring);
                }
                self.inner.refresh_gate.clone().lock_owned().await
            }
        };

        // Someone else may have refreshed while we waited for the gate
        if let Some(ring) = self.inner.fresh_ring(self.inner.clock.now()) {
            return Ok(ring);
        }
        // A refresh finished while we waited, failed ones included
        if let Some(result) = self.inner.outcome_since(seen_epoch) {
            return result;
        }

        // The refresh runs detached so a caller giving up does not cancel it
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.refresh_holding(guard).await })
            .await
            .map_err(|e| KeyError::KeyRingUnavailable(format!("Key ring refresh task failed: {}", e)))?
    }

    fn invalidate_cache(&self) {
        self.inner.invalidation.fetch_add(1, Ordering::AcqRel);
        debug!("Key ring cache invalidated");
    }
}

impl ProviderInner {
    fn fresh_ring(&self, now: DateTime<Utc>) -> Option<Arc<KeyRing>> {
        let cached = self.cache.load_full()?;
        let fresh = now < cached.expires_at
            && cached.manager_generation == self.manager.generation()
            && cached.invalidation == self.invalidation.load(Ordering::Acquire);
        fresh.then(|| cached.ring.clone())
    }

    fn usable_stale_ring(&self, now: DateTime<Utc>) -> Option<Arc<KeyRing>> {
        let cached = self.cache.load_full()?;
        cached
            .ring
            .default_key()
            .is_within_window(now)
            .then(|| cached.ring.clone())
    }

    fn outcome_since(&self, seen_epoch: u64) -> Option<KeyResult<Arc<KeyRing>>> {
        let outcome = self.last_outcome.load_full()?;
        let current = outcome.epoch > seen_epoch
            && outcome.invalidation == self.invalidation.load(Ordering::Acquire);
        if !current {
            return None;
        }
        debug!(epoch = outcome.epoch, "Reusing result of the refresh that just completed");
        Some(outcome.result.clone().map_err(KeyError::KeyRingUnavailable))
    }

    async fn refresh_holding(
        self: Arc<Self>,
        _gate: OwnedMutexGuard<()>,
    ) -> KeyResult<Arc<KeyRing>> {
        let invalidation = self.invalidation.load(Ordering::Acquire);
        let result = self.refresh_and_cache(invalidation).await;

        let epoch = self.refresh_epoch.load(Ordering::Acquire) + 1;
        self.last_outcome.store(Some(Arc::new(RefreshOutcome {
            epoch,
            invalidation,
            result: match &result {
                Ok(ring) => Ok(ring.clone()),
                Err(KeyError::KeyRingUnavailable(reason)) => Err(reason.clone()),
                Err(e) => Err(e.to_string()),
            },
        })));
        self.refresh_epoch.store(epoch, Ordering::Release);
        result
    }

    async fn refresh_and_cache(&self, invalidation: u64) -> KeyResult<Arc<KeyRing>> {
        let now = self.clock.now();
        let generation = self.manager.generation();

        match self.refresh(now, generation).await {
            Ok((ring, manager_generation)) => {
                self.cache.store(Some(Arc::new(CachedRing {
                    expires_at: ring.cache_expires_at(),
                    ring: ring.clone(),
                    manager_generation,
                    invalidation,
                })));
                Ok(ring)
            }
            Err(e) => self.fall_back(e, now),
        }
    }

    /// Build a new ring. Returns it with the manager generation it reflects.
    async fn refresh(&self, now: DateTime<Utc>, generation: u64) -> KeyResult<(Arc<KeyRing>, u64)> {
        let mut records = self.manager.get_all_keys().await?;
        let mut expected_generation = generation;

        let resolution = match self.resolver.resolve(&records, now, &*self.manager) {
            Ok(resolution) => resolution,
            Err(KeyError::NoDefaultKeyAvailable) => {
                if self.key_on_its_way(&records, now) {
                    info!("No default key yet, a new key is waiting for activation");
                    return Err(KeyError::NoDefaultKeyAvailable);
                }

                warn!("No default key available, creating a new signing key");
                let activation = now + self.options.new_key_activation_delay;
                let record = self.create_key(activation).await?;
                expected_generation += 1;
                records.push(record);

                // One retry only; a second miss surfaces to the caller
                self.resolver.resolve(&records, now, &*self.manager)?
            }
            Err(e) => return Err(e),
        };

        for warning in &resolution.warnings {
            warn!(key_id = %warning.key_id, message = %warning.message, "Key excluded from key ring");
        }
        if resolution.rotation_due {
            info!(
                default_key = %resolution.default_key.id,
                expires = %resolution.default_key.expiration_date,
                "Default key expires within the propagation window, rotation is due"
            );
        }

        let cache_expires_at = self.cache_expiry(&resolution, now);
        let ring = Arc::new(KeyRing::new(resolution, now, cache_expires_at));

        // Mutations by others during the refresh leave the generation
        // behind so the next call refreshes again
        let manager_generation = if self.manager.generation() == expected_generation {
            expected_generation
        } else {
            generation
        };

        info!(
            default_key = %ring.default_key_id(),
            valid_keys = ring.valid_key_ids().count(),
            cache_expires_at = %cache_expires_at,
            "Key ring refreshed"
        );
        Ok((ring, manager_generation))
    }

    /// Whether a key created earlier is still waiting to become eligible,
    /// in which case creating another would only pile up keys
    fn key_on_its_way(&self, records: &[KeyRecord], now: DateTime<Utc>) -> bool {
        let latest_acceptable = now + self.options.new_key_activation_delay;
        let stable_before = now - self.options.activation_stabilization;
        records.iter().any(|record| {
            matches!(KeyState::of(record, now), KeyState::Pending | KeyState::Active)
                && record.activation_date > stable_before
                && record.activation_date <= latest_acceptable
        })
    }

    async fn create_key(&self, activation: DateTime<Utc>) -> KeyResult<KeyRecord> {
        let expiration = activation
            .checked_add_signed(self.options.rotation_period)
            .ok_or_else(|| {
                KeyError::Configuration(format!(
                    "Rotation period {} overflows from activation {}",
                    self.options.rotation_period, activation
                ))
            })?;
        self.manager.create_new_key(activation, expiration).await
    }

    /// Earliest instant the ring could change: the jittered refresh period
    /// (bounded by the rotation period), the default key's expiry, the next
    /// pending activation and the moment it enters the skew window, a
    /// recently activated key becoming stable, and the end of any grace
    /// period in the ring
    fn cache_expiry(&self, resolution: &ResolutionResult, now: DateTime<Utc>) -> DateTime<Utc> {
        let factor = rand::thread_rng().gen_range(REFRESH_JITTER_MIN..=1.0);
        let refresh_ms = (self.options.refresh_period.num_milliseconds() as f64 * factor) as i64;
        let budget = Duration::milliseconds(refresh_ms).min(self.options.rotation_period);

        let mut expires_at = (now + budget).min(resolution.default_key.expiration_date);
        if let Some(next) = resolution.next_activation {
            expires_at = expires_at.min(next);
            let enters_ring = next - self.options.max_clock_skew;
            if enters_ring > now {
                expires_at = expires_at.min(enters_ring);
            }
        }
        for key in &resolution.valid_keys {
            let stable_at = key.activation_date + self.options.activation_stabilization;
            if stable_at > now {
                expires_at = expires_at.min(stable_at);
            }
            if key.expiration_date <= now {
                expires_at = expires_at.min(key.expiration_date + self.options.propagation_window);
            }
        }
        expires_at
    }

    /// Serve the previous ring after a failed refresh, if there is one
    fn fall_back(&self, err: KeyError, now: DateTime<Utc>) -> KeyResult<Arc<KeyRing>> {
        let Some(previous) = self.cache.load_full() else {
            error!(error = %err, "Key ring refresh failed and no key ring is cached");
            return Err(KeyError::KeyRingUnavailable(err.to_string()));
        };

        let retry_at = now + self.options.failure_retry_interval;
        warn!(
            error = %err,
            default_key = %previous.ring.default_key_id(),
            retry_at = %retry_at,
            "Key ring refresh failed, serving previous key ring"
        );

        self.cache.store(Some(Arc::new(CachedRing {
            ring: previous.ring.clone(),
            expires_at: retry_at,
            manager_generation: self.manager.generation(),
            invalidation: self.invalidation.load(Ordering::Acquire),
        })));
        Ok(previous.ring.clone())
    }
}
