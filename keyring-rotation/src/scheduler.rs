//! Background rotation check
//!
//! Lazy refresh already rotates on demand; the scheduler makes sure a
//! successor exists before the default key enters its last propagation
//! window even when no tokens are being issued.
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


use crate::error::KeyResult;
use crate::key_types::KeyId;
use crate::provider::{CacheableKeyRingProvider, KeyRingProvider};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Outcome of one rotation check
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RotationCheck {
    /// Successor created by this check
    pub rotated: Option<KeyId>,
    pub purged: Vec<KeyId>,
}

pub struct RotationScheduler {
    provider: KeyRingProvider,
    interval: Duration,
    purge: bool,
}

impl RotationScheduler {
    pub fn new(provider: KeyRingProvider, interval: Duration) -> Self {
        Self {
            provider,
            interval,
            purge: false,
        }
    }

    /// Also delete retired keys on every check
    pub fn with_purge(mut self, purge: bool) -> Self {
        self.purge = purge;
        self
    }

    /// Run a single check
    pub async fn run_once(&self) -> KeyResult<RotationCheck> {
        let mut check = RotationCheck::default();

        let ring = self.provider.get_current_key_ring().await?;
        if ring.rotation_due() {
            info!(default_key = %ring.default_key_id(), "Rotation due, scheduling successor key");
            let record = self.provider.schedule_successor().await?;
            check.rotated = Some(record.id);
        }

        if self.purge {
            let manager = self.provider.manager();
            check.purged = manager.purge_retired_keys(manager.clock().now()).await?;
            if !check.purged.is_empty() {
                self.provider.invalidate_cache();
            }
        }

        Ok(check)
    }

    /// Start checking every `interval` on a background task
    pub fn spawn(self) -> RotationSchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(());

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            info!(interval_secs = self.interval.as_secs(), purge = self.purge, "Rotation scheduler started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => {
                        info!("Rotation scheduler stopped");
                        return;
                    }
                }

                if let Err(e) = self.run_once().await {
                    error!(error = %e, "Rotation check failed");
                }
            }
        });

        RotationSchedulerHandle { shutdown_tx, task }
    }
}

/// Stops the scheduler when shut down or dropped
pub struct RotationSchedulerHandle {
    shutdown_tx: watch::Sender<()>,
    task: JoinHandle<()>,
}

impl RotationSchedulerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::encryptor::{Ed25519EncryptorConfiguration, MasterKeyProtector};
    use crate::key_manager::KeyManager;
    use crate::memory_store::InMemoryKeyRepository;
    use crate::options::KeyRotationOptions;
    use crate::repository::KeyRepository;
    use chrono::Utc;
    use std::sync::Arc;

    fn scheduler() -> (RotationScheduler, Arc<InMemoryKeyRepository>, Arc<ManualClock>) {
        let repo = Arc::new(InMemoryKeyRepository::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let protector = Arc::new(MasterKeyProtector::generate());
        let options = KeyRotationOptions::new(Arc::new(Ed25519EncryptorConfiguration::new(protector)))
            .with_rotation_period(chrono::Duration::days(10))
            .with_propagation_window(chrono::Duration::days(2))
            .with_retention_window(chrono::Duration::days(1));
        let manager = Arc::new(KeyManager::new(repo.clone(), Arc::new(options), clock.clone()));
        let scheduler = RotationScheduler::new(KeyRingProvider::new(manager), Duration::from_secs(60));
        (scheduler, repo, clock)
    }

    #[tokio::test]
    async fn test_no_rotation_while_default_is_fresh() {
        let (scheduler, repo, _clock) = scheduler();
        let check = scheduler.run_once().await.unwrap();
        assert_eq!(check, RotationCheck::default());
        assert_eq!(repo.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rotates_once_inside_propagation_window() {
        let (scheduler, repo, clock) = scheduler();
        scheduler.run_once().await.unwrap();

        clock.advance(chrono::Duration::days(9));
        let check = scheduler.run_once().await.unwrap();
        assert!(check.rotated.is_some());

        // The successor is lined up, nothing more to do
        let check = scheduler.run_once().await.unwrap();
        assert!(check.rotated.is_none());
        assert_eq!(repo.list_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_purge_removes_retired_keys() {
        let (scheduler, repo, clock) = scheduler();
        let scheduler = scheduler.with_purge(true);
        scheduler.run_once().await.unwrap();
        let first = repo.list_all().await.unwrap()[0].id.clone();

        clock.advance(chrono::Duration::days(9));
        scheduler.run_once().await.unwrap();

        // First key expired at day 10; gone after propagation + retention
        clock.set(clock.now() + chrono::Duration::days(5));
        let check = scheduler.run_once().await.unwrap();
        assert_eq!(check.purged, vec![first]);
        assert_eq!(repo.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_spawned_scheduler_shuts_down() {
        let (scheduler, repo, _clock) = scheduler();
        let handle = scheduler.spawn();
        // First tick fires immediately
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;
        assert_eq!(repo.list_all().await.unwrap().len(), 1);
    }
}
