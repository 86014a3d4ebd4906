//! Service integration helpers for wiring a key ring provider into a service
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


use crate::clock::{Clock, SystemClock};
use crate::encryptor::{MasterKeyProtector, MASTER_KEY_ENV};
use crate::error::{KeyError, KeyResult};
use crate::key_manager::KeyManager;
use crate::local_store::LocalKeyRepository;
use crate::options::KeyRotationOptions;
use crate::provider::KeyRingProvider;
use crate::repository::KeyRepository;
use crate::scheduler::{RotationScheduler, RotationSchedulerHandle};
use keyring_config::KeyRingConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Build a provider over an existing repository and master key
pub fn build_key_ring_provider(
    config: &KeyRingConfig,
    repository: Arc<dyn KeyRepository>,
    protector: Arc<MasterKeyProtector>,
    clock: Arc<dyn Clock>,
) -> KeyResult<KeyRingProvider> {
    config
        .validate()
        .map_err(|e| KeyError::Configuration(e.to_string()))?;

    let options = Arc::new(KeyRotationOptions::from_config(config, protector)?);
    info!(options = ?options, "Key rotation options loaded");

    let manager = Arc::new(KeyManager::new(repository, options, clock));
    Ok(KeyRingProvider::new(manager))
}

/// Initialize a key ring provider for a service: local repository at the
/// configured path, master key from `KEYRING_MASTER_KEY`, system clock.
///
/// Fails with [`KeyError::Configuration`] when the master key is not set.
pub async fn init_key_ring_provider(config: &KeyRingConfig) -> KeyResult<KeyRingProvider> {
    init_with_master_key_from(config, MASTER_KEY_ENV).await
}

async fn init_with_master_key_from(
    config: &KeyRingConfig,
    master_key_env: &str,
) -> KeyResult<KeyRingProvider> {
    info!(path = %config.storage_path, algorithm = %config.algorithm, "Initializing key ring provider");

    // Before touching the directory, so a misconfigured instance writes nothing
    let protector = Arc::new(MasterKeyProtector::from_env_var(master_key_env)?);
    let repository = Arc::new(LocalKeyRepository::new(&config.storage_path).await?);

    build_key_ring_provider(config, repository, protector, Arc::new(SystemClock))
}

/// Start the background rotation check configured for this service.
/// Returns `None` when the check interval is 0.
pub fn start_rotation_scheduler(
    provider: &KeyRingProvider,
    config: &KeyRingConfig,
) -> Option<RotationSchedulerHandle> {
    if config.rotation_check_interval_secs == 0 {
        info!("Background rotation check disabled");
        return None;
    }

    let handle = RotationScheduler::new(
        provider.clone(),
        Duration::from_secs(config.rotation_check_interval_secs),
    )
    .with_purge(true)
    .spawn();
    Some(handle)
}
