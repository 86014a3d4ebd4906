//! Key manager: creates, materializes, revokes and purges key records
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
use crate::key_types::{KeyId, KeyRecord, MaterializedKey};
use crate::options::KeyRotationOptions;
use crate::repository::KeyRepository;
use crate::resolver::KeyMaterializer;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct KeyManager {
    repository: Arc<dyn KeyRepository>,
    options: Arc<KeyRotationOptions>,
    clock: Arc<dyn Clock>,
    /// Bumped on every mutation made through this manager
    generation: AtomicU64,
}

impl KeyManager {
    pub fn new(
        repository: Arc<dyn KeyRepository>,
        options: Arc<KeyRotationOptions>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            options,
            clock,
            generation: AtomicU64::new(0),
        }
    }

    pub fn options(&self) -> &Arc<KeyRotationOptions> {
        &self.options
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Counter of mutations made through this manager. A cached key ring
    /// built at an older generation is out of date.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Generate, encrypt and persist a new key
    pub async fn create_new_key(
        &self,
        activation_date: DateTime<Utc>,
        expiration_date: DateTime<Utc>,
    ) -> KeyResult<KeyRecord> {
        if expiration_date <= activation_date {
            return Err(KeyError::Configuration(format!(
                "Key expiration {} must be after activation {}",
                expiration_date, activation_date
            )));
        }

        // Key generation is CPU bound (RSA especially)
        let encryptor = self.options.encryptor.clone();
        let encrypted_material = tokio::task::spawn_blocking(move || {
            let material = encryptor.generate_key_material()?;
            encryptor.encrypt(&material)
        })
        .await
        .map_err(|e| KeyError::KeyGeneration(format!("Key generation task failed: {}", e)))??;

        let record = KeyRecord::new(
            Uuid::new_v4().to_string(),
            self.clock.now(),
            activation_date,
            expiration_date,
            encrypted_material,
        );

        self.repository.create(&record).await?;
        self.bump_generation();

        info!(
            key_id = %record.id,
            algorithm = %self.options.encryptor.algorithm(),
            activation = %record.activation_date,
            expiration = %record.expiration_date,
            "Created new signing key"
        );
        Ok(record)
    }

    /// Decrypt one record into usable key material. The record's window
    /// must be well formed; whether the key is usable *now* is the
    /// resolver's call.
    pub fn materialize(&self, record: &KeyRecord) -> KeyResult<MaterializedKey> {
        if record.expiration_date <= record.activation_date {
            return Err(KeyError::Decryption {
                key_id: record.id.clone(),
                reason: "expiration is not after activation".to_string(),
            });
        }

        let material = self
            .options
            .encryptor
            .decrypt(&record.encrypted_material)
            .map_err(|e| KeyError::Decryption {
                key_id: record.id.clone(),
                reason: e.to_string(),
            })?;

        debug!(key_id = %record.id, "Materialized key");
        Ok(MaterializedKey::from_record(record, material))
    }

    /// Full, unfiltered repository snapshot
    pub async fn get_all_keys(&self) -> KeyResult<Vec<KeyRecord>> {
        self.repository.list_all().await
    }

    pub async fn revoke_key(&self, key_id: &KeyId) -> KeyResult<()> {
        info!(key_id = %key_id, "Revoking key");
        self.repository.revoke(key_id).await?;
        self.bump_generation();
        Ok(())
    }

    /// Revoke every key created before `created_before`. Returns the ids
    /// that were revoked by this call.
    pub async fn revoke_all_keys(&self, created_before: DateTime<Utc>) -> KeyResult<Vec<KeyId>> {
        let mut revoked = Vec::new();
        for record in self.repository.list_all().await? {
            if record.revoked || record.created_at >= created_before {
                continue;
            }
            self.repository.revoke(&record.id).await?;
            revoked.push(record.id);
        }

        if !revoked.is_empty() {
            self.bump_generation();
        }
        warn!(count = revoked.len(), before = %created_before, "Revoked all keys");
        Ok(revoked)
    }

    /// Delete keys whose expiration is older than the retention window.
    /// Returns the ids that were deleted.
    pub async fn purge_retired_keys(&self, now: DateTime<Utc>) -> KeyResult<Vec<KeyId>> {
        let cutoff = now - self.options.retention_window;
        let mut purged = Vec::new();

        for record in self.repository.list_all().await? {
            if record.expiration_date + self.options.propagation_window > cutoff {
                continue;
            }
            match self.repository.delete(&record.id).await {
                Ok(()) => purged.push(record.id),
                Err(KeyError::NotFound(_)) => {
                    debug!(key_id = %record.id, "Key already purged elsewhere");
                }
                Err(e) => return Err(e),
            }
        }

        if !purged.is_empty() {
            self.bump_generation();
            info!(count = purged.len(), "Purged retired keys");
        }
        Ok(purged)
    }
}

impl KeyMaterializer for KeyManager {
    fn materialize(&self, record: &KeyRecord) -> KeyResult<MaterializedKey> {
        KeyManager::materialize(self, record)
    }
}
