//! In-memory key repository
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


use crate::error::{KeyError, KeyResult};
use crate::key_types::{KeyId, KeyRecord};
use crate::repository::KeyRepository;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Repository that keeps records in process memory. Useful for tests and
/// single-instance deployments that re-create keys on every start.
#[derive(Debug, Default)]
pub struct InMemoryKeyRepository {
    records: RwLock<BTreeMap<KeyId, KeyRecord>>,
}

impl InMemoryKeyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the repository with existing records
    pub fn with_records(records: impl IntoIterator<Item = KeyRecord>) -> Self {
        let records = records
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();
        Self {
            records: RwLock::new(records),
        }
    }
}

#[async_trait]
impl KeyRepository for InMemoryKeyRepository {
    async fn create(&self, record: &KeyRecord) -> KeyResult<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(KeyError::AlreadyExists(record.id.clone()));
        }
        records.insert(record.id.clone(), record.clone());
        debug!(key_id = %record.id, "Stored key record in memory");
        Ok(())
    }

    async fn list_all(&self) -> KeyResult<Vec<KeyRecord>> {
        let records = self.records.read().await;
        Ok(records.values().cloned().collect())
    }

    async fn revoke(&self, key_id: &KeyId) -> KeyResult<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(key_id)
            .ok_or_else(|| KeyError::NotFound(key_id.clone()))?;
        record.revoked = true;
        Ok(())
    }

    async fn delete(&self, key_id: &KeyId) -> KeyResult<()> {
        let mut records = self.records.write().await;
        records
            .remove(key_id)
            .map(|_| ())
            .ok_or_else(|| KeyError::NotFound(key_id.clone()))
    }
}
