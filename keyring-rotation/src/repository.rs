//! Storage contract for encrypted key records
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
use crate::key_types::{KeyId, KeyRecord};
use async_trait::async_trait;

/// Durable storage of key records.
///
/// Implementations never look inside `encrypted_material`.
#[async_trait]
pub trait KeyRepository: Send + Sync {
    /// Persist a new record. Fails with `AlreadyExists` on id collision.
    async fn create(&self, record: &KeyRecord) -> KeyResult<()>;

    /// Every stored record, revoked and expired ones included
    async fn list_all(&self) -> KeyResult<Vec<KeyRecord>>;

    /// Mark a record as revoked
    async fn revoke(&self, key_id: &KeyId) -> KeyResult<()>;

    /// Remove a record permanently (retention cleanup)
    async fn delete(&self, key_id: &KeyId) -> KeyResult<()>;
}
