//! File-system key repository
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
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const RECORD_EXTENSION: &str = "json";

/// Stores one JSON document per key record in a directory.
///
/// The directory may be shared by several processes; every `list_all`
/// reads it afresh.
pub struct LocalKeyRepository {
    /// Storage directory
    storage_path: PathBuf,
    /// Serializes read-modify-write of a record within this process
    write_lock: Mutex<()>,
}

impl LocalKeyRepository {
    /// Create a new local repository, creating the directory if needed
    pub async fn new<P: AsRef<Path>>(storage_path: P) -> KeyResult<Self> {
        let storage_path = storage_path.as_ref().to_path_buf();
        fs::create_dir_all(&storage_path).await?;

        info!(path = %storage_path.display(), "Opened local key repository");

        Ok(Self {
            storage_path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    /// Get path for a record file
    fn record_path(&self, key_id: &KeyId) -> PathBuf {
        // Sanitize key_id for filesystem
        let sanitized = key_id.replace(['/', '\\'], "_");
        self.storage_path.join(format!("{}.{}", sanitized, RECORD_EXTENSION))
    }

    async fn read_record(&self, key_id: &KeyId) -> KeyResult<KeyRecord> {
        let path = self.record_path(key_id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(KeyError::NotFound(key_id.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    /// Write through a temporary file so readers never see a partial record
    async fn write_record(&self, record: &KeyRecord) -> KeyResult<()> {
        let path = self.record_path(&record.id);
        let tmp_path = path.with_extension("tmp");
        let json = serde_json::to_string_pretty(record)?;
        fs::write(&tmp_path, json).await?;
        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyRepository for LocalKeyRepository {
    async fn create(&self, record: &KeyRecord) -> KeyResult<()> {
        let _guard = self.write_lock.lock().await;

        if fs::try_exists(self.record_path(&record.id)).await? {
            return Err(KeyError::AlreadyExists(record.id.clone()));
        }

        self.write_record(record).await?;
        debug!(key_id = %record.id, "Key record stored");
        Ok(())
    }

    async fn list_all(&self) -> KeyResult<Vec<KeyRecord>> {
        let mut records = Vec::new();

        let mut entries = fs::read_dir(&self.storage_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            match fs::read_to_string(&path).await {
                Ok(content) => match serde_json::from_str::<KeyRecord>(&content) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to parse key record");
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read key record");
                }
            }
        }

        debug!("Loaded {} key records", records.len());
        Ok(records)
    }

    async fn revoke(&self, key_id: &KeyId) -> KeyResult<()> {
        let _guard = self.write_lock.lock().await;

        let mut record = self.read_record(key_id).await?;
        if record.revoked {
            return Ok(());
        }
        record.revoked = true;
        self.write_record(&record).await?;

        info!(key_id = %key_id, "Key record revoked");
        Ok(())
    }

    async fn delete(&self, key_id: &KeyId) -> KeyResult<()> {
        let _guard = self.write_lock.lock().await;

        match fs::remove_file(self.record_path(key_id)).await {
            Ok(()) => {
                info!(key_id = %key_id, "Key record deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(KeyError::NotFound(key_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
