//! Default key resolution
//!
//! Given every key record and the current time, decide which key signs new
//! tokens and which keys may still verify old ones.
//!
//! ```text
//!            activation                expiration     expiration + propagation
//!   pending ─────┼──────── active ──────────┼──── grace ────────┼──── retired
//!   (verify only within clock skew)  (default candidate)  (verify only)
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


use crate::error::{KeyError, KeyResult};
use crate::key_types::{KeyId, KeyRecord, MaterializedKey};
use crate::options::KeyRotationOptions;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

/// Turns a persisted record into key material
pub trait KeyMaterializer: Send + Sync {
    fn materialize(&self, record: &KeyRecord) -> KeyResult<MaterializedKey>;
}

/// A record excluded from resolution because it could not be materialized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionWarning {
    pub key_id: KeyId,
    pub message: String,
}

/// Where a key sits in its lifecycle at a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Revoked,
    /// `expiration_date <= now`
    Expired,
    /// `activation_date > now`
    Pending,
    Active,
}

impl KeyState {
    pub fn of(record: &KeyRecord, now: DateTime<Utc>) -> Self {
        if record.revoked {
            KeyState::Revoked
        } else if record.expiration_date <= now {
            KeyState::Expired
        } else if record.activation_date > now {
            KeyState::Pending
        } else {
            KeyState::Active
        }
    }
}

/// Outcome of one resolution pass
#[derive(Debug)]
pub struct ResolutionResult {
    pub default_key: Arc<MaterializedKey>,
    /// Always contains `default_key`
    pub valid_keys: Vec<Arc<MaterializedKey>>,
    pub warnings: Vec<ResolutionWarning>,
    /// The default expires within the propagation window and no successor
    /// is lined up
    pub rotation_due: bool,
    /// Earliest future activation among pending keys; the default may
    /// change at that instant
    pub next_activation: Option<DateTime<Utc>>,
}

pub struct DefaultKeyResolver {
    options: Arc<KeyRotationOptions>,
}

impl DefaultKeyResolver {
    pub fn new(options: Arc<KeyRotationOptions>) -> Self {
        Self { options }
    }

    /// Resolve the default key and the validation set at `now`.
    ///
    /// Fails with [`KeyError::NoDefaultKeyAvailable`] when no active key is
    /// eligible; the caller is expected to create one and resolve again.
    pub fn resolve(
        &self,
        records: &[KeyRecord],
        now: DateTime<Utc>,
        materializer: &dyn KeyMaterializer,
    ) -> KeyResult<ResolutionResult> {
        let grace_start = now - self.options.propagation_window;
        let pending_horizon = now + self.options.max_clock_skew;
        let stable_before = now - self.options.activation_stabilization;

        let mut warnings = Vec::new();
        let mut valid_keys: Vec<Arc<MaterializedKey>> = Vec::new();
        let mut default_key: Option<Arc<MaterializedKey>> = None;
        let mut next_activation: Option<DateTime<Utc>> = None;
        // (activation, expiration) of non-revoked pending keys
        let mut pending_windows = Vec::new();

        for record in records {
            // Every record is opened, retired ones included, so a damaged
            // store shows up in the warnings
            let key = match materializer.materialize(record) {
                Ok(key) => Arc::new(key),
                Err(e) => {
                    warn!(key_id = %record.id, error = %e, "Skipping unreadable key");
                    warnings.push(ResolutionWarning {
                        key_id: record.id.clone(),
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            let state = KeyState::of(record, now);
            let accepted = match state {
                KeyState::Revoked => false,
                KeyState::Expired => record.expiration_date > grace_start,
                KeyState::Pending => {
                    pending_windows.push((record.activation_date, record.expiration_date));
                    next_activation = Some(match next_activation {
                        Some(at) if at <= record.activation_date => at,
                        _ => record.activation_date,
                    });
                    record.activation_date <= pending_horizon
                }
                KeyState::Active => true,
            };
            if !accepted {
                debug!(key_id = %record.id, state = ?state, "Key excluded from key ring");
                continue;
            }

            if state == KeyState::Active && key.activation_date <= stable_before {
                let better = match &default_key {
                    None => true,
                    Some(current) => Self::preference(&key) > Self::preference(current),
                };
                if better {
                    default_key = Some(key.clone());
                }
            }
            valid_keys.push(key);
        }

        let default_key = default_key.ok_or(KeyError::NoDefaultKeyAvailable)?;

        let remaining = default_key.expiration_date - now;
        let has_successor = pending_windows.iter().any(|(activation, expiration)| {
            *activation <= default_key.expiration_date && *expiration > default_key.expiration_date
        });
        let rotation_due = remaining < self.options.propagation_window && !has_successor;

        debug!(
            default_key = %default_key.id,
            valid = valid_keys.len(),
            rotation_due,
            "Resolved key ring"
        );

        Ok(ResolutionResult {
            default_key,
            valid_keys,
            warnings,
            rotation_due,
            next_activation,
        })
    }

    /// Latest activation wins, then latest creation, then greatest id
    fn preference(key: &MaterializedKey) -> (DateTime<Utc>, DateTime<Utc>, &str) {
        (key.activation_date, key.created_at, key.id.as_str())
    }
}
