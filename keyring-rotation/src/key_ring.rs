//! Immutable key ring snapshot and the two views handed to token code
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
use crate::key_types::{KeyDescriptor, KeyId, MaterializedKey, PublicKeyMaterial, SigningAlgorithm};
use crate::resolver::ResolutionResult;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Result of one resolution pass. Shared read-only between callers and
/// replaced as a whole on refresh.
#[derive(Debug)]
pub struct KeyRing {
    default_key: Arc<MaterializedKey>,
    valid_keys: Vec<Arc<MaterializedKey>>,
    generated_at: DateTime<Utc>,
    cache_expires_at: DateTime<Utc>,
    rotation_due: bool,
}

impl KeyRing {
    pub fn new(
        resolution: ResolutionResult,
        generated_at: DateTime<Utc>,
        cache_expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            default_key: resolution.default_key,
            valid_keys: resolution.valid_keys,
            generated_at,
            cache_expires_at,
            rotation_due: resolution.rotation_due,
        }
    }

    pub fn default_key(&self) -> &MaterializedKey {
        &self.default_key
    }

    pub fn default_key_id(&self) -> &str {
        &self.default_key.id
    }

    pub fn valid_key_ids(&self) -> impl Iterator<Item = &str> {
        self.valid_keys.iter().map(|k| k.id.as_str())
    }

    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    pub fn cache_expires_at(&self) -> DateTime<Utc> {
        self.cache_expires_at
    }

    /// The default key is close to expiry with no successor lined up
    pub fn rotation_due(&self) -> bool {
        self.rotation_due
    }

    /// Key used to sign newly issued tokens
    pub fn signing_credential(&self) -> SigningCredential {
        SigningCredential {
            key: self.default_key.clone(),
        }
    }

    /// Every key a presented token may have been signed with
    pub fn validation_keys(&self) -> Vec<ValidationKey> {
        self.valid_keys.iter().map(|k| ValidationKey::from_key(k)).collect()
    }

    /// Verify a signature made by key `key_id`. Unknown keys and bad
    /// signatures are both simply invalid.
    pub fn verify(&self, key_id: &str, payload: &[u8], signature: &[u8]) -> bool {
        self.valid_keys
            .iter()
            .find(|k| k.id == key_id)
            .map(|k| k.material.public_key().verify(payload, signature))
            .unwrap_or(false)
    }
}

/// Signing view over the ring's default key
#[derive(Debug, Clone)]
pub struct SigningCredential {
    key: Arc<MaterializedKey>,
}

impl SigningCredential {
    pub fn key_id(&self) -> &str {
        &self.key.id
    }

    pub fn algorithm(&self) -> SigningAlgorithm {
        self.key.descriptor.algorithm
    }

    pub fn descriptor(&self) -> KeyDescriptor {
        self.key.descriptor
    }

    pub fn expiration_date(&self) -> DateTime<Utc> {
        self.key.expiration_date
    }

    pub fn sign(&self, payload: &[u8]) -> KeyResult<Vec<u8>> {
        self.key.material.sign(payload)
    }
}

/// Public half of one valid key
#[derive(Debug, Clone)]
pub struct ValidationKey {
    pub key_id: KeyId,
    pub algorithm: SigningAlgorithm,
    pub activation_date: DateTime<Utc>,
    pub expiration_date: DateTime<Utc>,
    pub public_key: PublicKeyMaterial,
}

impl ValidationKey {
    fn from_key(key: &MaterializedKey) -> Self {
        Self {
            key_id: key.id.clone(),
            algorithm: key.descriptor.algorithm,
            activation_date: key.activation_date,
            expiration_date: key.expiration_date,
            public_key: key.material.public_key(),
        }
    }

    pub fn verify(&self, payload: &[u8], signature: &[u8]) -> bool {
        self.public_key.verify(payload, signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_types::{KeyMaterial, KeyRecord};
    use chrono::Duration;
    use rand::rngs::OsRng;

    fn key(id: &str, activation: DateTime<Utc>, expiration: DateTime<Utc>) -> Arc<MaterializedKey> {
        let record = KeyRecord::new(id.to_string(), activation, activation, expiration, Vec::new());
        let material = KeyMaterial::Ed25519(ed25519_dalek::SigningKey::generate(&mut OsRng));
        Arc::new(MaterializedKey::from_record(&record, material))
    }

    fn ring() -> KeyRing {
        let now = Utc::now();
        let current = key("current", now - Duration::days(1), now + Duration::days(20));
        let previous = key("previous", now - Duration::days(40), now - Duration::days(1));
        let resolution = ResolutionResult {
            default_key: current.clone(),
            valid_keys: vec![current, previous],
            warnings: Vec::new(),
            rotation_due: false,
            next_activation: None,
        };
        KeyRing::new(resolution, now, now + Duration::hours(1))
    }

    #[test]
    fn test_signing_credential_is_default_key() {
        let ring = ring();
        let credential = ring.signing_credential();
        assert_eq!(credential.key_id(), "current");
        assert_eq!(credential.algorithm(), SigningAlgorithm::EdDsa);
        assert_eq!(ring.default_key_id(), "current");
    }

    #[test]
    fn test_validation_keys_cover_whole_valid_set() {
        let ring = ring();
        let mut ids: Vec<_> = ring.validation_keys().into_iter().map(|k| k.key_id).collect();
        ids.sort();
        assert_eq!(ids, vec!["current".to_string(), "previous".to_string()]);
    }

    #[test]
    fn test_verify_with_any_valid_key() {
        let ring = ring();
        let signature = ring.signing_credential().sign(b"claims").unwrap();

        assert!(ring.verify("current", b"claims", &signature));
        assert!(!ring.verify("previous", b"claims", &signature));
        assert!(!ring.verify("unknown", b"claims", &signature));
        assert!(!ring.verify("current", b"other claims", &signature));

        let validation = ring
            .validation_keys()
            .into_iter()
            .find(|k| k.key_id == "current")
            .unwrap();
        assert!(validation.verify(b"claims", &signature));
    }
}
