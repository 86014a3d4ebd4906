//! Encryptor configuration: how new keys are generated and how key
//! material is protected at rest.
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
use crate::key_types::{KeyMaterial, SigningAlgorithm};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroizing;

const NONCE_LEN: usize = 12;

/// Environment variable holding the at-rest master key
pub const MASTER_KEY_ENV: &str = "KEYRING_MASTER_KEY";

/// Smallest RSA modulus accepted for new keys
pub const MIN_RSA_KEY_SIZE: usize = 2048;

/// AES-256-GCM envelope around serialized key material
pub struct MasterKeyProtector {
    master_key: Zeroizing<[u8; 32]>,
}

impl MasterKeyProtector {
    pub fn new(master_key: &[u8]) -> KeyResult<Self> {
        if master_key.len() != 32 {
            return Err(KeyError::Configuration(
                "Master key must be exactly 32 bytes".to_string(),
            ));
        }
        let mut mk = Zeroizing::new([0u8; 32]);
        mk.copy_from_slice(master_key);
        Ok(Self { master_key: mk })
    }

    /// Derive the master key from the named variable, normally
    /// [`MASTER_KEY_ENV`]. A missing variable is a configuration error: a
    /// made-up key could not read keys written by other instances.
    pub fn from_env_var(name: &str) -> KeyResult<Self> {
        let secret = std::env::var(name)
            .map_err(|_| KeyError::Configuration(format!("{} is not set", name)))?;
        if secret.trim().is_empty() {
            return Err(KeyError::Configuration(format!("{} is empty", name)));
        }
        Self::from_secret(&secret)
    }

    /// Accepts 64 hex characters, otherwise hashes the passphrase with SHA-256
    pub fn from_secret(secret: &str) -> KeyResult<Self> {
        if let Ok(key_bytes) = hex::decode(secret) {
            if key_bytes.len() == 32 {
                return Self::new(&key_bytes);
            }
        }
        let hash = Sha256::digest(secret.as_bytes());
        Self::new(&hash)
    }

    pub fn generate() -> Self {
        use rand::RngCore;
        let mut mk = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut mk[..]);
        Self { master_key: mk }
    }

    /// Encrypt, prepending the nonce to the ciphertext
    pub fn seal(&self, plaintext: &[u8]) -> KeyResult<Vec<u8>> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.master_key.as_slice()));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| KeyError::Encryption(format!("Encryption failed: {}", e)))?;

        let mut result = nonce.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    pub fn open(&self, sealed: &[u8]) -> KeyResult<Zeroizing<Vec<u8>>> {
        if sealed.len() < NONCE_LEN {
            return Err(KeyError::InvalidFormat(
                "Encrypted data too short".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.master_key.as_slice()));

        cipher
            .decrypt(nonce, ciphertext)
            .map(Zeroizing::new)
            .map_err(|e| KeyError::InvalidFormat(format!("Authentication failed: {}", e)))
    }
}

impl std::fmt::Debug for MasterKeyProtector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKeyProtector { .. }")
    }
}

/// Plaintext layout sealed inside a record
#[derive(Serialize, Deserialize)]
struct StoredKeyMaterial {
    algorithm: SigningAlgorithm,
    #[serde(with = "hex")]
    secret: Vec<u8>,
}

impl Drop for StoredKeyMaterial {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.secret.zeroize();
    }
}

fn encode_material(material: &KeyMaterial) -> KeyResult<StoredKeyMaterial> {
    match material {
        KeyMaterial::Rsa(key) => {
            let der = key
                .to_pkcs8_der()
                .map_err(|e| KeyError::Encryption(format!("PKCS#8 encoding failed: {}", e)))?;
            Ok(StoredKeyMaterial {
                algorithm: SigningAlgorithm::Rs256,
                secret: der.as_bytes().to_vec(),
            })
        }
        KeyMaterial::Ed25519(key) => Ok(StoredKeyMaterial {
            algorithm: SigningAlgorithm::EdDsa,
            secret: key.to_bytes().to_vec(),
        }),
    }
}

fn decode_material(stored: &StoredKeyMaterial) -> KeyResult<KeyMaterial> {
    match stored.algorithm {
        SigningAlgorithm::Rs256 => RsaPrivateKey::from_pkcs8_der(&stored.secret)
            .map(KeyMaterial::Rsa)
            .map_err(|e| KeyError::InvalidFormat(format!("PKCS#8 decoding failed: {}", e))),
        SigningAlgorithm::EdDsa => {
            let seed: [u8; 32] = stored.secret.as_slice().try_into().map_err(|_| {
                KeyError::InvalidFormat(format!(
                    "Ed25519 seed must be 32 bytes, got {}",
                    stored.secret.len()
                ))
            })?;
            Ok(KeyMaterial::Ed25519(ed25519_dalek::SigningKey::from_bytes(
                &seed,
            )))
        }
    }
}

/// Policy for generating and protecting signing keys.
///
/// `decrypt` understands material of any algorithm, so switching the
/// configured algorithm keeps older keys readable.
pub trait EncryptorConfiguration: Send + Sync {
    fn algorithm(&self) -> SigningAlgorithm;

    fn key_size(&self) -> usize;

    fn protector(&self) -> &MasterKeyProtector;

    /// Generate fresh key material for a new key
    fn generate_key_material(&self) -> KeyResult<KeyMaterial>;

    fn encrypt(&self, material: &KeyMaterial) -> KeyResult<Vec<u8>> {
        let stored = encode_material(material)?;
        let plaintext = Zeroizing::new(serde_json::to_vec(&stored)?);
        self.protector().seal(&plaintext)
    }

    fn decrypt(&self, encrypted: &[u8]) -> KeyResult<KeyMaterial> {
        let plaintext = self.protector().open(encrypted)?;
        let stored: StoredKeyMaterial = serde_json::from_slice(&plaintext)?;
        decode_material(&stored)
    }
}

/// RS256 keys
#[derive(Debug)]
pub struct RsaEncryptorConfiguration {
    key_size: usize,
    protector: Arc<MasterKeyProtector>,
}

impl RsaEncryptorConfiguration {
    pub const DEFAULT_KEY_SIZE: usize = 2048;

    pub fn new(key_size: usize, protector: Arc<MasterKeyProtector>) -> KeyResult<Self> {
        if key_size < MIN_RSA_KEY_SIZE {
            return Err(KeyError::Configuration(format!(
                "RSA key size {} is below the minimum of {}",
                key_size, MIN_RSA_KEY_SIZE
            )));
        }
        Ok(Self {
            key_size,
            protector,
        })
    }
}

impl EncryptorConfiguration for RsaEncryptorConfiguration {
    fn algorithm(&self) -> SigningAlgorithm {
        SigningAlgorithm::Rs256
    }

    fn key_size(&self) -> usize {
        self.key_size
    }

    fn protector(&self) -> &MasterKeyProtector {
        &self.protector
    }

    fn generate_key_material(&self) -> KeyResult<KeyMaterial> {
        debug!(bits = self.key_size, "Generating RSA key pair");
        let mut rng = rand::rngs::OsRng;
        RsaPrivateKey::new(&mut rng, self.key_size)
            .map(KeyMaterial::Rsa)
            .map_err(|e| KeyError::KeyGeneration(format!("RSA key generation failed: {}", e)))
    }
}

/// EdDSA keys over Curve25519
#[derive(Debug)]
pub struct Ed25519EncryptorConfiguration {
    protector: Arc<MasterKeyProtector>,
}

impl Ed25519EncryptorConfiguration {
    pub fn new(protector: Arc<MasterKeyProtector>) -> Self {
        Self { protector }
    }
}

impl EncryptorConfiguration for Ed25519EncryptorConfiguration {
    fn algorithm(&self) -> SigningAlgorithm {
        SigningAlgorithm::EdDsa
    }

    fn key_size(&self) -> usize {
        256
    }

    fn protector(&self) -> &MasterKeyProtector {
        &self.protector
    }

    fn generate_key_material(&self) -> KeyResult<KeyMaterial> {
        let mut rng = rand::rngs::OsRng;
        Ok(KeyMaterial::Ed25519(ed25519_dalek::SigningKey::generate(
            &mut rng,
        )))
    }
}

/// Build the encryptor configuration for an algorithm name
pub fn encryptor_for(
    algorithm: SigningAlgorithm,
    rsa_key_size: usize,
    protector: Arc<MasterKeyProtector>,
) -> KeyResult<Arc<dyn EncryptorConfiguration>> {
    match algorithm {
        SigningAlgorithm::Rs256 => Ok(Arc::new(RsaEncryptorConfiguration::new(
            rsa_key_size,
            protector,
        )?)),
        SigningAlgorithm::EdDsa => Ok(Arc::new(Ed25519EncryptorConfiguration::new(protector))),
    }
}
