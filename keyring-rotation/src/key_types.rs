//! Key type definitions
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
use chrono::{DateTime, Utc};
use rsa::pkcs8::EncodePublicKey;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;

/// Unique identifier for a key
pub type KeyId = String;

/// Signature algorithm a key is used with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SigningAlgorithm {
    /// RSASSA-PKCS1-v1_5 with SHA-256
    #[serde(rename = "RS256")]
    Rs256,
    /// Ed25519
    #[serde(rename = "EdDSA")]
    EdDsa,
}

impl SigningAlgorithm {
    /// JOSE name of the algorithm
    pub fn as_str(&self) -> &'static str {
        match self {
            SigningAlgorithm::Rs256 => "RS256",
            SigningAlgorithm::EdDsa => "EdDSA",
        }
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SigningAlgorithm {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RS256" | "RSA" => Ok(SigningAlgorithm::Rs256),
            "EDDSA" | "ED25519" => Ok(SigningAlgorithm::EdDsa),
            other => Err(KeyError::Configuration(format!(
                "Unsupported signing algorithm: {}",
                other
            ))),
        }
    }
}

/// Describes what a piece of key material is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDescriptor {
    pub algorithm: SigningAlgorithm,
    /// Modulus size in bits for RSA, 256 for Ed25519
    pub key_size: usize,
}

/// Persisted key record. The material is opaque to everything but the
/// encryptor configuration that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub id: KeyId,
    pub created_at: DateTime<Utc>,
    pub activation_date: DateTime<Utc>,
    pub expiration_date: DateTime<Utc>,
    pub revoked: bool,
    #[serde(with = "hex")]
    pub encrypted_material: Vec<u8>,
}

impl KeyRecord {
    pub fn new(
        id: KeyId,
        created_at: DateTime<Utc>,
        activation_date: DateTime<Utc>,
        expiration_date: DateTime<Utc>,
        encrypted_material: Vec<u8>,
    ) -> Self {
        Self {
            id,
            created_at,
            activation_date,
            expiration_date,
            revoked: false,
            encrypted_material,
        }
    }
}

/// Decrypted private key material
pub enum KeyMaterial {
    Rsa(RsaPrivateKey),
    Ed25519(ed25519_dalek::SigningKey),
}

impl KeyMaterial {
    pub fn descriptor(&self) -> KeyDescriptor {
        match self {
            KeyMaterial::Rsa(key) => {
                use rsa::traits::PublicKeyParts;
                KeyDescriptor {
                    algorithm: SigningAlgorithm::Rs256,
                    key_size: key.size() * 8,
                }
            }
            KeyMaterial::Ed25519(_) => KeyDescriptor {
                algorithm: SigningAlgorithm::EdDsa,
                key_size: 256,
            },
        }
    }

    /// Sign a payload with this key
    pub fn sign(&self, payload: &[u8]) -> KeyResult<Vec<u8>> {
        match self {
            KeyMaterial::Rsa(key) => {
                use rsa::signature::{SignatureEncoding, Signer};
                let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(key.clone());
                let signature = signing_key
                    .try_sign(payload)
                    .map_err(|e| KeyError::Encryption(format!("RSA signing failed: {}", e)))?;
                Ok(signature.to_vec())
            }
            KeyMaterial::Ed25519(key) => {
                use ed25519_dalek::Signer;
                Ok(key.sign(payload).to_bytes().to_vec())
            }
        }
    }

    pub fn public_key(&self) -> PublicKeyMaterial {
        match self {
            KeyMaterial::Rsa(key) => PublicKeyMaterial::Rsa(RsaPublicKey::from(key)),
            KeyMaterial::Ed25519(key) => PublicKeyMaterial::Ed25519(key.verifying_key()),
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let descriptor = self.descriptor();
        f.debug_struct("KeyMaterial")
            .field("algorithm", &descriptor.algorithm)
            .field("key_size", &descriptor.key_size)
            .finish_non_exhaustive()
    }
}

/// Public half of a key, used for signature verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKeyMaterial {
    Rsa(RsaPublicKey),
    Ed25519(ed25519_dalek::VerifyingKey),
}

impl PublicKeyMaterial {
    /// Check a signature. A malformed signature is simply not valid.
    pub fn verify(&self, payload: &[u8], signature: &[u8]) -> bool {
        match self {
            PublicKeyMaterial::Rsa(key) => {
                use rsa::signature::Verifier;
                let verifying_key = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(key.clone());
                match rsa::pkcs1v15::Signature::try_from(signature) {
                    Ok(sig) => verifying_key.verify(payload, &sig).is_ok(),
                    Err(_) => false,
                }
            }
            PublicKeyMaterial::Ed25519(key) => {
                use ed25519_dalek::Verifier;
                match ed25519_dalek::Signature::from_slice(signature) {
                    Ok(sig) => key.verify(payload, &sig).is_ok(),
                    Err(_) => false,
                }
            }
        }
    }

    /// SubjectPublicKeyInfo DER for RSA, the raw 32-byte point for Ed25519
    pub fn to_bytes(&self) -> KeyResult<Vec<u8>> {
        match self {
            PublicKeyMaterial::Rsa(key) => key
                .to_public_key_der()
                .map(|doc| doc.as_bytes().to_vec())
                .map_err(|e| KeyError::InvalidFormat(format!("RSA public key encoding: {}", e))),
            PublicKeyMaterial::Ed25519(key) => Ok(key.as_bytes().to_vec()),
        }
    }
}

/// A key record after decryption. Lives only as long as the key ring that
/// owns it.
#[derive(Debug)]
pub struct MaterializedKey {
    pub id: KeyId,
    pub created_at: DateTime<Utc>,
    pub activation_date: DateTime<Utc>,
    pub expiration_date: DateTime<Utc>,
    pub revoked: bool,
    pub descriptor: KeyDescriptor,
    pub material: KeyMaterial,
}

impl MaterializedKey {
    pub fn from_record(record: &KeyRecord, material: KeyMaterial) -> Self {
        Self {
            id: record.id.clone(),
            created_at: record.created_at,
            activation_date: record.activation_date,
            expiration_date: record.expiration_date,
            revoked: record.revoked,
            descriptor: material.descriptor(),
            material,
        }
    }

    /// Inside `[activation_date, expiration_date)` at `now`
    pub fn is_within_window(&self, now: DateTime<Utc>) -> bool {
        self.activation_date <= now && now < self.expiration_date
    }
}
