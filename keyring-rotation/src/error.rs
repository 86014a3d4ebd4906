//! Error types for signing key rotation
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


use thiserror::Error;

/// Key rotation errors
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Key already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid key format: {0}")]
    InvalidFormat(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    /// One record could not be turned back into key material
    #[error("Decryption error for key {key_id}: {reason}")]
    Decryption { key_id: String, reason: String },

    /// The cryptographic provider failed while creating a new key
    #[error("Key generation error: {0}")]
    KeyGeneration(String),

    /// No active, non-revoked key can serve as the default signing key
    #[error("No default key available")]
    NoDefaultKeyAvailable,

    /// No usable key ring has ever been produced
    #[error("Key ring unavailable: {0}")]
    KeyRingUnavailable(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Result type for key operations
pub type KeyResult<T> = Result<T, KeyError>;
