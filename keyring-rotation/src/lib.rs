//! Signing key rotation for token services
//!
//! Keeps a repository of signing keys, decides which key signs new tokens
//! and which keys still verify presented ones, and rotates keys ahead of
//! expiry. Several instances may share one repository.
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


pub mod clock;
pub mod encryptor;
pub mod error;
pub mod key_manager;
pub mod key_ring;
pub mod key_types;
pub mod local_store;
pub mod memory_store;
pub mod options;
pub mod provider;
pub mod repository;
pub mod resolver;
pub mod scheduler;
pub mod service_integration;

pub use clock::{Clock, ManualClock, SystemClock};
pub use encryptor::{
    EncryptorConfiguration, Ed25519EncryptorConfiguration, MasterKeyProtector,
    RsaEncryptorConfiguration,
};
pub use error::{KeyError, KeyResult};
pub use key_manager::KeyManager;
pub use key_ring::{KeyRing, SigningCredential, ValidationKey};
pub use key_types::{KeyId, KeyMaterial, KeyRecord, MaterializedKey, SigningAlgorithm};
pub use local_store::LocalKeyRepository;
pub use memory_store::InMemoryKeyRepository;
pub use options::KeyRotationOptions;
pub use provider::{CacheableKeyRingProvider, KeyRingProvider};
pub use repository::KeyRepository;
pub use resolver::{DefaultKeyResolver, KeyState, ResolutionResult};
pub use scheduler::{RotationCheck, RotationScheduler, RotationSchedulerHandle};
pub use service_integration::*;
