//! Key rotation options
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


use crate::encryptor::{encryptor_for, EncryptorConfiguration, MasterKeyProtector};
use crate::error::{KeyError, KeyResult};
use crate::key_types::SigningAlgorithm;
use chrono::Duration;
use keyring_config::KeyRingConfig;
use std::fmt;
use std::sync::Arc;

/// Rotation policy. Immutable once handed to the key manager.
#[derive(Clone)]
pub struct KeyRotationOptions {
    /// Lifetime of a newly created key
    pub rotation_period: Duration,
    /// How long a key stays valid for verification after it expires, and how
    /// early a successor should exist before the default expires
    pub propagation_window: Duration,
    /// How long an expired key is kept in the repository before purge
    pub retention_window: Duration,
    /// Delay between creating a key on demand and activating it
    pub new_key_activation_delay: Duration,
    /// Upper bound on how long a resolved key ring is cached
    pub refresh_period: Duration,
    /// Pending keys activating within this window are accepted for
    /// verification, so instances with a clock ahead of ours still verify
    pub max_clock_skew: Duration,
    /// A key must have been active this long before it becomes default
    pub activation_stabilization: Duration,
    /// How long a stale ring is re-armed after a failed refresh
    pub failure_retry_interval: Duration,
    pub encryptor: Arc<dyn EncryptorConfiguration>,
}

impl KeyRotationOptions {
    pub const DEFAULT_ROTATION_PERIOD_DAYS: i64 = 90;
    pub const DEFAULT_PROPAGATION_WINDOW_DAYS: i64 = 2;
    pub const DEFAULT_RETENTION_WINDOW_DAYS: i64 = 30;
    pub const DEFAULT_REFRESH_PERIOD_HOURS: i64 = 24;
    pub const DEFAULT_MAX_CLOCK_SKEW_MINUTES: i64 = 5;
    pub const DEFAULT_FAILURE_RETRY_MINUTES: i64 = 2;

    /// Options with default timings around the given encryptor
    pub fn new(encryptor: Arc<dyn EncryptorConfiguration>) -> Self {
        Self {
            rotation_period: Duration::days(Self::DEFAULT_ROTATION_PERIOD_DAYS),
            propagation_window: Duration::days(Self::DEFAULT_PROPAGATION_WINDOW_DAYS),
            retention_window: Duration::days(Self::DEFAULT_RETENTION_WINDOW_DAYS),
            new_key_activation_delay: Duration::zero(),
            refresh_period: Duration::hours(Self::DEFAULT_REFRESH_PERIOD_HOURS),
            max_clock_skew: Duration::minutes(Self::DEFAULT_MAX_CLOCK_SKEW_MINUTES),
            activation_stabilization: Duration::zero(),
            failure_retry_interval: Duration::minutes(Self::DEFAULT_FAILURE_RETRY_MINUTES),
            encryptor,
        }
    }

    /// Build options from loaded configuration and a master key
    pub fn from_config(
        config: &KeyRingConfig,
        protector: Arc<MasterKeyProtector>,
    ) -> KeyResult<Self> {
        let algorithm: SigningAlgorithm = config.algorithm.parse()?;
        let encryptor = encryptor_for(algorithm, config.rsa_key_size, protector)?;

        let days = |name: &str, value: u32| config_duration(name, value.into(), Duration::try_days);
        let hours =
            |name: &str, value: u32| config_duration(name, value.into(), Duration::try_hours);
        let seconds = |name: &str, value: u64| config_duration(name, value, Duration::try_seconds);

        let options = Self {
            rotation_period: days("rotation_period_days", config.rotation_period_days)?,
            propagation_window: hours("propagation_window_hours", config.propagation_window_hours)?,
            retention_window: days("retention_window_days", config.retention_window_days)?,
            new_key_activation_delay: seconds(
                "new_key_activation_delay_secs",
                config.new_key_activation_delay_secs,
            )?,
            refresh_period: hours("refresh_period_hours", config.refresh_period_hours)?,
            max_clock_skew: seconds("max_clock_skew_secs", config.max_clock_skew_secs)?,
            activation_stabilization: seconds(
                "activation_stabilization_secs",
                config.activation_stabilization_secs,
            )?,
            failure_retry_interval: seconds("failure_retry_secs", config.failure_retry_secs)?,
            encryptor,
        };
        options.validate()?;
        Ok(options)
    }

    pub fn with_rotation_period(mut self, period: Duration) -> Self {
        self.rotation_period = period;
        self
    }

    pub fn with_propagation_window(mut self, window: Duration) -> Self {
        self.propagation_window = window;
        self
    }

    pub fn with_retention_window(mut self, window: Duration) -> Self {
        self.retention_window = window;
        self
    }

    pub fn with_new_key_activation_delay(mut self, delay: Duration) -> Self {
        self.new_key_activation_delay = delay;
        self
    }

    pub fn with_refresh_period(mut self, period: Duration) -> Self {
        self.refresh_period = period;
        self
    }

    pub fn with_max_clock_skew(mut self, skew: Duration) -> Self {
        self.max_clock_skew = skew;
        self
    }

    pub fn with_activation_stabilization(mut self, delay: Duration) -> Self {
        self.activation_stabilization = delay;
        self
    }

    pub fn with_failure_retry_interval(mut self, interval: Duration) -> Self {
        self.failure_retry_interval = interval;
        self
    }

    /// Check the invariants between the timings
    pub fn validate(&self) -> KeyResult<()> {
        let non_negative = [
            ("propagation_window", self.propagation_window),
            ("retention_window", self.retention_window),
            ("new_key_activation_delay", self.new_key_activation_delay),
            ("max_clock_skew", self.max_clock_skew),
            ("activation_stabilization", self.activation_stabilization),
        ];
        for (name, value) in non_negative {
            if value < Duration::zero() {
                return Err(KeyError::Configuration(format!("{} must not be negative", name)));
            }
        }

        let positive = [
            ("rotation_period", self.rotation_period),
            ("refresh_period", self.refresh_period),
            ("failure_retry_interval", self.failure_retry_interval),
        ];
        for (name, value) in positive {
            if value <= Duration::zero() {
                return Err(KeyError::Configuration(format!("{} must be positive", name)));
            }
        }

        if self.propagation_window >= self.rotation_period {
            return Err(KeyError::Configuration(format!(
                "propagation window ({}s) must be shorter than the rotation period ({}s)",
                self.propagation_window.num_seconds(),
                self.rotation_period.num_seconds()
            )));
        }

        Ok(())
    }
}

impl fmt::Debug for KeyRotationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRotationOptions")
            .field("rotation_period", &self.rotation_period)
            .field("propagation_window", &self.propagation_window)
            .field("retention_window", &self.retention_window)
            .field("new_key_activation_delay", &self.new_key_activation_delay)
            .field("refresh_period", &self.refresh_period)
            .field("max_clock_skew", &self.max_clock_skew)
            .field("activation_stabilization", &self.activation_stabilization)
            .field("failure_retry_interval", &self.failure_retry_interval)
            .field("algorithm", &self.encryptor.algorithm())
            .field("key_size", &self.encryptor.key_size())
            .finish()
    }
}

/// Convert a configured count into a duration, rejecting values chrono
/// cannot represent
fn config_duration(
    name: &str,
    value: u64,
    unit: fn(i64) -> Option<Duration>,
) -> KeyResult<Duration> {
    i64::try_from(value)
        .ok()
        .and_then(unit)
        .ok_or_else(|| KeyError::Configuration(format!("{} is out of range: {}", name, value)))
}
