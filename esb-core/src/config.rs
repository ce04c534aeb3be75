//! Service bus configuration

use crate::{circuit_breaker::CircuitBreakerConfig, dlq::DeadLetterConfig, Result};
use config::Environment;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct EsbConfig {
    /// Circuit breaker policy
    pub circuit_breaker: BreakerSettings,
    /// Dead-letter policy
    pub dead_letter: DeadLetterSettings,
    /// Transformation settings
    pub transform: TransformSettings,
    /// Delivery settings
    pub delivery: DeliverySettings,
}

/// Circuit breaker policy
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BreakerSettings {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Seconds an open breaker waits before admitting a trial call
    pub cooldown_seconds: u64,
}

/// Dead-letter policy
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DeadLetterSettings {
    /// Retries before an entry is archived
    pub max_retry_attempts: u32,
    /// Age in hours after which an entry may be archived
    pub archive_after_hours: u64,
}

/// Transformation settings
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TransformSettings {
    /// Root element wrapped around JSON documents rendered as XML
    pub xml_root_element: String,
}

/// Delivery settings
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DeliverySettings {
    /// Per-attempt delivery timeout in seconds
    pub timeout_seconds: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: crate::DEFAULT_CB_FAILURE_THRESHOLD,
            cooldown_seconds: crate::DEFAULT_CB_COOLDOWN_SECONDS,
        }
    }
}

impl Default for DeadLetterSettings {
    fn default() -> Self {
        Self {
            max_retry_attempts: crate::DEFAULT_RETRY_ATTEMPTS,
            archive_after_hours: crate::DEFAULT_ARCHIVE_AFTER_HOURS,
        }
    }
}

impl Default for TransformSettings {
    fn default() -> Self {
        Self {
            xml_root_element: crate::DEFAULT_XML_ROOT_ELEMENT.to_string(),
        }
    }
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            timeout_seconds: crate::DEFAULT_DELIVERY_TIMEOUT_SECONDS,
        }
    }
}

impl EsbConfig {
    /// Load defaults overridden by `ESB__SECTION__KEY` environment variables
    pub fn from_env() -> Result<Self> {
        let builder = config::Config::builder()
            .set_default(
                "circuit_breaker.failure_threshold",
                crate::DEFAULT_CB_FAILURE_THRESHOLD,
            )?
            .set_default(
                "circuit_breaker.cooldown_seconds",
                crate::DEFAULT_CB_COOLDOWN_SECONDS,
            )?
            .set_default(
                "dead_letter.max_retry_attempts",
                crate::DEFAULT_RETRY_ATTEMPTS,
            )?
            .set_default(
                "dead_letter.archive_after_hours",
                crate::DEFAULT_ARCHIVE_AFTER_HOURS,
            )?
            .set_default(
                "transform.xml_root_element",
                crate::DEFAULT_XML_ROOT_ELEMENT,
            )?
            .set_default(
                "delivery.timeout_seconds",
                crate::DEFAULT_DELIVERY_TIMEOUT_SECONDS,
            )?
            .add_source(Environment::with_prefix("ESB").separator("__"));

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Breaker config derived from these settings
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold.max(1),
            cooldown: Duration::from_secs(self.circuit_breaker.cooldown_seconds),
        }
    }

    /// Dead-letter config derived from these settings
    pub fn dead_letter_config(&self) -> DeadLetterConfig {
        DeadLetterConfig {
            max_retry_attempts: self.dead_letter.max_retry_attempts,
            archive_after: Duration::from_secs(self.dead_letter.archive_after_hours * 3600),
        }
    }

    /// Delivery timeout
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery.timeout_seconds)
    }
}
