//! Shared types for the service bus

use crate::{circuit_breaker::CircuitState, Error};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

/// Header naming the payload's current format
pub const HEADER_SOURCE_FORMAT: &str = "SourceFormat";

/// Header naming the format the target service expects
pub const HEADER_TARGET_FORMAT: &str = "TargetFormat";

/// Wire format of a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageFormat {
    /// JSON document
    Json,
    /// XML document
    Xml,
    /// Single-record CSV (header row + value row)
    Csv,
}

impl MessageFormat {
    /// Header value for this format
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageFormat::Json => "JSON",
            MessageFormat::Xml => "XML",
            MessageFormat::Csv => "CSV",
        }
    }
}

impl std::fmt::Display for MessageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "JSON" => Ok(MessageFormat::Json),
            "XML" => Ok(MessageFormat::Xml),
            "CSV" => Ok(MessageFormat::Csv),
            other => Err(Error::InvalidArgument(format!(
                "unsupported message format: {}",
                other
            ))),
        }
    }
}

/// Message payload.
///
/// Structured documents travel as a JSON tree; serialized XML/CSV (or raw JSON
/// text) travels as text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    /// Structured document (object/array/scalar nodes)
    Document(serde_json::Value),
    /// Serialized text
    Text(String),
}

impl Payload {
    /// Text form of the payload; documents are rendered as compact JSON
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Payload::Text(text) => Cow::Borrowed(text.as_str()),
            Payload::Document(value) => Cow::Owned(value.to_string()),
        }
    }

    /// Structured document, if this payload carries one
    pub fn as_document(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Document(value) => Some(value),
            Payload::Text(_) => None,
        }
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Document(value)
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

/// Message handed to the bus for routing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceBusMessage {
    /// Message ID (opaque)
    pub id: String,
    /// Message type tag
    pub message_type: String,
    /// Payload
    pub payload: Payload,
    /// Logical name of the destination service
    pub target_service: String,
    /// Created at
    pub timestamp: DateTime<Utc>,
    /// Cross-cutting instructions (e.g. `SourceFormat`/`TargetFormat`)
    pub headers: HashMap<String, String>,
}

impl ServiceBusMessage {
    /// Create a message with a fresh ID
    pub fn new(
        message_type: impl Into<String>,
        target_service: impl Into<String>,
        payload: impl Into<Payload>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type: message_type.into(),
            payload: payload.into(),
            target_service: target_service.into(),
            timestamp: Utc::now(),
            headers: HashMap::new(),
        }
    }

    /// Set message ID
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Add header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Set `SourceFormat` and `TargetFormat` headers
    pub fn with_formats(self, source: MessageFormat, target: MessageFormat) -> Self {
        self.with_header(HEADER_SOURCE_FORMAT, source.as_str())
            .with_header(HEADER_TARGET_FORMAT, target.as_str())
    }

    /// Header value by exact key
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Source/target format pair, if both headers are present
    pub fn format_pair(&self) -> Option<(&str, &str)> {
        Some((
            self.header(HEADER_SOURCE_FORMAT)?,
            self.header(HEADER_TARGET_FORMAT)?,
        ))
    }
}

/// Registry record for a logical service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistryEntry {
    /// Service name (unique key, case-sensitive)
    pub service_name: String,
    /// Endpoint URL
    pub endpoint_url: String,
    /// Service type tag (e.g. "REST")
    pub service_type: String,
    /// Accepting traffic
    pub is_active: bool,
    /// Registered at
    pub registered_at: DateTime<Utc>,
}

impl ServiceRegistryEntry {
    /// Active REST service at `endpoint_url`
    pub fn new(service_name: impl Into<String>, endpoint_url: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            endpoint_url: endpoint_url.into(),
            service_type: "REST".to_string(),
            is_active: true,
            registered_at: Utc::now(),
        }
    }

    /// Set service type tag
    pub fn with_service_type(mut self, service_type: impl Into<String>) -> Self {
        self.service_type = service_type.into();
        self
    }

    /// Set active flag
    pub fn with_active(mut self, is_active: bool) -> Self {
        self.is_active = is_active;
        self
    }
}

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Registered, active, breaker closed, nothing dead-lettered
    Healthy,
    /// Operational with pending dead letters or a half-open breaker
    Degraded,
    /// Unregistered, inactive, or breaker open
    Unhealthy,
}

/// Combined view of one destination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    /// Service name
    pub service_name: String,
    /// Status
    pub status: HealthStatus,
    /// Present in the registry
    pub registered: bool,
    /// Registry active flag
    pub is_active: bool,
    /// Breaker state
    pub circuit_state: CircuitState,
    /// Dead letters awaiting retry
    pub dead_letters_pending: usize,
    /// Last check
    pub last_check: DateTime<Utc>,
}
