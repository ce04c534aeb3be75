//! # ESB Core
//!
//! Enterprise service bus core with:
//! - Service registry (logical name -> endpoint)
//! - JSON / XML / CSV payload transformation
//! - Circuit-breaker per destination service
//! - Dead Letter Queue (DLQ) with bounded retry
//! - Routing orchestrator tying the above together
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │        Enterprise Service Bus (Orchestrator)        │
//! └────────────┬────────────────────────────────────────┘
//!              │
//!     ┌────────┼────────────────┬────────────┐
//!     │        │                │            │
//! ┌───▼─────┐ ┌▼────────────┐ ┌─▼───────┐ ┌──▼──────────┐
//! │ Service │ │ Transform   │ │ Circuit │ │ Dead Letter │
//! │Registry │ │  Engine     │ │ Breaker │ │    Queue    │
//! └─────────┘ └─────────────┘ └────┬────┘ └─────────────┘
//!                                  │
//! ┌────────────────────────────────▼─────────────────┐
//! │        Service Connector (HTTP / custom)         │
//! └──────────────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod circuit_breaker;
pub mod config;
pub mod connector;
pub mod dlq;
pub mod error;
pub mod esb;
pub mod metrics;
pub mod registry;
pub mod transform;
pub mod types;

pub use error::{Error, Result};
pub use esb::EnterpriseServiceBus;
pub use types::*;

/// Default DLQ retry attempts
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default circuit breaker threshold (failures before opening)
pub const DEFAULT_CB_FAILURE_THRESHOLD: u32 = 5;

/// Default circuit breaker cool-down (seconds before half-open)
pub const DEFAULT_CB_COOLDOWN_SECONDS: u64 = 30;

/// Default age (hours) after which dead letters are archived
pub const DEFAULT_ARCHIVE_AFTER_HOURS: u64 = 168;

/// Default root element for JSON -> XML
pub const DEFAULT_XML_ROOT_ELEMENT: &str = "Message";

/// Default per-attempt delivery timeout (seconds)
pub const DEFAULT_DELIVERY_TIMEOUT_SECONDS: u64 = 10;
