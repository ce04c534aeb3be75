//! Delivery boundary to registered endpoints

use crate::{
    types::{MessageFormat, Payload, ServiceBusMessage, ServiceRegistryEntry, HEADER_TARGET_FORMAT},
    Error, Result,
};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tracing::debug;

/// Header carrying the message ID on outbound requests
pub const MESSAGE_ID_HEADER: &str = "X-Message-Id";

/// Header carrying the message type on outbound requests
pub const MESSAGE_TYPE_HEADER: &str = "X-Message-Type";

/// Delivers a message to the endpoint the registry resolved
#[async_trait]
pub trait ServiceConnector: Send + Sync {
    /// Deliver `message` to `endpoint`; any error counts as a failed attempt
    async fn deliver(
        &self,
        endpoint: &ServiceRegistryEntry,
        message: &ServiceBusMessage,
    ) -> Result<()>;

    /// Connector name
    fn name(&self) -> &str;
}

/// Delivers by POSTing the payload to the endpoint URL
pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    /// Create connector with a per-request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    fn content_type(message: &ServiceBusMessage) -> &'static str {
        if let Payload::Document(_) = message.payload {
            return "application/json";
        }
        match message
            .header(HEADER_TARGET_FORMAT)
            .and_then(|f| f.parse::<MessageFormat>().ok())
        {
            Some(MessageFormat::Json) => "application/json",
            Some(MessageFormat::Xml) => "application/xml",
            Some(MessageFormat::Csv) => "text/csv",
            None => "text/plain",
        }
    }
}

#[async_trait]
impl ServiceConnector for HttpConnector {
    async fn deliver(
        &self,
        endpoint: &ServiceRegistryEntry,
        message: &ServiceBusMessage,
    ) -> Result<()> {
        debug!(
            "POST {} for message {} ({})",
            endpoint.endpoint_url, message.id, message.message_type
        );

        let response = self
            .client
            .post(&endpoint.endpoint_url)
            .header(MESSAGE_ID_HEADER, &message.id)
            .header(MESSAGE_TYPE_HEADER, &message.message_type)
            .header(CONTENT_TYPE, Self::content_type(message))
            .body(message.payload.as_text().into_owned())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::Delivery {
                service_name: endpoint.service_name.clone(),
                reason: format!("endpoint returned HTTP {}", status.as_u16()),
            })
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}
