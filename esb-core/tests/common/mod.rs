//! Shared test connector

use async_trait::async_trait;
use esb_core::{
    config::EsbConfig, connector::ServiceConnector, EnterpriseServiceBus, Error, Result,
    ServiceBusMessage, ServiceRegistryEntry,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Records every delivery; fails or stalls on demand
#[derive(Default)]
pub struct RecordingConnector {
    pub delivered: Mutex<Vec<ServiceBusMessage>>,
    pub calls: AtomicUsize,
    pub failing: AtomicBool,
    pub stall: Mutex<Option<Duration>>,
}

#[allow(dead_code)]
impl RecordingConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_stall(&self, stall: Duration) {
        *self.stall.lock().unwrap() = Some(stall);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<ServiceBusMessage> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceConnector for RecordingConnector {
    async fn deliver(
        &self,
        endpoint: &ServiceRegistryEntry,
        message: &ServiceBusMessage,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let stall = *self.stall.lock().unwrap();
        if let Some(stall) = stall {
            tokio::time::sleep(stall).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Delivery {
                service_name: endpoint.service_name.clone(),
                reason: "endpoint returned HTTP 503".to_string(),
            });
        }

        self.delivered.lock().unwrap().push(message.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

#[allow(dead_code)]
pub fn bus_with(config: &EsbConfig) -> (EnterpriseServiceBus, Arc<RecordingConnector>) {
    let connector = RecordingConnector::new();
    let bus = EnterpriseServiceBus::new(config, connector.clone());
    (bus, connector)
}

#[allow(dead_code)]
pub fn bus() -> (EnterpriseServiceBus, Arc<RecordingConnector>) {
    bus_with(&EsbConfig::default())
}
