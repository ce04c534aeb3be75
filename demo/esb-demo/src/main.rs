// ESB Demo - Walks messages through routing, transformation, breaker and DLQ
// against simulated downstream services

use anyhow::Result;
use async_trait::async_trait;
use colored::Colorize;
use esb_core::{
    config::EsbConfig, connector::ServiceConnector, EnterpriseServiceBus, Error, MessageFormat,
    ServiceBusMessage, ServiceRegistryEntry,
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tokio::time::{sleep, Duration};
use tracing::info;

/// Stands in for downstream endpoints; services in `down` reject every call
#[derive(Default)]
struct SimulatedConnector {
    down: RwLock<HashSet<String>>,
}

impl SimulatedConnector {
    fn set_down(&self, service_name: &str, down: bool) {
        let mut services = self.down.write().unwrap_or_else(|e| e.into_inner());
        if down {
            services.insert(service_name.to_string());
        } else {
            services.remove(service_name);
        }
    }

    fn is_down(&self, service_name: &str) -> bool {
        self.down
            .read()
            .map(|s| s.contains(service_name))
            .unwrap_or(false)
    }
}

#[async_trait]
impl ServiceConnector for SimulatedConnector {
    async fn deliver(
        &self,
        endpoint: &ServiceRegistryEntry,
        message: &ServiceBusMessage,
    ) -> esb_core::Result<()> {
        sleep(Duration::from_millis(20)).await;

        if self.is_down(&endpoint.service_name) {
            return Err(Error::Delivery {
                service_name: endpoint.service_name.clone(),
                reason: "endpoint returned HTTP 503".to_string(),
            });
        }

        println!(
            "    {} {} <- {}",
            "→".cyan(),
            endpoint.endpoint_url.dimmed(),
            message.payload.as_text()
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

struct EsbDemo {
    bus: EnterpriseServiceBus,
    connector: Arc<SimulatedConnector>,
}

impl EsbDemo {
    fn new(config: &EsbConfig) -> Result<Self> {
        let connector = Arc::new(SimulatedConnector::default());
        let bus = EnterpriseServiceBus::new(config, connector.clone());

        for (name, url, kind) in [
            ("DemoService", "https://demo.api.company.com/messages", "REST"),
            ("LegacyBilling", "https://billing.internal/soap", "SOAP"),
            ("FlakyService", "https://flaky.api.company.com/ingest", "REST"),
        ] {
            bus.register_service(ServiceRegistryEntry::new(name, url).with_service_type(kind))?;
        }

        Ok(Self { bus, connector })
    }

    async fn route(&self, message: ServiceBusMessage) -> Result<bool> {
        let id = message.id.clone();
        let target = message.target_service.clone();
        let delivered = self.bus.route_message(message).await?;

        if delivered {
            println!("  {} {} delivered to {}", "✅".green(), id, target.bold());
        } else {
            println!(
                "  {} {} dead-lettered for {}",
                "❌".red(),
                id,
                target.bold()
            );
        }
        Ok(delivered)
    }

    async fn run(&self) -> Result<()> {
        banner("1. Routing with format transformation");
        self.route(
            ServiceBusMessage::new(
                "CustomerUpdate",
                "DemoService",
                json!({"name": "John Doe", "age": 30}),
            )
            .with_id("demo-001")
            .with_formats(MessageFormat::Json, MessageFormat::Xml),
        )
        .await?;
        self.route(
            ServiceBusMessage::new(
                "Invoice",
                "LegacyBilling",
                json!({"invoice": "INV-7", "amount": 120.5, "currency": "EUR"}),
            )
            .with_id("demo-002")
            .with_formats(MessageFormat::Json, MessageFormat::Csv),
        )
        .await?;

        banner("2. Unregistered destination");
        self.route(
            ServiceBusMessage::new("Order", "UnavailableService", json!({"id": 1}))
                .with_id("demo-003"),
        )
        .await?;

        banner("3. Failing destination trips the breaker");
        self.connector.set_down("FlakyService", true);
        let threshold = self.bus.circuit_breakers().config().failure_threshold;
        for i in 0..=threshold {
            self.route(
                ServiceBusMessage::new("Telemetry", "FlakyService", json!({"seq": i}))
                    .with_id(format!("flaky-{:03}", i)),
            )
            .await?;
            let status = self.bus.get_circuit_breaker_status("FlakyService");
            println!(
                "    breaker: {} (failures: {})",
                status.state.to_string().yellow(),
                status.failure_count
            );
        }

        banner("4. Recovery and dead-letter retry");
        self.connector.set_down("FlakyService", false);
        self.bus.reset_circuit_breaker("FlakyService");
        for message in self.bus.get_dead_letter_messages("FlakyService") {
            let retried = self.bus.retry_message(&message.id).await;
            let mark = if retried { "✅".green() } else { "❌".red() };
            println!("  {} retry {}", mark, message.id);
        }

        banner("5. Summary");
        let transforms = self.bus.get_transformation_metrics();
        println!(
            "  transformations: {} total, {} ok, {} failed",
            transforms.total, transforms.successful, transforms.failed
        );
        for name in ["DemoService", "LegacyBilling", "FlakyService", "UnavailableService"] {
            let health = self.bus.get_service_health(name);
            let dlq = self.bus.get_dead_letter_metrics(name);
            println!(
                "  {:<20} {:?} / breaker {} / DLQ {} pending, {} archived",
                name.bold(),
                health.status,
                health.circuit_state,
                dlq.pending,
                dlq.archived
            );
        }

        Ok(())
    }
}

fn banner(title: &str) {
    println!("\n{}", format!("=== {} ===", title).bold().blue());
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let config = EsbConfig::from_env()?;
    info!("Starting ESB demo with config: {:?}", config);

    println!("{}", "🚌 Enterprise Service Bus demo".bold());
    let demo = EsbDemo::new(&config)?;
    demo.run().await?;

    println!("\n{}", "Demo complete".green().bold());
    Ok(())
}
