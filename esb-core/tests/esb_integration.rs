//! End-to-end routing tests (registry -> transform -> breaker -> connector -> DLQ)

mod common;

use common::{bus, bus_with};
use esb_core::{
    circuit_breaker::CircuitState, config::EsbConfig, esb::SERVICE_UNAVAILABLE_REASON,
    EnterpriseServiceBus, HealthStatus, MessageFormat, Payload, ServiceBusMessage,
    ServiceRegistryEntry,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn register(bus: &EnterpriseServiceBus, name: &str) {
    assert!(bus
        .register_service(ServiceRegistryEntry::new(
            name,
            format!("https://{}.api.company.com", name.to_lowercase())
        ))
        .unwrap());
}

fn customer_message(target: &str) -> ServiceBusMessage {
    ServiceBusMessage::new(
        "CustomerUpdate",
        target,
        json!({"name": "John Doe", "age": 30}),
    )
    .with_formats(MessageFormat::Json, MessageFormat::Xml)
}

#[tokio::test]
async fn test_route_transforms_and_delivers() {
    let (bus, connector) = bus();
    register(&bus, "DemoService");

    let message = customer_message("DemoService").with_id("msg-001");
    assert!(bus.route_message(message).await.unwrap());

    let delivered = connector.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].id, "msg-001");
    let body = delivered[0].payload.as_text();
    assert!(body.starts_with("<Message>"));
    assert!(body.contains("<name>John Doe</name>"));
    assert!(body.contains("<age>30</age>"));

    assert!(bus.dead_letter_queue().is_empty());
    assert_eq!(bus.get_transformation_metrics().successful, 1);
    assert_eq!(
        bus.get_circuit_breaker_status("DemoService").state,
        CircuitState::Closed
    );
}

#[tokio::test]
async fn test_same_format_skips_transformation() {
    let (bus, connector) = bus();
    register(&bus, "DemoService");

    let message = ServiceBusMessage::new("Ping", "DemoService", json!({"ok": true}))
        .with_formats(MessageFormat::Json, MessageFormat::Json);
    assert!(bus.route_message(message).await.unwrap());

    assert_eq!(
        connector.delivered()[0].payload,
        Payload::Document(json!({"ok": true}))
    );
    assert_eq!(bus.get_transformation_metrics().total, 0);
}

#[tokio::test]
async fn test_unregistered_service_goes_to_dlq() {
    let (bus, connector) = bus();

    let message = ServiceBusMessage::new("Order", "UnavailableService", json!({"id": 1}))
        .with_id("msg-404");
    assert!(!bus.route_message(message).await.unwrap());

    let dead = bus.get_dead_letter_messages("UnavailableService");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, "msg-404");
    assert_eq!(
        bus.dead_letter_queue().entry("msg-404").unwrap().reason,
        SERVICE_UNAVAILABLE_REASON
    );
    assert_eq!(connector.calls(), 0);
}

#[tokio::test]
async fn test_open_breaker_skips_transform_and_delivery() {
    let (bus, connector) = bus();
    register(&bus, "DemoService");
    bus.force_open_circuit("DemoService");

    assert!(!bus.is_service_available("DemoService"));
    assert!(!bus
        .route_message(customer_message("DemoService"))
        .await
        .unwrap());

    assert_eq!(connector.calls(), 0);
    assert_eq!(bus.get_transformation_metrics().total, 0);
    let entries = bus.dead_letter_queue().entries_for("DemoService");
    assert_eq!(entries[0].reason, SERVICE_UNAVAILABLE_REASON);

    bus.reset_circuit_breaker("DemoService");
    assert!(bus.is_service_available("DemoService"));
    assert!(bus
        .route_message(customer_message("DemoService"))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_failures_trip_breaker() {
    let (bus, connector) = bus();
    register(&bus, "Flaky");
    connector.set_failing(true);

    for _ in 0..5 {
        let msg = ServiceBusMessage::new("Order", "Flaky", json!({}));
        assert!(!bus.route_message(msg).await.unwrap());
    }
    assert_eq!(connector.calls(), 5);

    let status = bus.get_circuit_breaker_status("Flaky");
    assert_eq!(status.state, CircuitState::Open);
    assert_eq!(status.failure_count, 5);

    // Short-circuited: no further delivery attempts
    let msg = ServiceBusMessage::new("Order", "Flaky", json!({})).with_id("late");
    assert!(!bus.route_message(msg).await.unwrap());
    assert_eq!(connector.calls(), 5);
    assert_eq!(
        bus.dead_letter_queue().entry("late").unwrap().reason,
        SERVICE_UNAVAILABLE_REASON
    );

    let metrics = bus.get_dead_letter_metrics("Flaky");
    assert_eq!(metrics.total, 6);
    assert_eq!(metrics.pending, 6);

    let health = bus.get_service_health("Flaky");
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert_eq!(health.dead_letters_pending, 6);
}

#[tokio::test]
async fn test_delivery_failure_reason_recorded() {
    let (bus, connector) = bus();
    register(&bus, "Flaky");
    connector.set_failing(true);

    let msg = ServiceBusMessage::new("Order", "Flaky", json!({})).with_id("m-503");
    assert!(!bus.route_message(msg).await.unwrap());

    let entry = bus.dead_letter_queue().entry("m-503").unwrap();
    assert!(entry.reason.contains("HTTP 503"));
    assert_eq!(entry.retry_count, 0);
}

#[tokio::test]
async fn test_transformation_failure_goes_to_dlq() {
    let (bus, connector) = bus();
    register(&bus, "DemoService");

    let msg = ServiceBusMessage::new("Order", "DemoService", "<order><id>1</order>")
        .with_id("bad-xml")
        .with_formats(MessageFormat::Xml, MessageFormat::Json);
    assert!(!bus.route_message(msg).await.unwrap());

    assert_eq!(connector.calls(), 0);
    let entry = bus.dead_letter_queue().entry("bad-xml").unwrap();
    assert!(entry.reason.starts_with("Transformation XML -> JSON failed"));
    assert_eq!(bus.get_transformation_metrics().failed, 1);
    // Not a delivery failure
    assert_eq!(bus.get_circuit_breaker_status("DemoService").failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_delivery_timeout() {
    let mut config = EsbConfig::default();
    config.delivery.timeout_seconds = 1;
    let (bus, connector) = bus_with(&config);
    register(&bus, "Slow");
    connector.set_stall(Duration::from_secs(5));

    let msg = ServiceBusMessage::new("Order", "Slow", json!({})).with_id("slow-1");
    assert!(!bus.route_message(msg).await.unwrap());

    let entry = bus.dead_letter_queue().entry("slow-1").unwrap();
    assert!(entry.reason.contains("timed out after 1s"));
    assert_eq!(bus.get_circuit_breaker_status("Slow").failure_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_route_counts_failure_without_dlq() {
    let (bus, connector) = bus();
    register(&bus, "Slow");
    connector.set_stall(Duration::from_secs(5));

    let msg = ServiceBusMessage::new("Order", "Slow", json!({}));
    let outcome = tokio::time::timeout(Duration::from_secs(1), bus.route_message(msg)).await;
    assert!(outcome.is_err());

    assert!(bus.dead_letter_queue().is_empty());
    assert_eq!(bus.get_circuit_breaker_status("Slow").failure_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_route_during_half_open_trial_is_dead_lettered() {
    let mut config = EsbConfig::default();
    config.circuit_breaker.failure_threshold = 1;
    config.circuit_breaker.cooldown_seconds = 5;
    let (bus, connector) = bus_with(&config);
    register(&bus, "Recovering");

    connector.set_failing(true);
    let msg = ServiceBusMessage::new("Order", "Recovering", json!({})).with_id("hb-1");
    assert!(!bus.route_message(msg).await.unwrap());
    assert_eq!(bus.get_circuit_breaker_status("Recovering").state, CircuitState::Open);

    connector.set_failing(false);
    connector.set_stall(Duration::from_secs(2));
    tokio::time::advance(Duration::from_secs(5)).await;

    let bus = Arc::new(bus);
    let trial = {
        let bus = bus.clone();
        tokio::spawn(async move {
            let msg = ServiceBusMessage::new("Order", "Recovering", json!({})).with_id("hb-2");
            bus.route_message(msg).await
        })
    };
    while connector.calls() < 2 {
        tokio::task::yield_now().await;
    }

    assert_eq!(
        bus.get_circuit_breaker_status("Recovering").state,
        CircuitState::HalfOpen
    );
    assert!(!bus.is_service_available("Recovering"));

    let msg = ServiceBusMessage::new("Order", "Recovering", json!({})).with_id("hb-3");
    assert!(!bus.route_message(msg).await.unwrap());
    let entry = bus.dead_letter_queue().entry("hb-3").unwrap();
    assert_eq!(entry.reason, SERVICE_UNAVAILABLE_REASON);
    assert_eq!(connector.calls(), 2);

    assert!(trial.await.unwrap().unwrap());
    assert_eq!(
        bus.get_circuit_breaker_status("Recovering").state,
        CircuitState::Closed
    );
    assert!(bus.is_service_available("Recovering"));
}

#[tokio::test]
async fn test_retry_redelivers_and_removes_entry() {
    let (bus, connector) = bus();
    register(&bus, "Flaky");
    connector.set_failing(true);

    let msg = customer_message("Flaky").with_id("r-1");
    assert!(!bus.route_message(msg).await.unwrap());

    connector.set_failing(false);
    assert!(bus.retry_message("r-1").await);
    assert!(bus.dead_letter_queue().is_empty());

    // Redelivery goes through the same transformation
    let delivered = connector.delivered();
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].payload.as_text().contains("<name>John Doe</name>"));

    // Gone now
    assert!(!bus.retry_message("r-1").await);
}

#[tokio::test]
async fn test_retry_exhaustion_archives() {
    let (bus, connector) = bus();
    register(&bus, "Down");
    connector.set_failing(true);

    let msg = ServiceBusMessage::new("Order", "Down", json!({})).with_id("r-2");
    assert!(!bus.route_message(msg).await.unwrap());

    for attempt in 1..=3 {
        assert!(!bus.retry_message("r-2").await);
        let entry = bus.dead_letter_queue().entry("r-2").unwrap();
        assert_eq!(entry.retry_count, attempt);
        assert!(entry.last_error.is_some());
    }

    let entry = bus.dead_letter_queue().entry("r-2").unwrap();
    assert!(entry.archived);

    // Refused without another delivery attempt
    let calls = connector.calls();
    assert!(!bus.retry_message("r-2").await);
    assert_eq!(connector.calls(), calls);
    assert_eq!(bus.dead_letter_queue().entry("r-2").unwrap().retry_count, 3);

    // Failed retries never add new entries
    assert_eq!(bus.dead_letter_queue().len(), 1);
    let metrics = bus.get_dead_letter_metrics("Down");
    assert_eq!(metrics.archived, 1);
    assert_eq!(metrics.retry_attempts, 3);
}

#[tokio::test]
async fn test_retry_after_late_registration() {
    let (bus, _connector) = bus();

    let msg = ServiceBusMessage::new("Order", "Late", json!({})).with_id("r-3");
    assert!(!bus.route_message(msg).await.unwrap());

    assert!(!bus.retry_message("r-3").await);
    let entry = bus.dead_letter_queue().entry("r-3").unwrap();
    assert!(entry
        .last_error
        .as_deref()
        .unwrap()
        .contains("Service unavailable"));

    register(&bus, "Late");
    assert!(bus.retry_message("r-3").await);
}

#[tokio::test]
async fn test_retry_with_custom_limit() {
    let (bus, connector) = bus();
    register(&bus, "Down");
    connector.set_failing(true);

    let msg = ServiceBusMessage::new("Order", "Down", json!({})).with_id("r-4");
    assert!(!bus.route_message(msg).await.unwrap());

    assert!(!bus.retry_message_with_limit("r-4", 1).await);
    assert!(bus.dead_letter_queue().entry("r-4").unwrap().archived);
}

#[tokio::test]
async fn test_dead_letter_admin() {
    let (bus, _connector) = bus();

    for id in ["a", "b", "c"] {
        let msg = ServiceBusMessage::new("Order", "Gone", json!({})).with_id(id);
        assert!(!bus.route_message(msg).await.unwrap());
    }

    let ids: Vec<_> = bus
        .get_dead_letter_messages("Gone")
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, vec!["c", "b", "a"]);

    assert!(bus.remove_from_dead_letter("b"));
    assert!(!bus.remove_from_dead_letter("b"));
    assert_eq!(bus.get_dead_letter_metrics("Gone").total, 2);

    assert!(bus.handle_dead_letter(
        ServiceBusMessage::new("Order", "Other", json!({})),
        "manual"
    ));
    assert_eq!(bus.get_dead_letter_messages("Other").len(), 1);
    assert!(bus.get_dead_letter_messages("Nobody").is_empty());
}

#[tokio::test]
async fn test_archive_expired_dead_letters() {
    let mut config = EsbConfig::default();
    config.dead_letter.archive_after_hours = 0;
    let (bus, _connector) = bus_with(&config);

    let msg = ServiceBusMessage::new("Order", "Gone", json!({})).with_id("old");
    assert!(!bus.route_message(msg).await.unwrap());

    assert_eq!(bus.archive_expired_dead_letters(), 1);
    assert_eq!(bus.archive_expired_dead_letters(), 0);
    assert!(!bus.retry_message("old").await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_routing() {
    let (bus, connector) = bus();
    let bus = Arc::new(bus);
    register(&bus, "DemoService");

    let handles: Vec<_> = (0..32)
        .map(|i| {
            let bus = bus.clone();
            tokio::spawn(async move {
                let msg = customer_message("DemoService").with_id(format!("c-{}", i));
                bus.route_message(msg).await.unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.await.unwrap());
    }
    assert_eq!(connector.delivered().len(), 32);
    assert_eq!(bus.get_transformation_metrics().successful, 32);
}

#[tokio::test]
async fn test_pass_throughs() {
    let (bus, _connector) = bus();
    register(&bus, "DemoService");

    let found = bus.discover_service("DemoService").unwrap();
    assert_eq!(found.endpoint_url, "https://demoservice.api.company.com");
    assert!(bus.discover_service("Missing").is_none());

    let xml = bus
        .transform_message(&Payload::from(json!({"id": 7})), "JSON", "XML")
        .unwrap();
    assert!(bus.validate_format(&xml, "XML"));
    assert!(bus.transform_message(&xml, "XML", "YAML").is_err());

    let value: Result<u32, esb_core::circuit_breaker::BreakerError<std::io::Error>> = bus
        .execute_with_circuit_breaker("Inline", || async { Ok(42) })
        .await;
    assert_eq!(value.unwrap(), 42);
}
