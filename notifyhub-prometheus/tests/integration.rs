use notifyhub::telemetry::{DispatchEvent, Sink};
use notifyhub_prometheus::PrometheusSink;
use prometheus::Registry;

fn counter_value(registry: &Registry, metric: &str, kind: &str) -> Option<f64> {
    registry.gather().iter().find(|mf| mf.get_name() == metric).and_then(|mf| {
        mf.get_metric()
            .iter()
            .find(|m| m.get_label().iter().any(|l| l.get_name() == "kind" && l.get_value() == kind))
            .map(|m| m.get_counter().value())
    })
}

#[tokio::test]
async fn retrying_and_expired_events_increment_independently() {
    let registry = Registry::new();
    let sink = PrometheusSink::new(registry.clone()).expect("failed to create sink");

    sink.emit(DispatchEvent::Retrying { notification_id: "n1".into(), attempt: 1, next_delay_ms: 500 }).await;
    sink.emit(DispatchEvent::Expired { notification_id: "n2".into() }).await;
    sink.emit(DispatchEvent::Expired { notification_id: "n3".into() }).await;

    assert_eq!(counter_value(&registry, "notifyhub_dispatch_events_total", "retrying"), Some(1.0));
    assert_eq!(counter_value(&registry, "notifyhub_dispatch_events_total", "expired"), Some(2.0));
}
