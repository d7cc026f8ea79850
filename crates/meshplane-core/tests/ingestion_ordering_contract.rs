//! Contract Test: Broker Ingestion
//!
//! Constraints verified:
//! - Messages from the subscribed topic land in the domain matching their kind
//! - Messages are applied in arrival order (last write wins)
//! - Unknown kinds and malformed payloads are dropped, not fatal
//! - Deletes remove the record
//! - Outbound publishes reach the broker

mod common;

use common::*;
use meshplane_core::broker::IngestEvent;
use meshplane_core::traits::{BrokerMessage, Domain, EventType};
use meshplane_core::{BrokerConnection, ControlPlane, ObjectKind, Persister};
use serde_json::json;
use tokio::sync::mpsc;

const TOPIC: &str = "meshplane.cluster.events";

async fn publish(harness: &Harness, kind: &str, event: EventType, object: serde_json::Value) {
    let message = BrokerMessage::from_json(TOPIC, kind, event, &object).unwrap();
    harness.broker.publish(TOPIC, message).await.unwrap();
}

async fn next_event(events: &mut mpsc::Receiver<IngestEvent>) -> IngestEvent {
    tokio::time::timeout(std::time::Duration::from_secs(2), events.recv())
        .await
        .expect("ingest event within 2s")
        .expect("event channel open")
}

async fn started(dir: &std::path::Path, harness: &Harness) -> (ControlPlane, mpsc::Receiver<IngestEvent>) {
    let started = ControlPlane::start(test_config(dir, &[]), harness.collaborators())
        .await
        .unwrap();
    assert!(eventually(|| harness.broker.subscriber_count(TOPIC) == 1).await);
    started
}

#[tokio::test]
async fn messages_are_applied_in_arrival_order() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let (plane, mut events) = started(dir.path(), &harness).await;

    for version in 1..=5 {
        publish(
            &harness,
            "Pattern",
            EventType::Modified,
            json!({ "id": "p-1", "version": version }),
        )
        .await;
    }
    for _ in 0..5 {
        assert_eq!(
            next_event(&mut events).await,
            IngestEvent::Upserted { kind: ObjectKind::Pattern, key: "p-1".to_string() }
        );
    }

    let stored = plane
        .handler_config()
        .persisters
        .persister(Domain::Patterns)
        .unwrap()
        .get("p-1")
        .await
        .unwrap();
    assert_eq!(stored, Some(json!({ "id": "p-1", "version": 5 })));

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn cluster_objects_are_keyed_by_identity() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let (plane, mut events) = started(dir.path(), &harness).await;

    publish(
        &harness,
        "Object",
        EventType::Added,
        json!({ "kind": "Pod", "metadata": { "uid": "u-1", "name": "web", "namespace": "default" } }),
    )
    .await;
    publish(
        &harness,
        "Object",
        EventType::Added,
        json!({ "kind": "Deployment", "metadata": { "name": "api", "namespace": "prod" } }),
    )
    .await;
    publish(
        &harness,
        "Object",
        EventType::Added,
        json!({ "kind": "Namespace", "metadata": { "name": "prod" } }),
    )
    .await;

    let mut keys = Vec::new();
    for _ in 0..3 {
        match next_event(&mut events).await {
            IngestEvent::Upserted { kind: ObjectKind::Object, key } => keys.push(key),
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(keys, vec!["u-1", "prod/api", "prod"]);

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn bad_messages_are_dropped_and_ingestion_continues() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let (plane, mut events) = started(dir.path(), &harness).await;

    publish(&harness, "Widget", EventType::Added, json!({ "id": "w-1" })).await;
    harness
        .broker
        .publish(TOPIC, BrokerMessage::new(TOPIC, "Filter", EventType::Added, b"not json".to_vec()))
        .await
        .unwrap();
    publish(&harness, "Filter", EventType::Added, json!({ "name": "no id" })).await;
    publish(&harness, "KeyValue", EventType::Added, json!({ "key": "mesh", "value": "istio" })).await;

    for expected_kind in ["Widget", "Filter", "Filter"] {
        match next_event(&mut events).await {
            IngestEvent::Dropped { kind, .. } => assert_eq!(kind, expected_kind),
            other => panic!("expected a drop, got {:?}", other),
        }
    }
    assert_eq!(
        next_event(&mut events).await,
        IngestEvent::Upserted { kind: ObjectKind::KeyValue, key: "mesh".to_string() }
    );

    let stats = plane.ingest_stats().await;
    assert_eq!(stats.dropped, 3);
    assert_eq!(stats.upserted, 1);

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn deletes_remove_records() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let (plane, mut events) = started(dir.path(), &harness).await;

    publish(&harness, "Application", EventType::Added, json!({ "id": 7, "name": "bookinfo" })).await;
    publish(&harness, "Application", EventType::Deleted, json!({ "id": 7 })).await;

    next_event(&mut events).await;
    assert_eq!(
        next_event(&mut events).await,
        IngestEvent::Deleted { kind: ObjectKind::Application, key: "7".to_string() }
    );

    let applications = plane
        .handler_config()
        .persisters
        .persister(Domain::Applications)
        .unwrap();
    assert_eq!(applications.get("7").await.unwrap(), None);

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn outbound_messages_reach_the_broker() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let (plane, _events) = started(dir.path(), &harness).await;

    let command = BrokerMessage::new("meshplane.commands", "Command", EventType::Added, b"{}".to_vec());
    plane.handler_config().publish(command.clone()).await.unwrap();

    assert!(eventually(|| harness.broker.published().contains(&command)).await);

    plane.shutdown().await.unwrap();
}
