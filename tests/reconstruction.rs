//! Test that entity state does not depend on snapshots or read batches.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use refold::commons::Error;
use refold::engine::{Engine, EngineSettings};
use refold::eventsourcing::{EventEnvelope, EventStoreClient, Kind};
use refold::storage::{MemoryEventStore, MemoryReadModelStore};

mod common;

fn engine(events: Arc<dyn EventStoreClient>, snapshot_frequency: u64) -> Engine {
    Engine::new(
        common::registry(),
        events,
        Arc::new(MemoryReadModelStore::default()),
        EngineSettings {
            snapshot_frequency,
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn reconstruction_is_deterministic() {
    let chunked = Arc::new(MemoryEventStore::with_batch_limit(2));
    let writer = engine(chunked.clone(), 3);

    common::create_cart(&writer, "1", "alice").await;
    for nr in 0..10 {
        common::add_item(&writer, "1", &format!("sku-{}", nr % 3), nr).await;
    }
    common::emit(&writer, "1", common::checked_out()).await.unwrap();

    // same events, stored in one go, read in one go
    let all = chunked.read_since(common::CART, "1", 0).await.unwrap();
    assert_eq!(all.len(), 2);
    let mut events = vec![];
    let mut after = 0;
    loop {
        let batch = chunked.read_since(common::CART, "1", after).await.unwrap();
        match batch.last() {
            Some(last) => after = last.version,
            None => break,
        }
        events.extend(batch);
    }
    assert_eq!(events.len(), 12);
    let whole = Arc::new(MemoryEventStore::default());
    whole.append(common::CART, "1", 0, events).await.unwrap();

    let with_snapshots = writer.reconstruct(common::CART, "1").await.unwrap();
    let chunked_plain = engine(chunked.clone(), 0)
        .reconstruct(common::CART, "1")
        .await
        .unwrap();
    let whole_plain = engine(whole.clone(), 0)
        .reconstruct(common::CART, "1")
        .await
        .unwrap();

    assert!(chunked.read_snapshot(common::CART, "1").await.unwrap().is_some());
    assert!(whole.read_snapshot(common::CART, "1").await.unwrap().is_none());
    assert_eq!(with_snapshots, chunked_plain);
    assert_eq!(chunked_plain, whole_plain);

    let cart: common::Cart = whole_plain.unwrap().typed().unwrap();
    assert_eq!(cart.status, common::CartStatus::CheckedOut);
    assert_eq!(cart.revision, 12);
    assert_eq!(cart.items.values().sum::<u32>(), 45);
}

#[tokio::test]
async fn history_can_be_read_at_any_version() {
    let engine = common::mem_engine();
    common::create_cart(&engine, "1", "alice").await;
    common::add_item(&engine, "1", "X", 2).await;
    common::add_item(&engine, "1", "X", 1).await;

    let at_two: common::Cart = engine
        .reconstruct_at(common::CART, "1", 2)
        .await
        .unwrap()
        .unwrap()
        .typed()
        .unwrap();
    assert_eq!(at_two.items.get("X"), Some(&2));

    let beyond = engine.reconstruct_at(common::CART, "1", 10).await.unwrap().unwrap();
    assert_eq!(beyond.version, 3);

    assert!(engine.reconstruct(common::CART, "2").await.unwrap().is_none());
    assert!(matches!(
        engine.reconstruct("Basket", "1").await,
        Err(Error::UnknownEntityType(_))
    ));
}

#[tokio::test]
async fn old_events_are_upgraded_when_read() {
    let events = Arc::new(MemoryEventStore::default());
    let engine = engine(events.clone(), 0);
    common::create_cart(&engine, "1", "alice").await;

    // written by a release where ItemAdded still had a count
    let old = EventEnvelope {
        entity_type_name: common::CART.to_string(),
        entity_id: "1".to_string(),
        kind: Kind::Event,
        type_name: "ItemAdded".to_string(),
        version: 2,
        schema_version: 1,
        value: json!({ "sku": "X", "count": 4 }),
        created_at: Utc::now(),
        request_id: Uuid::new_v4(),
    };
    events.append(common::CART, "1", 1, vec![old]).await.unwrap();
    common::add_item(&engine, "1", "X", 1).await;

    let cart = common::cart(&engine, "1").await.unwrap();
    assert_eq!(cart.items.get("X"), Some(&5));

    // stored events are left as they were
    let stored = events.read_since(common::CART, "1", 1).await.unwrap();
    assert_eq!(stored[0].schema_version, 1);
    assert_eq!(stored[1].schema_version, 2);
    assert_eq!(stored[1].value, json!({ "sku": "X", "qty": 1 }));
}

#[tokio::test]
async fn future_events_are_refused() {
    let events = Arc::new(MemoryEventStore::default());
    let engine = engine(events.clone(), 0);
    common::create_cart(&engine, "1", "alice").await;

    let future = EventEnvelope {
        entity_type_name: common::CART.to_string(),
        entity_id: "1".to_string(),
        kind: Kind::Event,
        type_name: "ItemAdded".to_string(),
        version: 2,
        schema_version: 3,
        value: json!({ "sku": "X", "qty": 1, "colour": "red" }),
        created_at: Utc::now(),
        request_id: Uuid::new_v4(),
    };
    events.append(common::CART, "1", 1, vec![future]).await.unwrap();

    assert!(matches!(
        engine.reconstruct(common::CART, "1").await,
        Err(Error::FutureSchemaVersion { found: 3, current: 2, .. })
    ));
}

#[tokio::test]
async fn rebuild_repairs_snapshots() {
    let events = Arc::new(MemoryEventStore::default());
    let engine = engine(events.clone(), 1);
    common::create_cart(&engine, "1", "alice").await;
    common::add_item(&engine, "1", "X", 2).await;
    let expected = engine.reconstruct(common::CART, "1").await.unwrap().unwrap();

    let mut snapshot = events.read_snapshot(common::CART, "1").await.unwrap().unwrap();
    snapshot.value["customer"] = json!("mallory");
    events.store_snapshot(&snapshot).await.unwrap();

    let rebuilt = engine.rebuild(common::CART, "1").await.unwrap().unwrap();
    assert_eq!(rebuilt, expected);
    assert_eq!(
        engine.reconstruct(common::CART, "1").await.unwrap(),
        Some(expected)
    );
}
