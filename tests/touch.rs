//! Test re-projecting all entities of a type.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use refold::commons::Error;
use refold::constants::TOUCH_JOB_ENTITY;
use refold::engine::{Engine, EngineSettings};
use refold::eventsourcing::{JobStatus, ReadModelAction, ReadModelStore};
use refold::storage::{MemoryEventStore, MemoryReadModelStore};

mod common;

use common::{CART, CART_VIEW, Cart};

const CART_TOTAL: &str = "CartTotal";

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
struct CartTotal {
    total: u32,
}

/// An engine that projects carts into one more read model.
fn engine_with_totals(
    events: Arc<MemoryEventStore>,
    read_models: Arc<MemoryReadModelStore>,
) -> Engine {
    let registry = common::cart_registrations()
        .projection(
            CART,
            CART_TOTAL,
            |cart: &Cart| vec![cart.id.clone()],
            |cart: &Cart, _: Option<CartTotal>| {
                Ok(ReadModelAction::Upsert(CartTotal {
                    total: cart.items.values().sum(),
                }))
            },
        )
        .build()
        .unwrap();

    let settings = EngineSettings {
        page_size: 3,
        job_concurrency: 2,
        ..Default::default()
    };
    Engine::new(registry, events, read_models, settings)
}

async fn seven_carts(engine: &Engine) {
    for nr in 1..=7 {
        let id = format!("cart-{nr}");
        common::create_cart(engine, &id, "alice").await;
        common::add_item(engine, &id, "X", nr).await;
    }
}

#[tokio::test]
async fn touch_projects_into_new_read_models() {
    let events = Arc::new(MemoryEventStore::default());
    let read_models = Arc::new(MemoryReadModelStore::default());
    seven_carts(&common::engine_with(events.clone(), read_models.clone())).await;
    let views = common::dump(read_models.as_ref(), CART_VIEW).await;
    assert!(common::dump(read_models.as_ref(), CART_TOTAL).await.is_empty());

    let engine = engine_with_totals(events.clone(), read_models.clone());
    let report = engine.touch(CART).await.unwrap();
    assert_eq!(report.job, CART);
    assert_eq!(report.status, JobStatus::Finished);
    assert_eq!(report.processed, 7);
    assert_eq!(report.changed, 7);

    let totals = common::dump(read_models.as_ref(), CART_TOTAL).await;
    assert_eq!(totals.len(), 7);
    let record = read_models.get(CART_TOTAL, "cart-5").await.unwrap().unwrap();
    let total: CartTotal = serde_json::from_value(record.value).unwrap();
    assert_eq!(total, CartTotal { total: 5 });

    // existing read models are left as they were
    assert_eq!(common::dump(read_models.as_ref(), CART_VIEW).await, views);

    let report = engine.touch(CART).await.unwrap();
    assert_eq!(report.processed, 7);
    assert_eq!(report.changed, 0);
    assert_eq!(
        serde_json::to_string(&common::dump(read_models.as_ref(), CART_TOTAL).await)
            .unwrap(),
        serde_json::to_string(&totals).unwrap()
    );
}

#[tokio::test]
async fn touch_recreates_lost_read_models() {
    let events = Arc::new(MemoryEventStore::default());
    let read_models = Arc::new(MemoryReadModelStore::default());
    let engine = common::engine_with(events, read_models.clone());
    seven_carts(&engine).await;
    let views = common::dump(read_models.as_ref(), CART_VIEW).await;

    for id in ["cart-2", "cart-6"] {
        let version = read_models.get(CART_VIEW, id).await.unwrap().unwrap().version;
        read_models.delete_if_version(CART_VIEW, id, version).await.unwrap();
    }
    assert_eq!(common::dump(read_models.as_ref(), CART_VIEW).await.len(), 5);

    let report = engine.touch(CART).await.unwrap();
    assert_eq!(report.changed, 2);

    let touched = common::dump(read_models.as_ref(), CART_VIEW).await;
    assert_eq!(touched.len(), 7);
    for (before, after) in views.iter().zip(touched.iter()) {
        assert_eq!(before["id"], after["id"]);
        assert_eq!(before["value"], after["value"]);
    }

    // the job is tracked like any entity
    let tracker = engine.reconstruct(TOUCH_JOB_ENTITY, CART).await.unwrap().unwrap();
    assert_eq!(tracker.value["status"], serde_json::json!("FINISHED"));
    assert_eq!(tracker.value["processed"], serde_json::json!(7));
}

#[tokio::test]
async fn touch_single_entities() {
    let engine = common::mem_engine();
    common::create_cart(&engine, "1", "alice").await;

    let report = engine.touch_entity(CART, "1").await.unwrap();
    assert!(!report.changed());
    let report = engine.touch_entity(CART, "2").await.unwrap();
    assert!(!report.changed());
}

#[tokio::test]
async fn touch_needs_a_known_entity_type() {
    let engine = common::mem_engine();
    assert!(matches!(
        engine.touch("Basket").await,
        Err(Error::UnknownEntityType(_))
    ));

    // no entities is fine
    let report = engine.touch(CART).await.unwrap();
    assert_eq!(report.status, JobStatus::Finished);
    assert_eq!(report.processed, 0);
}
