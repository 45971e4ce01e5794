#![allow(dead_code)] // Different tests use different parts.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::Barrier;
use url::Url;

use refold::commons::{DomainError, RefoldResult};
use refold::config::Config;
use refold::engine::{Engine, EngineSettings};
use refold::eventsourcing::{
    AppendOutcome, CommandOutcome, EventEnvelope, EventStoreClient, NewEvent,
    Page, ReadModelAction, ReadModelStore, Registry, RegistryBuilder,
    SnapshotEnvelope, StoreError,
};
use refold::storage::{MemoryEventStore, MemoryReadModelStore};

//------------ TestConfig ----------------------------------------------------

/// A test config builder.
pub struct TestConfig {
    storage_uri: Url,
    snapshot_frequency: u64,
    command_retries: usize,
    page_size: usize,
    dir: Option<TempDir>,
}

impl TestConfig {
    /// Uses a memory namespace of its own.
    pub fn mem_storage() -> Self {
        let namespace = uuid::Uuid::new_v4();
        Self::with_uri(Url::parse(&format!("memory:{namespace}")).unwrap(), None)
    }

    /// Uses a fresh directory on disk.
    pub fn file_storage() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let uri = Url::parse(&format!("local://{}", dir.path().display())).unwrap();
        Self::with_uri(uri, Some(dir))
    }

    fn with_uri(storage_uri: Url, dir: Option<TempDir>) -> Self {
        TestConfig {
            storage_uri,
            snapshot_frequency: 0,
            command_retries: 5,
            page_size: 3,
            dir,
        }
    }

    pub fn snapshot_frequency(mut self, snapshot_frequency: u64) -> Self {
        self.snapshot_frequency = snapshot_frequency;
        self
    }

    pub fn command_retries(mut self, command_retries: usize) -> Self {
        self.command_retries = command_retries;
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Returns the config, and the directory to keep around while it is
    /// used.
    pub fn finalize(self) -> (Config, Option<TempDir>) {
        let mut config = Config::test(self.storage_uri);
        config.snapshot_frequency = self.snapshot_frequency;
        config.command_retries = self.command_retries;
        config.page_size = self.page_size;
        config.job_concurrency = 2;
        (config, self.dir)
    }

    pub fn engine(self) -> (Engine, Option<TempDir>) {
        let (config, dir) = self.finalize();
        let engine = Engine::from_config(registry(), &config).unwrap();
        (engine, dir)
    }
}

/// Creates an engine on the given stores with small pages.
pub fn engine_with(
    events: Arc<dyn EventStoreClient>,
    read_models: Arc<dyn ReadModelStore>,
) -> Engine {
    let settings = EngineSettings {
        page_size: 3,
        snapshot_frequency: 0,
        job_concurrency: 2,
        ..Default::default()
    };
    Engine::new(registry(), events, read_models, settings)
}

pub fn mem_engine() -> Engine {
    engine_with(
        Arc::new(MemoryEventStore::default()),
        Arc::new(MemoryReadModelStore::default()),
    )
}

//------------ Cart ----------------------------------------------------------

pub const CART: &str = "Cart";
pub const CART_VIEW: &str = "CartView";

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CartStatus {
    Open,
    CheckedOut,
    Discarded,
}

/// The cart entity at version 2.
///
/// The revision counts the events folded, so projections can ignore a
/// state older than the one they projected before.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Cart {
    pub id: String,
    pub customer: String,
    pub items: BTreeMap<String, u32>,
    pub status: CartStatus,
    pub revision: u64,
}

/// The cart entity at version 1.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CartV1 {
    pub id: String,
    pub customer: String,
    pub items: BTreeMap<String, u32>,
    pub checked_out: bool,
    pub revision: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CartCreated {
    pub id: String,
    pub customer: String,
}

/// Item added at version 2, version 1 called the quantity `count`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ItemAdded {
    pub sku: String,
    pub qty: u32,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ItemRemoved {
    pub sku: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CheckedOut {}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CartDiscarded {}

//------------ CartView ------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LineView {
    pub sku: String,
    pub qty: u32,
}

/// The cart read model at version 2, version 1 had no total and status.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CartView {
    pub id: String,
    pub customer: String,
    pub items: Vec<LineView>,
    pub total: u32,
    pub status: CartStatus,
    pub revision: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CartViewV1 {
    pub id: String,
    pub customer: String,
    pub items: Vec<LineView>,
    pub revision: u64,
}

fn open(cart: Option<Cart>) -> Result<Cart, DomainError> {
    match cart {
        Some(mut cart) if cart.status == CartStatus::Open => {
            cart.revision += 1;
            Ok(cart)
        }
        Some(cart) => Err(DomainError::new(format!(
            "cart {} is {:?}",
            cart.id, cart.status
        ))),
        None => Err(DomainError::new("no such cart")),
    }
}

/// The registrations of the cart domain, to extend in tests.
pub fn cart_registrations() -> RegistryBuilder {
    Registry::builder()
        .version(CART, 2)
        .migration_typed(CART, 2, |old: CartV1| {
            Ok(Cart {
                id: old.id,
                customer: old.customer,
                items: old.items,
                status: if old.checked_out {
                    CartStatus::CheckedOut
                } else {
                    CartStatus::Open
                },
                revision: old.revision,
            })
        })
        .version("ItemAdded", 2)
        .migration("ItemAdded", 2, |mut value: Value| {
            let count = value
                .as_object_mut()
                .and_then(|object| object.remove("count"))
                .ok_or_else(|| DomainError::new("ItemAdded without count"))?;
            value["qty"] = count;
            Ok(value)
        })
        .version(CART_VIEW, 2)
        .migration_typed(CART_VIEW, 2, |old: CartViewV1| {
            Ok(CartView {
                total: old.items.iter().map(|line| line.qty).sum(),
                id: old.id,
                customer: old.customer,
                items: old.items,
                status: CartStatus::Open,
                revision: old.revision,
            })
        })
        .reducer(CART, "CartCreated", |event: CartCreated, cart: Option<Cart>| {
            match cart {
                Some(_) => Err(DomainError::new("cart exists")),
                None => Ok(Cart {
                    id: event.id,
                    customer: event.customer,
                    items: BTreeMap::new(),
                    status: CartStatus::Open,
                    revision: 1,
                }),
            }
        })
        .reducer(CART, "ItemAdded", |event: ItemAdded, cart: Option<Cart>| {
            let mut cart = open(cart)?;
            *cart.items.entry(event.sku).or_default() += event.qty;
            Ok(cart)
        })
        .reducer(CART, "ItemRemoved", |event: ItemRemoved, cart: Option<Cart>| {
            let mut cart = open(cart)?;
            cart.items.remove(&event.sku);
            Ok(cart)
        })
        .reducer(CART, "CheckedOut", |_: CheckedOut, cart: Option<Cart>| {
            let mut cart = open(cart)?;
            if cart.items.is_empty() {
                return Err(DomainError::new("cannot check out an empty cart"));
            }
            cart.status = CartStatus::CheckedOut;
            Ok(cart)
        })
        .reducer(CART, "CartDiscarded", |_: CartDiscarded, cart: Option<Cart>| {
            let mut cart = open(cart)?;
            cart.status = CartStatus::Discarded;
            Ok(cart)
        })
        .projection(
            CART,
            CART_VIEW,
            |cart: &Cart| vec![cart.id.clone()],
            |cart: &Cart, prior: Option<CartView>| {
                if prior.is_some_and(|prior| prior.revision > cart.revision) {
                    return Ok(ReadModelAction::Nothing);
                }
                if cart.status == CartStatus::Discarded {
                    return Ok(ReadModelAction::Delete);
                }
                Ok(ReadModelAction::Upsert(cart_view(cart)))
            },
        )
}

pub fn cart_view(cart: &Cart) -> CartView {
    CartView {
        id: cart.id.clone(),
        customer: cart.customer.clone(),
        items: cart
            .items
            .iter()
            .map(|(sku, qty)| LineView {
                sku: sku.clone(),
                qty: *qty,
            })
            .collect(),
        total: cart.items.values().sum(),
        status: cart.status,
        revision: cart.revision,
    }
}

pub fn registry() -> Registry {
    cart_registrations().build().unwrap()
}

//------------ Commands ------------------------------------------------------

pub fn created(id: &str, customer: &str) -> NewEvent {
    NewEvent::new(
        "CartCreated",
        &CartCreated {
            id: id.to_string(),
            customer: customer.to_string(),
        },
    )
    .unwrap()
}

pub fn item_added(sku: &str, qty: u32) -> NewEvent {
    NewEvent::new(
        "ItemAdded",
        &ItemAdded {
            sku: sku.to_string(),
            qty,
        },
    )
    .unwrap()
}

pub fn checked_out() -> NewEvent {
    NewEvent::new("CheckedOut", &CheckedOut {}).unwrap()
}

pub fn discarded() -> NewEvent {
    NewEvent::new("CartDiscarded", &CartDiscarded {}).unwrap()
}

/// Creates the cart unless it exists.
pub async fn create_cart(engine: &Engine, id: &str, customer: &str) -> CommandOutcome {
    let event = created(id, customer);
    engine
        .execute_command(CART, id, move |cart| match cart {
            Some(_) => Ok(vec![]),
            None => Ok(vec![event.clone()]),
        })
        .await
        .unwrap()
}

pub async fn add_item(engine: &Engine, id: &str, sku: &str, qty: u32) -> CommandOutcome {
    let event = item_added(sku, qty);
    engine
        .execute_command(CART, id, move |cart| match cart {
            Some(_) => Ok(vec![event.clone()]),
            None => Err(DomainError::new("create the cart first")),
        })
        .await
        .unwrap()
}

pub async fn emit(engine: &Engine, id: &str, event: NewEvent) -> RefoldResult<CommandOutcome> {
    engine
        .execute_command(CART, id, move |_| Ok(vec![event.clone()]))
        .await
}

pub async fn cart(engine: &Engine, id: &str) -> Option<Cart> {
    engine
        .reconstruct(CART, id)
        .await
        .unwrap()
        .map(|state| state.typed().unwrap())
}

pub async fn cart_view_record(engine: &Engine, id: &str) -> Option<(u64, CartView)> {
    engine
        .read_models()
        .get(CART_VIEW, id)
        .await
        .unwrap()
        .map(|record| (record.version, serde_json::from_value(record.value).unwrap()))
}

/// Returns all read models of a type as stored, to compare them.
pub async fn dump(read_models: &dyn ReadModelStore, read_model: &str) -> Vec<Value> {
    let page = read_models.list(read_model, None, usize::MAX).await.unwrap();
    page.items
        .into_iter()
        .map(|record| {
            json!({
                "id": record.id,
                "version": record.version,
                "schema_version": record.schema_version,
                "value": record.value,
            })
        })
        .collect()
}

//------------ BarrierStore --------------------------------------------------

/// Once armed, holds the next appends until the given number of writers is
/// waiting, so that they all append against the same expected version.
pub struct BarrierStore {
    inner: MemoryEventStore,
    barrier: Barrier,
    writers: usize,
    armed: AtomicBool,
    held: AtomicUsize,
}

impl BarrierStore {
    pub fn new(writers: usize) -> Self {
        BarrierStore {
            inner: MemoryEventStore::default(),
            barrier: Barrier::new(writers),
            writers,
            armed: AtomicBool::new(false),
            held: AtomicUsize::new(0),
        }
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventStoreClient for BarrierStore {
    async fn append(
        &self,
        entity_type: &str,
        entity_id: &str,
        expected_version: u64,
        events: Vec<EventEnvelope>,
    ) -> Result<AppendOutcome, StoreError> {
        if self.armed.load(Ordering::SeqCst)
            && self.held.fetch_add(1, Ordering::SeqCst) < self.writers
        {
            self.barrier.wait().await;
        }
        self.inner
            .append(entity_type, entity_id, expected_version, events)
            .await
    }

    async fn read_since(
        &self,
        entity_type: &str,
        entity_id: &str,
        after_version: u64,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        self.inner.read_since(entity_type, entity_id, after_version).await
    }

    async fn read_snapshot(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<SnapshotEnvelope>, StoreError> {
        self.inner.read_snapshot(entity_type, entity_id).await
    }

    async fn store_snapshot(
        &self,
        snapshot: &SnapshotEnvelope,
    ) -> Result<(), StoreError> {
        self.inner.store_snapshot(snapshot).await
    }

    async fn list_entity_ids(
        &self,
        entity_type: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Page<String>, StoreError> {
        self.inner.list_entity_ids(entity_type, after, limit).await
    }
}
