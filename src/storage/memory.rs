//! In-memory storage.
//!
//! Stores opened with the same `memory:` uri share their data for the life
//! of the process, like separate connections to one database.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lazy_static::lazy_static;
use tokio::sync::RwLock;

use crate::eventsourcing::{
    AppendOutcome, DeleteOutcome, EventEnvelope, EventStoreClient, Page,
    PutOutcome, ReadModelEntry, ReadModelRecord, ReadModelStore,
    ReadModelWrite, SnapshotEnvelope, SourceVersions, StoreError,
};

use super::check_append;

//------------ Shared locations ----------------------------------------------

#[derive(Clone, Default)]
struct Location {
    events: Arc<MemoryEventStore>,
    read_models: Arc<MemoryReadModelStore>,
}

lazy_static! {
    static ref LOCATIONS: Mutex<HashMap<String, Location>> =
        Mutex::new(HashMap::new());
}

/// Returns the shared stores for a namespace.
pub(super) fn open(
    namespace: &str,
) -> Result<(Arc<MemoryEventStore>, Arc<MemoryReadModelStore>), StoreError> {
    let mut locations = LOCATIONS
        .lock()
        .map_err(|e| StoreError::other(format!("cannot lock memory store: {e}")))?;
    let location = locations.entry(namespace.to_string()).or_default();
    Ok((location.events.clone(), location.read_models.clone()))
}

//------------ MemoryEventStore ----------------------------------------------

#[derive(Debug, Default)]
struct Stream {
    events: Vec<EventEnvelope>,
    snapshot: Option<SnapshotEnvelope>,
}

/// Event streams kept in memory, keyed by entity type and id.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    streams: RwLock<BTreeMap<String, BTreeMap<String, Stream>>>,

    // Maximum number of events returned by one read, to mimic stores that
    // page their results.
    batch_limit: Option<usize>,
}

impl MemoryEventStore {
    pub fn with_batch_limit(batch_limit: usize) -> Self {
        MemoryEventStore {
            streams: RwLock::default(),
            batch_limit: Some(batch_limit.max(1)),
        }
    }
}

#[async_trait]
impl EventStoreClient for MemoryEventStore {
    async fn append(
        &self,
        entity_type: &str,
        entity_id: &str,
        expected_version: u64,
        events: Vec<EventEnvelope>,
    ) -> Result<AppendOutcome, StoreError> {
        check_append(entity_type, entity_id, expected_version, &events)?;

        let mut streams = self.streams.write().await;
        let stream = streams
            .entry(entity_type.to_string())
            .or_default()
            .entry(entity_id.to_string())
            .or_default();

        let actual = stream.events.len() as u64;
        if actual != expected_version {
            return Ok(AppendOutcome::VersionConflict { actual });
        }

        stream.events.extend(events);
        Ok(AppendOutcome::Appended {
            version: stream.events.len() as u64,
        })
    }

    async fn read_since(
        &self,
        entity_type: &str,
        entity_id: &str,
        after_version: u64,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        let streams = self.streams.read().await;
        let stream = match streams.get(entity_type).and_then(|s| s.get(entity_id)) {
            Some(stream) => stream,
            None => return Ok(vec![]),
        };

        let limit = self.batch_limit.unwrap_or(usize::MAX);
        Ok(stream
            .events
            .iter()
            .filter(|event| event.version > after_version)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn read_snapshot(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<SnapshotEnvelope>, StoreError> {
        let streams = self.streams.read().await;
        Ok(streams
            .get(entity_type)
            .and_then(|s| s.get(entity_id))
            .and_then(|stream| stream.snapshot.clone()))
    }

    async fn store_snapshot(
        &self,
        snapshot: &SnapshotEnvelope,
    ) -> Result<(), StoreError> {
        let mut streams = self.streams.write().await;
        streams
            .entry(snapshot.entity_type_name.clone())
            .or_default()
            .entry(snapshot.entity_id.clone())
            .or_default()
            .snapshot = Some(snapshot.clone());
        Ok(())
    }

    async fn list_entity_ids(
        &self,
        entity_type: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Page<String>, StoreError> {
        let streams = self.streams.read().await;
        let for_type = match streams.get(entity_type) {
            Some(for_type) => for_type,
            None => return Ok(Page::empty()),
        };

        let ids = for_type
            .range::<str, _>(lower_bound(after))
            .filter(|(_, stream)| !stream.events.is_empty())
            .map(|(id, _)| id.clone())
            .take(limit)
            .collect();
        Ok(Page::new(ids, limit, String::clone))
    }
}

fn lower_bound(after: Option<&str>) -> (Bound<&str>, Bound<&str>) {
    match after {
        Some(after) => (Bound::Excluded(after), Bound::Unbounded),
        None => (Bound::Unbounded, Bound::Unbounded),
    }
}

//------------ MemoryReadModelStore ------------------------------------------

/// Read models kept in memory, keyed by read model type and id.
#[derive(Debug, Default)]
pub struct MemoryReadModelStore {
    entries: RwLock<BTreeMap<String, BTreeMap<String, ReadModelEntry>>>,
}

#[async_trait]
impl ReadModelStore for MemoryReadModelStore {
    async fn entry(
        &self,
        read_model: &str,
        id: &str,
    ) -> Result<Option<ReadModelEntry>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries.get(read_model).and_then(|e| e.get(id)).cloned())
    }

    async fn write_if_version(
        &self,
        read_model: &str,
        id: &str,
        expected_version: u64,
        write: ReadModelWrite,
    ) -> Result<PutOutcome, StoreError> {
        let mut entries = self.entries.write().await;
        let for_type = entries.entry(read_model.to_string()).or_default();

        let current = for_type.get(id).map(ReadModelEntry::version).unwrap_or(0);
        if current != expected_version {
            return Ok(PutOutcome::VersionConflict);
        }

        let version = current + 1;
        for_type.insert(
            id.to_string(),
            ReadModelEntry::Present(write.into_record(id, version)),
        );
        Ok(PutOutcome::Stored { version })
    }

    async fn remove_if_version(
        &self,
        read_model: &str,
        id: &str,
        expected_version: u64,
        sources: SourceVersions,
    ) -> Result<DeleteOutcome, StoreError> {
        let mut entries = self.entries.write().await;
        let for_type = match entries.get_mut(read_model) {
            Some(for_type) => for_type,
            None => return Ok(DeleteOutcome::AlreadyAbsent),
        };

        match for_type.remove(id) {
            None => Ok(DeleteOutcome::AlreadyAbsent),
            Some(entry @ ReadModelEntry::Deleted { .. }) => {
                for_type.insert(id.to_string(), entry);
                Ok(DeleteOutcome::AlreadyAbsent)
            }
            Some(entry) if entry.version() != expected_version => {
                for_type.insert(id.to_string(), entry);
                Ok(DeleteOutcome::VersionConflict)
            }
            Some(entry) => {
                for_type.insert(id.to_string(), entry.tombstone(sources));
                Ok(DeleteOutcome::Deleted)
            }
        }
    }

    async fn list(
        &self,
        read_model: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Page<ReadModelRecord>, StoreError> {
        let entries = self.entries.read().await;
        let for_type = match entries.get(read_model) {
            Some(for_type) => for_type,
            None => return Ok(Page::empty()),
        };

        let items = for_type
            .range::<str, _>(lower_bound(after))
            .filter_map(|(_, entry)| entry.clone().into_record())
            .take(limit)
            .collect();
        Ok(Page::new(items, limit, |record: &ReadModelRecord| {
            record.id.clone()
        }))
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::storage::test_support::event;

    #[tokio::test]
    async fn append_requires_expected_version() {
        let store = MemoryEventStore::default();

        let outcome = store
            .append("Cart", "c1", 0, vec![event("c1", 1), event("c1", 2)])
            .await
            .unwrap();
        assert_eq!(outcome, AppendOutcome::Appended { version: 2 });

        let outcome = store
            .append("Cart", "c1", 1, vec![event("c1", 2)])
            .await
            .unwrap();
        assert_eq!(outcome, AppendOutcome::VersionConflict { actual: 2 });

        assert!(matches!(
            store.append("Cart", "c1", 2, vec![event("c1", 4)]).await,
            Err(StoreError::InvalidAppend(_))
        ));
    }

    #[tokio::test]
    async fn read_in_batches() {
        let store = MemoryEventStore::with_batch_limit(2);
        let events = (1..=5).map(|v| event("c1", v)).collect();
        store.append("Cart", "c1", 0, events).await.unwrap();

        let batch = store.read_since("Cart", "c1", 0).await.unwrap();
        assert_eq!(batch.len(), 2);
        let batch = store.read_since("Cart", "c1", 4).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].version, 5);
        assert!(store.read_since("Cart", "c1", 5).await.unwrap().is_empty());
        assert!(store.read_since("Cart", "c2", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_entity_ids_in_pages() {
        let store = MemoryEventStore::default();
        for id in ["c3", "c1", "c2"] {
            store.append("Cart", id, 0, vec![event(id, 1)]).await.unwrap();
        }

        let first = store.list_entity_ids("Cart", None, 2).await.unwrap();
        assert_eq!(first.items, vec!["c1", "c2"]);
        assert_eq!(first.next.as_deref(), Some("c2"));

        let second = store
            .list_entity_ids("Cart", first.next.as_deref(), 2)
            .await
            .unwrap();
        assert_eq!(second.items, vec!["c3"]);
        assert_eq!(second.next, None);
    }

    #[tokio::test]
    async fn conditional_read_model_writes() {
        let store = MemoryReadModelStore::default();

        let stored = store
            .put_if_version("CartView", "c1", 0, 1, json!({ "n": 1 }))
            .await
            .unwrap();
        assert_eq!(stored, PutOutcome::Stored { version: 1 });

        let conflict = store
            .put_if_version("CartView", "c1", 0, 1, json!({ "n": 2 }))
            .await
            .unwrap();
        assert_eq!(conflict, PutOutcome::VersionConflict);

        assert_eq!(
            store.delete_if_version("CartView", "c1", 3).await.unwrap(),
            DeleteOutcome::VersionConflict
        );
        assert_eq!(
            store.delete_if_version("CartView", "c1", 1).await.unwrap(),
            DeleteOutcome::Deleted
        );
        assert_eq!(
            store.delete_if_version("CartView", "c1", 1).await.unwrap(),
            DeleteOutcome::AlreadyAbsent
        );
        assert!(store.get("CartView", "c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn versions_continue_after_delete() {
        let store = MemoryReadModelStore::default();
        let sources = SourceVersions::from([("Cart/c1".to_string(), 4)]);

        store
            .write_if_version(
                "CartView",
                "c1",
                0,
                ReadModelWrite::new(1, json!({ "n": 1 })).with_sources(sources),
            )
            .await
            .unwrap();
        store
            .remove_if_version(
                "CartView",
                "c1",
                1,
                SourceVersions::from([("Cart/c1".to_string(), 5)]),
            )
            .await
            .unwrap();

        let tombstone = store.entry("CartView", "c1").await.unwrap().unwrap();
        assert_eq!(tombstone.version(), 2);
        assert_eq!(tombstone.sources().get("Cart/c1"), Some(&5));
        assert!(store.list("CartView", None, 10).await.unwrap().items.is_empty());

        // a token from before the delete no longer matches
        assert_eq!(
            store
                .put_if_version("CartView", "c1", 1, 1, json!({ "n": 2 }))
                .await
                .unwrap(),
            PutOutcome::VersionConflict
        );
        assert_eq!(
            store
                .put_if_version("CartView", "c1", 0, 1, json!({ "n": 2 }))
                .await
                .unwrap(),
            PutOutcome::VersionConflict
        );
        assert_eq!(
            store
                .put_if_version("CartView", "c1", 2, 1, json!({ "n": 2 }))
                .await
                .unwrap(),
            PutOutcome::Stored { version: 3 }
        );
        assert_eq!(store.get("CartView", "c1").await.unwrap().unwrap().version, 3);
    }

    #[test]
    fn shared_namespaces() {
        let (events_a, models_a) = open("shared_namespaces").unwrap();
        let (events_b, models_b) = open("shared_namespaces").unwrap();
        let (events_c, _) = open("other_namespace").unwrap();

        assert!(Arc::ptr_eq(&events_a, &events_b));
        assert!(Arc::ptr_eq(&models_a, &models_b));
        assert!(!Arc::ptr_eq(&events_a, &events_c));
    }
}
