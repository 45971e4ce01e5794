//! Reference storage backends for events and read models.
//!
//! The backend is selected by the scheme of the storage uri:
//!
//! * `memory:` or `memory:<namespace>` keeps everything in memory,
//! * `local:///<absolute path>` (or `file://`) keeps JSON files on disk.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use url::Url;

use crate::eventsourcing::{
    EventEnvelope, EventStoreClient, Kind, ReadModelStore, StoreError,
};

mod disk;
pub use self::disk::{DiskEventStore, DiskReadModelStore};

mod memory;
pub use self::memory::{MemoryEventStore, MemoryReadModelStore};

//------------ StorageSystem -------------------------------------------------

/// The event store and read model store behind one storage uri.
#[derive(Clone)]
pub struct StorageSystem {
    uri: Url,
    events: Arc<dyn EventStoreClient>,
    read_models: Arc<dyn ReadModelStore>,
}

impl StorageSystem {
    pub fn open(uri: &Url) -> Result<Self, StoreError> {
        let (events, read_models): (
            Arc<dyn EventStoreClient>,
            Arc<dyn ReadModelStore>,
        ) = match uri.scheme() {
            "memory" => {
                let (events, read_models) = memory::open(uri.path())?;
                (
                    events as Arc<dyn EventStoreClient>,
                    read_models as Arc<dyn ReadModelStore>,
                )
            }
            "local" | "file" => {
                let base = Self::local_path(uri)?;
                (
                    Arc::new(DiskEventStore::new(&base)?) as Arc<dyn EventStoreClient>,
                    Arc::new(DiskReadModelStore::new(&base)?) as Arc<dyn ReadModelStore>,
                )
            }
            other => return Err(StoreError::UnknownScheme(other.to_string())),
        };

        Ok(StorageSystem {
            uri: uri.clone(),
            events,
            read_models,
        })
    }

    fn local_path(uri: &Url) -> Result<PathBuf, StoreError> {
        if let Some(host) = uri.host_str() {
            if !host.is_empty() {
                return Err(StoreError::InvalidUri(format!(
                    "'{uri}' has a host, use three slashes for an absolute path"
                )));
            }
        }
        let path = PathBuf::from(uri.path());
        if !path.is_absolute() {
            return Err(StoreError::InvalidUri(format!(
                "'{uri}' is not an absolute path"
            )));
        }
        Ok(path)
    }

    pub fn events(&self) -> Arc<dyn EventStoreClient> {
        self.events.clone()
    }

    pub fn read_models(&self) -> Arc<dyn ReadModelStore> {
        self.read_models.clone()
    }
}

impl fmt::Display for StorageSystem {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.uri.fmt(f)
    }
}

//------------ Append checks -------------------------------------------------

/// Refuses appends of events that do not belong to the stream or do not
/// continue the expected version without gaps.
pub(crate) fn check_append(
    entity_type: &str,
    entity_id: &str,
    expected_version: u64,
    events: &[EventEnvelope],
) -> Result<(), StoreError> {
    if events.is_empty() {
        return Err(StoreError::InvalidAppend(format!(
            "no events for '{entity_type}/{entity_id}'"
        )));
    }
    for (nr, event) in events.iter().enumerate() {
        let version = expected_version + 1 + nr as u64;
        if event.entity_type_name != entity_type
            || event.entity_id != entity_id
            || event.kind != Kind::Event
        {
            return Err(StoreError::InvalidAppend(format!(
                "event '{event}' does not belong to '{entity_type}/{entity_id}'"
            )));
        }
        if event.version != version {
            return Err(StoreError::InvalidAppend(format!(
                "event '{event}' should have version {version}"
            )));
        }
    }
    Ok(())
}

//------------ Tests ---------------------------------------------------------
