//! The contracts of the external event store and read model store.

use std::collections::BTreeMap;
use std::{fmt, io};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{EventEnvelope, Page, SnapshotEnvelope};

//------------ AppendOutcome -------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AppendOutcome {
    /// All events were appended, the stream is now at `version`.
    Appended { version: u64 },

    /// The stream was not at the expected version.
    VersionConflict { actual: u64 },
}

//------------ EventStoreClient ----------------------------------------------

/// An append-only, per entity event log.
///
/// The store is the only serialization point: it must refuse an append
/// unless the stream is exactly at `expected_version` and the events carry
/// the versions following it without gaps.
#[async_trait]
pub trait EventStoreClient: Send + Sync + 'static {
    /// Appends events if the stream is at the expected version.
    async fn append(
        &self,
        entity_type: &str,
        entity_id: &str,
        expected_version: u64,
        events: Vec<EventEnvelope>,
    ) -> Result<AppendOutcome, StoreError>;

    /// Returns events with a version above `after_version`, ascending.
    ///
    /// Stores may return a bounded batch, an empty result means there are
    /// no more events.
    async fn read_since(
        &self,
        entity_type: &str,
        entity_id: &str,
        after_version: u64,
    ) -> Result<Vec<EventEnvelope>, StoreError>;

    /// Returns the latest cached snapshot, if any.
    async fn read_snapshot(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<SnapshotEnvelope>, StoreError>;

    /// Replaces the cached snapshot.
    async fn store_snapshot(
        &self,
        snapshot: &SnapshotEnvelope,
    ) -> Result<(), StoreError>;

    /// Lists the ids of all entities of a type, ordered, after the cursor.
    async fn list_entity_ids(
        &self,
        entity_type: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Page<String>, StoreError>;
}

//------------ SourceVersions ------------------------------------------------

/// The entity versions a read model was last projected from.
///
/// Keys are `<entity type>/<entity id>`.
pub type SourceVersions = BTreeMap<String, u64>;

/// Returns the key an entity has in [`SourceVersions`].
pub fn source_key(entity_type: &str, entity_id: &str) -> String {
    format!("{entity_type}/{entity_id}")
}

//------------ ReadModelRecord -----------------------------------------------

/// A read model as stored.
///
/// The version increments on every successful write and is the token for
/// optimistic concurrency. The schema version is the version of the read
/// model concept the value was written with.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ReadModelRecord {
    pub id: String,
    pub version: u64,
    pub schema_version: u32,
    pub value: Value,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sources: SourceVersions,
}

//------------ ReadModelEntry ------------------------------------------------

/// What a store holds under a read model id.
///
/// A deleted record leaves a tombstone behind. It keeps the version counter
/// going, so a token taken before the delete never matches a record created
/// after it, and it keeps the source versions the record was last written
/// from.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ReadModelEntry {
    Present(ReadModelRecord),
    Deleted { version: u64, sources: SourceVersions },
}

impl ReadModelEntry {
    pub fn version(&self) -> u64 {
        match self {
            ReadModelEntry::Present(record) => record.version,
            ReadModelEntry::Deleted { version, .. } => *version,
        }
    }

    pub fn sources(&self) -> &SourceVersions {
        match self {
            ReadModelEntry::Present(record) => &record.sources,
            ReadModelEntry::Deleted { sources, .. } => sources,
        }
    }

    /// Returns the record unless it was deleted.
    pub fn into_record(self) -> Option<ReadModelRecord> {
        match self {
            ReadModelEntry::Present(record) => Some(record),
            ReadModelEntry::Deleted { .. } => None,
        }
    }

    /// Turns the entry into a tombstone one version up.
    ///
    /// The tombstone keeps the highest of the recorded and the given
    /// source versions.
    pub fn tombstone(self, sources: SourceVersions) -> Self {
        let version = self.version() + 1;
        let mut merged = match self {
            ReadModelEntry::Present(record) => record.sources,
            ReadModelEntry::Deleted { sources, .. } => sources,
        };
        for (key, source_version) in sources {
            let recorded = merged.entry(key).or_insert(source_version);
            *recorded = (*recorded).max(source_version);
        }
        ReadModelEntry::Deleted {
            version,
            sources: merged,
        }
    }
}

//------------ ReadModelWrite ------------------------------------------------

/// A value to store as a read model.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReadModelWrite {
    pub schema_version: u32,
    pub value: Value,
    pub sources: SourceVersions,
}

impl ReadModelWrite {
    pub fn new(schema_version: u32, value: Value) -> Self {
        ReadModelWrite {
            schema_version,
            value,
            sources: SourceVersions::new(),
        }
    }

    pub fn with_sources(mut self, sources: SourceVersions) -> Self {
        self.sources = sources;
        self
    }

    /// Returns the record this write results in.
    pub fn into_record(self, id: &str, version: u64) -> ReadModelRecord {
        ReadModelRecord {
            id: id.to_string(),
            version,
            schema_version: self.schema_version,
            value: self.value,
            sources: self.sources,
        }
    }
}

//------------ PutOutcome ----------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PutOutcome {
    Stored { version: u64 },
    VersionConflict,
}

//------------ DeleteOutcome -------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeleteOutcome {
    Deleted,
    VersionConflict,
    AlreadyAbsent,
}

//------------ ReadModelStore ------------------------------------------------

/// A keyed store for read models with conditional writes.
///
/// Versions of one id only ever go up. Deleting a record leaves a
/// [`ReadModelEntry::Deleted`] tombstone whose version the next write must
/// name.
#[async_trait]
pub trait ReadModelStore: Send + Sync + 'static {
    /// Returns the entry for the id, tombstones included.
    async fn entry(
        &self,
        read_model: &str,
        id: &str,
    ) -> Result<Option<ReadModelEntry>, StoreError>;

    /// Writes if the current version of the entry matches.
    ///
    /// An expected version of 0 means nothing was ever stored under the id.
    async fn write_if_version(
        &self,
        read_model: &str,
        id: &str,
        expected_version: u64,
        write: ReadModelWrite,
    ) -> Result<PutOutcome, StoreError>;

    /// Replaces the record by a tombstone if the current version matches.
    ///
    /// The given source versions are merged into the tombstone.
    async fn remove_if_version(
        &self,
        read_model: &str,
        id: &str,
        expected_version: u64,
        sources: SourceVersions,
    ) -> Result<DeleteOutcome, StoreError>;

    /// Lists records ordered by id, after the cursor. Tombstones are left
    /// out.
    async fn list(
        &self,
        read_model: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Page<ReadModelRecord>, StoreError>;

    /// Returns the record, if there is one that was not deleted.
    async fn get(
        &self,
        read_model: &str,
        id: &str,
    ) -> Result<Option<ReadModelRecord>, StoreError> {
        Ok(self
            .entry(read_model, id)
            .await?
            .and_then(ReadModelEntry::into_record))
    }

    /// Writes a value without source versions.
    async fn put_if_version(
        &self,
        read_model: &str,
        id: &str,
        expected_version: u64,
        schema_version: u32,
        value: Value,
    ) -> Result<PutOutcome, StoreError> {
        self.write_if_version(
            read_model,
            id,
            expected_version,
            ReadModelWrite::new(schema_version, value),
        )
        .await
    }

    async fn delete_if_version(
        &self,
        read_model: &str,
        id: &str,
        expected_version: u64,
    ) -> Result<DeleteOutcome, StoreError> {
        self.remove_if_version(
            read_model,
            id,
            expected_version,
            SourceVersions::new(),
        )
        .await
    }
}

//------------ StoreError ----------------------------------------------------

#[derive(Debug)]
pub enum StoreError {
    Io { context: String, cause: io::Error },
    Json { context: String, cause: serde_json::Error },
    UnknownScheme(String),
    InvalidUri(String),
    InvalidAppend(String),
    Other(String),
}

impl StoreError {
    pub fn io(context: impl fmt::Display, cause: io::Error) -> Self {
        StoreError::Io {
            context: context.to_string(),
            cause,
        }
    }

    pub fn json(context: impl fmt::Display, cause: serde_json::Error) -> Self {
        StoreError::Json {
            context: context.to_string(),
            cause,
        }
    }

    pub fn other(msg: impl fmt::Display) -> Self {
        StoreError::Other(msg.to_string())
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StoreError::Io { context, cause } => write!(f, "{context}: {cause}"),
            StoreError::Json { context, cause } => {
                write!(f, "{context}: {cause}")
            }
            StoreError::UnknownScheme(scheme) => {
                write!(f, "unknown storage scheme: {scheme}")
            }
            StoreError::InvalidUri(msg) => write!(f, "invalid storage uri: {msg}"),
            StoreError::InvalidAppend(msg) => {
                write!(f, "invalid event append: {msg}")
            }
            StoreError::Other(msg) => msg.fmt(f),
        }
    }
}

impl std::error::Error for StoreError {}
