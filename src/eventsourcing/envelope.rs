//! Durable wrappers around events and snapshots.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

//------------ Kind ----------------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Event,
    Snapshot,
}

//------------ EventEnvelope -------------------------------------------------

/// An event as stored in the event log.
///
/// Identified by entity type, entity id and version. Immutable once
/// appended. The `schema_version` is the version of the event concept
/// (`type_name`) the payload was written with.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct EventEnvelope {
    pub entity_type_name: String,
    pub entity_id: String,
    pub kind: Kind,
    pub type_name: String,
    pub version: u64,
    pub schema_version: u32,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub request_id: Uuid,
}

impl fmt::Display for EventEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}/{} version {} {}",
            self.entity_type_name, self.entity_id, self.version, self.type_name
        )
    }
}

//------------ SnapshotEnvelope ----------------------------------------------

/// A cached fold result.
///
/// Never authoritative: any event with a version above the snapshot's
/// version must still be folded in.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SnapshotEnvelope {
    pub entity_type_name: String,
    pub entity_id: String,
    pub kind: Kind,
    pub type_name: String,
    pub version: u64,
    pub schema_version: u32,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub request_id: Uuid,
}

impl SnapshotEnvelope {
    pub fn from_state(state: &EntityState, schema_version: u32) -> Self {
        SnapshotEnvelope {
            entity_type_name: state.entity_type.clone(),
            entity_id: state.entity_id.clone(),
            kind: Kind::Snapshot,
            type_name: state.entity_type.clone(),
            version: state.version,
            schema_version,
            value: state.value.clone(),
            created_at: state.last_updated,
            request_id: Uuid::new_v4(),
        }
    }
}

//------------ NewEvent ------------------------------------------------------

/// An event produced by command handling, not yet stored.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NewEvent {
    pub type_name: String,
    pub value: Value,
}

impl NewEvent {
    pub fn new<T: Serialize>(
        type_name: &str,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(NewEvent {
            type_name: type_name.to_string(),
            value: serde_json::to_value(payload)?,
        })
    }

    pub fn from_value(type_name: &str, value: Value) -> Self {
        NewEvent {
            type_name: type_name.to_string(),
            value,
        }
    }
}

//------------ EntityState ---------------------------------------------------

/// The current state of an entity, as folded from its events.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EntityState {
    pub entity_type: String,
    pub entity_id: String,

    /// The version of the last event folded into this state.
    pub version: u64,
    pub value: Value,
    pub last_updated: DateTime<Utc>,
}

impl EntityState {
    /// Deserializes the value into the domain type.
    pub fn typed<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.value)
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}/{} at version {}",
            self.entity_type, self.entity_id, self.version
        )
    }
}

//------------ Page ----------------------------------------------------------

/// One page of a cursor based scan.
///
/// The cursor is the key of the last item, so items inserted concurrently
/// never shift later pages. `next` is `None` when there is nothing more.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<String>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Page {
            items: vec![],
            next: None,
        }
    }

    /// Creates a page, computing the cursor for the next one.
    pub fn new(items: Vec<T>, limit: usize, key: impl Fn(&T) -> String) -> Self {
        let next = if items.len() >= limit {
            items.last().map(key)
        } else {
            None
        };
        Page { items, next }
    }
}
