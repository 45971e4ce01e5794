use std::sync::Arc;

use log::{debug, trace, warn};

use crate::commons::error::ReducerFailure;
use crate::commons::{Error, RefoldEmptyResult, RefoldResult};

use super::{
    EntityState, EventEnvelope, EventStoreClient, Kind, Registry,
    SnapshotEnvelope,
};

//------------ SnapshotReconstructor -----------------------------------------

/// Rebuilds entity state from the last usable snapshot plus the events
/// stored after it.
///
/// Reconstruction is deterministic: the result depends only on the stored
/// events, never on whether a snapshot was present or how the store chunks
/// its reads.
#[derive(Clone)]
pub struct SnapshotReconstructor {
    registry: Arc<Registry>,
    events: Arc<dyn EventStoreClient>,

    // Fold at least this many events past the snapshot before storing a
    // new one. Zero disables snapshots.
    snapshot_frequency: u64,
}

impl SnapshotReconstructor {
    pub fn new(
        registry: Arc<Registry>,
        events: Arc<dyn EventStoreClient>,
        snapshot_frequency: u64,
    ) -> Self {
        SnapshotReconstructor {
            registry,
            events,
            snapshot_frequency,
        }
    }

    /// Returns the state of the entity, or `None` if it has no events.
    ///
    /// With `as_of` only the events up to and including that version are
    /// folded.
    pub async fn reconstruct(
        &self,
        entity_type: &str,
        entity_id: &str,
        as_of: Option<u64>,
    ) -> RefoldResult<Option<EntityState>> {
        self.load(entity_type, entity_id, as_of, true).await
    }

    /// Folds all events from scratch and replaces the stored snapshot.
    ///
    /// Used to repair a snapshot that is out of step with the events.
    pub async fn rebuild(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> RefoldResult<Option<EntityState>> {
        let state = self.load(entity_type, entity_id, None, false).await?;
        if let Some(state) = &state {
            self.store_snapshot(state).await?;
        }
        Ok(state)
    }

    async fn load(
        &self,
        entity_type: &str,
        entity_id: &str,
        as_of: Option<u64>,
        use_snapshot: bool,
    ) -> RefoldResult<Option<EntityState>> {
        if !self.registry.has_entity(entity_type) {
            return Err(Error::UnknownEntityType(entity_type.to_string()));
        }

        let mut state = if use_snapshot {
            self.usable_snapshot(entity_type, entity_id, as_of).await
        } else {
            None
        };
        let snapshot_version = state.as_ref().map(|s| s.version).unwrap_or(0);

        'batches: loop {
            let after = state.as_ref().map(|s| s.version).unwrap_or(0);
            if as_of.is_some_and(|as_of| after >= as_of) {
                break;
            }

            let batch = self.events.read_since(entity_type, entity_id, after).await?;
            if batch.is_empty() {
                break;
            }
            trace!(
                "Read {} events for '{}/{}' after version {}",
                batch.len(),
                entity_type,
                entity_id,
                after
            );

            for event in batch {
                if as_of.is_some_and(|as_of| event.version > as_of) {
                    break 'batches;
                }
                state = Some(self.apply(state, event)?);
            }
        }

        if let Some(state) = &state {
            let folded = state.version - snapshot_version;
            if use_snapshot
                && as_of.is_none()
                && self.snapshot_frequency > 0
                && folded >= self.snapshot_frequency
            {
                if let Err(e) = self.store_snapshot(state).await {
                    warn!("Could not store snapshot for {state}: {e}");
                }
            }
        }

        Ok(state)
    }

    /// Folds events into a prior state.
    ///
    /// The events must continue the prior state's version without gaps.
    pub fn fold(
        &self,
        prior: Option<EntityState>,
        events: impl IntoIterator<Item = EventEnvelope>,
    ) -> RefoldResult<Option<EntityState>> {
        let mut state = prior;
        for event in events {
            state = Some(self.apply(state, event)?);
        }
        Ok(state)
    }

    fn apply(
        &self,
        state: Option<EntityState>,
        event: EventEnvelope,
    ) -> RefoldResult<EntityState> {
        let expected = state.as_ref().map(|s| s.version).unwrap_or(0) + 1;
        if event.version != expected {
            return Err(Error::EventSequenceGap {
                entity_type: event.entity_type_name,
                entity_id: event.entity_id,
                expected,
                found: event.version,
            });
        }

        let reducer = self
            .registry
            .reducer(&event.entity_type_name, &event.type_name)?;
        let payload = self.registry.migrate(
            &event.type_name,
            event.schema_version,
            event.value.clone(),
        )?;

        let prior = state.map(|state| state.value);
        let value = reducer.reduce(payload, prior.clone()).map_err(|cause| {
            Error::ReducerFailed(Box::new(ReducerFailure {
                event: event.clone(),
                state: prior,
                cause,
            }))
        })?;

        Ok(EntityState {
            entity_type: event.entity_type_name,
            entity_id: event.entity_id,
            version: event.version,
            value,
            last_updated: event.created_at,
        })
    }

    /// Returns the stored snapshot as a starting state, if it can be used.
    ///
    /// A snapshot is only a cache, so anything wrong with it is logged and
    /// the fold starts from the first event instead.
    async fn usable_snapshot(
        &self,
        entity_type: &str,
        entity_id: &str,
        as_of: Option<u64>,
    ) -> Option<EntityState> {
        let snapshot = match self.events.read_snapshot(entity_type, entity_id).await
        {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return None,
            Err(e) => {
                warn!(
                    "Ignoring snapshot for '{entity_type}/{entity_id}', \
                     cannot read it: {e}"
                );
                return None;
            }
        };

        if snapshot.kind != Kind::Snapshot
            || snapshot.entity_type_name != entity_type
            || snapshot.entity_id != entity_id
            || snapshot.version == 0
        {
            warn!(
                "Ignoring snapshot for '{entity_type}/{entity_id}', it \
                 belongs to '{}/{}'",
                snapshot.entity_type_name, snapshot.entity_id
            );
            return None;
        }

        if as_of.is_some_and(|as_of| snapshot.version > as_of) {
            debug!(
                "Snapshot for '{entity_type}/{entity_id}' is at version {}, \
                 past the requested version",
                snapshot.version
            );
            return None;
        }

        match self.registry.migrate(
            entity_type,
            snapshot.schema_version,
            snapshot.value,
        ) {
            Ok(value) => Some(EntityState {
                entity_type: snapshot.entity_type_name,
                entity_id: snapshot.entity_id,
                version: snapshot.version,
                value,
                last_updated: snapshot.created_at,
            }),
            Err(e) => {
                warn!(
                    "Ignoring snapshot for '{entity_type}/{entity_id}', \
                     cannot migrate it: {e}"
                );
                None
            }
        }
    }

    async fn store_snapshot(&self, state: &EntityState) -> RefoldEmptyResult {
        let schema_version = self.registry.current_version(&state.entity_type)?;
        let snapshot = SnapshotEnvelope::from_state(state, schema_version);
        self.events.store_snapshot(&snapshot).await?;
        debug!("Stored snapshot for {state}");
        Ok(())
    }
}
