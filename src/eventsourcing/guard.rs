use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, trace, warn};
use rand::Rng;
use uuid::Uuid;

use crate::commons::{DomainError, Error, RefoldResult};

use super::{
    AppendOutcome, EntityState, EventEnvelope, EventStoreClient, Kind,
    NewEvent, Registry, SnapshotReconstructor,
};

//------------ AppendResult --------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AppendResult {
    /// The events were stored with these envelopes.
    Appended(Vec<EventEnvelope>),

    /// Another writer got there first, the stream is at `actual`.
    Conflict { actual: u64 },
}

//------------ CommandOutcome ------------------------------------------------

/// The result of a command that was handled successfully.
#[derive(Clone, Debug)]
pub struct CommandOutcome {
    pub entity_type: String,
    pub entity_id: String,

    /// The appended events, empty if the handler produced none.
    pub appended: Vec<EventEnvelope>,

    /// The entity state the handler decided on.
    pub prior: Option<EntityState>,

    /// The entity state after the appended events.
    pub state: Option<EntityState>,

    /// How often the handler ran.
    pub attempts: usize,
}

impl CommandOutcome {
    pub fn version(&self) -> u64 {
        self.state.as_ref().map(|state| state.version).unwrap_or(0)
    }

    pub fn is_noop(&self) -> bool {
        self.appended.is_empty()
    }
}

//------------ ConcurrencyGuard ----------------------------------------------

/// Appends events under optimistic concurrency.
///
/// A command handler decides on events given the current state. If another
/// writer appended in the meantime the append is refused by the store, and
/// the handler runs again against fresh state.
#[derive(Clone)]
pub struct ConcurrencyGuard {
    registry: Arc<Registry>,
    events: Arc<dyn EventStoreClient>,
    reconstructor: SnapshotReconstructor,
    command_retries: usize,
    retry_jitter_ms: u64,
}

impl ConcurrencyGuard {
    pub fn new(
        registry: Arc<Registry>,
        events: Arc<dyn EventStoreClient>,
        reconstructor: SnapshotReconstructor,
        command_retries: usize,
    ) -> Self {
        ConcurrencyGuard {
            registry,
            events,
            reconstructor,
            command_retries: command_retries.max(1),
            retry_jitter_ms: 0,
        }
    }

    /// Sleep up to this many milliseconds between attempts.
    pub fn with_retry_jitter(mut self, retry_jitter_ms: u64) -> Self {
        self.retry_jitter_ms = retry_jitter_ms;
        self
    }

    pub fn reconstructor(&self) -> &SnapshotReconstructor {
        &self.reconstructor
    }

    /// Stamps the events and appends them if the stream is at the expected
    /// version.
    ///
    /// All events share one request id and timestamp, and carry the current
    /// schema version of their event type.
    pub async fn append_with_expected_version(
        &self,
        entity_type: &str,
        entity_id: &str,
        expected_version: u64,
        new_events: Vec<NewEvent>,
    ) -> RefoldResult<AppendResult> {
        if new_events.is_empty() {
            return Ok(AppendResult::Appended(vec![]));
        }
        let envelopes =
            self.stamp(entity_type, entity_id, expected_version, new_events)?;
        self.append(entity_type, entity_id, expected_version, envelopes)
            .await
    }

    fn stamp(
        &self,
        entity_type: &str,
        entity_id: &str,
        expected_version: u64,
        new_events: Vec<NewEvent>,
    ) -> RefoldResult<Vec<EventEnvelope>> {
        let request_id = Uuid::new_v4();
        let created_at = Utc::now();

        let mut envelopes = Vec::with_capacity(new_events.len());
        for (nr, event) in new_events.into_iter().enumerate() {
            self.registry.reducer(entity_type, &event.type_name)?;
            let schema_version = self.registry.current_version(&event.type_name)?;

            envelopes.push(EventEnvelope {
                entity_type_name: entity_type.to_string(),
                entity_id: entity_id.to_string(),
                kind: Kind::Event,
                type_name: event.type_name,
                version: expected_version + 1 + nr as u64,
                schema_version,
                value: event.value,
                created_at,
                request_id,
            });
        }
        Ok(envelopes)
    }

    async fn append(
        &self,
        entity_type: &str,
        entity_id: &str,
        expected_version: u64,
        envelopes: Vec<EventEnvelope>,
    ) -> RefoldResult<AppendResult> {
        match self
            .events
            .append(entity_type, entity_id, expected_version, envelopes.clone())
            .await?
        {
            AppendOutcome::Appended { version } => {
                trace!(
                    "Appended {} events to '{entity_type}/{entity_id}', now at \
                     version {version}",
                    envelopes.len()
                );
                Ok(AppendResult::Appended(envelopes))
            }
            AppendOutcome::VersionConflict { actual } => {
                Ok(AppendResult::Conflict { actual })
            }
        }
    }

    /// Handles a command: reconstruct, decide, fold, append, retry on
    /// conflict.
    ///
    /// The handler may run more than once and must only depend on the state
    /// it is given. A handler or reducer error is not retried.
    pub async fn execute<F>(
        &self,
        entity_type: &str,
        entity_id: &str,
        mut handler: F,
    ) -> RefoldResult<CommandOutcome>
    where
        F: FnMut(Option<&EntityState>) -> Result<Vec<NewEvent>, DomainError>
            + Send,
    {
        for attempt in 1..=self.command_retries {
            let state = self
                .reconstructor
                .reconstruct(entity_type, entity_id, None)
                .await?;
            let expected = state.as_ref().map(|s| s.version).unwrap_or(0);

            let new_events =
                handler(state.as_ref()).map_err(|cause| Error::CommandRejected {
                    entity_type: entity_type.to_string(),
                    entity_id: entity_id.to_string(),
                    cause,
                })?;

            if new_events.is_empty() {
                debug!(
                    "Command for '{entity_type}/{entity_id}' at version \
                     {expected} produced no events"
                );
                return Ok(CommandOutcome {
                    entity_type: entity_type.to_string(),
                    entity_id: entity_id.to_string(),
                    appended: vec![],
                    prior: state.clone(),
                    state,
                    attempts: attempt,
                });
            }

            // Events the reducers refuse never reach the store.
            let envelopes = self.stamp(entity_type, entity_id, expected, new_events)?;
            let prior = state.clone();
            let folded = self.reconstructor.fold(state, envelopes.iter().cloned())?;

            match self
                .append(entity_type, entity_id, expected, envelopes)
                .await?
            {
                AppendResult::Appended(appended) => {
                    return Ok(CommandOutcome {
                        entity_type: entity_type.to_string(),
                        entity_id: entity_id.to_string(),
                        appended,
                        prior,
                        state: folded,
                        attempts: attempt,
                    });
                }
                AppendResult::Conflict { actual } => {
                    debug!(
                        "Conflict on '{entity_type}/{entity_id}': expected \
                         version {expected} but found {actual}, attempt {} \
                         of {}",
                        attempt, self.command_retries
                    );
                    if attempt < self.command_retries {
                        self.back_off().await;
                    }
                }
            }
        }

        warn!(
            "Giving up on command for '{entity_type}/{entity_id}' after {} \
             conflicting attempts",
            self.command_retries
        );
        Err(Error::OptimisticConcurrencyUnexpectedVersion {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            attempts: self.command_retries,
        })
    }

    async fn back_off(&self) {
        if self.retry_jitter_ms > 0 {
            let millis = rand::rng().random_range(0..=self.retry_jitter_ms);
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
    }
}
