use std::collections::BTreeSet;
use std::sync::Arc;

use log::{debug, error, trace};

use crate::commons::error::ProjectionFailure;
use crate::commons::{DomainError, Error, RefoldResult};

use super::{
    DeleteOutcome, EntityState, ProjectionAction, ProjectionMetadata,
    PutOutcome, ReadModelEntry, ReadModelStore, ReadModelWrite, Registry,
    SourceVersions, source_key,
};

//------------ ProjectionOutcome ---------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProjectionOutcome {
    Upserted,
    Deleted,
    Unchanged,
}

//------------ ProjectionReport ----------------------------------------------

/// Counts what happened to the read models of one entity.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ProjectionReport {
    pub upserted: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

impl ProjectionReport {
    fn add(&mut self, outcome: ProjectionOutcome) {
        match outcome {
            ProjectionOutcome::Upserted => self.upserted += 1,
            ProjectionOutcome::Deleted => self.deleted += 1,
            ProjectionOutcome::Unchanged => self.unchanged += 1,
        }
    }

    /// Returns whether any read model was written or removed.
    pub fn changed(&self) -> bool {
        self.upserted > 0 || self.deleted > 0
    }
}

//------------ ProjectionEngine ----------------------------------------------

/// Derives read models from entity state.
///
/// Each read model is written under its own version token. A concurrent
/// write makes the projection run again against the fresh read model. Every
/// record keeps the entity versions it was projected from, and is never
/// projected again from an older state of those entities.
#[derive(Clone)]
pub struct ProjectionEngine {
    registry: Arc<Registry>,
    read_models: Arc<dyn ReadModelStore>,
    max_attempts: usize,
}

impl ProjectionEngine {
    pub fn new(
        registry: Arc<Registry>,
        read_models: Arc<dyn ReadModelStore>,
        max_attempts: usize,
    ) -> Self {
        ProjectionEngine {
            registry,
            read_models,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Runs all projections registered for the entity's type.
    ///
    /// The read models to update are those named by the join key, plus
    /// existing records among the `affected_ids` the caller knows the entity
    /// touched before. Every projection is attempted, the first failure is
    /// returned.
    pub async fn project(
        &self,
        entity_type: &str,
        state: &EntityState,
        affected_ids: &[String],
    ) -> RefoldResult<ProjectionReport> {
        self.run(entity_type, None, state, affected_ids).await
    }

    /// Projects the change from `prior` to `state`.
    ///
    /// Read models the prior state joined to are projected as well, so a
    /// projection can remove what the entity no longer joins to.
    pub async fn project_change(
        &self,
        entity_type: &str,
        prior: Option<&EntityState>,
        state: &EntityState,
    ) -> RefoldResult<ProjectionReport> {
        self.run(entity_type, prior, state, &[]).await
    }

    async fn run(
        &self,
        entity_type: &str,
        prior: Option<&EntityState>,
        state: &EntityState,
        affected_ids: &[String],
    ) -> RefoldResult<ProjectionReport> {
        let mut report = ProjectionReport::default();
        let mut first_error = None;

        for projection in self.registry.projections_for(entity_type) {
            let (current, before) = match Self::join_keys(projection, prior, state) {
                Ok(keys) => keys,
                Err(e) => {
                    error!("{e}");
                    first_error.get_or_insert(e);
                    continue;
                }
            };

            // Ids the entity no longer joins to are only projected when
            // there is a record to update or remove.
            let current: BTreeSet<String> = current.into_iter().collect();
            let ids: BTreeSet<&String> = current
                .iter()
                .chain(before.iter())
                .chain(affected_ids)
                .collect();
            for id in ids {
                let existing_only = !current.contains(id);
                match self.project_one(projection, state, id, existing_only).await {
                    Ok(outcome) => report.add(outcome),
                    Err(e) => {
                        error!("{e}");
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Returns the ids the state joins to and those the prior state did.
    fn join_keys(
        projection: &ProjectionMetadata,
        prior: Option<&EntityState>,
        state: &EntityState,
    ) -> RefoldResult<(Vec<String>, Vec<String>)> {
        let current = projection
            .join_key(&state.value)
            .map_err(|cause| Self::failure(projection, state, None, cause))?;
        let before = match prior {
            Some(prior) => projection
                .join_key(&prior.value)
                .map_err(|cause| Self::failure(projection, prior, None, cause))?,
            None => vec![],
        };
        Ok((current, before))
    }

    /// Projects the state into one read model record.
    ///
    /// The record remembers the entity version it was last projected from.
    /// A state older than that is not projected, so a projection that runs
    /// late cannot undo a newer one.
    async fn project_one(
        &self,
        projection: &ProjectionMetadata,
        state: &EntityState,
        id: &str,
        existing_only: bool,
    ) -> RefoldResult<ProjectionOutcome> {
        let read_model = projection.read_model.as_str();
        let schema_version = self.registry.current_version(read_model)?;
        let source = source_key(&state.entity_type, &state.entity_id);

        for attempt in 1..=self.max_attempts {
            let entry = self.read_models.entry(read_model, id).await?;

            let (expected_version, mut sources) = match &entry {
                Some(entry) => (entry.version(), entry.sources().clone()),
                None => (0, SourceVersions::new()),
            };
            let recorded = sources.get(&source).copied();
            if recorded.is_some_and(|recorded| recorded > state.version) {
                trace!(
                    "Read model '{read_model}/{id}' was projected from a \
                     later version than {state}"
                );
                return Ok(ProjectionOutcome::Unchanged);
            }
            sources.insert(source.clone(), state.version);

            let record = entry.and_then(ReadModelEntry::into_record);
            if existing_only && record.is_none() {
                trace!("No read model '{read_model}/{id}' left for {state}");
                return Ok(ProjectionOutcome::Unchanged);
            }

            let prior = match &record {
                Some(record) => Some(self.registry.migrate(
                    read_model,
                    record.schema_version,
                    record.value.clone(),
                )?),
                None => None,
            };

            let action = projection.project(&state.value, prior).map_err(|cause| {
                Self::failure(projection, state, Some(id), cause)
            })?;

            match action {
                ProjectionAction::Nothing => {
                    return Ok(ProjectionOutcome::Unchanged);
                }
                ProjectionAction::Upsert(value) => {
                    if let Some(record) = &record {
                        if record.schema_version == schema_version
                            && record.value == value
                            && recorded == Some(state.version)
                        {
                            trace!("Read model '{read_model}/{id}' is unchanged");
                            return Ok(ProjectionOutcome::Unchanged);
                        }
                    }
                    let write = ReadModelWrite::new(schema_version, value)
                        .with_sources(sources);
                    match self
                        .read_models
                        .write_if_version(read_model, id, expected_version, write)
                        .await?
                    {
                        PutOutcome::Stored { version } => {
                            debug!(
                                "Projected {state} into '{read_model}/{id}' \
                                 version {version}"
                            );
                            return Ok(ProjectionOutcome::Upserted);
                        }
                        PutOutcome::VersionConflict => {}
                    }
                }
                ProjectionAction::Delete => {
                    if record.is_none() {
                        return Ok(ProjectionOutcome::Unchanged);
                    }
                    match self
                        .read_models
                        .remove_if_version(read_model, id, expected_version, sources)
                        .await?
                    {
                        DeleteOutcome::Deleted => {
                            debug!("Deleted '{read_model}/{id}' for {state}");
                            return Ok(ProjectionOutcome::Deleted);
                        }
                        DeleteOutcome::AlreadyAbsent => {
                            return Ok(ProjectionOutcome::Unchanged);
                        }
                        DeleteOutcome::VersionConflict => {}
                    }
                }
            }

            debug!(
                "Conflict writing '{read_model}/{id}' at version \
                 {expected_version}, attempt {attempt} of {}",
                self.max_attempts
            );
        }

        Err(Error::ReadModelConflict {
            read_model: read_model.to_string(),
            id: id.to_string(),
            attempts: self.max_attempts,
        })
    }

    fn failure(
        projection: &ProjectionMetadata,
        state: &EntityState,
        read_model_id: Option<&str>,
        cause: DomainError,
    ) -> Error {
        Error::ProjectionFailed(Box::new(ProjectionFailure {
            entity_type: state.entity_type.clone(),
            entity_id: state.entity_id.clone(),
            read_model: projection.read_model.clone(),
            read_model_id: read_model_id.map(str::to_string),
            entity: state.value.clone(),
            cause,
        }))
    }
}
