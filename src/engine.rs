//! The entry point for domain code: commands, reads and admin workflows.

use std::sync::Arc;

use log::{error, info};

use crate::commons::{DomainError, Error, RefoldResult};
use crate::config::Config;
use crate::constants::*;
use crate::eventsourcing::{
    CommandOutcome, ConcurrencyGuard, EntityState, EventStoreClient,
    JobReport, NewEvent, ProjectionEngine, ProjectionReport, ReadModelStore,
    Registry, Searcher, SnapshotReconstructor, TouchWorkflow,
};
use crate::storage::StorageSystem;
use crate::upgrades::{DataMigrationRunner, MigrationReport};

//------------ EngineSettings ------------------------------------------------

/// The tunables of an engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EngineSettings {
    pub command_retries: usize,
    pub projection_retries: usize,
    pub snapshot_frequency: u64,
    pub page_size: usize,
    pub job_concurrency: usize,
    pub retry_jitter_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            command_retries: DEFAULT_COMMAND_RETRIES,
            projection_retries: DEFAULT_PROJECTION_RETRIES,
            snapshot_frequency: DEFAULT_SNAPSHOT_FREQUENCY,
            page_size: DEFAULT_PAGE_SIZE,
            job_concurrency: DEFAULT_JOB_CONCURRENCY,
            retry_jitter_ms: 0,
        }
    }
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        EngineSettings {
            command_retries: config.command_retries,
            projection_retries: config.projection_retries,
            snapshot_frequency: config.snapshot_frequency,
            page_size: config.page_size,
            job_concurrency: config.job_concurrency,
            retry_jitter_ms: config.retry_jitter_ms,
        }
    }
}

//------------ Engine --------------------------------------------------------

/// Ties a validated registry to an event store and a read model store.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<Registry>,
    read_models: Arc<dyn ReadModelStore>,
    guard: ConcurrencyGuard,
    projections: ProjectionEngine,
    touch: TouchWorkflow,
    migrations: Arc<DataMigrationRunner>,
    settings: EngineSettings,
}

/// # Set up
impl Engine {
    /// Creates an engine. The registry is validated when it is built, so
    /// an engine never runs with gaps in its migrations.
    pub fn new(
        registry: Registry,
        events: Arc<dyn EventStoreClient>,
        read_models: Arc<dyn ReadModelStore>,
        settings: EngineSettings,
    ) -> Self {
        let registry = Arc::new(registry);

        let reconstructor = SnapshotReconstructor::new(
            registry.clone(),
            events.clone(),
            settings.snapshot_frequency,
        );
        let guard = ConcurrencyGuard::new(
            registry.clone(),
            events.clone(),
            reconstructor,
            settings.command_retries,
        )
        .with_retry_jitter(settings.retry_jitter_ms);
        let projections = ProjectionEngine::new(
            registry.clone(),
            read_models.clone(),
            settings.projection_retries,
        );
        let touch = TouchWorkflow::new(
            events.clone(),
            guard.clone(),
            projections.clone(),
            settings.page_size,
            settings.job_concurrency,
        );
        let migrations = Arc::new(DataMigrationRunner::new(
            registry.clone(),
            events,
            read_models.clone(),
            guard.clone(),
            settings.page_size,
            settings.job_concurrency,
            settings.projection_retries,
        ));

        Engine {
            registry,
            read_models,
            guard,
            projections,
            touch,
            migrations,
            settings,
        }
    }

    /// Creates an engine using the storage named in the config.
    pub fn from_config(registry: Registry, config: &Config) -> RefoldResult<Self> {
        config.verify()?;
        let storage = StorageSystem::open(&config.storage_uri)?;
        info!("Starting {REFOLD_ADMIN_APP} engine using storage {storage}");

        Ok(Self::new(
            registry,
            storage.events(),
            storage.read_models(),
            EngineSettings::from(config),
        ))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }
}

/// # Entities
impl Engine {
    /// Returns the current state of an entity, or `None` if it has no
    /// events.
    pub async fn reconstruct(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> RefoldResult<Option<EntityState>> {
        self.guard
            .reconstructor()
            .reconstruct(entity_type, entity_id, None)
            .await
    }

    /// Returns the state of an entity as of the given version.
    pub async fn reconstruct_at(
        &self,
        entity_type: &str,
        entity_id: &str,
        version: u64,
    ) -> RefoldResult<Option<EntityState>> {
        self.guard
            .reconstructor()
            .reconstruct(entity_type, entity_id, Some(version))
            .await
    }

    /// Rebuilds an entity from all of its events and replaces its snapshot.
    pub async fn rebuild(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> RefoldResult<Option<EntityState>> {
        self.guard.reconstructor().rebuild(entity_type, entity_id).await
    }

    /// Handles a command and projects the resulting state.
    ///
    /// The handler gets the current state and returns the events to append.
    /// It runs again on a version conflict. If projecting fails after the
    /// events were stored, `ProjectionAfterAppend` is returned: the events
    /// stay, and touching the entity type catches up the read models.
    pub async fn execute_command<F>(
        &self,
        entity_type: &str,
        entity_id: &str,
        handler: F,
    ) -> RefoldResult<CommandOutcome>
    where
        F: FnMut(Option<&EntityState>) -> Result<Vec<NewEvent>, DomainError>
            + Send,
    {
        let outcome = self.guard.execute(entity_type, entity_id, handler).await?;

        if let Some(state) = outcome.state.as_ref().filter(|_| !outcome.is_noop()) {
            if let Err(e) = self
                .projections
                .project_change(entity_type, outcome.prior.as_ref(), state)
                .await
            {
                error!(
                    "Events for '{entity_type}/{entity_id}' stored up to \
                     version {}, but projecting them failed: {e}",
                    state.version
                );
                return Err(Error::ProjectionAfterAppend {
                    entity_type: entity_type.to_string(),
                    entity_id: entity_id.to_string(),
                    version: state.version,
                    cause: Box::new(e),
                });
            }
        }

        Ok(outcome)
    }

    /// Reconstructs an entity and runs its projections, also for the given
    /// read model ids the entity used to join to.
    pub async fn project_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        affected_ids: &[String],
    ) -> RefoldResult<ProjectionReport> {
        match self.reconstruct(entity_type, entity_id).await? {
            Some(state) => {
                self.projections
                    .project(entity_type, &state, affected_ids)
                    .await
            }
            None => Ok(ProjectionReport::default()),
        }
    }
}

/// # Admin workflows
impl Engine {
    /// Re-projects all entities of a type.
    pub async fn touch(&self, entity_type: &str) -> RefoldResult<JobReport> {
        if !self.registry.has_entity(entity_type) {
            return Err(Error::UnknownEntityType(entity_type.to_string()));
        }
        self.touch.touch(entity_type).await
    }

    /// Re-projects one entity.
    pub async fn touch_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> RefoldResult<ProjectionReport> {
        self.touch.touch_entity(entity_type, entity_id).await
    }

    /// Migrates stored read models and snapshots of the named concept, or
    /// of all concepts, to their current schema version.
    pub async fn migrate_data(
        &self,
        concept: Option<&str>,
    ) -> RefoldResult<MigrationReport> {
        self.migrations.run_all(concept).await
    }
}

/// # Read models
impl Engine {
    /// Starts a search over the records of a read model.
    pub fn searcher(&self, read_model: &str) -> Searcher {
        Searcher::new(self.read_models.clone(), read_model)
            .page_size(self.settings.page_size)
    }

    pub fn read_models(&self) -> Arc<dyn ReadModelStore> {
        self.read_models.clone()
    }
}
