//! Support data migrations, i.e. rewriting stored read models and snapshots
//! written with an older schema version of their concept.
//!
//! Events are never rewritten. They are upgraded every time they are read,
//! so only the derived data is migrated here.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};

use crate::commons::{Error, RefoldResult};
use crate::constants::DATA_MIGRATION_JOB_ENTITY;
use crate::eventsourcing::{
    Concept, ConceptKind, ConcurrencyGuard, EventStoreClient, JobReport,
    JobRunner, JobStatus, JobTracker, Page, PagedJob, PutOutcome,
    ReadModelStore, ReadModelWrite, Registry, SnapshotEnvelope,
};

//------------ MigrationReport -----------------------------------------------

/// The outcome of migrating one or more concepts.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MigrationReport {
    /// One job report per concept, named after the concept.
    pub concepts: Vec<JobReport>,
}

impl MigrationReport {
    pub fn changed(&self) -> u64 {
        self.concepts.iter().map(|report| report.changed).sum()
    }

    pub fn is_success(&self) -> bool {
        self.concepts
            .iter()
            .all(|report| report.status == JobStatus::Finished)
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.concepts.is_empty() {
            return write!(f, "Nothing to migrate");
        }
        for report in &self.concepts {
            writeln!(f, "{report}")?;
        }
        Ok(())
    }
}

//------------ DataMigrationRunner -------------------------------------------

/// Migrates stored read models and entity snapshots to the current schema
/// version of their concept.
///
/// Each concept is migrated as a job tracked in `DataMigrationJob/<concept>`,
/// so an interrupted migration resumes where it was.
pub struct DataMigrationRunner {
    registry: Arc<Registry>,
    events: Arc<dyn EventStoreClient>,
    read_models: Arc<dyn ReadModelStore>,
    guard: ConcurrencyGuard,
    page_size: usize,
    concurrency: usize,
    max_attempts: usize,
}

impl DataMigrationRunner {
    pub fn new(
        registry: Arc<Registry>,
        events: Arc<dyn EventStoreClient>,
        read_models: Arc<dyn ReadModelStore>,
        guard: ConcurrencyGuard,
        page_size: usize,
        concurrency: usize,
        max_attempts: usize,
    ) -> Self {
        DataMigrationRunner {
            registry,
            events,
            read_models,
            guard,
            page_size,
            concurrency,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Migrates the named concept, or all entity and read model concepts
    /// beyond their first version.
    pub async fn run_all(&self, concept: Option<&str>) -> RefoldResult<MigrationReport> {
        let targets: Vec<&Concept> = match concept {
            Some(name) => {
                let concept = self.registry.concept(name)?;
                if concept.kind == ConceptKind::Event {
                    return Err(Error::custom(format!(
                        "'{name}' is an event type, stored events are \
                         migrated when read"
                    )));
                }
                vec![concept]
            }
            None => self
                .registry
                .concepts()
                .filter(|c| c.kind != ConceptKind::Event && c.current_version > 1)
                .collect(),
        };

        let mut report = MigrationReport::default();
        for concept in targets {
            report.concepts.push(self.run(concept).await?);
        }
        Ok(report)
    }

    async fn run(&self, concept: &Concept) -> RefoldResult<JobReport> {
        info!(
            "Migrating {} '{}' to version {}",
            concept.kind, concept.name, concept.current_version
        );
        let tracker = JobTracker::new(
            self.guard.clone(),
            DATA_MIGRATION_JOB_ENTITY,
            &concept.name,
        );
        let runner = JobRunner::new(tracker, self.page_size, self.concurrency);

        match concept.kind {
            ConceptKind::ReadModel => {
                runner
                    .run(&MigrateReadModels {
                        concept,
                        read_models: self.read_models.as_ref(),
                        max_attempts: self.max_attempts,
                    })
                    .await
            }
            ConceptKind::Entity => {
                runner
                    .run(&MigrateSnapshots {
                        concept,
                        events: self.events.as_ref(),
                    })
                    .await
            }
            ConceptKind::Event => Err(Error::custom(format!(
                "cannot migrate stored events of '{}'",
                concept.name
            ))),
        }
    }
}

//------------ MigrateReadModels ---------------------------------------------

struct MigrateReadModels<'a> {
    concept: &'a Concept,
    read_models: &'a dyn ReadModelStore,
    max_attempts: usize,
}

#[async_trait]
impl PagedJob for MigrateReadModels<'_> {
    async fn page(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> RefoldResult<Page<String>> {
        let page = self.read_models.list(&self.concept.name, after, limit).await?;
        Ok(Page {
            items: page.items.into_iter().map(|record| record.id).collect(),
            next: page.next,
        })
    }

    /// Rewrites the record under its version token. A concurrent write
    /// means the record is fetched and migrated again.
    async fn process(&self, id: &str) -> RefoldResult<bool> {
        let name = self.concept.name.as_str();
        let current = self.concept.current_version;

        for _ in 0..self.max_attempts {
            let record = match self.read_models.get(name, id).await? {
                Some(record) => record,
                None => return Ok(false),
            };
            if record.schema_version == current {
                return Ok(false);
            }

            let value = self.concept.migrate(record.schema_version, record.value)?;
            let write = ReadModelWrite::new(current, value).with_sources(record.sources);
            match self
                .read_models
                .write_if_version(name, id, record.version, write)
                .await?
            {
                PutOutcome::Stored { .. } => {
                    debug!(
                        "Migrated '{name}/{id}' from version {} to {current}",
                        record.schema_version
                    );
                    return Ok(true);
                }
                PutOutcome::VersionConflict => {
                    debug!("Conflict migrating '{name}/{id}', trying again");
                }
            }
        }

        Err(Error::ReadModelConflict {
            read_model: name.to_string(),
            id: id.to_string(),
            attempts: self.max_attempts,
        })
    }
}

//------------ MigrateSnapshots ----------------------------------------------

struct MigrateSnapshots<'a> {
    concept: &'a Concept,
    events: &'a dyn EventStoreClient,
}

#[async_trait]
impl PagedJob for MigrateSnapshots<'_> {
    async fn page(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> RefoldResult<Page<String>> {
        Ok(self
            .events
            .list_entity_ids(&self.concept.name, after, limit)
            .await?)
    }

    async fn process(&self, id: &str) -> RefoldResult<bool> {
        let name = self.concept.name.as_str();
        let snapshot = match self.events.read_snapshot(name, id).await? {
            Some(snapshot) => snapshot,
            None => return Ok(false),
        };
        if snapshot.schema_version == self.concept.current_version {
            return Ok(false);
        }

        let from_version = snapshot.schema_version;
        let migrated = SnapshotEnvelope {
            schema_version: self.concept.current_version,
            value: self.concept.migrate(from_version, snapshot.value)?,
            ..snapshot
        };
        self.events.store_snapshot(&migrated).await?;
        debug!(
            "Migrated snapshot of '{name}/{id}' from version {from_version} to {}",
            self.concept.current_version
        );
        Ok(true)
    }
}
