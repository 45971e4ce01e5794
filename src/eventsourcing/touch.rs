use std::sync::Arc;

use async_trait::async_trait;
use log::trace;

use crate::commons::RefoldResult;
use crate::constants::TOUCH_JOB_ENTITY;

use super::{
    ConcurrencyGuard, EventStoreClient, JobReport, JobRunner, JobTracker, Page,
    PagedJob, ProjectionEngine, ProjectionReport, SnapshotReconstructor,
};

//------------ TouchWorkflow -------------------------------------------------

/// Re-projects every entity of a type.
///
/// Used after a projection was added or changed. Touching only writes read
/// models whose value changes, so touching twice leaves them identical.
#[derive(Clone)]
pub struct TouchWorkflow {
    events: Arc<dyn EventStoreClient>,
    guard: ConcurrencyGuard,
    projections: ProjectionEngine,
    page_size: usize,
    concurrency: usize,
}

impl TouchWorkflow {
    pub fn new(
        events: Arc<dyn EventStoreClient>,
        guard: ConcurrencyGuard,
        projections: ProjectionEngine,
        page_size: usize,
        concurrency: usize,
    ) -> Self {
        TouchWorkflow {
            events,
            guard,
            projections,
            page_size,
            concurrency,
        }
    }

    /// Touches all entities of the type, tracked as job `TouchJob/<type>`.
    pub async fn touch(&self, entity_type: &str) -> RefoldResult<JobReport> {
        let tracker = JobTracker::new(self.guard.clone(), TOUCH_JOB_ENTITY, entity_type);
        let runner = JobRunner::new(tracker, self.page_size, self.concurrency);

        let job = TouchEntities {
            entity_type,
            events: self.events.as_ref(),
            reconstructor: self.guard.reconstructor(),
            projections: &self.projections,
        };
        runner.run(&job).await
    }

    /// Reconstructs one entity and projects it.
    pub async fn touch_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> RefoldResult<ProjectionReport> {
        touch_one(
            self.guard.reconstructor(),
            &self.projections,
            entity_type,
            entity_id,
        )
        .await
    }
}

async fn touch_one(
    reconstructor: &SnapshotReconstructor,
    projections: &ProjectionEngine,
    entity_type: &str,
    entity_id: &str,
) -> RefoldResult<ProjectionReport> {
    match reconstructor.reconstruct(entity_type, entity_id, None).await? {
        Some(state) => projections.project(entity_type, &state, &[]).await,
        None => {
            trace!("Nothing to touch for '{entity_type}/{entity_id}'");
            Ok(ProjectionReport::default())
        }
    }
}

//------------ TouchEntities -------------------------------------------------

struct TouchEntities<'a> {
    entity_type: &'a str,
    events: &'a dyn EventStoreClient,
    reconstructor: &'a SnapshotReconstructor,
    projections: &'a ProjectionEngine,
}

#[async_trait]
impl PagedJob for TouchEntities<'_> {
    async fn page(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> RefoldResult<Page<String>> {
        Ok(self
            .events
            .list_entity_ids(self.entity_type, after, limit)
            .await?)
    }

    async fn process(&self, item: &str) -> RefoldResult<bool> {
        let report =
            touch_one(self.reconstructor, self.projections, self.entity_type, item)
                .await?;
        Ok(report.changed())
    }
}
