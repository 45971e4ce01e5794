//! Long running administrative jobs.
//!
//! A job walks over all items of some kind page by page. Its progress is
//! kept in a tracker entity, which is event sourced like any other entity,
//! so that an interrupted job can resume from the last completed page.
//!
//! The tracker follows `PENDING -> RUNNING -> FINISHED | FAILED`. A job that
//! finished or failed can be started again, which starts from scratch.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::commons::{DomainError, Error, RefoldResult};
use crate::constants::{
    DATA_MIGRATION_JOB_ENTITY, JOB_FAILED_EVENT, JOB_FINISHED_EVENT,
    JOB_PROGRESSED_EVENT, JOB_REQUESTED_EVENT, JOB_STARTED_EVENT,
    TOUCH_JOB_ENTITY,
};

use super::{CommandOutcome, ConcurrencyGuard, NewEvent, Page, RegistryBuilder};

//------------ JobStatus -----------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn is_done(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "PENDING"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Finished => write!(f, "FINISHED"),
            JobStatus::Failed => write!(f, "FAILED"),
        }
    }
}

//------------ JobState ------------------------------------------------------

/// The state of a job tracker.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct JobState {
    pub name: String,
    pub status: JobStatus,

    /// The key of the last item of the last completed page.
    pub cursor: Option<String>,
    pub processed: u64,
    pub changed: u64,

    /// Items that could not be processed, to be retried by a next run.
    pub failed: Vec<String>,

    /// Why the job failed, if it did.
    pub reason: Option<String>,
    pub last_updated: DateTime<Utc>,
}

//------------ Job events ----------------------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize)]
struct JobRequested {
    name: String,
    at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct JobStarted {
    at: DateTime<Utc>,
    resumed: bool,
}

/// Running totals, not increments, so that replays cannot double count.
#[derive(Clone, Debug, Deserialize, Serialize)]
struct JobProgressed {
    cursor: Option<String>,
    processed: u64,
    changed: u64,
    failed: Vec<String>,
    at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct JobFinished {
    at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct JobFailed {
    at: DateTime<Utc>,
    reason: String,
}

fn running(state: Option<JobState>, event: &str) -> Result<JobState, DomainError> {
    match state {
        Some(state) if state.status == JobStatus::Running => Ok(state),
        Some(state) => Err(DomainError::new(format!(
            "{event} for job '{}' which is {}",
            state.name, state.status
        ))),
        None => Err(DomainError::new(format!("{event} for unknown job"))),
    }
}

/// Adds the reducers of the job trackers.
pub(super) fn register(builder: RegistryBuilder) -> RegistryBuilder {
    let mut builder = builder;
    for entity_type in [TOUCH_JOB_ENTITY, DATA_MIGRATION_JOB_ENTITY] {
        builder = builder
            .reducer(
                entity_type,
                JOB_REQUESTED_EVENT,
                |event: JobRequested, state: Option<JobState>| match state {
                    Some(state) if !state.status.is_done() => {
                        Err(DomainError::new(format!(
                            "job '{}' requested while {}",
                            state.name, state.status
                        )))
                    }
                    _ => Ok(JobState {
                        name: event.name,
                        status: JobStatus::Pending,
                        cursor: None,
                        processed: 0,
                        changed: 0,
                        failed: vec![],
                        reason: None,
                        last_updated: event.at,
                    }),
                },
            )
            .reducer(
                entity_type,
                JOB_STARTED_EVENT,
                |event: JobStarted, state: Option<JobState>| {
                    let mut state = match state {
                        Some(state) if event.resumed => {
                            running(Some(state), JOB_STARTED_EVENT)?
                        }
                        Some(state) if state.status == JobStatus::Pending => state,
                        Some(state) => {
                            return Err(DomainError::new(format!(
                                "job '{}' started while {}",
                                state.name, state.status
                            )));
                        }
                        None => {
                            return Err(DomainError::new(
                                "job started without request",
                            ));
                        }
                    };
                    state.status = JobStatus::Running;
                    state.last_updated = event.at;
                    Ok(state)
                },
            )
            .reducer(
                entity_type,
                JOB_PROGRESSED_EVENT,
                |event: JobProgressed, state: Option<JobState>| {
                    let mut state = running(state, JOB_PROGRESSED_EVENT)?;
                    state.cursor = event.cursor;
                    state.processed = event.processed;
                    state.changed = event.changed;
                    state.failed = event.failed;
                    state.last_updated = event.at;
                    Ok(state)
                },
            )
            .reducer(
                entity_type,
                JOB_FINISHED_EVENT,
                |event: JobFinished, state: Option<JobState>| {
                    let mut state = running(state, JOB_FINISHED_EVENT)?;
                    state.status = JobStatus::Finished;
                    state.last_updated = event.at;
                    Ok(state)
                },
            )
            .reducer(
                entity_type,
                JOB_FAILED_EVENT,
                |event: JobFailed, state: Option<JobState>| {
                    let mut state = running(state, JOB_FAILED_EVENT)?;
                    state.status = JobStatus::Failed;
                    state.reason = Some(event.reason);
                    state.last_updated = event.at;
                    Ok(state)
                },
            );
    }
    builder
}

fn new_event<T: Serialize>(
    type_name: &str,
    payload: &T,
) -> Result<NewEvent, DomainError> {
    NewEvent::new(type_name, payload).map_err(DomainError::new)
}

//------------ JobTracker ----------------------------------------------------

/// Records the progress of one job in its tracker entity.
#[derive(Clone)]
pub struct JobTracker {
    guard: ConcurrencyGuard,
    job_entity: String,
    name: String,
}

impl JobTracker {
    pub fn new(guard: ConcurrencyGuard, job_entity: &str, name: &str) -> Self {
        JobTracker {
            guard,
            job_entity: job_entity.to_string(),
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> RefoldResult<Option<JobState>> {
        let state = self
            .guard
            .reconstructor()
            .reconstruct(&self.job_entity, &self.name, None)
            .await?;
        match state {
            Some(state) => Ok(Some(state.typed()?)),
            None => Ok(None),
        }
    }

    /// Moves the job to running.
    ///
    /// A job that is still running was interrupted, it is resumed and keeps
    /// its cursor and totals. Otherwise the job starts from scratch.
    pub async fn start(&self) -> RefoldResult<JobState> {
        let name = self.name.clone();
        let outcome = self
            .guard
            .execute(&self.job_entity, &self.name, |state| {
                let at = Utc::now();
                let status = match state {
                    Some(state) => Some(
                        state
                            .typed::<JobState>()
                            .map_err(DomainError::new)?
                            .status,
                    ),
                    None => None,
                };
                match status {
                    Some(JobStatus::Running) => Ok(vec![new_event(
                        JOB_STARTED_EVENT,
                        &JobStarted { at, resumed: true },
                    )?]),
                    Some(JobStatus::Pending) => Ok(vec![new_event(
                        JOB_STARTED_EVENT,
                        &JobStarted { at, resumed: false },
                    )?]),
                    _ => Ok(vec![
                        new_event(
                            JOB_REQUESTED_EVENT,
                            &JobRequested {
                                name: name.clone(),
                                at,
                            },
                        )?,
                        new_event(
                            JOB_STARTED_EVENT,
                            &JobStarted { at, resumed: false },
                        )?,
                    ]),
                }
            })
            .await?;
        Self::job_state(outcome)
    }

    /// Records the running totals after a completed page.
    pub async fn progress(
        &self,
        cursor: Option<String>,
        processed: u64,
        changed: u64,
        failed: Vec<String>,
    ) -> RefoldResult<JobState> {
        let outcome = self
            .guard
            .execute(&self.job_entity, &self.name, |_| {
                Ok(vec![new_event(
                    JOB_PROGRESSED_EVENT,
                    &JobProgressed {
                        cursor: cursor.clone(),
                        processed,
                        changed,
                        failed: failed.clone(),
                        at: Utc::now(),
                    },
                )?])
            })
            .await?;
        Self::job_state(outcome)
    }

    pub async fn finish(&self) -> RefoldResult<JobState> {
        let outcome = self
            .guard
            .execute(&self.job_entity, &self.name, |_| {
                Ok(vec![new_event(
                    JOB_FINISHED_EVENT,
                    &JobFinished { at: Utc::now() },
                )?])
            })
            .await?;
        Self::job_state(outcome)
    }

    pub async fn fail(&self, reason: &str) -> RefoldResult<JobState> {
        let outcome = self
            .guard
            .execute(&self.job_entity, &self.name, |_| {
                Ok(vec![new_event(
                    JOB_FAILED_EVENT,
                    &JobFailed {
                        at: Utc::now(),
                        reason: reason.to_string(),
                    },
                )?])
            })
            .await?;
        Self::job_state(outcome)
    }

    fn job_state(outcome: CommandOutcome) -> RefoldResult<JobState> {
        match outcome.state {
            Some(state) => Ok(state.typed()?),
            None => Err(Error::custom(format!(
                "job tracker '{}/{}' has no state",
                outcome.entity_type, outcome.entity_id
            ))),
        }
    }
}

//------------ PagedJob ------------------------------------------------------

/// The work of a job: a paged source of items and what to do with each.
#[async_trait]
pub trait PagedJob: Send + Sync {
    /// Returns the items following the cursor, ordered by key.
    async fn page(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> RefoldResult<Page<String>>;

    /// Processes one item, returns whether anything was changed.
    async fn process(&self, item: &str) -> RefoldResult<bool>;
}

//------------ JobReport -----------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobReport {
    pub job: String,
    pub status: JobStatus,
    pub processed: u64,
    pub changed: u64,
    pub failed: Vec<String>,
}

impl From<JobState> for JobReport {
    fn from(state: JobState) -> Self {
        JobReport {
            job: state.name,
            status: state.status,
            processed: state.processed,
            changed: state.changed,
            failed: state.failed,
        }
    }
}

impl fmt::Display for JobReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}: {}, processed {}, changed {}",
            self.job, self.status, self.processed, self.changed
        )?;
        if !self.failed.is_empty() {
            write!(f, ", failed: {}", self.failed.join(", "))?;
        }
        Ok(())
    }
}

//------------ JobRunner -----------------------------------------------------

/// Drives a [`PagedJob`] to completion, tracking progress per page.
pub struct JobRunner {
    tracker: JobTracker,
    page_size: usize,
    concurrency: usize,
}

impl JobRunner {
    pub fn new(tracker: JobTracker, page_size: usize, concurrency: usize) -> Self {
        JobRunner {
            tracker,
            page_size: page_size.max(1),
            concurrency: concurrency.max(1),
        }
    }

    /// Runs the job.
    ///
    /// Failing items are collected rather than aborting the job. The job
    /// ends as failed if there were any, listing them for a retry. Only a
    /// failure to fetch a page or to update the tracker aborts the run.
    pub async fn run(&self, job: &dyn PagedJob) -> RefoldResult<JobReport> {
        let started = self.tracker.start().await?;
        if started.cursor.is_some() {
            info!(
                "Resuming job '{}' after '{}'",
                started.name,
                started.cursor.as_deref().unwrap_or_default()
            );
        } else {
            info!("Starting job '{}'", started.name);
        }

        let mut cursor = started.cursor;
        let mut processed = started.processed;
        let mut changed = started.changed;
        let mut failed = started.failed;

        loop {
            let page = match job.page(cursor.as_deref(), self.page_size).await {
                Ok(page) => page,
                Err(e) => {
                    self.tracker.fail(&e.to_string()).await?;
                    return Err(e);
                }
            };
            if page.items.is_empty() {
                break;
            }

            let results: Vec<(&String, RefoldResult<bool>)> =
                stream::iter(page.items.iter())
                    .map(|item| async move { (item, job.process(item).await) })
                    .buffer_unordered(self.concurrency)
                    .collect()
                    .await;

            for (item, result) in results {
                processed += 1;
                match result {
                    Ok(true) => changed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Job '{}' failed on '{item}': {e}", self.tracker.name());
                        failed.push(item.clone());
                    }
                }
            }

            cursor = page.items.last().cloned();
            self.tracker
                .progress(cursor.clone(), processed, changed, failed.clone())
                .await?;

            if page.next.is_none() {
                break;
            }
        }

        let state = if failed.is_empty() {
            self.tracker.finish().await?
        } else {
            let reason = format!("{} items failed", failed.len());
            self.tracker.fail(&reason).await?
        };

        let report = JobReport::from(state);
        info!("Job {report}");
        Ok(report)
    }
}
