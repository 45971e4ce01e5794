//! Event sourcing support for refold.
//!
//! Entities are never stored as such. Their state is rebuilt by folding
//! their events through registered reducers, after upgrading each event
//! payload to the current schema version. Read models are derived from
//! entity state by projections and written under their own version token.

mod envelope;
pub use self::envelope::{
    EntityState, EventEnvelope, Kind, NewEvent, Page, SnapshotEnvelope,
};

mod store;
pub use self::store::{
    AppendOutcome, DeleteOutcome, EventStoreClient, PutOutcome,
    ReadModelEntry, ReadModelRecord, ReadModelStore, ReadModelWrite,
    SourceVersions, StoreError, source_key,
};

mod migration;
pub use self::migration::{Concept, ConceptKind, MigrationMetadata};

mod registry;
pub use self::registry::{
    ProjectionAction, ProjectionMetadata, ReadModelAction, ReducerMetadata,
    Registry, RegistryBuilder,
};

mod reconstruct;
pub use self::reconstruct::SnapshotReconstructor;

mod guard;
pub use self::guard::{AppendResult, CommandOutcome, ConcurrencyGuard};

mod projection;
pub use self::projection::{ProjectionEngine, ProjectionOutcome, ProjectionReport};

mod jobs;
pub use self::jobs::{
    JobReport, JobRunner, JobState, JobStatus, JobTracker, PagedJob,
};

mod touch;
pub use self::touch::TouchWorkflow;

mod search;
pub use self::search::{Filter, Order, Searcher};
