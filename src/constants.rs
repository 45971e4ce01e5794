//! Various refold-wide constants.


//------------ Binary Names -------------------------------------------------

/// The friendly name of the admin command line tool.
pub const REFOLD_ADMIN_APP: &str = "refold";


//------------ Config Files Paths -------------------------------------------

/// The default path to the config file.
pub const REFOLD_DEFAULT_CONFIG_FILE: &str = "/etc/refold.conf";


//------------ Environment Variables ----------------------------------------

/// The environment variable with the log level.
///
/// The variable should contain the name of a [`log::LevelFilter`]. It will
/// be overwritten by the config file. The default is “info.”
pub const REFOLD_ENV_LOG_LEVEL: &str = "REFOLD_LOG_LEVEL";


//------------ Defaults -----------------------------------------------------

/// How many times a command is tried before giving up on version conflicts.
pub const DEFAULT_COMMAND_RETRIES: usize = 5;

/// How many times a read model write is tried before giving up on version
/// conflicts.
pub const DEFAULT_PROJECTION_RETRIES: usize = 5;

/// Store a fresh snapshot once this many events were folded beyond the
/// previous one.
pub const DEFAULT_SNAPSHOT_FREQUENCY: u64 = 5;

/// The number of entities or records fetched per page by background jobs.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// The number of entities or records a background job works on at once.
pub const DEFAULT_JOB_CONCURRENCY: usize = 8;


//------------ Job Trackers -------------------------------------------------

/// Entity type of the trackers for touch jobs, keyed by entity type.
pub const TOUCH_JOB_ENTITY: &str = "TouchJob";

/// Entity type of the trackers for data migrations, keyed by concept.
pub const DATA_MIGRATION_JOB_ENTITY: &str = "DataMigrationJob";

pub const JOB_REQUESTED_EVENT: &str = "JobRequested";
pub const JOB_STARTED_EVENT: &str = "JobStarted";
pub const JOB_PROGRESSED_EVENT: &str = "JobProgressed";
pub const JOB_FINISHED_EVENT: &str = "JobFinished";
pub const JOB_FAILED_EVENT: &str = "JobFailed";


//------------ Storage ------------------------------------------------------

/// Directory under a `local://` storage root holding event streams.
pub const EVENTS_DIR: &str = "events";

/// Directory under a `local://` storage root holding read models.
pub const READ_MODELS_DIR: &str = "read_models";

/// Directory under a `local://` storage root for temporary files.
pub const TMP_DIR: &str = ".tmp";

pub const LOCK_FILE_NAME: &str = "lockfile.lock";
pub const SNAPSHOT_FILE_NAME: &str = "snapshot.json";
pub const EVENT_FILE_PREFIX: &str = "delta-";
