//! Configuration of a refold engine and its logging.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, fmt, fs, io};

use log::{LevelFilter, error};
use serde::de;
use serde::{Deserialize, Deserializer};
use url::Url;

use crate::commons::ext_serde;
use crate::constants::*;

//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn log_level() -> LevelFilter {
        match env::var(REFOLD_ENV_LOG_LEVEL) {
            Ok(level) => match LevelFilter::from_str(&level) {
                Ok(level) => level,
                Err(_) => {
                    eprintln!(
                        "Unrecognized value for log level in env var {REFOLD_ENV_LOG_LEVEL}, using info"
                    );
                    LevelFilter::Info
                }
            },
            _ => LevelFilter::Info,
        }
    }

    fn log_type() -> LogType {
        LogType::Stderr
    }

    fn log_file() -> PathBuf {
        PathBuf::from("./refold.log")
    }

    fn command_retries() -> usize {
        DEFAULT_COMMAND_RETRIES
    }

    fn projection_retries() -> usize {
        DEFAULT_PROJECTION_RETRIES
    }

    fn snapshot_frequency() -> u64 {
        DEFAULT_SNAPSHOT_FREQUENCY
    }

    fn page_size() -> usize {
        DEFAULT_PAGE_SIZE
    }

    fn job_concurrency() -> usize {
        DEFAULT_JOB_CONCURRENCY
    }

    fn retry_jitter_ms() -> u64 {
        0
    }
}

//------------ Config --------------------------------------------------------

/// Global configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Where events and read models live, `memory:` or `local:///path`.
    pub storage_uri: Url,

    #[serde(
        default = "ConfigDefaults::log_level",
        deserialize_with = "ext_serde::de_level_filter"
    )]
    pub log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    pub log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    pub log_file: PathBuf,

    /// How often a command handler runs before a version conflict is
    /// given up on.
    #[serde(default = "ConfigDefaults::command_retries")]
    pub command_retries: usize,

    /// How often a read model write is tried before a version conflict is
    /// given up on.
    #[serde(default = "ConfigDefaults::projection_retries")]
    pub projection_retries: usize,

    /// Store a snapshot after folding this many events, 0 disables them.
    #[serde(default = "ConfigDefaults::snapshot_frequency")]
    pub snapshot_frequency: u64,

    #[serde(default = "ConfigDefaults::page_size")]
    pub page_size: usize,

    #[serde(default = "ConfigDefaults::job_concurrency")]
    pub job_concurrency: usize,

    /// Upper bound of the random pause between conflicting attempts.
    #[serde(default = "ConfigDefaults::retry_jitter_ms")]
    pub retry_jitter_ms: u64,
}

/// # Construction
impl Config {
    /// Creates a config with all defaults for the given storage.
    pub fn test(storage_uri: Url) -> Self {
        Config {
            storage_uri,
            log_level: LevelFilter::Debug,
            log_type: LogType::Stderr,
            log_file: ConfigDefaults::log_file(),
            command_retries: ConfigDefaults::command_retries(),
            projection_retries: ConfigDefaults::projection_retries(),
            snapshot_frequency: ConfigDefaults::snapshot_frequency(),
            page_size: ConfigDefaults::page_size(),
            job_concurrency: ConfigDefaults::job_concurrency(),
            retry_jitter_ms: ConfigDefaults::retry_jitter_ms(),
        }
    }

    pub fn read_config(file: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(file).map_err(|e| {
            ConfigError::Other(format!(
                "Cannot read config file '{}': {}",
                file.display(),
                e
            ))
        })?;
        let config = Self::parse_str(&content)?;
        config.verify()?;
        Ok(config)
    }

    pub fn parse_str(s: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(s)?;
        Ok(config)
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        match self.storage_uri.scheme() {
            "memory" | "local" | "file" => {}
            other => {
                return Err(ConfigError::Other(format!(
                    "Unsupported storage_uri scheme '{other}', use 'memory' or 'local'"
                )));
            }
        }

        if self.command_retries == 0 {
            return Err(ConfigError::other("command_retries must be at least 1"));
        }

        if self.projection_retries == 0 {
            return Err(ConfigError::other("projection_retries must be at least 1"));
        }

        if self.page_size == 0 {
            return Err(ConfigError::other("page_size must be at least 1"));
        }

        if self.job_concurrency == 0 {
            return Err(ConfigError::other("job_concurrency must be at least 1"));
        }

        Ok(())
    }
}

/// # Logging
impl Config {
    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::File => self.file_logger(&self.log_file),
            LogType::Stderr => self.stderr_logger(),
        }
    }

    /// Creates a stderr logger.
    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.fern_logger()
            .chain(io::stderr())
            .apply()
            .map_err(|e| {
                ConfigError::Other(format!("Failed to init stderr logging: {e}"))
            })
    }

    /// Creates a file logger using the file provided by `path`.
    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        let file = match fern::log_file(path) {
            Ok(file) => file,
            Err(err) => {
                let error_string = format!(
                    "Failed to open log file '{}': {}",
                    path.display(),
                    err
                );
                error!("{}", error_string.as_str());
                return Err(ConfigError::Other(error_string));
            }
        };
        self.fern_logger()
            .chain(file)
            .apply()
            .map_err(|e| {
                ConfigError::Other(format!("Failed to init file logging: {e}"))
            })
    }

    /// Creates and returns a fern logger with log level tweaks.
    fn fern_logger(&self) -> fern::Dispatch {
        // the per event and per read model logging is very chatty
        let framework_level = self.log_level.min(LevelFilter::Debug);

        let show_target = self.log_level == LevelFilter::Trace
            || self.log_level == LevelFilter::Debug;
        fern::Dispatch::new()
            .format(move |out, message, record| {
                if show_target {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                } else {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        message
                    ))
                }
            })
            .level(self.log_level)
            .level_for("refold::eventsourcing", framework_level)
            .level_for("refold::storage", framework_level)
    }
}

//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => e.fmt(f),
            ConfigError::TomlError(e) => e.fmt(f),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}

impl std::error::Error for ConfigError {}

//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D>(d: D) -> Result<LogType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        match string.as_str() {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            _ => Err(de::Error::custom(format!(
                "expected \"stderr\" or \"file\", found : \"{string}\""
            ))),
        }
    }
}

//------------ Tests ---------------------------------------------------------
