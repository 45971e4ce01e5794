//! Defines all refold errors

use std::fmt;

use serde_json::Value;

use crate::config::ConfigError;
use crate::eventsourcing::{EventEnvelope, StoreError};

//------------ DomainError ---------------------------------------------------

/// An error raised by user supplied domain code.
///
/// Command handlers, reducers, projections, join keys and migrations all
/// report failure with this type. The framework wraps it with the context
/// in which it happened before handing it to the caller.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DomainError(String);

impl DomainError {
    pub fn new(msg: impl fmt::Display) -> Self {
        DomainError(msg.to_string())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for DomainError {}

//------------ ReducerFailure ------------------------------------------------

/// A reducer failed for a specific event.
///
/// Carries the offending event and the entity state it was folded into.
#[derive(Clone, Debug)]
pub struct ReducerFailure {
    pub event: EventEnvelope,
    pub state: Option<Value>,
    pub cause: DomainError,
}

//------------ ProjectionFailure ---------------------------------------------

/// A projection or join key function failed for an entity.
#[derive(Clone, Debug)]
pub struct ProjectionFailure {
    pub entity_type: String,
    pub entity_id: String,
    pub read_model: String,
    pub read_model_id: Option<String>,
    pub entity: Value,
    pub cause: DomainError,
}

//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    //-----------------------------------------------------------------
    // Configuration issues, fatal at startup
    //-----------------------------------------------------------------
    InvalidVersion { concept: String, missing: u32 },
    AmbiguousRegistration(String),
    InvalidRegistration(String),
    UnknownEntityType(String),
    UnknownConcept(String),
    Config(ConfigError),

    //-----------------------------------------------------------------
    // Conflicts, retried locally before they surface
    //-----------------------------------------------------------------
    OptimisticConcurrencyUnexpectedVersion {
        entity_type: String,
        entity_id: String,
        attempts: usize,
    },
    ReadModelConflict {
        read_model: String,
        id: String,
        attempts: usize,
    },

    //-----------------------------------------------------------------
    // Domain code failures
    //-----------------------------------------------------------------
    CommandRejected {
        entity_type: String,
        entity_id: String,
        cause: DomainError,
    },
    ReducerFailed(Box<ReducerFailure>),
    ProjectionFailed(Box<ProjectionFailure>),
    MigrationFailed {
        concept: String,
        to_version: u32,
        cause: DomainError,
    },

    /// The events were appended, but projecting them failed.
    ProjectionAfterAppend {
        entity_type: String,
        entity_id: String,
        version: u64,
        cause: Box<Error>,
    },

    //-----------------------------------------------------------------
    // Stored data does not match the registered code
    //-----------------------------------------------------------------
    MissingMigration { concept: String, to_version: u32 },
    FutureSchemaVersion { concept: String, found: u32, current: u32 },
    InvalidReducer { entity_type: String, event_type: String },
    EventSequenceGap {
        entity_type: String,
        entity_id: String,
        expected: u64,
        found: u64,
    },

    //-----------------------------------------------------------------
    // System issues
    //-----------------------------------------------------------------
    Json(serde_json::Error),
    Store(StoreError),
    Custom(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidVersion { concept, missing } => write!(
                f,
                "Missing migration for concept '{concept}' to version {missing}"
            ),
            Error::AmbiguousRegistration(msg) => {
                write!(f, "Ambiguous registration: {msg}")
            }
            Error::InvalidRegistration(msg) => {
                write!(f, "Invalid registration: {msg}")
            }
            Error::UnknownEntityType(name) => {
                write!(f, "No reducers registered for entity type '{name}'")
            }
            Error::UnknownConcept(name) => {
                write!(f, "Unknown concept '{name}'")
            }
            Error::Config(e) => e.fmt(f),
            Error::OptimisticConcurrencyUnexpectedVersion {
                entity_type,
                entity_id,
                attempts,
            } => write!(
                f,
                "Concurrent modification of '{entity_type}/{entity_id}', \
                 gave up after {attempts} attempts"
            ),
            Error::ReadModelConflict {
                read_model,
                id,
                attempts,
            } => write!(
                f,
                "Concurrent modification of read model '{read_model}/{id}', \
                 gave up after {attempts} attempts"
            ),
            Error::CommandRejected {
                entity_type,
                entity_id,
                cause,
            } => write!(
                f,
                "Command for '{entity_type}/{entity_id}' rejected: {cause}"
            ),
            Error::ReducerFailed(failure) => write!(
                f,
                "Reducer failed for event '{}': {}",
                failure.event, failure.cause
            ),
            Error::ProjectionFailed(failure) => match &failure.read_model_id {
                Some(id) => write!(
                    f,
                    "Projection of '{}/{}' into '{}/{}' failed: {}",
                    failure.entity_type,
                    failure.entity_id,
                    failure.read_model,
                    id,
                    failure.cause
                ),
                None => write!(
                    f,
                    "Join key of '{}/{}' for '{}' failed: {}",
                    failure.entity_type,
                    failure.entity_id,
                    failure.read_model,
                    failure.cause
                ),
            },
            Error::MigrationFailed {
                concept,
                to_version,
                cause,
            } => write!(
                f,
                "Migration of concept '{concept}' to version {to_version} \
                 failed: {cause}"
            ),
            Error::ProjectionAfterAppend {
                entity_type,
                entity_id,
                version,
                cause,
            } => write!(
                f,
                "Events for '{entity_type}/{entity_id}' were stored up to \
                 version {version}, but projecting them failed: {cause}"
            ),
            Error::MissingMigration {
                concept,
                to_version,
            } => write!(
                f,
                "No migration registered for concept '{concept}' to version \
                 {to_version}"
            ),
            Error::FutureSchemaVersion {
                concept,
                found,
                current,
            } => write!(
                f,
                "Stored '{concept}' has schema version {found}, newer than \
                 the current version {current}"
            ),
            Error::InvalidReducer {
                entity_type,
                event_type,
            } => write!(
                f,
                "No reducer for event '{event_type}' of entity type \
                 '{entity_type}'"
            ),
            Error::EventSequenceGap {
                entity_type,
                entity_id,
                expected,
                found,
            } => write!(
                f,
                "Event stream '{entity_type}/{entity_id}' expected version \
                 {expected}, found {found}"
            ),
            Error::Json(e) => write!(f, "Invalid JSON: {e}"),
            Error::Store(e) => e.fmt(f),
            Error::Custom(s) => s.fmt(f),
        }
    }
}

impl Error {
    pub fn custom(msg: impl fmt::Display) -> Self {
        Error::Custom(msg.to_string())
    }

    /// Returns whether this is a (retry exhausted) version conflict.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::OptimisticConcurrencyUnexpectedVersion { .. }
            | Error::ReadModelConflict { .. } => true,
            Error::ProjectionAfterAppend { cause, .. } => cause.is_conflict(),
            _ => false,
        }
    }

    /// Returns whether this error is caused by invalid registration.
    ///
    /// These errors are never retried, they need a code or config fix.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::InvalidVersion { .. }
                | Error::AmbiguousRegistration(_)
                | Error::InvalidRegistration(_)
                | Error::UnknownEntityType(_)
                | Error::UnknownConcept(_)
                | Error::Config(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Error::Store(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl std::error::Error for Error {}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_errors() {
        let conflict = Error::OptimisticConcurrencyUnexpectedVersion {
            entity_type: "Cart".into(),
            entity_id: "1".into(),
            attempts: 5,
        };
        assert!(conflict.is_conflict());
        assert!(!conflict.is_configuration());

        let after_append = Error::ProjectionAfterAppend {
            entity_type: "Cart".into(),
            entity_id: "1".into(),
            version: 3,
            cause: Box::new(Error::ReadModelConflict {
                read_model: "CartView".into(),
                id: "1".into(),
                attempts: 5,
            }),
        };
        assert!(after_append.is_conflict());

        let gap = Error::InvalidVersion {
            concept: "Cart".into(),
            missing: 4,
        };
        assert!(gap.is_configuration());
        assert_eq!(
            gap.to_string(),
            "Missing migration for concept 'Cart' to version 4"
        );
    }
}
