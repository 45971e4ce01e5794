//! Schema versions and migrations of concepts.
//!
//! Every entity type, event type and read model type is a concept with a
//! current schema version. Stored payloads carry the version they were
//! written with. Payloads written with an older version are upgraded one
//! version at a time, so a concept at version `n` needs a migration to each
//! of the versions `2..=n`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use log::trace;
use serde_json::Value;

use crate::commons::{DomainError, Error, RefoldEmptyResult, RefoldResult};

pub type MigrateFn =
    Arc<dyn Fn(Value) -> Result<Value, DomainError> + Send + Sync>;

//------------ ConceptKind ---------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConceptKind {
    Entity,
    Event,
    ReadModel,
}

impl fmt::Display for ConceptKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConceptKind::Entity => write!(f, "entity"),
            ConceptKind::Event => write!(f, "event"),
            ConceptKind::ReadModel => write!(f, "read model"),
        }
    }
}

//------------ MigrationMetadata ---------------------------------------------

/// Upgrades a payload from `to_version - 1` to `to_version`.
#[derive(Clone)]
pub struct MigrationMetadata {
    pub to_version: u32,
    migrate: MigrateFn,
}

impl MigrationMetadata {
    pub fn new(to_version: u32, migrate: MigrateFn) -> Self {
        MigrationMetadata {
            to_version,
            migrate,
        }
    }
}

impl fmt::Debug for MigrationMetadata {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MigrationMetadata")
            .field("to_version", &self.to_version)
            .finish()
    }
}

//------------ Concept -------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Concept {
    pub name: String,
    pub kind: ConceptKind,
    pub current_version: u32,
    migrations: BTreeMap<u32, MigrationMetadata>,
}

impl Concept {
    pub fn new(name: &str, kind: ConceptKind, current_version: u32) -> Self {
        Concept {
            name: name.to_string(),
            kind,
            current_version,
            migrations: BTreeMap::new(),
        }
    }

    /// Adds a migration.
    ///
    /// Each target version can be registered once, otherwise it would be
    /// ambiguous which one applies.
    pub fn add_migration(
        &mut self,
        migration: MigrationMetadata,
    ) -> RefoldEmptyResult {
        let to_version = migration.to_version;
        if to_version < 2 {
            return Err(Error::InvalidRegistration(format!(
                "migration for '{}' targets version {}, the first version \
                 that can be migrated to is 2",
                self.name, to_version
            )));
        }
        if self.migrations.contains_key(&to_version) {
            return Err(Error::AmbiguousRegistration(format!(
                "two migrations for '{}' to version {}",
                self.name, to_version
            )));
        }
        self.migrations.insert(to_version, migration);
        Ok(())
    }

    pub fn migrations(&self) -> impl Iterator<Item = &MigrationMetadata> {
        self.migrations.values()
    }

    /// Checks that a migration exists for every version after the first.
    ///
    /// Versions are scanned in ascending order and the first gap is
    /// reported. Migrations beyond the current version are refused too,
    /// they would turn a stored payload into something the code does not
    /// understand yet.
    pub fn validate(&self) -> RefoldEmptyResult {
        for version in 2..=self.current_version {
            if !self.migrations.contains_key(&version) {
                return Err(Error::InvalidVersion {
                    concept: self.name.clone(),
                    missing: version,
                });
            }
        }
        if let Some(highest) = self.migrations.keys().next_back() {
            if *highest > self.current_version {
                return Err(Error::InvalidRegistration(format!(
                    "migration for '{}' to version {} is beyond its current \
                     version {}",
                    self.name, highest, self.current_version
                )));
            }
        }
        Ok(())
    }

    /// Upgrades a payload written with `from_version` to the current one.
    ///
    /// Applies each step in order, the output of one being the input of the
    /// next. A missing step aborts rather than skipping it.
    pub fn migrate(&self, from_version: u32, value: Value) -> RefoldResult<Value> {
        if from_version > self.current_version {
            return Err(Error::FutureSchemaVersion {
                concept: self.name.clone(),
                found: from_version,
                current: self.current_version,
            });
        }

        let mut value = value;
        for to_version in (from_version + 1)..=self.current_version {
            let migration = self.migrations.get(&to_version).ok_or_else(|| {
                Error::MissingMigration {
                    concept: self.name.clone(),
                    to_version,
                }
            })?;
            trace!("Migrating '{}' to version {}", self.name, to_version);
            value = (migration.migrate)(value).map_err(|cause| {
                Error::MigrationFailed {
                    concept: self.name.clone(),
                    to_version,
                    cause,
                }
            })?;
        }
        Ok(value)
    }
}

//------------ validate ------------------------------------------------------

/// Validates the contiguity of all concepts, in name order.
pub fn validate<'a>(
    concepts: impl IntoIterator<Item = &'a Concept>,
) -> RefoldEmptyResult {
    for concept in concepts {
        concept.validate()?;
    }
    Ok(())
}

//------------ Tests ---------------------------------------------------------
