//! Registration of reducers, projections and migrations.
//!
//! All domain behaviour is registered explicitly with a [`RegistryBuilder`].
//! Building the registry validates it, so a [`Registry`] that exists is one
//! that can be used to serve traffic.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use log::{debug, info};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::commons::{DomainError, Error, RefoldEmptyResult, RefoldResult};

use super::jobs;
use super::migration::{self, Concept, ConceptKind, MigrationMetadata};

pub type ReduceFn = Arc<
    dyn Fn(Value, Option<Value>) -> Result<Value, DomainError> + Send + Sync,
>;

pub type JoinKeyFn =
    Arc<dyn Fn(&Value) -> Result<Vec<String>, DomainError> + Send + Sync>;

pub type ProjectFn = Arc<
    dyn Fn(&Value, Option<Value>) -> Result<ProjectionAction, DomainError>
        + Send
        + Sync,
>;

fn to_domain<T: DeserializeOwned>(
    what: &str,
    value: Value,
) -> Result<T, DomainError> {
    serde_json::from_value(value)
        .map_err(|e| DomainError::new(format!("cannot parse {what}: {e}")))
}

fn from_domain<T: Serialize>(what: &str, value: &T) -> Result<Value, DomainError> {
    serde_json::to_value(value)
        .map_err(|e| DomainError::new(format!("cannot serialize {what}: {e}")))
}

//------------ ProjectionAction ----------------------------------------------

/// What a projection wants done with one read model.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProjectionAction {
    Upsert(Value),
    Delete,
    Nothing,
}

//------------ ReadModelAction -----------------------------------------------

/// The typed counterpart of [`ProjectionAction`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReadModelAction<R> {
    Upsert(R),
    Delete,
    Nothing,
}

//------------ ReducerMetadata -----------------------------------------------

/// Folds one event type into the state of one entity type.
#[derive(Clone)]
pub struct ReducerMetadata {
    pub entity_type: String,
    pub event_type: String,
    reduce: ReduceFn,
}

impl ReducerMetadata {
    pub fn reduce(
        &self,
        event: Value,
        state: Option<Value>,
    ) -> Result<Value, DomainError> {
        (self.reduce)(event, state)
    }
}

impl fmt::Debug for ReducerMetadata {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ReducerMetadata")
            .field("entity_type", &self.entity_type)
            .field("event_type", &self.event_type)
            .finish()
    }
}

//------------ ProjectionMetadata --------------------------------------------

/// Derives read models of one type from the state of one entity type.
#[derive(Clone)]
pub struct ProjectionMetadata {
    pub entity_type: String,
    pub read_model: String,
    join_key: JoinKeyFn,
    project: ProjectFn,
}

impl ProjectionMetadata {
    /// Returns the ids of the read models affected by the entity.
    pub fn join_key(&self, entity: &Value) -> Result<Vec<String>, DomainError> {
        (self.join_key)(entity)
    }

    pub fn project(
        &self,
        entity: &Value,
        prior: Option<Value>,
    ) -> Result<ProjectionAction, DomainError> {
        (self.project)(entity, prior)
    }
}

impl fmt::Debug for ProjectionMetadata {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ProjectionMetadata")
            .field("entity_type", &self.entity_type)
            .field("read_model", &self.read_model)
            .finish()
    }
}

//------------ RegistryBuilder -----------------------------------------------

/// Collects registrations. Nothing is checked until [`Self::build`].
#[derive(Default)]
pub struct RegistryBuilder {
    reducers: Vec<ReducerMetadata>,
    projections: Vec<ProjectionMetadata>,
    versions: Vec<(String, u32)>,
    migrations: Vec<(String, MigrationMetadata)>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the current schema version of a concept. Defaults to 1.
    pub fn version(mut self, concept: &str, version: u32) -> Self {
        self.versions.push((concept.to_string(), version));
        self
    }

    /// Registers a migration of a concept to `to_version`.
    pub fn migration<F>(mut self, concept: &str, to_version: u32, migrate: F) -> Self
    where
        F: Fn(Value) -> Result<Value, DomainError> + Send + Sync + 'static,
    {
        self.migrations.push((
            concept.to_string(),
            MigrationMetadata::new(to_version, Arc::new(migrate)),
        ));
        self
    }

    /// Registers a migration between two typed payload versions.
    pub fn migration_typed<A, B, F>(
        self,
        concept: &str,
        to_version: u32,
        migrate: F,
    ) -> Self
    where
        A: DeserializeOwned,
        B: Serialize,
        F: Fn(A) -> Result<B, DomainError> + Send + Sync + 'static,
    {
        let what = format!("{concept} before version {to_version}");
        self.migration(concept, to_version, move |value| {
            let old: A = to_domain(&what, value)?;
            from_domain(&what, &migrate(old)?)
        })
    }

    /// Registers a reducer working on JSON values.
    pub fn reducer_raw<F>(
        mut self,
        entity_type: &str,
        event_type: &str,
        reduce: F,
    ) -> Self
    where
        F: Fn(Value, Option<Value>) -> Result<Value, DomainError>
            + Send
            + Sync
            + 'static,
    {
        self.reducers.push(ReducerMetadata {
            entity_type: entity_type.to_string(),
            event_type: event_type.to_string(),
            reduce: Arc::new(reduce),
        });
        self
    }

    /// Registers a typed reducer.
    ///
    /// The event and state are converted with serde, a payload that does
    /// not match the type is reported as a reducer failure.
    pub fn reducer<E, S, F>(
        self,
        entity_type: &str,
        event_type: &str,
        reduce: F,
    ) -> Self
    where
        E: DeserializeOwned,
        S: Serialize + DeserializeOwned,
        F: Fn(E, Option<S>) -> Result<S, DomainError> + Send + Sync + 'static,
    {
        let event_what = format!("event '{event_type}'");
        let state_what = format!("state of '{entity_type}'");
        self.reducer_raw(entity_type, event_type, move |event, state| {
            let event: E = to_domain(&event_what, event)?;
            let state: Option<S> = match state {
                Some(state) => Some(to_domain(&state_what, state)?),
                None => None,
            };
            from_domain(&state_what, &reduce(event, state)?)
        })
    }

    /// Registers a projection working on JSON values.
    pub fn projection_raw<J, P>(
        mut self,
        entity_type: &str,
        read_model: &str,
        join_key: J,
        project: P,
    ) -> Self
    where
        J: Fn(&Value) -> Result<Vec<String>, DomainError> + Send + Sync + 'static,
        P: Fn(&Value, Option<Value>) -> Result<ProjectionAction, DomainError>
            + Send
            + Sync
            + 'static,
    {
        self.projections.push(ProjectionMetadata {
            entity_type: entity_type.to_string(),
            read_model: read_model.to_string(),
            join_key: Arc::new(join_key),
            project: Arc::new(project),
        });
        self
    }

    /// Registers a typed projection.
    pub fn projection<S, R, J, P>(
        self,
        entity_type: &str,
        read_model: &str,
        join_key: J,
        project: P,
    ) -> Self
    where
        S: DeserializeOwned,
        R: Serialize + DeserializeOwned,
        J: Fn(&S) -> Vec<String> + Send + Sync + 'static,
        P: Fn(&S, Option<R>) -> Result<ReadModelAction<R>, DomainError>
            + Send
            + Sync
            + 'static,
    {
        let entity_what = format!("state of '{entity_type}'");
        let join_what = entity_what.clone();
        let model_what = format!("read model '{read_model}'");

        self.projection_raw(
            entity_type,
            read_model,
            move |entity| {
                let entity: S = to_domain(&join_what, entity.clone())?;
                Ok(join_key(&entity))
            },
            move |entity, prior| {
                let entity: S = to_domain(&entity_what, entity.clone())?;
                let prior: Option<R> = match prior {
                    Some(prior) => Some(to_domain(&model_what, prior)?),
                    None => None,
                };
                match project(&entity, prior)? {
                    ReadModelAction::Upsert(model) => Ok(ProjectionAction::Upsert(
                        from_domain(&model_what, &model)?,
                    )),
                    ReadModelAction::Delete => Ok(ProjectionAction::Delete),
                    ReadModelAction::Nothing => Ok(ProjectionAction::Nothing),
                }
            },
        )
    }

    /// Builds and validates the registry.
    ///
    /// The reducers of the background job trackers are added here, they
    /// share the event log with the domain entities.
    pub fn build(self) -> RefoldResult<Registry> {
        let RegistryBuilder {
            reducers,
            projections,
            versions,
            migrations,
        } = jobs::register(self);

        let mut registry = Registry {
            concepts: BTreeMap::new(),
            reducers: BTreeMap::new(),
            projections: BTreeMap::new(),
        };

        for reducer in reducers {
            registry.add_concept(&reducer.entity_type, ConceptKind::Entity)?;
            registry.add_concept(&reducer.event_type, ConceptKind::Event)?;

            let for_entity = registry
                .reducers
                .entry(reducer.entity_type.clone())
                .or_default();
            if for_entity.contains_key(&reducer.event_type) {
                return Err(Error::AmbiguousRegistration(format!(
                    "two reducers for event '{}' of entity type '{}'",
                    reducer.event_type, reducer.entity_type
                )));
            }
            for_entity.insert(reducer.event_type.clone(), reducer);
        }

        for projection in projections {
            if !registry.reducers.contains_key(&projection.entity_type) {
                return Err(Error::InvalidRegistration(format!(
                    "projection into '{}' from entity type '{}' which has \
                     no reducers",
                    projection.read_model, projection.entity_type
                )));
            }
            registry.add_concept(&projection.read_model, ConceptKind::ReadModel)?;

            let for_entity = registry
                .projections
                .entry(projection.entity_type.clone())
                .or_default();
            if for_entity
                .iter()
                .any(|existing| existing.read_model == projection.read_model)
            {
                return Err(Error::AmbiguousRegistration(format!(
                    "two projections from entity type '{}' into '{}'",
                    projection.entity_type, projection.read_model
                )));
            }
            for_entity.push(projection);
        }

        let mut versioned = BTreeSet::new();
        for (name, version) in versions {
            if !versioned.insert(name.clone()) {
                return Err(Error::AmbiguousRegistration(format!(
                    "version of '{name}' set twice"
                )));
            }
            if version == 0 {
                return Err(Error::InvalidRegistration(format!(
                    "version of '{name}' must be at least 1"
                )));
            }
            registry.concept_mut(&name)?.current_version = version;
        }

        for (name, migration) in migrations {
            registry.concept_mut(&name)?.add_migration(migration)?;
        }

        migration::validate(registry.concepts.values())?;

        info!(
            "Registered {} entity types, {} concepts and {} projections",
            registry.reducers.len(),
            registry.concepts.len(),
            registry.projections.values().map(Vec::len).sum::<usize>()
        );

        Ok(registry)
    }
}

//------------ Registry ------------------------------------------------------

/// The validated set of concepts, reducers and projections.
#[derive(Debug)]
pub struct Registry {
    concepts: BTreeMap<String, Concept>,
    reducers: BTreeMap<String, BTreeMap<String, ReducerMetadata>>,
    projections: BTreeMap<String, Vec<ProjectionMetadata>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    fn add_concept(&mut self, name: &str, kind: ConceptKind) -> RefoldEmptyResult {
        match self.concepts.get(name) {
            Some(existing) if existing.kind != kind => {
                Err(Error::InvalidRegistration(format!(
                    "'{}' is registered both as {} and as {}",
                    name, existing.kind, kind
                )))
            }
            Some(_) => Ok(()),
            None => {
                debug!("Registered {kind} concept '{name}'");
                self.concepts
                    .insert(name.to_string(), Concept::new(name, kind, 1));
                Ok(())
            }
        }
    }

    fn concept_mut(&mut self, name: &str) -> RefoldResult<&mut Concept> {
        self.concepts
            .get_mut(name)
            .ok_or_else(|| Error::UnknownConcept(name.to_string()))
    }

    pub fn concept(&self, name: &str) -> RefoldResult<&Concept> {
        self.concepts
            .get(name)
            .ok_or_else(|| Error::UnknownConcept(name.to_string()))
    }

    /// Returns all concepts ordered by name.
    pub fn concepts(&self) -> impl Iterator<Item = &Concept> {
        self.concepts.values()
    }

    pub fn current_version(&self, name: &str) -> RefoldResult<u32> {
        self.concept(name).map(|concept| concept.current_version)
    }

    pub fn has_entity(&self, entity_type: &str) -> bool {
        self.reducers.contains_key(entity_type)
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.reducers.keys().map(String::as_str)
    }

    pub fn reducer(
        &self,
        entity_type: &str,
        event_type: &str,
    ) -> RefoldResult<&ReducerMetadata> {
        let for_entity = self
            .reducers
            .get(entity_type)
            .ok_or_else(|| Error::UnknownEntityType(entity_type.to_string()))?;

        for_entity
            .get(event_type)
            .ok_or_else(|| Error::InvalidReducer {
                entity_type: entity_type.to_string(),
                event_type: event_type.to_string(),
            })
    }

    pub fn projections_for(&self, entity_type: &str) -> &[ProjectionMetadata] {
        self.projections
            .get(entity_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Upgrades a payload of a concept to its current version.
    pub fn migrate(
        &self,
        concept: &str,
        from_version: u32,
        value: Value,
    ) -> RefoldResult<Value> {
        self.concept(concept)?.migrate(from_version, value)
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Deserialize, Serialize)]
    struct Counted {
        count: u64,
    }

    #[derive(Deserialize)]
    struct Incremented {
        by: u64,
    }

    fn counter() -> RegistryBuilder {
        RegistryBuilder::new().reducer(
            "Counter",
            "Incremented",
            |event: Incremented, state: Option<Counted>| {
                let count = state.map(|s| s.count).unwrap_or(0);
                Ok(Counted {
                    count: count + event.by,
                })
            },
        )
    }

    #[test]
    fn typed_reducer_converts_with_serde() {
        let registry = counter().build().unwrap();
        let reducer = registry.reducer("Counter", "Incremented").unwrap();

        let state = reducer.reduce(json!({ "by": 2 }), None).unwrap();
        let state = reducer.reduce(json!({ "by": 3 }), Some(state)).unwrap();
        assert_eq!(state, json!({ "count": 5 }));

        assert!(reducer.reduce(json!({ "nope": 1 }), None).is_err());
    }

    #[test]
    fn lookup_errors() {
        let registry = counter().build().unwrap();
        assert!(matches!(
            registry.reducer("Nothing", "Incremented"),
            Err(Error::UnknownEntityType(_))
        ));
        assert!(matches!(
            registry.reducer("Counter", "Decremented"),
            Err(Error::InvalidReducer { .. })
        ));
        assert!(registry.has_entity("Counter"));
        assert!(registry.projections_for("Counter").is_empty());
    }

    #[test]
    fn refuse_duplicate_reducer() {
        let result = counter()
            .reducer_raw("Counter", "Incremented", |event, _| Ok(event))
            .build();
        assert!(matches!(result, Err(Error::AmbiguousRegistration(_))));
    }

    #[test]
    fn refuse_duplicate_projection() {
        let project = |entity: &Value, _prior: Option<Value>| {
            Ok(ProjectionAction::Upsert(entity.clone()))
        };
        let join = |_: &Value| Ok(vec!["total".to_string()]);

        let result = counter()
            .projection_raw("Counter", "Total", join, project)
            .projection_raw("Counter", "Total", join, project)
            .build();
        assert!(matches!(result, Err(Error::AmbiguousRegistration(_))));
    }

    #[test]
    fn refuse_projection_without_reducers() {
        let result = counter()
            .projection_raw(
                "Ghost",
                "GhostView",
                |_| Ok(vec![]),
                |_, _| Ok(ProjectionAction::Nothing),
            )
            .build();
        assert!(matches!(result, Err(Error::InvalidRegistration(_))));
    }

    #[test]
    fn refuse_concept_of_two_kinds() {
        let result = counter()
            .reducer_raw("Incremented", "Something", |event, _| Ok(event))
            .build();
        assert!(matches!(result, Err(Error::InvalidRegistration(_))));
    }

    #[test]
    fn refuse_unknown_concept() {
        assert!(matches!(
            counter().version("Unknown", 2).build(),
            Err(Error::UnknownConcept(_))
        ));
        assert!(matches!(
            counter().migration("Unknown", 2, Ok).build(),
            Err(Error::UnknownConcept(_))
        ));
    }

    #[test]
    fn refuse_gap_in_migrations() {
        let result = counter()
            .version("Incremented", 5)
            .migration("Incremented", 2, Ok)
            .migration("Incremented", 3, Ok)
            .migration("Incremented", 5, Ok)
            .build();

        match result {
            Err(Error::InvalidVersion { concept, missing }) => {
                assert_eq!(concept, "Incremented");
                assert_eq!(missing, 4);
            }
            other => panic!("expected invalid version, got {other:?}"),
        }
    }

    #[test]
    fn typed_migration() {
        #[derive(Deserialize)]
        struct V1 {
            amount: u64,
        }

        let registry = counter()
            .version("Incremented", 2)
            .migration_typed("Incremented", 2, |old: V1| {
                Ok(json!({ "by": old.amount }))
            })
            .build()
            .unwrap();

        let migrated = registry
            .migrate("Incremented", 1, json!({ "amount": 7 }))
            .unwrap();
        assert_eq!(migrated, json!({ "by": 7 }));
        assert_eq!(registry.current_version("Counter").unwrap(), 1);
    }

    #[test]
    fn job_trackers_are_registered() {
        let registry = counter().build().unwrap();
        assert!(registry.has_entity(crate::constants::TOUCH_JOB_ENTITY));
        assert!(registry.has_entity(crate::constants::DATA_MIGRATION_JOB_ENTITY));
    }
}
