//! The admin command line for an engine.
//!
//! Domain code builds its registry and hands it to [`run`], which parses
//! the process arguments, reads the config, and runs one admin command.

use std::path::PathBuf;

use clap::Parser;
use log::info;

use crate::commons::RefoldResult;
use crate::config::Config;
use crate::constants::*;
use crate::engine::Engine;
use crate::eventsourcing::Registry;

//------------ Options -------------------------------------------------------

/// The command line options for the refold admin tool.
#[derive(clap::Parser, Debug)]
#[command(version, about = "Maintains refold entities and read models.")]
pub struct Options {
    /// The configuration file.
    #[arg(
        short, long,
        env = "REFOLD_CONFIG",
        default_value = REFOLD_DEFAULT_CONFIG_FILE,
    )]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

impl Options {
    /// Creates the options from the process arguments.
    ///
    /// If the arguments won't result in usable options, exits the process.
    pub fn from_args() -> Self {
        Self::parse()
    }
}

//------------ Command -------------------------------------------------------

#[derive(clap::Subcommand, Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// Shows the registered concepts and their schema versions.
    Validate,

    /// Re-projects all entities of a type into their read models.
    Touch {
        /// The entity type to touch.
        entity_type: String,
    },

    /// Migrates stored read models and snapshots to their current schema.
    Migrate {
        /// Only migrate this concept.
        #[arg(long)]
        concept: Option<String>,
    },

    /// Rebuilds one entity from its events and replaces its snapshot.
    Rebuild {
        entity_type: String,
        entity_id: String,
    },
}

impl Command {
    /// Runs the command and returns a printable report.
    pub async fn run(&self, engine: &Engine) -> RefoldResult<String> {
        match self {
            Command::Validate => Ok(validation_report(engine.registry())),
            Command::Touch { entity_type } => {
                let report = engine.touch(entity_type).await?;
                Ok(report.to_string())
            }
            Command::Migrate { concept } => {
                let report = engine.migrate_data(concept.as_deref()).await?;
                Ok(report.to_string())
            }
            Command::Rebuild {
                entity_type,
                entity_id,
            } => match engine.rebuild(entity_type, entity_id).await? {
                Some(state) => Ok(format!("Rebuilt {state}")),
                None => Ok(format!("No events for '{entity_type}/{entity_id}'")),
            },
        }
    }
}

fn validation_report(registry: &Registry) -> String {
    let mut report = String::new();
    for concept in registry.concepts() {
        report.push_str(&format!(
            "{} '{}' at version {}\n",
            concept.kind, concept.name, concept.current_version
        ));
    }
    report.push_str("Registry is valid");
    report
}

//------------ Running -------------------------------------------------------

/// Parses the process arguments and runs the admin command against an
/// engine for the registry.
pub async fn run(registry: Registry) -> RefoldResult<String> {
    run_with(Options::from_args(), registry).await
}

pub async fn run_with(options: Options, registry: Registry) -> RefoldResult<String> {
    let config = Config::read_config(&options.config)?;
    config.init_logging()?;
    info!("{REFOLD_ADMIN_APP} running {:?}", options.command);

    let engine = Engine::from_config(registry, &config)?;
    options.command.run(&engine).await
}

//------------ Tests ---------------------------------------------------------
