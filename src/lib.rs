//! The _refold_ library crate.
//!
//! Rebuilds entity state from per-entity event streams, upgrades stale
//! payloads through registered schema migrations, and projects the result
//! into read models, using optimistic concurrency on both the event log and
//! the read models.

pub mod cli;
pub mod commons;
pub mod config;
pub mod constants;
pub mod engine;
pub mod eventsourcing;
pub mod storage;
pub mod upgrades;
