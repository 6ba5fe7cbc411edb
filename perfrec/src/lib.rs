//! Deferred commit of performance measurements.
//!
//! Producers commit typed records into a [`recorder::Recorder`], which assigns provisional local
//! ids and writes every commit to a line-oriented log. The [`loader::MergeLoader`] later replays
//! one or many such logs against a relational store, deduplicating dimensions by natural key,
//! assigning store ids to facts and rewriting every foreign key from local to global ids.

pub mod config;
pub mod database;
pub mod dedup;
pub mod entity;
pub mod error;
pub mod flush;
pub mod loader;
pub mod protocol;
pub mod recorder;
pub mod sequence;
pub mod staging;

pub use error::{ErrorKind, ReconcileError};

#[cfg(test)]
mod dedup_test;
#[cfg(test)]
mod loader_test;
#[cfg(test)]
mod protocol_test;
#[cfg(test)]
mod recorder_test;
