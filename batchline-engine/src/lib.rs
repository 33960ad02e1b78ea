//! Batchline Engine
//!
//! Chunk-oriented batch execution engine with skip/recovery semantics and
//! restartable job instances.
//!
//! The engine reads items through an [`item::ItemReader`], processes them in
//! transactional chunks, consults a [`skip::SkipPolicy`] to exclude faulty
//! records without aborting the whole job, persists execution state through
//! the repository layer so failed jobs can be restarted from the last
//! committed chunk, and routes between steps on exit status via a
//! [`flow::Flow`]. The [`operator::JobOperator`] is the public entry point.

pub mod chunk;
pub mod db;
pub mod error;
pub mod flow;
pub mod item;
pub mod operator;
pub mod registry;
pub mod repository;
pub mod skip;
pub mod step;

pub use error::{BatchError, Result};
