//! Batchline Core
//!
//! Core types for the Batchline chunk-oriented batch execution engine.
//!
//! This crate contains:
//! - Domain types: Core batch entities (JobInstance, JobExecution, StepExecution, etc.)
//! - Status and exit-status enums shared between the engine and embedders

pub mod domain;
