//! Repository Module
//!
//! Data access layer for the engine.
//! Each repository handles database operations for a specific batch entity.
//! Durability of the chunk-commit write is the correctness anchor for
//! crash-restart: a chunk is only reported committed once its repository
//! write has succeeded.

pub mod context;
pub mod execution;
pub mod instance;
pub mod step;

// Re-export for convenience
pub use context as context_repository;
pub use execution as execution_repository;
pub use instance as instance_repository;
pub use step as step_repository;
