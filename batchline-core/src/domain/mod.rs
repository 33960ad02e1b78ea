//! Core domain types
//!
//! This module contains the core domain structures used across Batchline.
//! These types represent the fundamental batch entities and are shared between
//! the execution repository (for persistence) and the engine (for execution).

pub mod context;
pub mod job;
pub mod parameters;
pub mod status;
pub mod step;
