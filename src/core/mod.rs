//! Core domain models
//!
//! This module defines the fundamental data structures that represent
//! pipelines, stages, and their runtime state.

pub mod config;
pub mod context;
pub mod pipeline;
pub mod stage;
pub mod state;

pub use context::*;
pub use pipeline::*;
pub use stage::*;
pub use state::*;
