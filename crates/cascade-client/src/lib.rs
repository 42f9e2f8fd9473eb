//! Client side of the cascade pipeline: applying server cascades to a local
//! cache and managing optimistic predictions until the server answers.

pub mod cache;
pub mod engine;
pub mod optimistic;

pub use cache::*;
pub use engine::*;
pub use optimistic::*;

pub use cascade_core::{CascadeError, CascadeResponse, ClientConfig, ConflictStrategy, Result};
