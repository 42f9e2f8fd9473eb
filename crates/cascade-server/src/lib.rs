//! Server side of the cascade pipeline.
//!
//! A mutation resolver starts a transaction on an [`EntityChangeTracker`],
//! reports the entities it creates, updates and deletes, and hands the tracker
//! to a [`ResponseBuilder`], which asks an [`Invalidator`] for query hints and
//! emits a size-bounded [`cascade_core::CascadeResponse`].

pub mod adapter;
pub mod builder;
pub mod invalidation;
pub mod tracker;

pub use adapter::*;
pub use builder::*;
pub use invalidation::*;
pub use tracker::*;

pub use cascade_core::{CascadeError, CascadeResponse, Result};
