//! Shared building blocks for GraphQL cascade responses.
//!
//! The server crate produces [`CascadeResponse`] values and the client crate
//! consumes them; both agree on the types, error codes and configuration
//! defined here.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use self::config::*;
pub use error::*;
pub use logging::*;
pub use types::*;
