//! Loco Common Library
//!
//! Shared data model and error taxonomy for the Loco fleet gateway.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;

/// Loco version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
