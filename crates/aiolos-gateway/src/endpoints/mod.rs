//! Declarative endpoint catalog and per-endpoint payload validators.

pub mod catalog;
pub mod validators;

pub use catalog::build_registry;
pub use validators::ValidationError;

use crate::routing::PathParams;

/// Judges a decoded payload against the parameters bound from its path.
/// Validators never modify the payload.
pub type Validator = fn(&serde_json::Value, &PathParams) -> Result<(), ValidationError>;
