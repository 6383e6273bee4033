//! Route registry and path matching.
//!
//! # Data Flow
//! ```text
//! Startup:
//!     Endpoint[] (declarative catalog)
//!     → template.rs (parse, reject malformed placeholders)
//!     → registry.rs register() (reject duplicates, check target params)
//!     → compile_all() (anchored regex per route)
//!     → immutable RouteRegistry, shared read-only by every request
//!
//! Per request:
//!     path → resolve() → first matching route + PathParams, or None
//! ```
//!
//! # Design Decisions
//! - Routes are compiled once and never mutated; no locks on the hot path
//! - First registered match wins; register specific templates before general ones
//! - Parameter values are raw strings; validators interpret them

pub mod registry;
pub mod template;

pub use registry::{Endpoint, RouteError, RouteRegistry};

use std::fmt;

/// Parameter bindings extracted from a matched path, in template order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParams(Vec<(String, String)>);

impl PathParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

impl fmt::Display for PathParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        f.write_str("}")
    }
}

/// A backend path with parameters already substituted, kept as raw segments
/// so the forwarder can percent-encode each one when building the URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPath {
    segments: Vec<String>,
}

impl TargetPath {
    pub(crate) fn new(segments: Vec<String>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl fmt::Display for TargetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}
