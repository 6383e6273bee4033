//! Route registration, compilation and lookup.

use std::collections::HashMap;

use regex::Regex;

use super::template::{PathTemplate, TemplateError};
use super::{PathParams, TargetPath};
use crate::endpoints::Validator;

/// A declared endpoint: which paths it accepts, how payloads are judged and
/// where accepted payloads go.
#[derive(Clone)]
pub struct Endpoint {
    pub path: String,
    pub target: String,
    pub validator: Validator,
}

impl Endpoint {
    pub fn new(path: impl Into<String>, target: impl Into<String>, validator: Validator) -> Self {
        Self {
            path: path.into(),
            target: target.into(),
            validator,
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("path", &self.path)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("route `{template}` duplicates already registered route `{existing}`")]
    Duplicate { template: String, existing: String },
    #[error("target `{target}` of route `{template}` uses parameter `{name}` the route does not declare")]
    UnknownTargetParam {
        template: String,
        target: String,
        name: String,
    },
    #[error("failed to compile matcher for `{template}`: {source}")]
    Compile {
        template: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug)]
struct PendingRoute {
    template: PathTemplate,
    target: PathTemplate,
    validator: Validator,
}

/// Collects endpoints in registration order, rejecting bad ones eagerly.
#[derive(Debug, Default)]
pub struct RouteRegistryBuilder {
    pending: Vec<PendingRoute>,
    shapes: HashMap<String, String>,
}

impl RouteRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an endpoint. Fails if the template (or target) is malformed, if the
    /// target references a parameter the template lacks, or if a route with
    /// an equivalent template was already registered.
    pub fn register(&mut self, endpoint: Endpoint) -> Result<&mut Self, RouteError> {
        let template = PathTemplate::parse(&endpoint.path)?;
        let target = PathTemplate::parse(&endpoint.target)?;

        if let Some(name) = target.params().find(|p| !template.params().any(|q| q == *p)) {
            return Err(RouteError::UnknownTargetParam {
                template: endpoint.path,
                target: endpoint.target,
                name: name.to_string(),
            });
        }

        if let Some(existing) = self.shapes.get(&template.shape()) {
            return Err(RouteError::Duplicate {
                template: endpoint.path,
                existing: existing.clone(),
            });
        }
        self.shapes
            .insert(template.shape(), template.as_str().to_string());

        self.pending.push(PendingRoute {
            template,
            target,
            validator: endpoint.validator,
        });
        Ok(self)
    }

    /// Compile every registered template into an anchored matcher and freeze
    /// the result.
    pub fn compile_all(self) -> Result<RouteRegistry, RouteError> {
        let mut routes = Vec::with_capacity(self.pending.len());
        for pending in self.pending {
            let matcher =
                Regex::new(&pending.template.to_pattern()).map_err(|source| RouteError::Compile {
                    template: pending.template.as_str().to_string(),
                    source,
                })?;
            let param_names = pending.template.params().map(str::to_string).collect();
            routes.push(CompiledRoute {
                template: pending.template,
                target: pending.target,
                matcher,
                param_names,
                validator: pending.validator,
            });
        }

        tracing::debug!(routes = routes.len(), "Route registry compiled");
        Ok(RouteRegistry { routes })
    }
}

/// A route ready for matching. Never mutated after compilation.
pub struct CompiledRoute {
    template: PathTemplate,
    target: PathTemplate,
    matcher: Regex,
    param_names: Vec<String>,
    validator: Validator,
}

impl CompiledRoute {
    pub fn template(&self) -> &PathTemplate {
        &self.template
    }

    pub fn target(&self) -> &PathTemplate {
        &self.target
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    pub fn validator(&self) -> Validator {
        self.validator
    }

    /// Match `path` against this route, binding captures to names in order.
    pub fn matches(&self, path: &str) -> Option<PathParams> {
        let captures = self.matcher.captures(path)?;
        let mut params = PathParams::new();
        for (i, name) in self.param_names.iter().enumerate() {
            let value = captures.get(i + 1)?;
            params.push(name.as_str(), value.as_str());
        }
        Some(params)
    }

    /// The backend path for a request bound with `params`.
    pub fn target_for(&self, params: &PathParams) -> Result<TargetPath, TemplateError> {
        self.target.render(params)
    }
}

impl std::fmt::Debug for CompiledRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledRoute")
            .field("template", &self.template.as_str())
            .field("target", &self.target.as_str())
            .field("pattern", &self.matcher.as_str())
            .finish()
    }
}

/// Result of a successful lookup.
#[derive(Debug)]
pub struct RouteMatch<'a> {
    pub route: &'a CompiledRoute,
    pub params: PathParams,
}

/// Immutable, ordered set of compiled routes.
#[derive(Debug)]
pub struct RouteRegistry {
    routes: Vec<CompiledRoute>,
}

impl RouteRegistry {
    pub fn builder() -> RouteRegistryBuilder {
        RouteRegistryBuilder::new()
    }

    /// Build a registry from endpoints in the given order.
    pub fn from_endpoints(endpoints: impl IntoIterator<Item = Endpoint>) -> Result<Self, RouteError> {
        let mut builder = Self::builder();
        for endpoint in endpoints {
            builder.register(endpoint)?;
        }
        builder.compile_all()
    }

    /// First route in registration order whose matcher accepts `path`.
    pub fn resolve(&self, path: &str) -> Option<RouteMatch<'_>> {
        self.routes.iter().find_map(|route| {
            route
                .matches(path)
                .map(|params| RouteMatch { route, params })
        })
    }

    pub fn routes(&self) -> &[CompiledRoute] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
