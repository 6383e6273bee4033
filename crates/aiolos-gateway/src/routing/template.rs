//! Path template grammar.
//!
//! A template is a `/`-separated list of segments. Each segment is either a
//! literal or a placeholder `{name}` standing for exactly one path segment:
//!
//! ```text
//! /station/{stationId}/diagnostics
//!  ^^^^^^^ ^^^^^^^^^^^ ^^^^^^^^^^^
//!  literal  parameter    literal
//! ```
//!
//! Literals match case-sensitively. Parameter names follow identifier rules
//! (`[A-Za-z_][A-Za-z0-9_]*`) and must be unique within a template.

use std::fmt;
use std::str::FromStr;

use super::{PathParams, TargetPath};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("template `{0}` must start with `/`")]
    MissingLeadingSlash(String),
    #[error("template `{0}` contains an empty segment")]
    EmptySegment(String),
    #[error("template `{template}` has malformed placeholder segment `{segment}`")]
    MalformedPlaceholder { template: String, segment: String },
    #[error("template `{template}` declares parameter `{name}` more than once")]
    DuplicateParam { template: String, name: String },
    #[error("template `{template}` references unbound parameter `{name}`")]
    UnboundParam { template: String, name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A parsed, validated path template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        let rest = raw
            .strip_prefix('/')
            .ok_or_else(|| TemplateError::MissingLeadingSlash(raw.to_string()))?;

        let mut segments = Vec::new();
        if !rest.is_empty() {
            for segment in rest.split('/') {
                segments.push(parse_segment(raw, segment)?);
            }
        }

        let mut seen: Vec<&str> = Vec::new();
        for segment in &segments {
            if let Segment::Param(name) = segment {
                if seen.contains(&name.as_str()) {
                    return Err(TemplateError::DuplicateParam {
                        template: raw.to_string(),
                        name: name.clone(),
                    });
                }
                seen.push(name);
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Parameter names in declaration order.
    pub fn params(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Param(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// The template with parameter names erased. Two templates with the same
    /// shape accept exactly the same paths.
    pub fn shape(&self) -> String {
        if self.segments.is_empty() {
            return "/".to_string();
        }
        let mut shape = String::new();
        for segment in &self.segments {
            shape.push('/');
            match segment {
                Segment::Literal(lit) => shape.push_str(lit),
                Segment::Param(_) => shape.push_str("{}"),
            }
        }
        shape
    }

    /// Anchored regular expression: literals escaped, one capture group per
    /// parameter matching a single non-empty segment.
    pub fn to_pattern(&self) -> String {
        let mut pattern = String::from("^");
        if self.segments.is_empty() {
            pattern.push('/');
        }
        for segment in &self.segments {
            pattern.push('/');
            match segment {
                Segment::Literal(lit) => pattern.push_str(&regex::escape(lit)),
                Segment::Param(_) => pattern.push_str("([^/]+)"),
            }
        }
        pattern.push('$');
        pattern
    }

    /// Substitute bound parameters, producing the concrete segments.
    pub fn render(&self, params: &PathParams) -> Result<TargetPath, TemplateError> {
        let mut rendered = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => rendered.push(lit.clone()),
                Segment::Param(name) => {
                    let value =
                        params
                            .get(name)
                            .ok_or_else(|| TemplateError::UnboundParam {
                                template: self.raw.clone(),
                                name: name.clone(),
                            })?;
                    rendered.push(value.to_string());
                }
            }
        }
        Ok(TargetPath::new(rendered))
    }
}

fn parse_segment(template: &str, segment: &str) -> Result<Segment, TemplateError> {
    if segment.is_empty() {
        return Err(TemplateError::EmptySegment(template.to_string()));
    }

    let malformed = || TemplateError::MalformedPlaceholder {
        template: template.to_string(),
        segment: segment.to_string(),
    };

    match segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
        Some(name) if is_identifier(name) => Ok(Segment::Param(name.to_string())),
        Some(_) => Err(malformed()),
        None if segment.contains(['{', '}']) => Err(malformed()),
        None => Ok(Segment::Literal(segment.to_string())),
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl FromStr for PathTemplate {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
