//! Prompt templates with `{name}` and `{name.path}` placeholders.
//!
//! `{{` and `}}` render as literal braces. String values render raw;
//! every other JSON value renders compactly.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use thiserror::Error;

use crate::errors::{ErrorInfo, PipelineValidationError};

static PLACEHOLDER_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z0-9_]+)*$").ok());

/// Template problems.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// The template text is malformed.
    #[error("invalid template at byte {position}: {reason}")]
    Syntax {
        /// Byte offset of the problem.
        position: usize,
        /// What was wrong.
        reason: String,
    },
    /// Rendering data lacks a referenced value.
    #[error("missing value for placeholder '{{{placeholder}}}'")]
    Missing {
        /// The placeholder as written.
        placeholder: String,
    },
}

impl TemplateError {
    /// Wraps the error as a pipeline configuration error for `step`.
    #[must_use]
    pub fn into_validation_error(self, step: &str) -> PipelineValidationError {
        PipelineValidationError::new(format!("Step '{step}' has a bad template: {self}"))
            .with_steps(vec![step.to_string()])
            .with_error_info(
                ErrorInfo::new("PIPELINE-TEMPLATE", self.to_string())
                    .with_fix_hint("Escape literal braces as '{{' and '}}' and reference only available inputs."),
            )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder { raw: String, path: Vec<String> },
}

/// A parsed prompt template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl PromptTemplate {
    /// Parses `source`.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::Syntax`] for unbalanced braces or invalid
    /// placeholder names.
    pub fn parse(source: impl Into<String>) -> Result<Self, TemplateError> {
        let source = source.into();
        let segments = parse_segments(&source)?;
        Ok(Self { source, segments })
    }

    /// A template consisting of the single placeholder `{name}`.
    #[must_use]
    pub fn field(name: &str) -> Self {
        Self {
            source: format!("{{{name}}}"),
            segments: vec![Segment::Placeholder {
                raw: name.to_string(),
                path: name.split('.').map(ToString::to_string).collect(),
            }],
        }
    }

    /// Returns the template text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns the distinct top-level names the template reads.
    #[must_use]
    pub fn placeholders(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for segment in &self.segments {
            if let Segment::Placeholder { path, .. } = segment {
                if let Some(root) = path.first() {
                    if !names.contains(root) {
                        names.push(root.clone());
                    }
                }
            }
        }
        names
    }

    /// Renders against a JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::Missing`] if a referenced value is absent.
    pub fn render(&self, data: &Value) -> Result<String, TemplateError> {
        let mut rendered = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => rendered.push_str(text),
                Segment::Placeholder { raw, path } => {
                    let value = lookup(data, path).ok_or_else(|| TemplateError::Missing {
                        placeholder: raw.clone(),
                    })?;
                    match value {
                        Value::String(text) => rendered.push_str(text),
                        other => rendered.push_str(&other.to_string()),
                    }
                }
            }
        }
        Ok(rendered)
    }
}

fn lookup<'a>(data: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(data, |current, key| match current {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|index| items.get(index)),
        _ => None,
    })
}

fn parse_segments(source: &str) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = source.char_indices().peekable();

    while let Some((position, ch)) = chars.next() {
        match ch {
            '{' if chars.peek().map(|&(_, next)| next) == Some('{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek().map(|&(_, next)| next) == Some('}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for (_, inner) in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    name.push(inner);
                }
                if !closed {
                    return Err(TemplateError::Syntax {
                        position,
                        reason: "unclosed '{'".to_string(),
                    });
                }
                let name = name.trim();
                let valid = PLACEHOLDER_NAME
                    .as_ref()
                    .is_some_and(|pattern| pattern.is_match(name));
                if !valid {
                    return Err(TemplateError::Syntax {
                        position,
                        reason: format!("invalid placeholder name '{name}'"),
                    });
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Placeholder {
                    raw: name.to_string(),
                    path: name.split('.').map(ToString::to_string).collect(),
                });
            }
            '}' => {
                return Err(TemplateError::Syntax {
                    position,
                    reason: "unmatched '}'".to_string(),
                });
            }
            other => literal.push(other),
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}
