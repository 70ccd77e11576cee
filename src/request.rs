use regex::Regex;
use rmcp::schemars::{self, JsonSchema};
use serde::Deserialize;
use std::time::Duration;

use crate::security::{Validatable, ValidationError};

/// Available transformation operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Transformation {
    Grep,
    Sort,
    Unique,
    Head,
    Tail,
}

/// Default transformation order
const DEFAULT_TRANSFORM_ORDER: &[Transformation] = &[
    Transformation::Grep,
    Transformation::Sort,
    Transformation::Unique,
    Transformation::Head,
    Transformation::Tail,
];

/// Fields every tool accepts on top of its own arguments.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct OutputOptions {
    /// Optional regex pattern to filter stdout lines (keeps matching lines)
    #[serde(default)]
    pub grep_pattern: Option<String>,

    /// If true, invert grep to exclude matching lines instead of keeping them
    #[serde(default)]
    pub invert_grep: Option<bool>,

    /// Return only the first N lines of stdout
    #[serde(default)]
    pub head: Option<usize>,

    /// Return only the last N lines of stdout
    #[serde(default)]
    pub tail: Option<usize>,

    /// Sort stdout lines alphabetically
    #[serde(default)]
    pub sort: Option<bool>,

    /// Remove duplicate consecutive lines (like uniq)
    #[serde(default)]
    pub unique: Option<bool>,

    /// Order to apply transformations. Default: ["grep", "sort", "unique", "head", "tail"]
    /// Only listed transformations will be applied.
    #[serde(default)]
    pub transform_order: Option<Vec<Transformation>>,

    /// Timeout in milliseconds for each spawned command (default: server COMMAND_TIMEOUT)
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// A wrapper that adds the common fields to any tool request.
/// Both halves are flattened, so the schema is a single object.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ToolRequest<T> {
    #[serde(flatten)]
    pub options: OutputOptions,

    #[serde(flatten)]
    pub inner: T,
}

impl<T: Validatable> Validatable for ToolRequest<T> {
    fn validate(&self) -> Result<(), ValidationError> {
        self.options.validate()?;
        self.inner.validate()
    }
}

impl Validatable for OutputOptions {
    fn validate(&self) -> Result<(), ValidationError> {
        if let Some(pattern) = &self.grep_pattern {
            Regex::new(pattern).map_err(|e| ValidationError::InvalidPattern(e.to_string()))?;
        }
        if self.timeout_ms == Some(0) {
            return Err(ValidationError::NotAllowed(
                "timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl OutputOptions {
    /// Per-call timeout, falling back to the server default
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_ms.map_or(default, Duration::from_millis)
    }

    /// True when at least one transformation would change the output
    pub fn shapes_output(&self) -> bool {
        self.grep_pattern.is_some()
            || self.head.is_some()
            || self.tail.is_some()
            || self.sort.unwrap_or(false)
            || self.unique.unwrap_or(false)
    }

    /// Apply output transformations in the configured order.
    /// Default order: grep -> sort -> unique -> head -> tail
    pub fn transform_output(&self, output: &str) -> String {
        if !self.shapes_output() {
            return output.to_string();
        }
        // An invalid pattern is rejected by `validate`, so it never reaches here.
        let grep = self
            .grep_pattern
            .as_deref()
            .and_then(|pattern| Regex::new(pattern).ok());
        let invert = self.invert_grep.unwrap_or(false);

        let order = self
            .transform_order
            .as_deref()
            .unwrap_or(DEFAULT_TRANSFORM_ORDER);

        let mut lines: Vec<&str> = output.lines().collect();
        for transform in order {
            match transform {
                Transformation::Grep => {
                    if let Some(regex) = &grep {
                        lines.retain(|line| regex.is_match(line) != invert);
                    }
                }
                Transformation::Sort => {
                    if self.sort.unwrap_or(false) {
                        lines.sort_unstable();
                    }
                }
                Transformation::Unique => {
                    if self.unique.unwrap_or(false) {
                        lines.dedup();
                    }
                }
                Transformation::Head => {
                    if let Some(n) = self.head {
                        lines.truncate(n);
                    }
                }
                Transformation::Tail => {
                    if let Some(n) = self.tail {
                        let skip = lines.len().saturating_sub(n);
                        lines.drain(..skip);
                    }
                }
            }
        }
        lines.join("\n")
    }
}
