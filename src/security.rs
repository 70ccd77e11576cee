use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Kubernetes object names, resource types (`deployments.apps`) and
/// `type/name` references.
static KUBE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:/-]*$").expect("valid regex"));

/// Branch names accepted by the git tools.
static GIT_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._/-]*$").expect("valid regex"));

/// Host names (optionally with a port) that may be checked by health_check.
static HOST_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9_-]*[A-Za-z0-9])?(\.[A-Za-z0-9_-]+)*(:[0-9]{1,5})?$")
        .expect("valid regex")
});

/// Option names supplied through `flags` maps, without their leading dashes.
static FLAG_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9-]*$").expect("valid regex"));

/// Validation error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("'{field}' must not start with '-' (got '{value}')")]
    FlagInjection { field: &'static str, value: String },

    #[error("'{field}' contains invalid characters: '{value}'")]
    InvalidCharacters { field: &'static str, value: String },

    #[error("'{0}' must not be empty")]
    Empty(&'static str),

    #[error("Invalid grep pattern: {0}")]
    InvalidPattern(String),

    #[error("{0}")]
    NotAllowed(String),
}

/// Trait for request types that need validation before execution
pub trait Validatable {
    /// Validate the request, returning an error if invalid
    fn validate(&self) -> Result<(), ValidationError>;
}

/// Commands are spawned without a shell, so the only argv-level hazards are
/// values that read as options and embedded control characters.
pub fn validate_argument(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty(field));
    }
    if value.starts_with('-') {
        return Err(ValidationError::FlagInjection {
            field,
            value: value.to_string(),
        });
    }
    if value.chars().any(char::is_control) {
        return Err(ValidationError::InvalidCharacters {
            field,
            value: value.escape_default().to_string(),
        });
    }
    Ok(())
}

pub fn validate_optional(field: &'static str, value: Option<&str>) -> Result<(), ValidationError> {
    value.map_or(Ok(()), |v| validate_argument(field, v))
}

pub fn validate_kube_name(field: &'static str, value: &str) -> Result<(), ValidationError> {
    validate_argument(field, value)?;
    matches_pattern(&KUBE_NAME, field, value)
}

pub fn validate_git_ref(field: &'static str, value: &str) -> Result<(), ValidationError> {
    validate_argument(field, value)?;
    if value.contains("..") || value.ends_with('/') || value.ends_with(".lock") {
        return Err(ValidationError::InvalidCharacters {
            field,
            value: value.to_string(),
        });
    }
    matches_pattern(&GIT_REF, field, value)
}

pub fn validate_host(field: &'static str, value: &str) -> Result<(), ValidationError> {
    validate_argument(field, value)?;
    matches_pattern(&HOST_NAME, field, value)
}

pub fn validate_flag_name(value: &str) -> Result<(), ValidationError> {
    matches_pattern(&FLAG_NAME, "flags", value)
}

fn matches_pattern(
    pattern: &Regex,
    field: &'static str,
    value: &str,
) -> Result<(), ValidationError> {
    if pattern.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::InvalidCharacters {
            field,
            value: value.to_string(),
        })
    }
}
