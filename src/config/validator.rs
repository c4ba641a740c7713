//! Configuration validation for desired-state documents.
//!
//! This module checks a parsed document for structural mistakes before the
//! graph builder runs, so users get every problem reported at once instead
//! of the first one the builder trips over.

use crate::error::{ConfigError, ConvergeError, Result};
use crate::graph::{ResourceAddress, is_identifier};
use std::collections::HashSet;
use tracing::debug;
use validator::Validate;

use super::spec::{Document, EngineSettings, ForEach, ResourceBlock, StateBackend, StateConfig};

/// Validator for desired-state documents.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a desired-state document.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any were found.
    pub fn validate(&self, document: &Document) -> Result<ValidationResult> {
        let result = self.check(document);

        if result.errors.is_empty() {
            debug!(
                "Configuration validation passed with {} warnings",
                result.warnings.len()
            );
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(ConvergeError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn check(&self, document: &Document) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_settings(&document.settings, &mut result);
        Self::validate_state(&document.state, &mut result);
        Self::validate_variables(document, &mut result);
        Self::validate_resources(&document.resources, &mut result);

        result
    }

    /// Validates engine settings.
    fn validate_settings(settings: &EngineSettings, result: &mut ValidationResult) {
        if let Err(errors) = settings.validate() {
            for (field, field_errors) in errors.field_errors() {
                for error in field_errors {
                    let message = error.message.as_ref().map_or_else(
                        || format!("{field} is out of range ({})", error.code),
                        ToString::to_string,
                    );
                    result.errors.push(ValidationError {
                        field: format!("settings.{field}"),
                        message,
                    });
                }
            }
        }

        if settings.lock_ttl_secs == 0 {
            result.warnings.push(String::from(
                "settings.lock_ttl_secs: locks never expire; a crashed run will need `state unlock`",
            ));
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        if !is_valid_workspace(&state.workspace) {
            result.errors.push(ValidationError {
                field: String::from("state.workspace"),
                message: format!(
                    "Workspace '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    state.workspace
                ),
            });
        }

        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.errors.push(ValidationError {
                        field: String::from("state.bucket"),
                        message: String::from("S3 bucket name is required when using S3 backend"),
                    });
                }
            }
            StateBackend::Local => {}
        }
    }

    /// Validates variable names.
    fn validate_variables(document: &Document, result: &mut ValidationResult) {
        for name in document.variables.keys() {
            if !is_identifier(name) {
                result.errors.push(ValidationError {
                    field: format!("variables.{name}"),
                    message: format!("Variable name '{name}' is not a valid identifier"),
                });
            }
        }
    }

    /// Validates all resource blocks.
    fn validate_resources(blocks: &[ResourceBlock], result: &mut ValidationResult) {
        if blocks.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined in configuration"));
            return;
        }

        let mut seen_labels = HashSet::new();

        for (i, block) in blocks.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !is_identifier(&block.resource_type) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.type"),
                    message: format!("Resource type '{}' is invalid", block.resource_type),
                });
            }

            if !is_identifier(&block.name) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!("Resource name '{}' is invalid", block.name),
                });
            }

            if !seen_labels.insert(block.label()) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!("Duplicate resource block: {}", block.label()),
                });
            }

            if let Some(provider) = &block.provider
                && !is_identifier(provider)
            {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.provider"),
                    message: format!("Provider name '{provider}' is invalid"),
                });
            }

            Self::validate_multiplicity(block, &prefix, result);
            Self::validate_depends_on(block, &prefix, result);
            Self::validate_lifecycle(block, &prefix, result);
        }
    }

    /// Validates `count` / `for_each`.
    fn validate_multiplicity(block: &ResourceBlock, prefix: &str, result: &mut ValidationResult) {
        match (&block.count, &block.for_each) {
            (Some(_), Some(_)) => {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.for_each"),
                    message: format!(
                        "Resource {} sets both count and for_each",
                        block.label()
                    ),
                });
            }
            (Some(0), None) => {
                result.warnings.push(format!(
                    "{prefix}.count: {} has count 0 and declares no instances",
                    block.label()
                ));
            }
            (None, Some(ForEach::Keys(keys))) => {
                let mut seen = HashSet::new();
                for (j, key) in keys.iter().enumerate() {
                    if key.is_empty() {
                        result.errors.push(ValidationError {
                            field: format!("{prefix}.for_each[{j}]"),
                            message: String::from("for_each keys cannot be empty"),
                        });
                    } else if !seen.insert(key) {
                        result.errors.push(ValidationError {
                            field: format!("{prefix}.for_each[{j}]"),
                            message: format!("Duplicate for_each key: {key}"),
                        });
                    }
                }
            }
            (None, Some(ForEach::Map(map))) => {
                if map.keys().any(String::is_empty) {
                    result.errors.push(ValidationError {
                        field: format!("{prefix}.for_each"),
                        message: String::from("for_each keys cannot be empty"),
                    });
                }
            }
            _ => {}
        }
    }

    /// Validates that `depends_on` entries are well-formed addresses.
    fn validate_depends_on(block: &ResourceBlock, prefix: &str, result: &mut ValidationResult) {
        for (j, dependency) in block.depends_on.iter().enumerate() {
            if dependency.parse::<ResourceAddress>().is_err() {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.depends_on[{j}]"),
                    message: format!("'{dependency}' is not a resource address"),
                });
            }
        }
    }

    /// Warns about lifecycle settings that cannot have an effect.
    fn validate_lifecycle(block: &ResourceBlock, prefix: &str, result: &mut ValidationResult) {
        for ignored in &block.lifecycle.ignore_changes {
            if ignored == "*" {
                continue;
            }
            let root = ignored.split('.').next().unwrap_or_default();
            if !block.attributes.contains_key(root) {
                result.warnings.push(format!(
                    "{prefix}.lifecycle.ignore_changes: '{ignored}' is not an attribute of {}",
                    block.label()
                ));
            }
        }
    }
}

/// Validates that a workspace name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_workspace(name: &str) -> bool {
    let mut chars = name.chars();

    if !chars.next().is_some_and(|first| first.is_ascii_lowercase()) {
        return false;
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
