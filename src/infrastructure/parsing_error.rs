//! Parsing error types for DOM extraction
//!
//! Context-aware errors so that a layout change on the source is reported
//! with the selectors that were tried instead of silently yielding nothing.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParsingError {
    #[error("Required field '{field}' not found in HTML")]
    RequiredFieldMissing {
        field: String,
        context: Option<String>,
    },

    #[error("Invalid CSS selector: {selector} - {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("No mission list container found (tried: {})", .tried_containers.join(", "))]
    NoListContainers { tried_containers: Vec<String> },

    #[error("Invalid value for '{field}': {value}")]
    InvalidValue { field: String, value: String },

    #[error("Unexpected JSON payload: {message}")]
    UnexpectedPayload { message: String },
}

impl ParsingError {
    /// Create a required field missing error with context
    pub fn required_field_missing(field: &str, context: Option<&str>) -> Self {
        Self::RequiredFieldMissing {
            field: field.to_string(),
            context: context.map(ToString::to_string),
        }
    }

    pub fn invalid_selector(selector: &str, reason: impl ToString) -> Self {
        Self::InvalidSelector {
            selector: selector.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_value(field: &str, value: &str) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    /// Whether the error concerns a single entry rather than the whole page
    pub fn is_entry_level(&self) -> bool {
        matches!(
            self,
            Self::RequiredFieldMissing { .. } | Self::InvalidValue { .. }
        )
    }
}

pub type ParsingResult<T> = Result<T, ParsingError>;
