//! Configuration error types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    /// A source could not be read or parsed, or did not match the schema
    #[error("Failed to load configuration for environment '{environment}': {error}")]
    Load { environment: String, error: String },

    #[error("Missing required configuration field '{field}' in {context}")]
    MissingRequiredField { field: String, context: String },

    #[error("Invalid value '{value}' for field '{field}': {context}")]
    InvalidValue {
        field: String,
        value: String,
        context: String,
    },
}

impl ConfigurationError {
    pub fn load<E: Into<String>, R: std::fmt::Display>(environment: E, error: R) -> Self {
        Self::Load {
            environment: environment.into(),
            error: error.to_string(),
        }
    }

    pub fn missing_required_field<F: Into<String>, C: Into<String>>(field: F, context: C) -> Self {
        Self::MissingRequiredField {
            field: field.into(),
            context: context.into(),
        }
    }

    pub fn invalid_value<F: Into<String>, V: Into<String>, C: Into<String>>(
        field: F,
        value: V,
        context: C,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
            context: context.into(),
        }
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigurationError>;
