//! Error types for the EQL engine

use saker_schema::ConversionError;
use thiserror::Error;

/// A syntax error produced by the tokenizer or the token converter.
///
/// Carries the absolute character offset of the error plus the clause under
/// construction when it occurred, so callers can highlight the offending
/// part of the query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ParseError {
    /// Human-readable message embedding the offending text.
    pub message: String,
    /// Character offset of the error in the original query string.
    pub error_position: usize,
    /// Offset at which the clause being parsed starts.
    pub context_start: usize,
    /// Literal text of the clause being parsed.
    pub context_expression: String,
}

/// EQL engine error type
#[derive(Debug, Error)]
pub enum EqlError {
    /// Syntax error during tokenizing or parsing
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Query references a property the registry does not know
    #[error("Unknown property: {property}")]
    UnknownProperty { property: String },

    /// Operator is not legal for the property's declared kind
    #[error("Operator '{operator}' is not supported for property '{property}': supported operators are {supported}")]
    IllegalOperator {
        property: String,
        operator: String,
        supported: String,
    },

    /// Argument shape is not legal for the condition
    #[error("Illegal value for '{property} {operator}': {reason}")]
    IllegalValue {
        property: String,
        operator: String,
        reason: String,
    },

    /// A raw literal could not be converted to the property kind
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    /// A function handler rejected its invocation
    #[error("Cannot apply function '{function}': {message}")]
    FunctionApplication { function: String, message: String },
}

/// Result type for EQL operations
pub type Result<T> = std::result::Result<T, EqlError>;

impl EqlError {
    pub fn unknown_property(property: impl Into<String>) -> Self {
        EqlError::UnknownProperty {
            property: property.into(),
        }
    }

    pub fn illegal_operator(
        property: impl Into<String>,
        operator: impl Into<String>,
        supported: impl Into<String>,
    ) -> Self {
        EqlError::IllegalOperator {
            property: property.into(),
            operator: operator.into(),
            supported: supported.into(),
        }
    }

    pub fn illegal_value(
        property: impl Into<String>,
        operator: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        EqlError::IllegalValue {
            property: property.into(),
            operator: operator.into(),
            reason: reason.into(),
        }
    }

    pub fn function_application(function: impl Into<String>, message: impl Into<String>) -> Self {
        EqlError::FunctionApplication {
            function: function.into(),
            message: message.into(),
        }
    }
}
