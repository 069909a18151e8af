use crate::GraphQLError;
use std::fmt;
use thiserror::Error;

/// Error taxonomy of the gateway core.
///
/// Registration and unification failures are fatal to gateway construction.
/// Configuration errors are raised synchronously when an in-context callable
/// is invoked with an invalid parameter combination. Delegated execution
/// errors are never raised as `MeshError`; they fold into the error list of
/// the eventual result so partial data survives.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("mesh build failed: {}", failures.join("; "))]
    BuildFailed { failures: Vec<String> },

    #[error("schema unification failed: {0}")]
    Unify(String),

    #[error("invalid configuration for {source_name}.{type_name}.{field}: {reason}")]
    Config {
        source_name: String,
        type_name: String,
        field: String,
        reason: String,
    },

    #[error("invalid gateway configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse document: {0}")]
    Parse(String),

    #[error("document validation failed: {}", format_errors(.0))]
    Validation(Vec<GraphQLError>),

    #[error("invalid schema: {0}")]
    Schema(String),

    #[error("source handler failed: {0}")]
    Handler(String),

    #[error("execution failed: {0}")]
    Executor(String),
}

fn format_errors(errors: &[GraphQLError]) -> String {
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

/// All errors of one collapsed result, presented as a single value so that
/// callers of the requester never need exception handling for expected
/// upstream failures.
#[derive(Clone, Debug, PartialEq, Error)]
pub struct AggregateError {
    pub errors: Vec<GraphQLError>,
}

impl AggregateError {
    pub fn new(errors: Vec<GraphQLError>) -> Self {
        AggregateError { errors }
    }

    pub fn from_message(message: impl Into<String>) -> Self {
        AggregateError {
            errors: vec![GraphQLError::new(message)],
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} error(s): {}",
            self.errors.len(),
            format_errors(&self.errors)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn config_error_names_the_full_field_path_and_has_no_cause() {
        let error = MeshError::Config {
            source_name: "users".into(),
            type_name: "Query".into(),
            field: "user".into(),
            reason: "selectionSet required".into(),
        };
        assert_eq!(
            error.to_string(),
            "invalid configuration for users.Query.user: selectionSet required"
        );
        // None of the variants carry a chained cause.
        assert!(error.source().is_none());
    }
}
