use analyze_host::AnalyzeError;
use thiserror::Error;

/// Errors that can occur while protecting a request
///
/// Only `Configuration` and `ExecutionContextExhausted` ever reach the caller
/// of `protect`/`evaluate`. Every other kind is resolved inside the pipeline
/// into a rule result, a cache miss, or a logged default.
#[derive(Error, Debug)]
pub enum ProtectError {
    /// Bad client or rule configuration, or an analysis component that does
    /// not match the expected interface
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An execution context was reused
    #[error("Execution context exhausted: {0}")]
    ExecutionContextExhausted(String),

    /// A host import override failed
    #[error("Import binding failure: {0}")]
    ImportBinding(String),

    /// A single rule could not be evaluated
    #[error("Rule evaluation error: {0}")]
    RuleEvaluation(String),

    /// The remote decision service could not be reached or answered badly
    #[error("Transport error: {0}")]
    Transport(String),

    /// The decision store failed
    #[error("Cache error: {0}")]
    Cache(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ProtectError {
    /// Whether the error must propagate to the caller
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtectError::Configuration(_) | ProtectError::ExecutionContextExhausted(_)
        )
    }
}

/// Result type alias using ProtectError
pub type Result<T> = std::result::Result<T, ProtectError>;

impl From<AnalyzeError> for ProtectError {
    fn from(err: AnalyzeError) -> Self {
        match err {
            AnalyzeError::Config(msg) => ProtectError::Configuration(msg),
            AnalyzeError::Marshal(e) => {
                ProtectError::Configuration(format!("analysis component contract violation: {}", e))
            }
            AnalyzeError::ExecutionContextExhausted(msg) => ProtectError::ExecutionContextExhausted(msg),
            AnalyzeError::Trap(msg) | AnalyzeError::Guest(msg) => ProtectError::RuleEvaluation(msg),
        }
    }
}

impl From<serde_json::Error> for ProtectError {
    fn from(err: serde_json::Error) -> Self {
        ProtectError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for ProtectError {
    fn from(err: config::ConfigError) -> Self {
        ProtectError::Configuration(err.to_string())
    }
}

impl From<toml::ser::Error> for ProtectError {
    fn from(err: toml::ser::Error) -> Self {
        ProtectError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analyze_host::MarshalError;

    #[test]
    fn test_error_display() {
        let err = ProtectError::Configuration("key must not be empty".to_string());
        assert_eq!(err.to_string(), "Configuration error: key must not be empty");
    }

    #[test]
    fn test_analyze_error_mapping() {
        let err: ProtectError = AnalyzeError::Trap("unreachable".into()).into();
        assert!(matches!(err, ProtectError::RuleEvaluation(_)));
        assert!(!err.is_fatal());

        let err: ProtectError = AnalyzeError::Marshal(MarshalError::UnknownCase {
            type_name: "validator-response",
            case: "maybe".into(),
        })
        .into();
        assert!(matches!(err, ProtectError::Configuration(_)));
        assert!(err.is_fatal());

        let err: ProtectError = AnalyzeError::ExecutionContextExhausted("detect-bot".into()).into();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_from_serde_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{invalid").unwrap_err();
        let err: ProtectError = json_err.into();
        assert!(matches!(err, ProtectError::Serialization(_)));
    }
}
