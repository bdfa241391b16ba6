use thiserror::Error;

use crate::convert::MarshalError;

/// Errors raised by the analysis component bridge
#[derive(Error, Debug)]
pub enum AnalyzeError {
    /// The component could not be loaded, or its interface does not match
    /// the contract this bridge was built against
    #[error("Configuration error: {0}")]
    Config(String),

    /// A second export was invoked through an execution context that was
    /// already used
    #[error("Execution context exhausted: {0}")]
    ExecutionContextExhausted(String),

    /// The component trapped (including calls to unwired imports and fuel
    /// exhaustion)
    #[error("Component trapped: {0}")]
    Trap(String),

    /// The export returned the error case of its `result`
    #[error("Component returned an error: {0}")]
    Guest(String),

    /// A value crossing the boundary did not have the expected shape
    #[error(transparent)]
    Marshal(#[from] MarshalError),
}

impl AnalyzeError {
    /// Whether the error invalidates the bridge itself rather than one call
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AnalyzeError::Config(_) | AnalyzeError::ExecutionContextExhausted(_) | AnalyzeError::Marshal(_)
        )
    }
}

/// Result type alias using AnalyzeError
pub type Result<T> = std::result::Result<T, AnalyzeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AnalyzeError::Config("missing export `detect-bot`".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing export `detect-bot`");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(AnalyzeError::ExecutionContextExhausted("detect-bot".into()).is_fatal());
        assert!(AnalyzeError::Marshal(MarshalError::UnexpectedShape {
            expected: "record",
            found: "string".into(),
        })
        .is_fatal());
        assert!(!AnalyzeError::Trap("unreachable".into()).is_fatal());
        assert!(!AnalyzeError::Guest("bad expression".into()).is_fatal());
    }
}
