use crate::error::Result;
use crate::types::*;

/// The analysis capabilities exported by the component
///
/// `AnalyzeComponent` is the production implementation. Anything else that
/// answers the same six questions (a test double, a cached front) can stand
/// in for it.
pub trait Analyzer: Send + Sync {
    /// Evaluate filter `expressions` against the serialized request
    fn match_filters(&self, request: &str, expressions: &[String], allow_if_match: bool) -> Result<FilterResult>;

    fn detect_bot(&self, request: &str, options: &BotConfig) -> Result<BotResult>;

    /// Derive a fingerprint from the requested characteristics
    fn generate_fingerprint(&self, request: &str, characteristics: &[String]) -> Result<String>;

    /// Check that every characteristic can be resolved for this request
    fn validate_characteristics(&self, request: &str, characteristics: &[String]) -> Result<()>;

    fn is_valid_email(&self, candidate: &str, options: &EmailValidationConfig) -> Result<EmailValidationResult>;

    fn detect_sensitive_info(&self, content: &str, options: &SensitiveInfoConfig) -> Result<SensitiveInfoResult>;
}
