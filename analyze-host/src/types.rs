//! Native counterparts of the records, variants and enums in the component world.
//!
//! Field names are snake_case here and kebab-case on the ABI side; the
//! conversions live in [`crate::convert`].

use serde::{Deserialize, Serialize};

/// Outcome of `match-filters`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterResult {
    /// Whether the request passes the filter set
    pub allowed: bool,
    /// Expressions that matched the request
    pub matched_expressions: Vec<String>,
    /// Expressions that could neither be matched nor excluded
    pub undetermined_expressions: Vec<String>,
}

/// Bot detection policy handed to `detect-bot`
///
/// An allow policy denies every detected bot not listed; a deny policy only
/// denies the listed ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BotConfig {
    Allowed(AllowedBotConfig),
    Denied(DeniedBotConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedBotConfig {
    pub entities: Vec<String>,
    pub skip_custom_detect: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeniedBotConfig {
    pub entities: Vec<String>,
    pub skip_custom_detect: bool,
}

/// Outcome of `detect-bot`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BotResult {
    pub allowed: Vec<String>,
    pub denied: Vec<String>,
    /// The bot's IP matched the published ranges of the bot it claims to be
    pub verified: bool,
    /// The bot claims to be a known crawler but its IP does not match
    pub spoofed: bool,
}

/// Three-valued answer returned by host verification and override hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ValidatorResponse {
    Yes,
    No,
    #[default]
    Unknown,
}

/// Email validation policy handed to `is-valid-email`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmailValidationConfig {
    Allow(AllowEmailValidationConfig),
    Deny(DenyEmailValidationConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowEmailValidationConfig {
    pub require_top_level_domain: bool,
    pub allow_domain_literal: bool,
    pub allow: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenyEmailValidationConfig {
    pub require_top_level_domain: bool,
    pub allow_domain_literal: bool,
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmailValidity {
    Valid,
    Invalid,
}

/// Outcome of `is-valid-email`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailValidationResult {
    pub validity: EmailValidity,
    /// Email type labels (e.g. `DISPOSABLE`) that caused the address to be blocked
    pub blocked: Vec<String>,
}

/// Kind of sensitive information found in a piece of content
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensitiveInfoEntity {
    Email,
    PhoneNumber,
    IpAddress,
    CreditCardNumber,
    Custom(String),
}

impl SensitiveInfoEntity {
    /// Stable label used in reasons and logs
    pub fn label(&self) -> String {
        match self {
            SensitiveInfoEntity::Email => "EMAIL".to_string(),
            SensitiveInfoEntity::PhoneNumber => "PHONE_NUMBER".to_string(),
            SensitiveInfoEntity::IpAddress => "IP_ADDRESS".to_string(),
            SensitiveInfoEntity::CreditCardNumber => "CREDIT_CARD_NUMBER".to_string(),
            SensitiveInfoEntity::Custom(name) => name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensitiveInfoEntities {
    Allow(Vec<SensitiveInfoEntity>),
    Deny(Vec<SensitiveInfoEntity>),
}

/// Sensitive information policy handed to `detect-sensitive-info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensitiveInfoConfig {
    pub entities: SensitiveInfoEntities,
    /// Number of surrounding tokens passed to the custom identifier
    pub context_window_size: Option<u32>,
    pub skip_custom_detect: bool,
}

/// A span of content identified as sensitive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedSensitiveInfoEntity {
    pub start: u32,
    pub end: u32,
    pub identified_type: SensitiveInfoEntity,
}

/// Outcome of `detect-sensitive-info`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SensitiveInfoResult {
    pub allowed: Vec<DetectedSensitiveInfoEntity>,
    pub denied: Vec<DetectedSensitiveInfoEntity>,
}
