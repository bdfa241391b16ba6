// Rules Module - Rule definitions and their validating constructors
//
// Rules are immutable once built. Each constructor checks its parameters
// eagerly so a misconfigured rule fails at client construction rather than
// on the first request.

use std::fmt;
use std::str::FromStr;

use analyze_host::{
    AllowEmailValidationConfig, AllowedBotConfig, BotConfig, DenyEmailValidationConfig, DeniedBotConfig,
    EmailValidationConfig, SensitiveInfoConfig, SensitiveInfoEntities, SensitiveInfoEntity,
};
use serde::{Deserialize, Serialize};

use crate::error::{ProtectError, Result};

/// Enforcement mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    #[default]
    Live,
    DryRun,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Live => "LIVE",
            Mode::DryRun => "DRY_RUN",
        }
    }

    /// Dry-run if either mode is dry-run
    pub fn combine(self, other: Mode) -> Mode {
        if self == Mode::DryRun || other == Mode::DryRun {
            Mode::DryRun
        } else {
            Mode::Live
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ProtectError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LIVE" => Ok(Mode::Live),
            "DRY_RUN" | "DRYRUN" | "DRY-RUN" => Ok(Mode::DryRun),
            _ => Err(ProtectError::Configuration(format!("Unknown mode: {:?}", s))),
        }
    }
}

/// Known bot categories, usable alongside individual bot names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BotCategory {
    Academic,
    Advertising,
    Ai,
    Amazon,
    Archive,
    Feedfetcher,
    Google,
    Meta,
    Microsoft,
    Monitor,
    Optimizer,
    Preview,
    Programmatic,
    SearchEngine,
    Slack,
    Social,
    Tool,
    Unknown,
    Vercel,
    Yahoo,
}

impl BotCategory {
    pub const ALL: [BotCategory; 20] = [
        BotCategory::Academic,
        BotCategory::Advertising,
        BotCategory::Ai,
        BotCategory::Amazon,
        BotCategory::Archive,
        BotCategory::Feedfetcher,
        BotCategory::Google,
        BotCategory::Meta,
        BotCategory::Microsoft,
        BotCategory::Monitor,
        BotCategory::Optimizer,
        BotCategory::Preview,
        BotCategory::Programmatic,
        BotCategory::SearchEngine,
        BotCategory::Slack,
        BotCategory::Social,
        BotCategory::Tool,
        BotCategory::Unknown,
        BotCategory::Vercel,
        BotCategory::Yahoo,
    ];

    /// Identifier understood by the analysis component
    pub fn as_str(&self) -> &'static str {
        match self {
            BotCategory::Academic => "CATEGORY:ACADEMIC",
            BotCategory::Advertising => "CATEGORY:ADVERTISING",
            BotCategory::Ai => "CATEGORY:AI",
            BotCategory::Amazon => "CATEGORY:AMAZON",
            BotCategory::Archive => "CATEGORY:ARCHIVE",
            BotCategory::Feedfetcher => "CATEGORY:FEEDFETCHER",
            BotCategory::Google => "CATEGORY:GOOGLE",
            BotCategory::Meta => "CATEGORY:META",
            BotCategory::Microsoft => "CATEGORY:MICROSOFT",
            BotCategory::Monitor => "CATEGORY:MONITOR",
            BotCategory::Optimizer => "CATEGORY:OPTIMIZER",
            BotCategory::Preview => "CATEGORY:PREVIEW",
            BotCategory::Programmatic => "CATEGORY:PROGRAMMATIC",
            BotCategory::SearchEngine => "CATEGORY:SEARCH_ENGINE",
            BotCategory::Slack => "CATEGORY:SLACK",
            BotCategory::Social => "CATEGORY:SOCIAL",
            BotCategory::Tool => "CATEGORY:TOOL",
            BotCategory::Unknown => "CATEGORY:UNKNOWN",
            BotCategory::Vercel => "CATEGORY:VERCEL",
            BotCategory::Yahoo => "CATEGORY:YAHOO",
        }
    }

    /// Match `CATEGORY:SEARCH_ENGINE` or the bare name `SEARCH_ENGINE`
    pub fn parse(value: &str) -> Option<Self> {
        let upper = value.trim().to_ascii_uppercase();
        let bare = upper.strip_prefix("CATEGORY:").unwrap_or(&upper);
        Self::ALL
            .into_iter()
            .find(|category| category.as_str().trim_start_matches("CATEGORY:") == bare)
    }
}

impl fmt::Display for BotCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalize a bot specifier: categories to their canonical identifier,
/// anything else kept as a bot name
pub fn bot_specifier(value: &str) -> String {
    match BotCategory::parse(value) {
        Some(category) => category.as_str().to_string(),
        None => value.to_string(),
    }
}

/// Email classification labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmailType {
    Disposable,
    Free,
    NoMxRecords,
    NoGravatar,
    Invalid,
}

impl EmailType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailType::Disposable => "DISPOSABLE",
            EmailType::Free => "FREE",
            EmailType::NoMxRecords => "NO_MX_RECORDS",
            EmailType::NoGravatar => "NO_GRAVATAR",
            EmailType::Invalid => "INVALID",
        }
    }
}

impl FromStr for EmailType {
    type Err = ProtectError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        match upper.strip_prefix("EMAIL_TYPE_").unwrap_or(&upper) {
            "DISPOSABLE" => Ok(EmailType::Disposable),
            "FREE" => Ok(EmailType::Free),
            "NO_MX_RECORDS" => Ok(EmailType::NoMxRecords),
            "NO_GRAVATAR" => Ok(EmailType::NoGravatar),
            "INVALID" => Ok(EmailType::Invalid),
            _ => Err(ProtectError::Configuration(format!("Unknown email type: {:?}", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShieldRule {
    pub mode: Mode,
    pub characteristics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotDetectionRule {
    pub mode: Mode,
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    pub characteristics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBucketRule {
    pub mode: Mode,
    /// Tokens added per interval
    pub refill_rate: u32,
    /// Refill interval in seconds
    pub interval: u32,
    pub capacity: u32,
    pub characteristics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedWindowRule {
    pub mode: Mode,
    pub max: u32,
    /// Window length in seconds
    pub window: u32,
    pub characteristics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlidingWindowRule {
    pub mode: Mode,
    pub max: u32,
    /// Interval length in seconds
    pub interval: u32,
    pub characteristics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailValidationRule {
    pub mode: Mode,
    pub allow: Vec<EmailType>,
    pub deny: Vec<EmailType>,
    pub require_top_level_domain: bool,
    pub allow_domain_literal: bool,
    pub characteristics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensitiveInfoRule {
    pub mode: Mode,
    pub allow: Vec<SensitiveInfoEntity>,
    pub deny: Vec<SensitiveInfoEntity>,
    pub context_window_size: Option<u32>,
    pub characteristics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    pub mode: Mode,
    /// Allow only requests matching one of these expressions
    pub allow: Vec<String>,
    /// Deny requests matching any of these expressions
    pub deny: Vec<String>,
    pub characteristics: Vec<String>,
}

/// One configured check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rule {
    Shield(ShieldRule),
    BotDetection(BotDetectionRule),
    TokenBucket(TokenBucketRule),
    FixedWindow(FixedWindowRule),
    SlidingWindow(SlidingWindowRule),
    EmailValidation(EmailValidationRule),
    SensitiveInfo(SensitiveInfoRule),
    Filter(FilterRule),
}

fn positive(rule: &str, name: &str, value: u32) -> Result<()> {
    if value == 0 {
        return Err(ProtectError::Configuration(format!(
            "{}: {} must be a positive integer",
            rule, name
        )));
    }
    Ok(())
}

fn exclusive<T>(rule: &str, allow: &[T], deny: &[T]) -> Result<()> {
    if !allow.is_empty() && !deny.is_empty() {
        return Err(ProtectError::Configuration(format!(
            "{}: allow and deny cannot both be set",
            rule
        )));
    }
    Ok(())
}

fn non_empty_strings(rule: &str, list: &str, items: &[String]) -> Result<()> {
    if items.iter().any(|item| item.trim().is_empty()) {
        return Err(ProtectError::Configuration(format!(
            "{}: {} entries cannot be empty strings",
            rule, list
        )));
    }
    Ok(())
}

/// Shield requests against common attack patterns
pub fn shield(mode: Mode) -> Rule {
    Rule::Shield(ShieldRule {
        mode,
        characteristics: Vec::new(),
    })
}

/// Detect bots with either an allow list or a deny list
///
/// With `allow`, every detected bot not listed is denied. With `deny`, only
/// the listed bots are denied.
pub fn detect_bot<A, D>(mode: Mode, allow: A, deny: D) -> Result<Rule>
where
    A: IntoIterator,
    A::Item: AsRef<str>,
    D: IntoIterator,
    D::Item: AsRef<str>,
{
    let rule = Rule::BotDetection(BotDetectionRule {
        mode,
        allow: allow.into_iter().map(|b| bot_specifier(b.as_ref())).collect(),
        deny: deny.into_iter().map(|b| bot_specifier(b.as_ref())).collect(),
        characteristics: Vec::new(),
    });
    rule.validate()?;
    Ok(rule)
}

pub fn token_bucket(mode: Mode, refill_rate: u32, interval: u32, capacity: u32) -> Result<Rule> {
    let rule = Rule::TokenBucket(TokenBucketRule {
        mode,
        refill_rate,
        interval,
        capacity,
        characteristics: Vec::new(),
    });
    rule.validate()?;
    Ok(rule)
}

pub fn fixed_window(mode: Mode, max: u32, window: u32) -> Result<Rule> {
    let rule = Rule::FixedWindow(FixedWindowRule {
        mode,
        max,
        window,
        characteristics: Vec::new(),
    });
    rule.validate()?;
    Ok(rule)
}

pub fn sliding_window(mode: Mode, max: u32, interval: u32) -> Result<Rule> {
    let rule = Rule::SlidingWindow(SlidingWindowRule {
        mode,
        max,
        interval,
        characteristics: Vec::new(),
    });
    rule.validate()?;
    Ok(rule)
}

/// Validate the email passed with each request
pub fn validate_email(mode: Mode, allow: &[EmailType], deny: &[EmailType]) -> Result<Rule> {
    let rule = Rule::EmailValidation(EmailValidationRule {
        mode,
        allow: allow.to_vec(),
        deny: deny.to_vec(),
        require_top_level_domain: true,
        allow_domain_literal: false,
        characteristics: Vec::new(),
    });
    rule.validate()?;
    Ok(rule)
}

/// Detect sensitive information in the request body
pub fn detect_sensitive_info(
    mode: Mode,
    allow: &[SensitiveInfoEntity],
    deny: &[SensitiveInfoEntity],
    context_window_size: Option<u32>,
) -> Result<Rule> {
    let rule = Rule::SensitiveInfo(SensitiveInfoRule {
        mode,
        allow: allow.to_vec(),
        deny: deny.to_vec(),
        context_window_size,
        characteristics: Vec::new(),
    });
    rule.validate()?;
    Ok(rule)
}

/// Match the request against filter expressions
pub fn filter<A, D>(mode: Mode, allow: A, deny: D) -> Result<Rule>
where
    A: IntoIterator,
    A::Item: Into<String>,
    D: IntoIterator,
    D::Item: Into<String>,
{
    let rule = Rule::Filter(FilterRule {
        mode,
        allow: allow.into_iter().map(Into::into).collect(),
        deny: deny.into_iter().map(Into::into).collect(),
        characteristics: Vec::new(),
    });
    rule.validate()?;
    Ok(rule)
}

impl Rule {
    /// Short name used in rule ids, logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Rule::Shield(_) => "shield",
            Rule::BotDetection(_) => "bot",
            Rule::TokenBucket(_) => "token_bucket",
            Rule::FixedWindow(_) => "fixed_window",
            Rule::SlidingWindow(_) => "sliding_window",
            Rule::EmailValidation(_) => "email",
            Rule::SensitiveInfo(_) => "sensitive_info",
            Rule::Filter(_) => "filter",
        }
    }

    /// Stable identifier of the rule at `index` in its rule list
    pub fn rule_id(&self, index: usize) -> String {
        format!("{}:{}", self.kind(), index)
    }

    pub fn mode(&self) -> Mode {
        match self {
            Rule::Shield(r) => r.mode,
            Rule::BotDetection(r) => r.mode,
            Rule::TokenBucket(r) => r.mode,
            Rule::FixedWindow(r) => r.mode,
            Rule::SlidingWindow(r) => r.mode,
            Rule::EmailValidation(r) => r.mode,
            Rule::SensitiveInfo(r) => r.mode,
            Rule::Filter(r) => r.mode,
        }
    }

    /// Characteristics with empty entries dropped
    pub fn characteristics(&self) -> Vec<&str> {
        let raw = match self {
            Rule::Shield(r) => &r.characteristics,
            Rule::BotDetection(r) => &r.characteristics,
            Rule::TokenBucket(r) => &r.characteristics,
            Rule::FixedWindow(r) => &r.characteristics,
            Rule::SlidingWindow(r) => &r.characteristics,
            Rule::EmailValidation(r) => &r.characteristics,
            Rule::SensitiveInfo(r) => &r.characteristics,
            Rule::Filter(r) => &r.characteristics,
        };
        raw.iter().map(String::as_str).filter(|c| !c.is_empty()).collect()
    }

    pub fn with_characteristics<I, S>(mut self, characteristics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let list: Vec<String> = characteristics.into_iter().map(Into::into).collect();
        match &mut self {
            Rule::Shield(r) => r.characteristics = list,
            Rule::BotDetection(r) => r.characteristics = list,
            Rule::TokenBucket(r) => r.characteristics = list,
            Rule::FixedWindow(r) => r.characteristics = list,
            Rule::SlidingWindow(r) => r.characteristics = list,
            Rule::EmailValidation(r) => r.characteristics = list,
            Rule::SensitiveInfo(r) => r.characteristics = list,
            Rule::Filter(r) => r.characteristics = list,
        }
        self
    }

    /// Evaluated by the analysis component rather than the decision service
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Rule::BotDetection(_) | Rule::EmailValidation(_) | Rule::SensitiveInfo(_) | Rule::Filter(_)
        )
    }

    /// Whether evaluating this rule needs the analysis component
    pub fn needs_analyzer(&self) -> bool {
        self.is_local() || !self.characteristics().is_empty()
    }

    /// Check the rule's parameters
    pub fn validate(&self) -> Result<()> {
        match self {
            Rule::Shield(_) => Ok(()),
            Rule::BotDetection(r) => {
                exclusive("detect_bot", &r.allow, &r.deny)?;
                non_empty_strings("detect_bot", "allow", &r.allow)?;
                non_empty_strings("detect_bot", "deny", &r.deny)
            }
            Rule::TokenBucket(r) => {
                positive("token_bucket", "refill_rate", r.refill_rate)?;
                positive("token_bucket", "interval", r.interval)?;
                positive("token_bucket", "capacity", r.capacity)
            }
            Rule::FixedWindow(r) => {
                positive("fixed_window", "max", r.max)?;
                positive("fixed_window", "window", r.window)
            }
            Rule::SlidingWindow(r) => {
                positive("sliding_window", "max", r.max)?;
                positive("sliding_window", "interval", r.interval)
            }
            Rule::EmailValidation(r) => exclusive("validate_email", &r.allow, &r.deny),
            Rule::SensitiveInfo(r) => {
                exclusive("detect_sensitive_info", &r.allow, &r.deny)?;
                if r.context_window_size == Some(0) {
                    return Err(ProtectError::Configuration(
                        "detect_sensitive_info: context_window_size must be greater than 0".to_string(),
                    ));
                }
                Ok(())
            }
            Rule::Filter(r) => {
                exclusive("filter", &r.allow, &r.deny)?;
                if r.allow.is_empty() && r.deny.is_empty() {
                    return Err(ProtectError::Configuration(
                        "filter: at least one expression is required".to_string(),
                    ));
                }
                non_empty_strings("filter", "allow", &r.allow)?;
                non_empty_strings("filter", "deny", &r.deny)
            }
        }
    }
}

impl BotDetectionRule {
    /// Policy handed to the analysis component
    pub fn to_config(&self) -> BotConfig {
        if self.allow.is_empty() && !self.deny.is_empty() {
            BotConfig::Denied(DeniedBotConfig {
                entities: self.deny.clone(),
                skip_custom_detect: false,
            })
        } else {
            BotConfig::Allowed(AllowedBotConfig {
                entities: self.allow.clone(),
                skip_custom_detect: false,
            })
        }
    }
}

impl EmailValidationRule {
    pub fn to_config(&self) -> EmailValidationConfig {
        let labels = |types: &[EmailType]| -> Vec<String> { types.iter().map(|t| t.as_str().to_string()).collect() };
        if self.allow.is_empty() {
            EmailValidationConfig::Deny(DenyEmailValidationConfig {
                require_top_level_domain: self.require_top_level_domain,
                allow_domain_literal: self.allow_domain_literal,
                deny: labels(&self.deny),
            })
        } else {
            EmailValidationConfig::Allow(AllowEmailValidationConfig {
                require_top_level_domain: self.require_top_level_domain,
                allow_domain_literal: self.allow_domain_literal,
                allow: labels(&self.allow),
            })
        }
    }
}

impl SensitiveInfoRule {
    pub fn to_config(&self) -> SensitiveInfoConfig {
        let entities = if self.allow.is_empty() {
            SensitiveInfoEntities::Deny(self.deny.clone())
        } else {
            SensitiveInfoEntities::Allow(self.allow.clone())
        };
        SensitiveInfoConfig {
            entities,
            context_window_size: self.context_window_size,
            skip_custom_detect: false,
        }
    }
}
