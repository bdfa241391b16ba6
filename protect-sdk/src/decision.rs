// Decision Module - Per-rule results and the aggregate decision
//
// Both are immutable once created. A `Decision` is produced only by the
// aggregator and handed to the caller (or replayed verbatim from the cache).

use analyze_host::DetectedSensitiveInfoEntity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Verdict of one rule or of the whole request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Conclusion {
    Allow,
    Deny,
    Challenge,
    Error,
}

impl Conclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Conclusion::Allow => "ALLOW",
            Conclusion::Deny => "DENY",
            Conclusion::Challenge => "CHALLENGE",
            Conclusion::Error => "ERROR",
        }
    }
}

/// How a rule took part in the evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleState {
    /// Evaluated and enforced
    Run,
    /// Evaluated for observation only; never enforced
    DryRun,
    /// Skipped after the decision was already final
    NotRun,
}

/// Why a rule (or the decision) concluded what it did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    Bot {
        allowed: Vec<String>,
        denied: Vec<String>,
        verified: bool,
        spoofed: bool,
    },
    Email {
        email_types: Vec<String>,
    },
    Error {
        message: String,
    },
    Filter {
        matched_expressions: Vec<String>,
        undetermined_expressions: Vec<String>,
    },
    RateLimit {
        max: u32,
        /// Requests left in the current window, when the service reports it
        remaining: Option<u32>,
        /// Seconds until the limit resets
        reset_seconds: u64,
        /// Window length in seconds
        window_seconds: u64,
        reset_time: Option<DateTime<Utc>>,
    },
    Shield {
        shield_triggered: bool,
    },
    SensitiveInfo {
        allowed: Vec<DetectedSensitiveInfoEntity>,
        denied: Vec<DetectedSensitiveInfoEntity>,
    },
    NotRun,
}

impl Reason {
    /// The `type` discriminator
    pub fn type_name(&self) -> &'static str {
        match self {
            Reason::Bot { .. } => "BOT",
            Reason::Email { .. } => "EMAIL",
            Reason::Error { .. } => "ERROR",
            Reason::Filter { .. } => "FILTER",
            Reason::RateLimit { .. } => "RATE_LIMIT",
            Reason::Shield { .. } => "SHIELD",
            Reason::SensitiveInfo { .. } => "SENSITIVE_INFO",
            Reason::NotRun => "NOT_RUN",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Reason::Error {
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reason::Error { .. })
    }

    pub fn is_bot(&self) -> bool {
        matches!(self, Reason::Bot { .. })
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Reason::RateLimit { .. })
    }
}

/// Geolocation, network and reputation data for the request IP
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpDetails {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub accuracy_radius: Option<u32>,
    pub timezone: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub country_name: Option<String>,
    pub continent: Option<String>,
    pub continent_name: Option<String>,
    pub asn: Option<String>,
    pub asn_name: Option<String>,
    pub asn_domain: Option<String>,
    pub asn_type: Option<String>,
    pub asn_country: Option<String>,
    pub service: Option<String>,
    pub is_hosting: Option<bool>,
    pub is_vpn: Option<bool>,
    pub is_proxy: Option<bool>,
    pub is_tor: Option<bool>,
    pub is_relay: Option<bool>,
}

/// Boolean reputation checks over optional `IpDetails`
#[derive(Debug, Clone, Copy)]
pub struct IpInfo<'a> {
    details: Option<&'a IpDetails>,
}

impl<'a> IpInfo<'a> {
    pub fn details(&self) -> Option<&'a IpDetails> {
        self.details
    }

    fn flag(&self, get: impl Fn(&IpDetails) -> Option<bool>) -> bool {
        self.details.and_then(get).unwrap_or(false)
    }

    /// The IP belongs to a cloud or hosting provider
    pub fn is_hosting(&self) -> bool {
        self.flag(|d| d.is_hosting)
    }

    pub fn is_vpn(&self) -> bool {
        self.flag(|d| d.is_vpn)
    }

    pub fn is_proxy(&self) -> bool {
        self.flag(|d| d.is_proxy)
    }

    /// The IP is a Tor exit node
    pub fn is_tor(&self) -> bool {
        self.flag(|d| d.is_tor)
    }

    pub fn is_relay(&self) -> bool {
        self.flag(|d| d.is_relay)
    }
}

/// Outcome of evaluating one rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleResult {
    pub rule_id: String,
    pub state: RuleState,
    /// The rule's own conclusion, before any dry-run downgrade
    pub conclusion: Conclusion,
    pub reason: Reason,
    /// Seconds this result may be cached; 0 means do not cache
    pub ttl: u32,
    /// Client fingerprint used for this rule, if one was generated
    pub fingerprint: Option<String>,
}

impl RuleResult {
    pub fn new(rule_id: impl Into<String>, state: RuleState, conclusion: Conclusion, reason: Reason, ttl: u32) -> Self {
        Self {
            rule_id: rule_id.into(),
            state,
            conclusion,
            reason,
            ttl,
            fingerprint: None,
        }
    }

    /// Result for a rule that failed to evaluate
    pub fn error(rule_id: impl Into<String>, state: RuleState, message: impl Into<String>) -> Self {
        Self::new(rule_id, state, Conclusion::Error, Reason::error(message), 0)
    }

    /// Result for a rule skipped after the decision became final
    pub fn not_run(rule_id: impl Into<String>) -> Self {
        Self::new(rule_id, RuleState::NotRun, Conclusion::Allow, Reason::NotRun, 0)
    }

    pub fn with_fingerprint(mut self, fingerprint: Option<String>) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    /// The conclusion as enforced: dry-run results never enforce
    pub fn enforced_conclusion(&self) -> Conclusion {
        match self.state {
            RuleState::DryRun => Conclusion::Allow,
            _ => self.conclusion,
        }
    }

    pub fn was_evaluated(&self) -> bool {
        self.state != RuleState::NotRun
    }

    pub fn is_denied(&self) -> bool {
        self.enforced_conclusion() == Conclusion::Deny
    }

    pub fn is_allowed(&self) -> bool {
        self.enforced_conclusion() == Conclusion::Allow
    }

    pub fn is_error(&self) -> bool {
        self.conclusion == Conclusion::Error
    }
}

/// Whether a bot detection result found a bot impersonating a known crawler
pub fn is_spoofed_bot(result: &RuleResult) -> bool {
    matches!(result.reason, Reason::Bot { spoofed: true, .. })
}

/// The verdict for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    id: String,
    conclusion: Conclusion,
    reason: Reason,
    results: Vec<RuleResult>,
    ip: Option<IpDetails>,
    ttl: u32,
    created_at: DateTime<Utc>,
}

/// Locally generated decision id
pub fn new_decision_id() -> String {
    format!("lreq_{}", Uuid::new_v4().simple())
}

impl Decision {
    pub(crate) fn new(
        conclusion: Conclusion,
        reason: Reason,
        results: Vec<RuleResult>,
        ip: Option<IpDetails>,
        ttl: u32,
    ) -> Self {
        Self {
            id: new_decision_id(),
            conclusion,
            reason,
            results,
            ip,
            ttl,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn conclusion(&self) -> Conclusion {
        self.conclusion
    }

    pub fn is_allowed(&self) -> bool {
        self.conclusion == Conclusion::Allow
    }

    pub fn is_denied(&self) -> bool {
        self.conclusion == Conclusion::Deny
    }

    pub fn is_challenged(&self) -> bool {
        self.conclusion == Conclusion::Challenge
    }

    /// Whether any evaluated rule failed
    pub fn has_errors(&self) -> bool {
        self.results.iter().any(|r| r.was_evaluated() && r.is_error())
    }

    /// Primary reason
    pub fn reason(&self) -> &Reason {
        &self.reason
    }

    /// Every rule result, in configuration order
    pub fn results(&self) -> &[RuleResult] {
        &self.results
    }

    pub fn ip(&self) -> IpInfo<'_> {
        IpInfo {
            details: self.ip.as_ref(),
        }
    }

    /// Seconds this decision may be cached; 0 means do not cache
    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
