//! Protect SDK Library
//!
//! Evaluates protection rules for a request and returns one decision,
//! combining the analysis component with a remote decision service and a
//! fingerprint-keyed decision cache.

pub mod aggregate;
pub mod cache;
pub mod client;
pub mod config;
pub mod context;
pub mod decision;
pub mod error;
pub mod fingerprint;
pub mod pipeline;
pub mod remote;
pub mod rules;
pub mod telemetry;

// Re-export commonly used types
pub use aggregate::aggregate;
pub use cache::{DecisionCache, DecisionStore, MemoryDecisionStore};
pub use client::{BlockingProtector, Protector, ProtectorBuilder, MANUAL_IP_EXTRA};
pub use config::{CacheConfig, LoggingConfig, ProtectConfig};
pub use context::{resolve_client_ip, RequestContext};
pub use decision::{is_spoofed_bot, Conclusion, Decision, IpDetails, IpInfo, Reason, RuleResult, RuleState};
pub use error::{ProtectError, Result};
pub use fingerprint::Fingerprint;
pub use remote::{
    DecideService, HttpDecideService, LocalDecideService, RemoteRuleRequest, RemoteRuleResponse, TransportError,
};
pub use rules::{BotCategory, EmailType, Mode, Rule};
