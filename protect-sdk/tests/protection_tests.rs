//! Integration tests for the protect SDK
//!
//! These tests drive the public client end to end:
//! - Bot detection plus rate limiting over repeated requests
//! - Decision caching and TTL expiry
//! - Fail-open and fail-closed handling of an unreachable decision service
//! - Aggregation precedence properties

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use analyze_host::{
    Analyzer, BotConfig, BotResult, EmailValidationConfig, EmailValidationResult, EmailValidity, FilterResult,
    SensitiveInfoConfig, SensitiveInfoResult,
};
use async_trait::async_trait;
use proptest::prelude::*;

use protect_sdk::rules::{detect_bot, fixed_window, shield, BotCategory};
use protect_sdk::{
    aggregate, Conclusion, DecideService, LocalDecideService, Mode, ProtectConfig, Protector, Reason,
    RemoteRuleRequest, RemoteRuleResponse, RequestContext, RuleResult, RuleState, TransportError,
};

/// Flags anything whose user agent starts with `curl` as an automated client
#[derive(Default)]
struct UserAgentAnalyzer {
    bot_checks: AtomicUsize,
}

impl Analyzer for UserAgentAnalyzer {
    fn match_filters(&self, _request: &str, _expressions: &[String], _allow_if_match: bool) -> analyze_host::Result<FilterResult> {
        Ok(FilterResult {
            allowed: true,
            matched_expressions: vec![],
            undetermined_expressions: vec![],
        })
    }

    fn detect_bot(&self, request: &str, options: &BotConfig) -> analyze_host::Result<BotResult> {
        self.bot_checks.fetch_add(1, Ordering::SeqCst);
        let automated = request.contains("\"user-agent\":\"curl");
        let denied = match options {
            BotConfig::Denied(config) if automated && config.entities.iter().any(|e| e == "CURL") => {
                vec!["CURL".to_string()]
            }
            _ => vec![],
        };
        Ok(BotResult {
            allowed: vec![],
            denied,
            verified: false,
            spoofed: false,
        })
    }

    fn generate_fingerprint(&self, _request: &str, characteristics: &[String]) -> analyze_host::Result<String> {
        Ok(characteristics.join(";"))
    }

    fn validate_characteristics(&self, _request: &str, _characteristics: &[String]) -> analyze_host::Result<()> {
        Ok(())
    }

    fn is_valid_email(&self, _candidate: &str, _options: &EmailValidationConfig) -> analyze_host::Result<EmailValidationResult> {
        Ok(EmailValidationResult {
            validity: EmailValidity::Valid,
            blocked: vec![],
        })
    }

    fn detect_sensitive_info(&self, _content: &str, _options: &SensitiveInfoConfig) -> analyze_host::Result<SensitiveInfoResult> {
        Ok(SensitiveInfoResult {
            allowed: vec![],
            denied: vec![],
        })
    }
}

struct Unreachable;

#[async_trait]
impl DecideService for Unreachable {
    async fn decide(&self, _request: &RemoteRuleRequest) -> Result<RemoteRuleResponse, TransportError> {
        Err(TransportError::Request("connection refused".to_string()))
    }
}

fn curl_request() -> RequestContext {
    RequestContext::new("1.2.3.4").with_header("User-Agent", "curl")
}

fn protector(rules: Vec<protect_sdk::Rule>, analyzer: Arc<UserAgentAnalyzer>) -> Protector {
    Protector::builder(ProtectConfig::new("ajkey_test"))
        .rules(rules)
        .analyzer(analyzer)
        .decide_service(Arc::new(LocalDecideService::new()))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_bot_detection_then_rate_limit() {
    let analyzer = Arc::new(UserAgentAnalyzer::default());
    // Only AI crawlers are denied, so curl passes the bot check
    let rules = vec![
        detect_bot(Mode::Live, Vec::<String>::new(), [BotCategory::Ai.as_str()]).unwrap(),
        fixed_window(Mode::Live, 5, 60).unwrap(),
    ];
    let protector = protector(rules, Arc::clone(&analyzer));
    let ctx = curl_request();

    for attempt in 1..=5 {
        let decision = protector.protect(&ctx).await.unwrap();
        assert!(decision.is_allowed(), "attempt {} should be allowed", attempt);
        assert_eq!(decision.results()[0].conclusion, Conclusion::Allow);
        assert_eq!(decision.ttl(), 0);
    }

    let decision = protector.protect(&ctx).await.unwrap();
    assert!(decision.is_denied());
    assert_eq!(decision.results()[1].rule_id, "fixed_window:1");
    // The rate limit is keyed on the client IP alone
    assert_eq!(decision.results()[1].fingerprint.as_deref(), Some("ip=1.2.3.4"));
    assert!(decision.reason().is_rate_limit());
    assert_eq!(decision.ttl(), decision.results()[1].ttl);
    assert!(decision.ttl() >= 1 && decision.ttl() <= 12);

    // Served from cache: the component is not consulted again
    let checks = analyzer.bot_checks.load(Ordering::SeqCst);
    let cached = protector.protect(&ctx).await.unwrap();
    assert_eq!(cached, decision);
    assert_eq!(analyzer.bot_checks.load(Ordering::SeqCst), checks);
}

#[tokio::test]
async fn test_denied_bot_short_circuits_when_configured() {
    let analyzer = Arc::new(UserAgentAnalyzer::default());
    let mut config = ProtectConfig::new("ajkey_test");
    config.short_circuit = true;
    let protector = Protector::builder(config)
        .rule(detect_bot(Mode::Live, Vec::<String>::new(), ["CURL"]).unwrap())
        .rule(fixed_window(Mode::Live, 5, 60).unwrap())
        .analyzer(analyzer)
        .decide_service(Arc::new(LocalDecideService::new()))
        .build()
        .unwrap();

    let decision = protector.protect(&curl_request()).await.unwrap();
    assert!(decision.is_denied());
    assert!(decision.reason().is_bot());
    assert_eq!(decision.results()[1].state, RuleState::NotRun);
    // Local verdicts carry no TTL
    assert_eq!(decision.ttl(), 0);
}

#[tokio::test]
async fn test_unreachable_service_fail_open_and_closed() {
    let build = |fail_open: bool| {
        let mut config = ProtectConfig::new("ajkey_test");
        config.fail_open = fail_open;
        Protector::builder(config)
            .rule(shield(Mode::Live))
            .decide_service(Arc::new(Unreachable))
            .build()
            .unwrap()
    };

    let decision = build(true).protect(&curl_request()).await.unwrap();
    assert!(decision.is_allowed());
    assert!(decision.has_errors());
    assert!(matches!(decision.reason(), Reason::Error { message } if message.contains("connection refused")));

    let decision = build(false).protect(&curl_request()).await.unwrap();
    assert!(decision.is_denied());
    assert_eq!(decision.ttl(), 0);
}

#[tokio::test]
async fn test_trusted_proxy_resolution_feeds_fingerprint() {
    let mut config = ProtectConfig::new("ajkey_test");
    config.proxies = vec!["10.0.0.0/8".to_string()];
    let protector = Protector::builder(config)
        .rule(fixed_window(Mode::Live, 1, 60).unwrap())
        .decide_service(Arc::new(LocalDecideService::new()))
        .build()
        .unwrap();

    let via_proxy = |client: &str| {
        RequestContext::new("10.0.0.2")
            .with_header("X-Forwarded-For", client)
            .with_header("User-Agent", "curl")
    };

    assert!(protector.protect(&via_proxy("198.51.100.1")).await.unwrap().is_allowed());
    // A different client behind the same proxy has its own limit
    let decision = protector.protect(&via_proxy("198.51.100.2")).await.unwrap();
    assert!(decision.is_allowed());
    assert_eq!(decision.results()[0].fingerprint.as_deref(), Some("ip=198.51.100.2"));

    assert!(protector.protect(&via_proxy("198.51.100.1")).await.unwrap().is_denied());
}

#[tokio::test]
async fn test_rotating_user_agent_shares_one_limit() {
    let limiter = Arc::new(LocalDecideService::new());
    let protector = Protector::builder(ProtectConfig::new("ajkey_test"))
        .rule(fixed_window(Mode::Live, 5, 60).unwrap())
        .decide_service(limiter.clone())
        .build()
        .unwrap();

    let mut allowed = 0;
    for attempt in 0..20 {
        let ctx = RequestContext::new("1.2.3.4").with_header("User-Agent", format!("agent/{}", attempt));
        if protector.protect(&ctx).await.unwrap().is_allowed() {
            allowed += 1;
        }
    }

    assert_eq!(allowed, 5);
    assert_eq!(limiter.tracked(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_share_one_limit() {
    let limiter = Arc::new(LocalDecideService::new());
    let protector = Arc::new(
        Protector::builder(ProtectConfig::new("ajkey_test"))
            .rule(fixed_window(Mode::Live, 5, 60).unwrap())
            .decide_service(limiter.clone())
            .build()
            .unwrap(),
    );

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let protector = Arc::clone(&protector);
            tokio::spawn(async move { protector.protect(&RequestContext::new("1.2.3.4")).await.unwrap() })
        })
        .collect();

    let mut allowed = 0;
    for handle in handles {
        let decision = handle.await.unwrap();
        assert_eq!(decision.results().len(), 1);
        if decision.is_allowed() {
            allowed += 1;
        } else {
            assert!(matches!(decision.reason(), Reason::RateLimit { max: 5, .. }));
        }
    }

    assert_eq!(allowed, 5);
    assert_eq!(limiter.tracked(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cached_denial_expires() {
    let protector = Protector::builder(ProtectConfig::new("ajkey_test"))
        .rule(fixed_window(Mode::Live, 1, 3600).unwrap())
        .decide_service(Arc::new(LocalDecideService::new()))
        .build()
        .unwrap();
    let ctx = curl_request();

    protector.protect(&ctx).await.unwrap();
    let denied = protector.protect(&ctx).await.unwrap();
    assert!(denied.is_denied());
    let ttl = Duration::from_secs(u64::from(denied.ttl()));

    tokio::time::advance(ttl - Duration::from_millis(100)).await;
    assert_eq!(protector.protect(&ctx).await.unwrap().id(), denied.id());

    tokio::time::advance(Duration::from_millis(200)).await;
    assert_ne!(protector.protect(&ctx).await.unwrap().id(), denied.id());
}

fn conclusion_strategy() -> impl Strategy<Value = Conclusion> {
    prop_oneof![
        Just(Conclusion::Allow),
        Just(Conclusion::Deny),
        Just(Conclusion::Challenge),
        Just(Conclusion::Error),
    ]
}

proptest! {
    #[test]
    fn prop_live_deny_always_wins(
        conclusions in prop::collection::vec(conclusion_strategy(), 1..8),
        fail_open in any::<bool>(),
    ) {
        let results: Vec<RuleResult> = conclusions
            .iter()
            .enumerate()
            .map(|(i, c)| RuleResult::new(format!("rule:{}", i), RuleState::Run, *c, Reason::NotRun, 0))
            .collect();
        let decision = aggregate(results, fail_open, None);

        if conclusions.contains(&Conclusion::Deny) {
            prop_assert!(decision.is_denied());
        } else if conclusions.contains(&Conclusion::Challenge) {
            prop_assert!(decision.is_challenged());
        } else if conclusions.contains(&Conclusion::Error) && !fail_open {
            prop_assert!(decision.is_denied());
        } else {
            prop_assert!(decision.is_allowed());
        }
    }

    #[test]
    fn prop_dry_run_never_enforces(
        conclusions in prop::collection::vec(conclusion_strategy(), 0..8),
        fail_open in any::<bool>(),
    ) {
        let results: Vec<RuleResult> = conclusions
            .iter()
            .enumerate()
            .map(|(i, c)| RuleResult::new(format!("rule:{}", i), RuleState::DryRun, *c, Reason::NotRun, 30))
            .collect();
        let decision = aggregate(results, fail_open, None);
        prop_assert!(decision.is_allowed());
        prop_assert_eq!(decision.ttl(), 0);
    }
}
