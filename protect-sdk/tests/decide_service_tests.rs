//! HTTP decision service tests against a mock server

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use protect_sdk::rules::{fixed_window, shield};
use protect_sdk::{
    Conclusion, DecideService, HttpDecideService, Mode, ProtectConfig, Protector, Reason, RemoteRuleRequest,
    RequestContext, TransportError,
};

fn request() -> RemoteRuleRequest {
    let rule = fixed_window(Mode::Live, 5, 60).unwrap();
    RemoteRuleRequest {
        rule_id: rule.rule_id(0),
        rule,
        fingerprint: "ip=1.2.3.4;ua=curl".to_string(),
        context: RequestContext::new("1.2.3.4").with_header("User-Agent", "curl"),
        requested: 1,
    }
}

fn rate_limited_body() -> serde_json::Value {
    json!({
        "conclusion": "DENY",
        "reason": {
            "type": "RATE_LIMIT",
            "max": 5,
            "remaining": 0,
            "reset_seconds": 42,
            "window_seconds": 60,
            "reset_time": null
        },
        "ttl": 42,
        "ip_details": { "country": "NL", "is_vpn": true }
    })
}

#[tokio::test]
async fn test_decide_posts_with_bearer_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/decide"))
        .and(header("authorization", "Bearer ajkey_test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rate_limited_body()))
        .expect(1)
        .mount(&server)
        .await;

    let service = HttpDecideService::new(&server.uri(), "ajkey_test", Duration::from_secs(2)).unwrap();
    let response = service.decide(&request()).await.unwrap();

    assert_eq!(response.conclusion, Conclusion::Deny);
    assert_eq!(response.ttl, 42);
    assert!(matches!(response.reason, Reason::RateLimit { reset_seconds: 42, .. }));
    assert_eq!(response.ip_details.and_then(|d| d.is_vpn), Some(true));
}

#[tokio::test]
async fn test_error_status_is_transport_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let service = HttpDecideService::new(&server.uri(), "ajkey_test", Duration::from_secs(2)).unwrap();
    let err = service.decide(&request()).await.unwrap_err();
    assert_eq!(
        err,
        TransportError::Status {
            status: 503,
            body: "overloaded".to_string()
        }
    );
}

#[tokio::test]
async fn test_malformed_body_is_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let service = HttpDecideService::new(&server.uri(), "ajkey_test", Duration::from_secs(2)).unwrap();
    let err = service.decide(&request()).await.unwrap_err();
    assert!(matches!(err, TransportError::Decode(_)));
}

#[tokio::test]
async fn test_slow_service_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rate_limited_body()).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let service = HttpDecideService::new(&server.uri(), "ajkey_test", Duration::from_millis(100)).unwrap();
    let err = service.decide(&request()).await.unwrap_err();
    assert_eq!(err, TransportError::Timeout(Duration::from_millis(100)));
}

#[tokio::test]
async fn test_protector_uses_http_service_by_default() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/decide"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "conclusion": "ALLOW",
            "reason": { "type": "SHIELD", "shield_triggered": false },
            "ttl": 0
        })))
        .mount(&server)
        .await;

    let mut config = ProtectConfig::new("ajkey_test");
    config.base_url = server.uri();
    let protector = Protector::builder(config).rule(shield(Mode::Live)).build().unwrap();

    let decision = protector.protect(&RequestContext::new("1.2.3.4")).await.unwrap();
    assert!(decision.is_allowed());
    assert_eq!(decision.reason(), &Reason::Shield { shield_triggered: false });

    let received = server.received_requests().await.unwrap_or_default();
    assert_eq!(received.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(body["rule_id"], "shield:0");
    assert_eq!(body["rule"]["kind"], "shield");
}
