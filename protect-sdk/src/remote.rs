// Remote Decision Service - Rules evaluated outside the process
//
// Rate limits and shield are decided by a service shared across instances.
// `HttpDecideService` talks to it over JSON; `LocalDecideService` implements
// the same contract in-process for offline operation and tests.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use metrics::{counter, gauge};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, info};

use crate::context::RequestContext;
use crate::decision::{Conclusion, IpDetails, Reason};
use crate::error::{ProtectError, Result};
use crate::rules::Rule;

/// Failure to obtain a verdict from the decision service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("rule kind {0} is not decided remotely")]
    Unsupported(&'static str),
}

impl From<TransportError> for ProtectError {
    fn from(err: TransportError) -> Self {
        ProtectError::Transport(err.to_string())
    }
}

/// One rule sent for a remote verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRuleRequest {
    pub rule_id: String,
    pub rule: Rule,
    /// Client identity the rule is keyed on
    pub fingerprint: String,
    pub context: RequestContext,
    /// Tokens to charge against a token bucket
    pub requested: u32,
}

/// Verdict for one remote rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRuleResponse {
    pub conclusion: Conclusion,
    pub reason: Reason,
    /// Seconds the verdict may be cached
    #[serde(default)]
    pub ttl: u32,
    #[serde(default)]
    pub ip_details: Option<IpDetails>,
}

/// The decision service contract
#[async_trait]
pub trait DecideService: Send + Sync {
    async fn decide(&self, request: &RemoteRuleRequest) -> std::result::Result<RemoteRuleResponse, TransportError>;
}

/// Decision service reached over HTTP
#[derive(Debug, Clone)]
pub struct HttpDecideService {
    client: Client,
    endpoint: String,
    key: String,
    timeout: Duration,
}

impl HttpDecideService {
    pub fn new(base_url: &str, key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProtectError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        let endpoint = format!("{}/v1/decide", base_url.trim_end_matches('/'));
        info!(endpoint = %endpoint, timeout_ms = timeout.as_millis() as u64, "Decision service client configured");

        Ok(Self {
            client,
            endpoint,
            key: key.into(),
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn transport_error(err: reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout)
    } else {
        TransportError::Request(err.to_string())
    }
}

#[async_trait]
impl DecideService for HttpDecideService {
    async fn decide(&self, request: &RemoteRuleRequest) -> std::result::Result<RemoteRuleResponse, TransportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.key)
            .json(request)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status { status, body });
        }

        response
            .json::<RemoteRuleResponse>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Quota shape of a rate limit rule
#[derive(Debug, Clone, Copy)]
struct Limit {
    max: u32,
    burst: u32,
    window: u32,
    /// Time to replenish one cell
    period: Duration,
}

impl Limit {
    fn of(rule: &Rule) -> Option<Self> {
        let (max, burst, window, per) = match rule {
            Rule::FixedWindow(r) => (r.max, r.max, r.window, r.max),
            Rule::SlidingWindow(r) => (r.max, r.max, r.interval, r.max),
            Rule::TokenBucket(r) => (r.capacity, r.capacity, r.interval, r.refill_rate),
            _ => return None,
        };
        let period = Duration::from_secs(u64::from(window)) / per.max(1);
        Some(Self {
            max,
            burst,
            window,
            period,
        })
    }

    fn quota(&self) -> Option<Quota> {
        let burst = NonZeroU32::new(self.burst)?;
        Some(Quota::with_period(self.period)?.allow_burst(burst))
    }

    /// Idle time after which a limiter is back to a full burst
    fn idle_after(&self) -> Duration {
        let refill = self.period.saturating_mul(self.burst);
        refill.max(Duration::from_secs(u64::from(self.window)))
    }
}

#[derive(Debug)]
struct Tracked {
    limiter: Arc<DirectLimiter>,
    idle_after: Duration,
    last_seen: Instant,
}

/// In-process decision service
///
/// Keeps one governor limiter per rule and client fingerprint, the way the
/// proxy's per-IP limiter works. Shield never triggers. Limiters left idle
/// past their window are dropped by [`cleanup`](Self::cleanup).
#[derive(Debug, Clone, Default)]
pub struct LocalDecideService {
    limiters: Arc<DashMap<String, Tracked>>,
}

impl LocalDecideService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked (rule, client) pairs
    pub fn tracked(&self) -> usize {
        self.limiters.len()
    }

    fn limiter(&self, request: &RemoteRuleRequest, limit: &Limit) -> std::result::Result<Arc<DirectLimiter>, TransportError> {
        let key = format!(
            "{}|{}|{}|{}",
            request.rule_id,
            limit.period.as_nanos(),
            limit.burst,
            request.fingerprint
        );
        let now = Instant::now();
        if let Some(mut tracked) = self.limiters.get_mut(&key) {
            tracked.last_seen = now;
            return Ok(Arc::clone(&tracked.limiter));
        }

        let quota = limit
            .quota()
            .ok_or(TransportError::Unsupported("rate limit with a zero period"))?;
        let mut tracked = self.limiters.entry(key).or_insert_with(|| Tracked {
            limiter: Arc::new(RateLimiter::direct(quota)),
            idle_after: limit.idle_after(),
            last_seen: now,
        });
        tracked.last_seen = now;
        Ok(Arc::clone(&tracked.limiter))
    }

    /// Drop limiters idle for longer than their window, returning how many
    /// were removed. A dropped limiter would have been full again anyway.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let before = self.limiters.len();
        self.limiters
            .retain(|_, tracked| now.duration_since(tracked.last_seen) <= tracked.idle_after);
        let removed = before.saturating_sub(self.limiters.len());

        gauge!("protect_local_limiters", self.limiters.len() as f64);
        if removed > 0 {
            debug!(removed = removed, remaining = self.limiters.len(), "Dropped idle rate limiters");
        }
        removed
    }

    /// Start a background task running [`cleanup`](Self::cleanup) every `every`
    pub fn start_cleanup_task(&self, every: Duration) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                ticker.tick().await;
                service.cleanup();
            }
        })
    }

    fn rate_limit(&self, request: &RemoteRuleRequest, limit: Limit) -> std::result::Result<RemoteRuleResponse, TransportError> {
        let limiter = self.limiter(request, &limit)?;

        let outcome = match &request.rule {
            Rule::TokenBucket(_) => {
                let tokens = NonZeroU32::new(request.requested.max(1)).unwrap_or(NonZeroU32::MIN);
                match limiter.check_n(tokens) {
                    Ok(verdict) => verdict,
                    // More tokens than the bucket can ever hold
                    Err(_) => {
                        return Ok(rate_limited(&limit, Duration::from_secs(u64::from(limit.window))));
                    }
                }
            }
            _ => limiter.check(),
        };

        match outcome {
            Ok(()) => Ok(RemoteRuleResponse {
                conclusion: Conclusion::Allow,
                reason: Reason::RateLimit {
                    max: limit.max,
                    remaining: None,
                    reset_seconds: 0,
                    window_seconds: u64::from(limit.window),
                    reset_time: None,
                },
                ttl: 0,
                ip_details: None,
            }),
            Err(not_until) => {
                let wait = not_until.wait_time_from(DefaultClock::default().now());
                counter!("protect_local_rate_limited_total", 1);
                debug!(
                    rule_id = %request.rule_id,
                    fingerprint = %request.fingerprint,
                    wait_ms = wait.as_millis() as u64,
                    "Rate limit exceeded"
                );
                Ok(rate_limited(&limit, wait))
            }
        }
    }
}

fn rate_limited(limit: &Limit, wait: Duration) -> RemoteRuleResponse {
    // Whole seconds, rounded up
    let reset_seconds = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    let reset_seconds = reset_seconds.max(1);
    let reset_time = chrono::Duration::from_std(wait)
        .ok()
        .map(|delta| Utc::now() + delta);

    RemoteRuleResponse {
        conclusion: Conclusion::Deny,
        reason: Reason::RateLimit {
            max: limit.max,
            remaining: Some(0),
            reset_seconds,
            window_seconds: u64::from(limit.window),
            reset_time,
        },
        ttl: u32::try_from(reset_seconds).unwrap_or(u32::MAX),
        ip_details: None,
    }
}

#[async_trait]
impl DecideService for LocalDecideService {
    async fn decide(&self, request: &RemoteRuleRequest) -> std::result::Result<RemoteRuleResponse, TransportError> {
        if let Some(limit) = Limit::of(&request.rule) {
            return self.rate_limit(request, limit);
        }

        match &request.rule {
            Rule::Shield(_) => Ok(RemoteRuleResponse {
                conclusion: Conclusion::Allow,
                reason: Reason::Shield {
                    shield_triggered: false,
                },
                ttl: 0,
                ip_details: None,
            }),
            other => Err(TransportError::Unsupported(other.kind())),
        }
    }
}
