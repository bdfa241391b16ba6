// Rule Evaluation Pipeline - Runs configured rules for one request
//
// Rules run in configuration order. Local rules call the analysis component;
// consecutive remote rules are issued together and collected as they
// complete. A failing rule becomes an ERROR result and the pipeline moves on,
// unless fail-closed or short-circuit finalizes the request, in which case
// the remaining rules are recorded as not run. Component calls run on the
// blocking pool so a long analysis never stalls other evaluations.

use std::sync::Arc;
use std::time::{Duration, Instant};

use analyze_host::{Analyzer, EmailValidity};
use futures::stream::{FuturesUnordered, StreamExt};
use metrics::{counter, histogram};
use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::decision::{Conclusion, IpDetails, Reason, RuleResult, RuleState};
use crate::error::{ProtectError, Result};
use crate::fingerprint::Fingerprint;
use crate::remote::{DecideService, RemoteRuleRequest};
use crate::rules::{Mode, Rule};

/// Results of one pipeline run, in configuration order
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub results: Vec<RuleResult>,
    /// IP details reported by the decision service
    pub ip: Option<IpDetails>,
}

/// Per-request policy
#[derive(Debug, Clone, Copy)]
pub struct EvaluationPolicy {
    pub mode: Mode,
    pub fail_open: bool,
    pub short_circuit: bool,
}

/// Shared, read-only rule runner
#[derive(Clone)]
pub struct Pipeline {
    analyzer: Option<Arc<dyn Analyzer>>,
    decide: Arc<dyn DecideService>,
    remote_timeout: Duration,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("analyzer", &self.analyzer.is_some())
            .field("remote_timeout", &self.remote_timeout)
            .finish()
    }
}

struct Pending {
    index: usize,
    request: RemoteRuleRequest,
    state: RuleState,
    kind: &'static str,
}

impl Pipeline {
    pub fn new(analyzer: Option<Arc<dyn Analyzer>>, decide: Arc<dyn DecideService>, remote_timeout: Duration) -> Self {
        Self {
            analyzer,
            decide,
            remote_timeout,
        }
    }

    /// Check that `rules` can run against this pipeline at all
    pub fn check_rules(&self, rules: &[Rule]) -> Result<()> {
        for rule in rules {
            rule.validate()?;
            if rule.needs_analyzer() && self.analyzer.is_none() {
                return Err(ProtectError::Configuration(format!(
                    "rule {} needs the analysis component but none is configured",
                    rule.kind()
                )));
            }
        }
        Ok(())
    }

    /// Evaluate every rule for `ctx`
    ///
    /// `ctx.ip` must already be the resolved client address: rules without
    /// their own characteristics are keyed on it. Only fatal errors are
    /// returned; everything else is folded into the results.
    pub async fn run(&self, ctx: &RequestContext, rules: &[Rule], policy: EvaluationPolicy) -> Result<Evaluation> {
        self.check_rules(rules)?;
        if ctx.email.is_none() && rules.iter().any(|r| matches!(r, Rule::EmailValidation(_))) {
            return Err(ProtectError::Configuration(
                "an email validation rule is configured but the request has no email".to_string(),
            ));
        }

        let request: Arc<str> = ctx.to_analysis_json()?.into();
        let default_fingerprint = Fingerprint::client_ip(ctx)
            .map(|fp| fp.as_str().to_string())
            .unwrap_or_default();

        let mut slots: Vec<Option<RuleResult>> = vec![None; rules.len()];
        let mut ip = None;
        let mut finalized = false;
        let mut index = 0;

        while index < rules.len() {
            if finalized {
                slots[index] = Some(RuleResult::not_run(rules[index].rule_id(index)));
                index += 1;
                continue;
            }

            let rule = &rules[index];
            if rule.is_local() {
                let result = self
                    .run_local(index, rule, ctx, &request, &default_fingerprint, policy.mode)
                    .await?;
                finalized = finalizes(&result, &policy);
                slots[index] = Some(result);
                index += 1;
                continue;
            }

            // Run of consecutive remote rules
            let start = index;
            while index < rules.len() && !rules[index].is_local() {
                index += 1;
            }

            let mut pending = Vec::new();
            for (offset, rule) in rules[start..index].iter().enumerate() {
                let position = start + offset;
                let rule_id = rule.rule_id(position);
                let state = rule_state(rule, policy.mode);
                let fingerprint = match declared_characteristics(rule) {
                    Some(characteristics) => {
                        let request = Arc::clone(&request);
                        self.with_analyzer(move |analyzer| rule_fingerprint(analyzer, &request, &characteristics))
                            .await
                    }
                    None => Ok(default_fingerprint.clone()),
                };
                match fingerprint {
                    Ok(fp) => pending.push(Pending {
                        index: position,
                        request: RemoteRuleRequest {
                            rule_id,
                            rule: rule.clone(),
                            fingerprint: fp,
                            context: ctx.clone(),
                            requested: ctx.requested.unwrap_or(1),
                        },
                        state,
                        kind: rule.kind(),
                    }),
                    Err(e) => slots[position] = Some(recover(rule_id, state, rule.kind(), e)?),
                }
            }

            let mut in_flight = pending
                .into_iter()
                .map(|p| self.run_remote(p))
                .collect::<FuturesUnordered<_>>();
            while let Some((position, result, details)) = in_flight.next().await {
                if ip.is_none() {
                    ip = details;
                }
                slots[position] = Some(result);
            }

            finalized = slots[start..index]
                .iter()
                .flatten()
                .any(|result| finalizes(result, &policy));
        }

        let results = slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| slot.unwrap_or_else(|| RuleResult::not_run(rules[i].rule_id(i))))
            .collect();
        Ok(Evaluation { results, ip })
    }

    /// Run `call` against the component on the blocking pool
    async fn with_analyzer<T, F>(&self, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Analyzer) -> Result<T> + Send + 'static,
    {
        let analyzer = Arc::clone(
            self.analyzer
                .as_ref()
                .ok_or_else(|| ProtectError::Configuration("analysis component is not configured".to_string()))?,
        );
        tokio::task::spawn_blocking(move || call(analyzer.as_ref()))
            .await
            .map_err(|e| ProtectError::RuleEvaluation(format!("analysis task failed: {}", e)))?
    }

    async fn run_local(
        &self,
        index: usize,
        rule: &Rule,
        ctx: &RequestContext,
        request: &Arc<str>,
        default_fingerprint: &str,
        mode: Mode,
    ) -> Result<RuleResult> {
        let rule_id = rule.rule_id(index);
        let state = rule_state(rule, mode);
        let started = Instant::now();

        let characteristics = declared_characteristics(rule);
        let default_fingerprint = default_fingerprint.to_string();
        let owned_rule = rule.clone();
        let owned_ctx = ctx.clone();
        let request = Arc::clone(request);
        let evaluated = self
            .with_analyzer(move |analyzer| {
                let fp = match characteristics {
                    Some(characteristics) => rule_fingerprint(analyzer, &request, &characteristics)?,
                    None => default_fingerprint,
                };
                let verdict = evaluate_local(analyzer, &owned_rule, &owned_ctx, &request)?;
                Ok((fp, verdict))
            })
            .await;

        histogram!(
            "protect_rule_duration_seconds",
            started.elapsed().as_secs_f64(),
            "kind" => rule.kind()
        );

        match evaluated {
            Ok((fp, (conclusion, reason))) => {
                Ok(record(RuleResult::new(rule_id, state, conclusion, reason, 0).with_fingerprint(Some(fp))))
            }
            Err(e) => recover(rule_id, state, rule.kind(), e),
        }
    }

    async fn run_remote(&self, pending: Pending) -> (usize, RuleResult, Option<IpDetails>) {
        let Pending {
            index,
            request,
            state,
            kind,
        } = pending;
        let started = Instant::now();

        let outcome = tokio::time::timeout(self.remote_timeout, self.decide.decide(&request)).await;

        histogram!(
            "protect_rule_duration_seconds",
            started.elapsed().as_secs_f64(),
            "kind" => kind
        );

        let fingerprint = Some(request.fingerprint);
        let failure = match outcome {
            Ok(Ok(response)) => {
                let result = RuleResult::new(request.rule_id, state, response.conclusion, response.reason, response.ttl)
                    .with_fingerprint(fingerprint);
                return (index, record(result), response.ip_details);
            }
            Ok(Err(e)) => ProtectError::from(e),
            Err(_) => ProtectError::Transport(format!("timed out after {:?}", self.remote_timeout)),
        };

        // Transport failures are never fatal
        let result = match recover(request.rule_id.clone(), state, kind, failure) {
            Ok(result) => result,
            Err(e) => RuleResult::error(request.rule_id, state, e.to_string()),
        };
        (index, result.with_fingerprint(fingerprint), None)
    }
}

/// Characteristics the component fingerprints for `rule`, if it declares any
fn declared_characteristics(rule: &Rule) -> Option<Vec<String>> {
    let characteristics: Vec<String> = rule.characteristics().into_iter().map(str::to_string).collect();
    (!characteristics.is_empty()).then_some(characteristics)
}

/// Fingerprint generated by the component from declared characteristics
fn rule_fingerprint(analyzer: &dyn Analyzer, request: &str, characteristics: &[String]) -> Result<String> {
    analyzer.validate_characteristics(request, characteristics)?;
    Ok(analyzer.generate_fingerprint(request, characteristics)?)
}

fn evaluate_local(analyzer: &dyn Analyzer, rule: &Rule, ctx: &RequestContext, request: &str) -> Result<(Conclusion, Reason)> {
    match rule {
        Rule::BotDetection(r) => {
            let result = analyzer.detect_bot(request, &r.to_config())?;
            let conclusion = if !result.denied.is_empty() || result.spoofed {
                Conclusion::Deny
            } else {
                Conclusion::Allow
            };
            Ok((
                conclusion,
                Reason::Bot {
                    allowed: result.allowed,
                    denied: result.denied,
                    verified: result.verified,
                    spoofed: result.spoofed,
                },
            ))
        }
        Rule::EmailValidation(r) => {
            let email = ctx.email.as_deref().ok_or_else(|| {
                ProtectError::Configuration("email validation needs an email on the request".to_string())
            })?;
            let result = analyzer.is_valid_email(email, &r.to_config())?;
            let mut email_types = result.blocked;
            let conclusion = if result.validity == EmailValidity::Invalid || !email_types.is_empty() {
                if email_types.is_empty() {
                    email_types.push("INVALID".to_string());
                }
                Conclusion::Deny
            } else {
                Conclusion::Allow
            };
            Ok((conclusion, Reason::Email { email_types }))
        }
        Rule::SensitiveInfo(r) => {
            let Some(body) = ctx.body.as_deref() else {
                return Ok((
                    Conclusion::Allow,
                    Reason::SensitiveInfo {
                        allowed: Vec::new(),
                        denied: Vec::new(),
                    },
                ));
            };
            let result = analyzer.detect_sensitive_info(body, &r.to_config())?;
            let conclusion = if result.denied.is_empty() {
                Conclusion::Allow
            } else {
                Conclusion::Deny
            };
            Ok((
                conclusion,
                Reason::SensitiveInfo {
                    allowed: result.allowed,
                    denied: result.denied,
                },
            ))
        }
        Rule::Filter(r) => {
            let (expressions, allow_if_match) = if r.allow.is_empty() {
                (&r.deny, false)
            } else {
                (&r.allow, true)
            };
            let result = analyzer.match_filters(request, expressions, allow_if_match)?;
            let conclusion = if result.allowed {
                Conclusion::Allow
            } else {
                Conclusion::Deny
            };
            Ok((
                conclusion,
                Reason::Filter {
                    matched_expressions: result.matched_expressions,
                    undetermined_expressions: result.undetermined_expressions,
                },
            ))
        }
        other => Err(ProtectError::RuleEvaluation(format!(
            "rule {} is not evaluated locally",
            other.kind()
        ))),
    }
}

fn rule_state(rule: &Rule, mode: Mode) -> RuleState {
    match rule.mode().combine(mode) {
        Mode::Live => RuleState::Run,
        Mode::DryRun => RuleState::DryRun,
    }
}

/// Whether `result` makes the decision final
fn finalizes(result: &RuleResult, policy: &EvaluationPolicy) -> bool {
    if result.state != RuleState::Run {
        return false;
    }
    match result.conclusion {
        Conclusion::Deny => policy.short_circuit,
        Conclusion::Error => !policy.fail_open,
        _ => false,
    }
}

fn record(result: RuleResult) -> RuleResult {
    debug!(
        rule_id = %result.rule_id,
        state = ?result.state,
        conclusion = result.conclusion.as_str(),
        ttl = result.ttl,
        "Rule evaluated"
    );
    result
}

/// Turn a rule failure into an ERROR result; fatal errors propagate
fn recover(rule_id: String, state: RuleState, kind: &'static str, err: ProtectError) -> Result<RuleResult> {
    if err.is_fatal() {
        return Err(err);
    }
    warn!(rule_id = %rule_id, error = %err, "Rule evaluation failed");
    counter!("protect_rule_errors_total", 1, "kind" => kind);
    Ok(RuleResult::error(rule_id, state, err.to_string()))
}
