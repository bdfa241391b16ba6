// Client - Protector facade in async and blocking flavors
//
// Both flavors share one `Protector` core: resolve the client IP, derive the
// fingerprint, consult the decision cache, run the pipeline, aggregate and
// cache. The blocking flavor drives the same future on its own runtime.

use std::sync::Arc;
use std::time::{Duration, Instant};

use analyze_host::{AnalyzeComponent, Analyzer, HostImports};
use ipnet::IpNet;
use metrics::{counter, histogram};
use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::aggregate::aggregate;
use crate::cache::{DecisionCache, DecisionStore, MemoryDecisionStore};
use crate::config::ProtectConfig;
use crate::context::RequestContext;
use crate::decision::Decision;
use crate::error::{ProtectError, Result};
use crate::fingerprint::{rule_characteristics, Fingerprint};
use crate::pipeline::{EvaluationPolicy, Pipeline};
use crate::remote::{DecideService, HttpDecideService};
use crate::rules::{Mode, Rule};

/// Extra reported to the decision service when the caller chose the client IP
pub const MANUAL_IP_EXTRA: &str = "protect_disable_automatic_ip_detection";

/// Builder for `Protector` and `BlockingProtector`
pub struct ProtectorBuilder {
    config: ProtectConfig,
    rules: Vec<Rule>,
    analyzer: Option<Arc<dyn Analyzer>>,
    decide: Option<Arc<dyn DecideService>>,
    store: Option<Arc<dyn DecisionStore>>,
    imports: HostImports,
}

impl ProtectorBuilder {
    pub fn new(config: ProtectConfig) -> Self {
        Self {
            config,
            rules: Vec::new(),
            analyzer: None,
            decide: None,
            store: None,
            imports: HostImports::with_defaults(),
        }
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(mut self, rules: impl IntoIterator<Item = Rule>) -> Self {
        self.rules.extend(rules);
        self
    }

    /// Use `analyzer` instead of loading `analyze.component_path`
    pub fn analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn decide_service(mut self, decide: Arc<dyn DecideService>) -> Self {
        self.decide = Some(decide);
        self
    }

    pub fn decision_store(mut self, store: Arc<dyn DecisionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Host imports wired into the component when it is loaded from file
    pub fn imports(mut self, imports: HostImports) -> Self {
        self.imports = imports;
        self
    }

    /// Build the async protector
    ///
    /// Starts the cache sweeper when configured and a runtime is running.
    pub fn build(self) -> Result<Protector> {
        self.config.validate()?;
        for rule in &self.rules {
            rule.validate()?;
        }

        let analyzer = match (self.analyzer, &self.config.analyze.component_path) {
            (Some(analyzer), _) => Some(analyzer),
            (None, Some(path)) => {
                let component = AnalyzeComponent::from_file(path, self.config.analyze.limits(), &self.imports)?;
                Some(Arc::new(component) as Arc<dyn Analyzer>)
            }
            (None, None) => None,
        };

        let decide = match self.decide {
            Some(decide) => decide,
            None => Arc::new(HttpDecideService::new(
                &self.config.base_url,
                self.config.key.clone(),
                self.config.timeout(),
            )?),
        };

        let pipeline = Pipeline::new(analyzer, decide, self.config.timeout());
        pipeline.check_rules(&self.rules)?;

        let cache = self.config.cache.enabled.then(|| {
            let store = self
                .store
                .unwrap_or_else(|| Arc::new(MemoryDecisionStore::new(self.config.cache.max_entries)));
            DecisionCache::new(store)
        });

        let sweeper = match (&cache, self.config.cache.sweep_interval_seconds) {
            (Some(cache), Some(seconds)) if Handle::try_current().is_ok() => {
                Some(cache.start_sweep_task(Duration::from_secs(seconds)))
            }
            _ => None,
        };

        info!(
            environment = %self.config.environment,
            rules = self.rules.len(),
            fail_open = self.config.fail_open,
            short_circuit = self.config.short_circuit,
            cache_enabled = cache.is_some(),
            "Protector initialized"
        );

        Ok(Protector {
            inner: Arc::new(Inner {
                proxies: self.config.trusted_proxies()?,
                config: self.config,
                rules: self.rules,
                pipeline,
                cache,
                sweeper,
            }),
        })
    }

    /// Build the blocking protector on its own current-thread runtime
    pub fn build_blocking(self) -> Result<BlockingProtector> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ProtectError::Configuration(format!("Failed to start runtime: {}", e)))?;

        let protector = {
            let _guard = runtime.enter();
            self.build()?
        };
        Ok(BlockingProtector { runtime, protector })
    }
}

struct Inner {
    config: ProtectConfig,
    rules: Vec<Rule>,
    proxies: Vec<IpNet>,
    pipeline: Pipeline,
    cache: Option<DecisionCache>,
    sweeper: Option<JoinHandle<()>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

/// Request protector; cheap to clone and share across tasks
#[derive(Clone)]
pub struct Protector {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Protector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protector")
            .field("rules", &self.inner.rules.len())
            .field("pipeline", &self.inner.pipeline)
            .field("cache", &self.inner.cache)
            .finish()
    }
}

impl Protector {
    pub fn builder(config: ProtectConfig) -> ProtectorBuilder {
        ProtectorBuilder::new(config)
    }

    pub fn config(&self) -> &ProtectConfig {
        &self.inner.config
    }

    pub fn rules(&self) -> &[Rule] {
        &self.inner.rules
    }

    /// Evaluate the configured rules live under the configured failure policy
    pub async fn protect(&self, ctx: &RequestContext) -> Result<Decision> {
        self.evaluate(ctx, &self.inner.rules, Mode::Live, self.inner.config.fail_open)
            .await
    }

    /// `ctx` with `ip` set to the client address the rules should see
    fn client_context(&self, ctx: &RequestContext) -> Result<RequestContext> {
        let manual = self.inner.config.disable_automatic_ip_detection;
        match (manual, ctx.ip_src.as_deref()) {
            (true, Some(ip)) => {
                let mut resolved = ctx.clone();
                resolved.ip = ip.to_string();
                resolved.ip_src = None;
                resolved
                    .extra
                    .insert(MANUAL_IP_EXTRA.to_string(), "true".to_string());
                Ok(resolved)
            }
            (true, None) => Err(ProtectError::Configuration(
                "ip_src is required when disable_automatic_ip_detection is set".to_string(),
            )),
            (false, Some(_)) => Err(ProtectError::Configuration(
                "ip_src cannot be set unless disable_automatic_ip_detection is set".to_string(),
            )),
            (false, None) => Ok(ctx.with_resolved_ip(&self.inner.proxies)),
        }
    }

    /// Evaluate `rules` for `ctx`
    ///
    /// `mode` applies on top of each rule's own mode. Only configuration
    /// errors and execution-context reuse are returned as errors; every
    /// other failure is part of the decision. Dropping the future before it
    /// completes caches nothing.
    pub async fn evaluate(&self, ctx: &RequestContext, rules: &[Rule], mode: Mode, fail_open: bool) -> Result<Decision> {
        let started = Instant::now();
        let inner = &self.inner;

        let ctx = self.client_context(ctx)?;
        let fingerprint = Fingerprint::derive(&ctx, &inner.config.fingerprint_headers, &rule_characteristics(rules));

        let cache_key = match (&inner.cache, &fingerprint) {
            (Some(_), Some(fp)) => Some(fp.cache_key(rules, mode, fail_open)?),
            _ => None,
        };

        if let (Some(cache), Some(key)) = (&inner.cache, &cache_key) {
            if let Some(decision) = cache.get(key) {
                counter!("protect_decisions_total", 1, "conclusion" => decision.conclusion().as_str(), "source" => "cache");
                return Ok(decision);
            }
        }

        let policy = EvaluationPolicy {
            mode,
            fail_open,
            short_circuit: inner.config.short_circuit,
        };
        let evaluation = inner.pipeline.run(&ctx, rules, policy).await?;
        let decision = aggregate(evaluation.results, fail_open, evaluation.ip);

        if let (Some(cache), Some(key)) = (&inner.cache, &cache_key) {
            cache.put(key, &decision);
        }

        let elapsed = started.elapsed();
        counter!("protect_decisions_total", 1, "conclusion" => decision.conclusion().as_str(), "source" => "pipeline");
        histogram!("protect_evaluation_duration_seconds", elapsed.as_secs_f64());
        debug!(
            decision_id = %decision.id(),
            conclusion = decision.conclusion().as_str(),
            fingerprint = fingerprint.as_ref().map(Fingerprint::as_str).unwrap_or(""),
            ttl = decision.ttl(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Request evaluated"
        );

        Ok(decision)
    }
}

/// Blocking protector; each call blocks the calling thread
///
/// Must not be used from inside an async runtime.
#[derive(Debug)]
pub struct BlockingProtector {
    runtime: Runtime,
    protector: Protector,
}

impl BlockingProtector {
    pub fn builder(config: ProtectConfig) -> ProtectorBuilder {
        ProtectorBuilder::new(config)
    }

    pub fn config(&self) -> &ProtectConfig {
        self.protector.config()
    }

    pub fn protect(&self, ctx: &RequestContext) -> Result<Decision> {
        self.runtime.block_on(self.protector.protect(ctx))
    }

    pub fn evaluate(&self, ctx: &RequestContext, rules: &[Rule], mode: Mode, fail_open: bool) -> Result<Decision> {
        self.runtime
            .block_on(self.protector.evaluate(ctx, rules, mode, fail_open))
    }
}
