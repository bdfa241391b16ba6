// Engine Module - Lifecycle of the analysis component and per-call execution
//
// This module provides:
// - Compilation of the component and validation of its exports at load time
// - Import linkage resolved once, before the first call
// - A fresh execution context (store + instance) for every exported call,
//   with fuel and memory limits applied per context

use std::path::Path;
use std::time::Instant;

use metrics::histogram;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use wasmtime::component::types::{ComponentFunc, ComponentItem};
use wasmtime::component::{Component, Instance, InstancePre, Linker, Type, Val};
use wasmtime::{Config, Engine, Store, StoreLimits, StoreLimitsBuilder};

use crate::abi::*;
use crate::analyzer::Analyzer;
use crate::convert::{decode_result, FromVal, ToVal};
use crate::error::{AnalyzeError, Result};
use crate::imports::HostImports;
use crate::types::*;

/// Resource limits applied to every execution context
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzeConfig {
    /// Fuel (roughly, wasm instructions) granted to each call
    pub max_fuel: u64,

    /// Maximum linear memory per instance (bytes)
    /// Default: 128 MB
    pub max_memory_bytes: usize,

    /// Enable the wasmtime compilation cache
    pub cache_enabled: bool,
}

impl Default for AnalyzeConfig {
    fn default() -> Self {
        Self {
            max_fuel: 1_000_000_000,
            max_memory_bytes: 128 * 1024 * 1024,
            cache_enabled: true,
        }
    }
}

/// Per-context host state
pub struct HostState {
    limits: StoreLimits,
}

/// The compiled analysis component and its resolved import linkage
///
/// Everything held here is read-only after construction. Calls never share
/// mutable state: each one builds its own `ExecutionContext`.
pub struct AnalyzeComponent {
    engine: Engine,
    pre: InstancePre<HostState>,
    config: AnalyzeConfig,
}

impl AnalyzeComponent {
    /// Compile a component from binary (or WAT text) and link `imports`
    pub fn new(bytes: impl AsRef<[u8]>, config: AnalyzeConfig, imports: &HostImports) -> Result<Self> {
        let engine = Self::build_engine(&config)?;
        let component = Component::new(&engine, bytes)
            .map_err(|e| AnalyzeError::Config(format!("Failed to compile component: {:#}", e)))?;
        Self::link(engine, component, config, imports)
    }

    /// Compile the component stored at `path`
    pub fn from_file(path: impl AsRef<Path>, config: AnalyzeConfig, imports: &HostImports) -> Result<Self> {
        let path = path.as_ref();
        let engine = Self::build_engine(&config)?;
        let component = Component::from_file(&engine, path).map_err(|e| {
            AnalyzeError::Config(format!("Failed to load component {}: {:#}", path.display(), e))
        })?;
        Self::link(engine, component, config, imports)
    }

    fn build_engine(config: &AnalyzeConfig) -> Result<Engine> {
        let mut engine_config = Config::new();
        engine_config.wasm_component_model(true);
        engine_config.consume_fuel(true);

        if config.cache_enabled {
            if let Err(e) = engine_config.cache_config_load_default() {
                warn!("Failed to load wasmtime cache config: {}", e);
            }
        }

        Engine::new(&engine_config)
            .map_err(|e| AnalyzeError::Config(format!("Failed to create wasmtime engine: {}", e)))
    }

    fn link(engine: Engine, component: Component, config: AnalyzeConfig, imports: &HostImports) -> Result<Self> {
        Self::check_exports(&engine, &component)?;

        if !imports.is_fully_wired() {
            warn!(imports = ?imports, "Some host imports are not wired and will trap when called");
        }

        let mut linker = Linker::new(&engine);
        imports
            .link(&mut linker)
            .map_err(|e| AnalyzeError::Config(format!("Failed to link host imports: {:#}", e)))?;

        // Resolves every import now, so an interface mismatch is reported at
        // load time rather than on the first call
        let pre = linker
            .instantiate_pre(&component)
            .map_err(|e| AnalyzeError::Config(format!("Component imports do not match {}: {:#}", WORLD_VERSION, e)))?;

        info!(
            world = WORLD_VERSION,
            max_fuel = config.max_fuel,
            max_memory_bytes = config.max_memory_bytes,
            "Analysis component loaded"
        );

        Ok(Self {
            engine,
            pre,
            config,
        })
    }

    fn check_exports(engine: &Engine, component: &Component) -> Result<()> {
        let ty = component.component_type();

        for signature in &EXPORT_SIGNATURES {
            let func = match ty.get_export(engine, signature.name) {
                Some(ComponentItem::ComponentFunc(func)) => func,
                Some(_) => {
                    return Err(AnalyzeError::Config(format!(
                        "Component export `{}` is not a function ({})",
                        signature.name, WORLD_VERSION
                    )))
                }
                None => {
                    return Err(AnalyzeError::Config(format!(
                        "Component must export `{}` ({})",
                        signature.name, WORLD_VERSION
                    )))
                }
            };

            if !matches_signature(&func, signature) {
                return Err(AnalyzeError::Config(format!(
                    "Component export `{}` does not match {}: expected {}",
                    signature.name, WORLD_VERSION, signature
                )));
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &AnalyzeConfig {
        &self.config
    }

    /// Build a fresh execution context
    pub fn context(&self) -> Result<ExecutionContext> {
        let limits = StoreLimitsBuilder::new()
            .memory_size(self.config.max_memory_bytes)
            .build();
        let mut store = Store::new(&self.engine, HostState { limits });
        store.limiter(|state| &mut state.limits);
        store
            .set_fuel(self.config.max_fuel)
            .map_err(|e| AnalyzeError::Config(format!("Failed to set fuel limit: {}", e)))?;

        let instance = self
            .pre
            .instantiate(&mut store)
            .map_err(|e| AnalyzeError::Trap(format!("Failed to instantiate component: {:#}", e)))?;

        Ok(ExecutionContext {
            store,
            instance,
            max_fuel: self.config.max_fuel,
            spent: None,
        })
    }

    fn call(&self, name: &'static str, params: &[Val]) -> Result<Val> {
        let start = Instant::now();
        let result = self.context().and_then(|mut ctx| ctx.invoke(name, params));
        histogram!(
            "analyze_call_duration_seconds",
            start.elapsed().as_secs_f64(),
            "export" => name
        );
        result
    }

    fn call_result<T: FromVal>(&self, name: &'static str, params: &[Val]) -> Result<T> {
        let val = self.call(name, params)?;
        decode_result::<T>(&val)?.map_err(AnalyzeError::Guest)
    }
}

impl Analyzer for AnalyzeComponent {
    fn match_filters(&self, request: &str, expressions: &[String], allow_if_match: bool) -> Result<FilterResult> {
        self.call_result(
            MATCH_FILTERS_FN,
            &[request.to_val(), expressions.to_val(), allow_if_match.to_val()],
        )
    }

    fn detect_bot(&self, request: &str, options: &BotConfig) -> Result<BotResult> {
        self.call_result(DETECT_BOT_FN, &[request.to_val(), options.to_val()])
    }

    fn generate_fingerprint(&self, request: &str, characteristics: &[String]) -> Result<String> {
        self.call_result(
            GENERATE_FINGERPRINT_FN,
            &[request.to_val(), characteristics.to_val()],
        )
    }

    fn validate_characteristics(&self, request: &str, characteristics: &[String]) -> Result<()> {
        self.call_result(
            VALIDATE_CHARACTERISTICS_FN,
            &[request.to_val(), characteristics.to_val()],
        )
    }

    fn is_valid_email(&self, candidate: &str, options: &EmailValidationConfig) -> Result<EmailValidationResult> {
        self.call_result(IS_VALID_EMAIL_FN, &[candidate.to_val(), options.to_val()])
    }

    fn detect_sensitive_info(&self, content: &str, options: &SensitiveInfoConfig) -> Result<SensitiveInfoResult> {
        let val = self.call(DETECT_SENSITIVE_INFO_FN, &[content.to_val(), options.to_val()])?;
        Ok(SensitiveInfoResult::from_val(&val)?)
    }
}

fn matches_signature(func: &ComponentFunc, signature: &ExportSignature) -> bool {
    let params: Vec<Type> = func.params().map(|(_, ty)| ty).collect();
    let results: Vec<Type> = func.results().collect();

    params.len() == signature.params.len()
        && params.iter().zip(signature.params).all(|(ty, shape)| conforms(ty, shape))
        && matches!(results.as_slice(), [ty] if conforms(ty, &signature.result))
}

fn conforms(ty: &Type, shape: &Shape) -> bool {
    match (ty, shape) {
        (Type::Bool, Shape::Bool) | (Type::U32, Shape::U32) | (Type::String, Shape::String) => true,
        (Type::List(list), Shape::List(inner)) => conforms(&list.ty(), inner),
        (Type::Option(option), Shape::Option(inner)) => conforms(&option.ty(), inner),
        (Type::Result(result), Shape::Result(ok, err)) => {
            payload_conforms(result.ok(), *ok) && payload_conforms(result.err(), *err)
        }
        (Type::Record(record), Shape::Record(fields)) => {
            record.fields().len() == fields.len()
                && record
                    .fields()
                    .zip(fields.iter())
                    .all(|(field, (name, shape))| field.name == *name && conforms(&field.ty, shape))
        }
        (Type::Variant(variant), Shape::Variant(cases)) => {
            variant.cases().len() == cases.len()
                && variant
                    .cases()
                    .zip(cases.iter())
                    .all(|(case, (name, shape))| case.name == *name && payload_conforms(case.ty, shape.as_ref()))
        }
        (Type::Enum(en), Shape::Enum(names)) => en.names().eq(names.iter().copied()),
        _ => false,
    }
}

fn payload_conforms(ty: Option<Type>, shape: Option<&Shape>) -> bool {
    match (ty, shape) {
        (None, None) => true,
        (Some(ty), Some(shape)) => conforms(&ty, shape),
        _ => false,
    }
}

/// A store and instance good for exactly one exported call
///
/// Released when dropped, on every exit path.
pub struct ExecutionContext {
    store: Store<HostState>,
    instance: Instance,
    max_fuel: u64,
    spent: Option<&'static str>,
}

impl ExecutionContext {
    /// Invoke export `name`; fails if this context was already used
    pub fn invoke(&mut self, name: &'static str, params: &[Val]) -> Result<Val> {
        if let Some(previous) = self.spent {
            return Err(AnalyzeError::ExecutionContextExhausted(format!(
                "`{}` invoked through a context already used for `{}`",
                name, previous
            )));
        }
        self.spent = Some(name);

        let func = self
            .instance
            .get_func(&mut self.store, name)
            .ok_or_else(|| AnalyzeError::Config(format!("Component does not export `{}`", name)))?;

        let mut results = vec![Val::Bool(false)];
        func.call(&mut self.store, params, &mut results)
            .map_err(|e| AnalyzeError::Trap(format!("`{}` failed: {:#}", name, e)))?;
        func.post_return(&mut self.store)
            .map_err(|e| AnalyzeError::Trap(format!("`{}` post-return failed: {:#}", name, e)))?;

        let fuel_consumed = self.max_fuel.saturating_sub(self.store.get_fuel().unwrap_or(0));
        debug!(export = name, fuel_consumed, "Component call completed");

        results
            .pop()
            .ok_or_else(|| AnalyzeError::Trap(format!("`{}` produced no result", name)))
    }

    pub fn is_spent(&self) -> bool {
        self.spent.is_some()
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        debug!(export = self.spent.unwrap_or("<unused>"), "Execution context released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STUB_COMPONENT: &str = include_str!("../tests/fixtures/analyze_stub.wat");

    // Right export names, wrong shapes
    const NULLARY_COMPONENT: &str = r#"
        (component
          (core module $m (func (export "seven") (result i32) i32.const 7))
          (core instance $i (instantiate $m))
          (func (export "match-filters") (result u32) (canon lift (core func $i "seven")))
          (func (export "detect-bot") (result u32) (canon lift (core func $i "seven")))
          (func (export "generate-fingerprint") (result u32) (canon lift (core func $i "seven")))
          (func (export "validate-characteristics") (result u32) (canon lift (core func $i "seven")))
          (func (export "is-valid-email") (result u32) (canon lift (core func $i "seven")))
          (func (export "detect-sensitive-info") (result u32) (canon lift (core func $i "seven")))
        )
    "#;

    fn test_config() -> AnalyzeConfig {
        AnalyzeConfig {
            max_fuel: 100_000,
            max_memory_bytes: 1024 * 1024,
            cache_enabled: false,
        }
    }

    fn stub() -> AnalyzeComponent {
        AnalyzeComponent::new(STUB_COMPONENT, test_config(), &HostImports::with_defaults()).unwrap()
    }

    fn fingerprint_params() -> Vec<Val> {
        vec!["{}".to_val(), vec!["ip.src".to_string()].to_val()]
    }

    #[test]
    fn test_default_config() {
        let config = AnalyzeConfig::default();
        assert!(config.max_fuel > 0);
        assert_eq!(config.max_memory_bytes, 128 * 1024 * 1024);
        assert!(config.cache_enabled);
    }

    #[test]
    fn test_load_and_invoke() {
        let component = stub();
        let mut ctx = component.context().unwrap();
        assert!(!ctx.is_spent());
        let val = ctx.invoke(GENERATE_FINGERPRINT_FN, &fingerprint_params()).unwrap();
        assert_eq!(decode_result::<String>(&val).unwrap(), Ok(String::new()));
        assert!(ctx.is_spent());
    }

    #[test]
    fn test_typed_calls_lift_results() {
        let component = stub();
        assert_eq!(component.generate_fingerprint("{}", &["ip.src".to_string()]).unwrap(), "");

        let email = component
            .is_valid_email(
                "a@example.com",
                &EmailValidationConfig::Deny(DenyEmailValidationConfig {
                    require_top_level_domain: true,
                    allow_domain_literal: false,
                    deny: vec!["DISPOSABLE".to_string()],
                }),
            )
            .unwrap();
        assert_eq!(email.validity, EmailValidity::Valid);
        assert!(email.blocked.is_empty());

        let sensitive = component
            .detect_sensitive_info(
                "call 555-0100",
                &SensitiveInfoConfig {
                    entities: SensitiveInfoEntities::Deny(vec![
                        SensitiveInfoEntity::PhoneNumber,
                        SensitiveInfoEntity::Custom("badge".to_string()),
                    ]),
                    context_window_size: Some(2),
                    skip_custom_detect: false,
                },
            )
            .unwrap();
        assert!(sensitive.denied.is_empty());
    }

    #[test]
    fn test_spent_context_is_exhausted() {
        let component = stub();
        let mut ctx = component.context().unwrap();
        ctx.invoke(GENERATE_FINGERPRINT_FN, &fingerprint_params()).unwrap();

        let err = ctx.invoke(GENERATE_FINGERPRINT_FN, &fingerprint_params()).unwrap_err();
        assert!(matches!(err, AnalyzeError::ExecutionContextExhausted(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_fresh_context_after_trap() {
        let component = stub();

        let options = BotConfig::Denied(DeniedBotConfig {
            entities: vec!["CURL".to_string()],
            skip_custom_detect: true,
        });
        let err = component.detect_bot("{}", &options).unwrap_err();
        assert!(matches!(err, AnalyzeError::Trap(_)));
        assert!(!err.is_fatal());

        // A trap poisons only the context it happened in
        assert_eq!(component.generate_fingerprint("{}", &[]).unwrap(), "");
    }

    #[test]
    fn test_fuel_exhaustion_traps() {
        let component = stub();
        let err = component
            .validate_characteristics("{}", &["ip.src".to_string()])
            .unwrap_err();
        assert!(matches!(err, AnalyzeError::Trap(_)));
    }

    #[test]
    fn test_missing_export_is_config_error() {
        let wat = r#"
            (component
              (core module $m (func (export "seven") (result i32) i32.const 7))
              (core instance $i (instantiate $m))
              (func (export "match-filters") (result u32) (canon lift (core func $i "seven")))
            )
        "#;
        let err = AnalyzeComponent::new(wat, test_config(), &HostImports::with_defaults())
            .err()
            .unwrap();
        assert!(matches!(err, AnalyzeError::Config(ref msg) if msg.contains("must export")));
    }

    #[test]
    fn test_invalid_bytes_is_config_error() {
        let err = AnalyzeComponent::new(b"not wasm".as_slice(), test_config(), &HostImports::new())
            .err()
            .unwrap();
        assert!(matches!(err, AnalyzeError::Config(_)));
    }

    #[test]
    fn test_mismatched_signature_is_rejected_at_load() {
        let err = AnalyzeComponent::new(NULLARY_COMPONENT, test_config(), &HostImports::with_defaults())
            .err()
            .unwrap();
        match err {
            AnalyzeError::Config(msg) => {
                assert!(msg.contains("`match-filters` does not match"), "{msg}");
                assert!(msg.contains("result<record"), "{msg}");
            }
            other => panic!("expected a configuration error, got {other}"),
        }
    }

    #[test]
    fn test_changed_record_field_is_rejected_at_load() {
        // `spoofed` renamed in the component's bot-result
        let wat = STUB_COMPONENT.replace(r#"(field "spoofed" bool)"#, r#"(field "forged" bool)"#);
        let err = AnalyzeComponent::new(wat, test_config(), &HostImports::with_defaults())
            .err()
            .unwrap();
        assert!(matches!(err, AnalyzeError::Config(ref msg) if msg.contains("`detect-bot` does not match")));
    }
}
