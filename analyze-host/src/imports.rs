// Imports Module - Host functions the analysis component calls back into
//
// Five capability groups are exposed to the component. Each has a default
// implementation in `DefaultImports` and an override point on `HostImports`.
// Nothing is wired implicitly: an import left unset traps the component when
// it is called, so callers must install either an override or the default.
//
// Overrides never propagate a failure into the component. An `Err` or a panic
// is caught at the binding boundary, logged, and replaced by the interface's
// default answer.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use metrics::counter;
use tracing::{debug, warn};
use wasmtime::component::{Linker, LinkerInstance, Val};

use crate::abi::*;
use crate::convert::{FromVal, ToVal};
use crate::types::{SensitiveInfoEntity, ValidatorResponse};

/// IP reputation lookup used while evaluating filter expressions
pub trait IpLookup: Send + Sync {
    /// Optional annotation for `ip` (e.g. `"vpn"`)
    fn ip_lookup(&self, ip: &str) -> anyhow::Result<Option<String>>;
}

/// Custom bot identification over the serialized request
pub trait BotIdentifier: Send + Sync {
    fn detect(&self, request: &str) -> anyhow::Result<Vec<String>>;
}

/// Verification that a bot's IP belongs to the operator it claims
pub trait BotVerifier: Send + Sync {
    fn verify(&self, bot_id: &str, ip: &str) -> anyhow::Result<ValidatorResponse>;
}

/// Domain and address checks consulted by email validation
pub trait EmailValidatorOverrides: Send + Sync {
    fn is_free_email(&self, domain: &str) -> anyhow::Result<ValidatorResponse>;
    fn is_disposable_email(&self, domain: &str) -> anyhow::Result<ValidatorResponse>;
    fn has_mx_records(&self, domain: &str) -> anyhow::Result<ValidatorResponse>;
    fn has_gravatar(&self, email: &str) -> anyhow::Result<ValidatorResponse>;
}

/// Custom sensitive information identification over tokenized content
///
/// The returned list must have one entry per token.
pub trait SensitiveInfoIdentifier: Send + Sync {
    fn detect(&self, tokens: &[String]) -> anyhow::Result<Vec<Option<SensitiveInfoEntity>>>;
}

/// The documented non-committal answers for every import
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultImports;

impl IpLookup for DefaultImports {
    fn ip_lookup(&self, _ip: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

impl BotIdentifier for DefaultImports {
    fn detect(&self, _request: &str) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

impl BotVerifier for DefaultImports {
    fn verify(&self, _bot_id: &str, _ip: &str) -> anyhow::Result<ValidatorResponse> {
        Ok(ValidatorResponse::Unknown)
    }
}

impl EmailValidatorOverrides for DefaultImports {
    fn is_free_email(&self, _domain: &str) -> anyhow::Result<ValidatorResponse> {
        Ok(ValidatorResponse::Unknown)
    }

    fn is_disposable_email(&self, _domain: &str) -> anyhow::Result<ValidatorResponse> {
        Ok(ValidatorResponse::Unknown)
    }

    fn has_mx_records(&self, _domain: &str) -> anyhow::Result<ValidatorResponse> {
        Ok(ValidatorResponse::Unknown)
    }

    fn has_gravatar(&self, _email: &str) -> anyhow::Result<ValidatorResponse> {
        Ok(ValidatorResponse::Unknown)
    }
}

impl SensitiveInfoIdentifier for DefaultImports {
    fn detect(&self, tokens: &[String]) -> anyhow::Result<Vec<Option<SensitiveInfoEntity>>> {
        Ok(vec![None; tokens.len()])
    }
}

/// The set of host functions linked into the component
#[derive(Clone, Default)]
pub struct HostImports {
    ip_lookup: Option<Arc<dyn IpLookup>>,
    bot_identifier: Option<Arc<dyn BotIdentifier>>,
    bot_verifier: Option<Arc<dyn BotVerifier>>,
    email_overrides: Option<Arc<dyn EmailValidatorOverrides>>,
    sensitive_info: Option<Arc<dyn SensitiveInfoIdentifier>>,
}

impl std::fmt::Debug for HostImports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostImports")
            .field("ip_lookup", &self.ip_lookup.is_some())
            .field("bot_identifier", &self.bot_identifier.is_some())
            .field("bot_verifier", &self.bot_verifier.is_some())
            .field("email_overrides", &self.email_overrides.is_some())
            .field("sensitive_info", &self.sensitive_info.is_some())
            .finish()
    }
}

impl HostImports {
    /// No imports wired; every import traps when called
    pub fn new() -> Self {
        Self::default()
    }

    /// Every import wired to `DefaultImports`
    pub fn with_defaults() -> Self {
        let defaults = Arc::new(DefaultImports);
        Self {
            ip_lookup: Some(defaults.clone()),
            bot_identifier: Some(defaults.clone()),
            bot_verifier: Some(defaults.clone()),
            email_overrides: Some(defaults.clone()),
            sensitive_info: Some(defaults),
        }
    }

    pub fn with_ip_lookup(mut self, imp: impl IpLookup + 'static) -> Self {
        self.ip_lookup = Some(Arc::new(imp));
        self
    }

    pub fn with_bot_identifier(mut self, imp: impl BotIdentifier + 'static) -> Self {
        self.bot_identifier = Some(Arc::new(imp));
        self
    }

    pub fn with_bot_verifier(mut self, imp: impl BotVerifier + 'static) -> Self {
        self.bot_verifier = Some(Arc::new(imp));
        self
    }

    pub fn with_email_overrides(mut self, imp: impl EmailValidatorOverrides + 'static) -> Self {
        self.email_overrides = Some(Arc::new(imp));
        self
    }

    pub fn with_sensitive_info_identifier(mut self, imp: impl SensitiveInfoIdentifier + 'static) -> Self {
        self.sensitive_info = Some(Arc::new(imp));
        self
    }

    /// Whether every import has an implementation
    pub fn is_fully_wired(&self) -> bool {
        self.ip_lookup.is_some()
            && self.bot_identifier.is_some()
            && self.bot_verifier.is_some()
            && self.email_overrides.is_some()
            && self.sensitive_info.is_some()
    }

    /// Define every import function in `linker`
    ///
    /// Unwired functions are defined as traps so that a component calling
    /// them fails loudly instead of receiving a fabricated answer.
    pub(crate) fn link<T: 'static>(&self, linker: &mut Linker<T>) -> anyhow::Result<()> {
        {
            let mut iface = linker.instance(FILTER_OVERRIDES_IFACE)?;
            match self.ip_lookup.clone() {
                Some(imp) => iface.func_new(IP_LOOKUP_FN, move |_, params, results| {
                    ip_lookup(imp.as_ref(), params, results)
                })?,
                None => define_trap(&mut iface, FILTER_OVERRIDES_IFACE, IP_LOOKUP_FN)?,
            }
        }

        {
            let mut iface = linker.instance(BOT_IDENTIFIER_IFACE)?;
            match self.bot_identifier.clone() {
                Some(imp) => iface.func_new(BOT_DETECT_FN, move |_, params, results| {
                    bot_detect(imp.as_ref(), params, results)
                })?,
                None => define_trap(&mut iface, BOT_IDENTIFIER_IFACE, BOT_DETECT_FN)?,
            }
        }

        {
            let mut iface = linker.instance(VERIFY_BOT_IFACE)?;
            match self.bot_verifier.clone() {
                Some(imp) => iface.func_new(VERIFY_FN, move |_, params, results| {
                    bot_verify(imp.as_ref(), params, results)
                })?,
                None => define_trap(&mut iface, VERIFY_BOT_IFACE, VERIFY_FN)?,
            }
        }

        {
            let mut iface = linker.instance(EMAIL_OVERRIDES_IFACE)?;
            for check in EmailCheck::ALL {
                match self.email_overrides.clone() {
                    Some(imp) => iface.func_new(check.name(), move |_, params, results| {
                        email_check(imp.as_ref(), check, params, results)
                    })?,
                    None => define_trap(&mut iface, EMAIL_OVERRIDES_IFACE, check.name())?,
                }
            }
        }

        {
            let mut iface = linker.instance(SENSITIVE_INFO_IFACE)?;
            match self.sensitive_info.clone() {
                Some(imp) => iface.func_new(SENSITIVE_DETECT_FN, move |_, params, results| {
                    sensitive_detect(imp.as_ref(), params, results)
                })?,
                None => define_trap(&mut iface, SENSITIVE_INFO_IFACE, SENSITIVE_DETECT_FN)?,
            }
        }

        debug!(imports = ?self, "Linked host imports");
        Ok(())
    }
}

fn define_trap<T: 'static>(
    iface: &mut LinkerInstance<'_, T>,
    iface_name: &'static str,
    name: &'static str,
) -> anyhow::Result<()> {
    iface.func_new(name, move |_, _, _| {
        bail!("import `{iface_name}#{name}` called but not wired")
    })
}

/// Run an override, falling back to `default` on error or panic
fn guarded<R>(import: &'static str, default: impl FnOnce() -> R, call: impl FnOnce() -> anyhow::Result<R>) -> R {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            warn!(import, error = %e, "Import override failed, using default");
            counter!("analyze_import_binding_failures_total", 1, "import" => import);
            default()
        }
        Err(_) => {
            warn!(import, "Import override panicked, using default");
            counter!("analyze_import_binding_failures_total", 1, "import" => import);
            default()
        }
    }
}

fn param<T: FromVal>(params: &[Val], index: usize) -> anyhow::Result<T> {
    let val = params
        .get(index)
        .ok_or_else(|| anyhow!("missing import parameter {index}"))?;
    Ok(T::from_val(val)?)
}

fn set_result(results: &mut [Val], val: Val) -> anyhow::Result<()> {
    let slot = results
        .get_mut(0)
        .ok_or_else(|| anyhow!("import result slot missing"))?;
    *slot = val;
    Ok(())
}

pub(crate) fn ip_lookup(imp: &dyn IpLookup, params: &[Val], results: &mut [Val]) -> anyhow::Result<()> {
    let ip: String = param(params, 0)?;
    let annotation = guarded(IP_LOOKUP_FN, || None, || imp.ip_lookup(&ip));
    set_result(results, annotation.to_val())
}

pub(crate) fn bot_detect(imp: &dyn BotIdentifier, params: &[Val], results: &mut [Val]) -> anyhow::Result<()> {
    let request: String = param(params, 0)?;
    let entities = guarded(BOT_DETECT_FN, Vec::new, || imp.detect(&request));
    set_result(results, entities.to_val())
}

pub(crate) fn bot_verify(imp: &dyn BotVerifier, params: &[Val], results: &mut [Val]) -> anyhow::Result<()> {
    let bot_id: String = param(params, 0)?;
    let ip: String = param(params, 1)?;
    let response = guarded(VERIFY_FN, ValidatorResponse::default, || imp.verify(&bot_id, &ip));
    set_result(results, response.to_val())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EmailCheck {
    FreeEmail,
    DisposableEmail,
    MxRecords,
    Gravatar,
}

impl EmailCheck {
    const ALL: [EmailCheck; 4] = [
        EmailCheck::FreeEmail,
        EmailCheck::DisposableEmail,
        EmailCheck::MxRecords,
        EmailCheck::Gravatar,
    ];

    fn name(self) -> &'static str {
        match self {
            EmailCheck::FreeEmail => IS_FREE_EMAIL_FN,
            EmailCheck::DisposableEmail => IS_DISPOSABLE_EMAIL_FN,
            EmailCheck::MxRecords => HAS_MX_RECORDS_FN,
            EmailCheck::Gravatar => HAS_GRAVATAR_FN,
        }
    }
}

pub(crate) fn email_check(
    imp: &dyn EmailValidatorOverrides,
    check: EmailCheck,
    params: &[Val],
    results: &mut [Val],
) -> anyhow::Result<()> {
    let subject: String = param(params, 0)?;
    let response = guarded(check.name(), ValidatorResponse::default, || match check {
        EmailCheck::FreeEmail => imp.is_free_email(&subject),
        EmailCheck::DisposableEmail => imp.is_disposable_email(&subject),
        EmailCheck::MxRecords => imp.has_mx_records(&subject),
        EmailCheck::Gravatar => imp.has_gravatar(&subject),
    });
    set_result(results, response.to_val())
}

pub(crate) fn sensitive_detect(
    imp: &dyn SensitiveInfoIdentifier,
    params: &[Val],
    results: &mut [Val],
) -> anyhow::Result<()> {
    let tokens: Vec<String> = param(params, 0)?;
    let all_absent = || vec![None; tokens.len()];
    let detected = guarded(SENSITIVE_DETECT_FN, all_absent, || {
        let detected = imp.detect(&tokens)?;
        if detected.len() != tokens.len() {
            bail!(
                "identifier returned {} entries for {} tokens",
                detected.len(),
                tokens.len()
            );
        }
        Ok(detected)
    });
    set_result(results, detected.to_val())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VpnLookup;

    impl IpLookup for VpnLookup {
        fn ip_lookup(&self, ip: &str) -> anyhow::Result<Option<String>> {
            Ok((ip == "10.0.0.1").then(|| "vpn".to_string()))
        }
    }

    struct FailingVerifier;

    impl BotVerifier for FailingVerifier {
        fn verify(&self, _bot_id: &str, _ip: &str) -> anyhow::Result<ValidatorResponse> {
            Err(anyhow!("reverse DNS unavailable"))
        }
    }

    struct PanickingEmail;

    impl EmailValidatorOverrides for PanickingEmail {
        fn is_free_email(&self, domain: &str) -> anyhow::Result<ValidatorResponse> {
            Ok(if domain == "gmail.com" {
                ValidatorResponse::Yes
            } else {
                ValidatorResponse::No
            })
        }

        fn is_disposable_email(&self, _domain: &str) -> anyhow::Result<ValidatorResponse> {
            panic!("disposable list not loaded")
        }

        fn has_mx_records(&self, _domain: &str) -> anyhow::Result<ValidatorResponse> {
            Ok(ValidatorResponse::Yes)
        }

        fn has_gravatar(&self, _email: &str) -> anyhow::Result<ValidatorResponse> {
            Ok(ValidatorResponse::No)
        }
    }

    struct ShortIdentifier;

    impl SensitiveInfoIdentifier for ShortIdentifier {
        fn detect(&self, _tokens: &[String]) -> anyhow::Result<Vec<Option<SensitiveInfoEntity>>> {
            Ok(vec![Some(SensitiveInfoEntity::Custom("badge".to_string()))])
        }
    }

    fn string(s: &str) -> Val {
        Val::String(s.to_string())
    }

    fn slot() -> Vec<Val> {
        vec![Val::Bool(false)]
    }

    #[test]
    fn test_ip_lookup_override() {
        let mut results = slot();
        ip_lookup(&VpnLookup, &[string("10.0.0.1")], &mut results).unwrap();
        assert_eq!(results[0], Val::Option(Some(Box::new(string("vpn")))));

        ip_lookup(&VpnLookup, &[string("8.8.8.8")], &mut results).unwrap();
        assert_eq!(results[0], Val::Option(None));
    }

    #[test]
    fn test_failing_override_returns_unknown() {
        let mut results = slot();
        bot_verify(&FailingVerifier, &[string("GOOGLE_CRAWLER"), string("1.2.3.4")], &mut results).unwrap();
        assert_eq!(results[0], Val::Enum("unknown".to_string()));
    }

    #[test]
    fn test_panicking_override_returns_unknown() {
        let mut results = slot();
        email_check(&PanickingEmail, EmailCheck::DisposableEmail, &[string("mailinator.com")], &mut results)
            .unwrap();
        assert_eq!(results[0], Val::Enum("unknown".to_string()));

        email_check(&PanickingEmail, EmailCheck::FreeEmail, &[string("gmail.com")], &mut results).unwrap();
        assert_eq!(results[0], Val::Enum("yes".to_string()));
    }

    #[test]
    fn test_sensitive_length_mismatch_falls_back_to_absent() {
        let mut results = slot();
        let tokens = Val::List(vec![string("my"), string("badge"), string("1234")]);
        sensitive_detect(&ShortIdentifier, &[tokens], &mut results).unwrap();
        assert_eq!(
            results[0],
            Val::List(vec![Val::Option(None), Val::Option(None), Val::Option(None)])
        );
    }

    #[test]
    fn test_defaults() {
        let mut results = slot();
        bot_detect(&DefaultImports, &[string("{}")], &mut results).unwrap();
        assert_eq!(results[0], Val::List(vec![]));

        let tokens = Val::List(vec![string("a"), string("b")]);
        sensitive_detect(&DefaultImports, &[tokens], &mut results).unwrap();
        assert_eq!(results[0], Val::List(vec![Val::Option(None), Val::Option(None)]));
    }

    #[test]
    fn test_wrong_parameter_shape_is_an_error() {
        let mut results = slot();
        assert!(ip_lookup(&DefaultImports, &[Val::U32(4)], &mut results).is_err());
        assert!(bot_verify(&DefaultImports, &[string("only-one")], &mut results).is_err());
    }

    #[test]
    fn test_wiring_state() {
        assert!(!HostImports::new().is_fully_wired());
        assert!(HostImports::with_defaults().is_fully_wired());
        let partial = HostImports::new().with_ip_lookup(VpnLookup);
        assert!(!partial.is_fully_wired());
    }
}
