use sha2::{Digest, Sha256};

use crate::context::RequestContext;
use crate::error::Result;
use crate::rules::{Mode, Rule};

/// Characteristic that names the client IP, always folded in first
const IP_CHARACTERISTIC: &str = "ip.src";

/// Deterministic identity of a client, e.g. `ip=1.2.3.4;ua=curl`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

fn header_label(name: &str) -> &str {
    match name {
        "user-agent" => "ua",
        other => other,
    }
}

/// `key=value` with `\`, `;` and `=` backslash-escaped on both sides, so no
/// value can forge a part boundary
fn part(key: &str, value: &str) -> String {
    fn escape_into(out: &mut String, raw: &str) {
        for c in raw.chars() {
            if matches!(c, '\\' | ';' | '=') {
                out.push('\\');
            }
            out.push(c);
        }
    }

    let mut out = String::with_capacity(key.len() + value.len() + 1);
    escape_into(&mut out, key);
    out.push('=');
    escape_into(&mut out, value);
    out
}

impl Fingerprint {
    /// Derive the fingerprint of `ctx`
    ///
    /// Parts appear in a fixed order: the IP, then `headers` in configured
    /// order, then each characteristic resolved from the caller-supplied
    /// extras or a header of the same name. Missing values are skipped.
    pub fn derive(ctx: &RequestContext, headers: &[String], characteristics: &[&str]) -> Option<Self> {
        let mut parts = Vec::new();

        let ip = ctx.ip.trim();
        if !ip.is_empty() {
            parts.push(part("ip", ip));
        }

        for name in headers {
            let name = name.to_ascii_lowercase();
            if let Some(value) = ctx.header(&name) {
                parts.push(part(header_label(&name), value));
            }
        }

        for characteristic in characteristics {
            if *characteristic == IP_CHARACTERISTIC {
                continue;
            }
            let value = ctx
                .extra
                .get(*characteristic)
                .map(String::as_str)
                .or_else(|| ctx.header(characteristic));
            if let Some(value) = value {
                parts.push(part(characteristic, value));
            }
        }

        if parts.is_empty() {
            return None;
        }
        Some(Self(parts.join(";")))
    }

    /// Identity of the client address alone, e.g. `ip=1.2.3.4`
    ///
    /// Rate limits without characteristics are keyed on this, so rotating
    /// headers does not yield a fresh limit.
    pub fn client_ip(ctx: &RequestContext) -> Option<Self> {
        Self::derive(ctx, &[], &[])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Cache key binding this fingerprint to one rule set and policy
    pub fn cache_key(&self, rules: &[Rule], mode: Mode, fail_open: bool) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        hasher.update([0u8]);
        hasher.update(serde_json::to_vec(rules)?);
        hasher.update([0u8]);
        hasher.update(mode.as_str().as_bytes());
        hasher.update([u8::from(fail_open)]);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Union of the characteristics declared by `rules`, in first-seen order
pub fn rule_characteristics(rules: &[Rule]) -> Vec<&str> {
    let mut seen = Vec::new();
    for characteristic in rules.iter().flat_map(Rule::characteristics) {
        if !seen.contains(&characteristic) {
            seen.push(characteristic);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{fixed_window, shield};

    fn ua() -> Vec<String> {
        vec!["user-agent".to_string()]
    }

    #[test]
    fn test_ip_and_user_agent() {
        let ctx = RequestContext::new("1.2.3.4").with_header("User-Agent", "curl");
        let fp = Fingerprint::derive(&ctx, &ua(), &[]).unwrap();
        assert_eq!(fp.as_str(), "ip=1.2.3.4;ua=curl");
    }

    #[test]
    fn test_characteristics_from_extra() {
        let ctx = RequestContext::new("1.2.3.4").with_extra("user_id", "42");
        let fp = Fingerprint::derive(&ctx, &ua(), &["ip.src", "user_id", "missing"]).unwrap();
        assert_eq!(fp.as_str(), "ip=1.2.3.4;user_id=42");
    }

    #[test]
    fn test_separators_in_values_cannot_forge_parts() {
        let forged = RequestContext::new("1.2.3.4").with_header("User-Agent", "x;user_id=42");
        let genuine = RequestContext::new("1.2.3.4")
            .with_header("User-Agent", "x")
            .with_extra("user_id", "42");

        let a = Fingerprint::derive(&forged, &ua(), &["user_id"]).unwrap();
        let b = Fingerprint::derive(&genuine, &ua(), &["user_id"]).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_str(), "ip=1.2.3.4;ua=x\\;user_id\\=42");
        assert_eq!(b.as_str(), "ip=1.2.3.4;ua=x;user_id=42");

        let slash = RequestContext::new("1.2.3.4").with_header("User-Agent", "x\\");
        assert_eq!(Fingerprint::derive(&slash, &ua(), &[]).unwrap().as_str(), "ip=1.2.3.4;ua=x\\\\");
    }

    #[test]
    fn test_client_ip_ignores_headers() {
        let a = RequestContext::new("1.2.3.4").with_header("User-Agent", "curl");
        let b = RequestContext::new("1.2.3.4").with_header("User-Agent", "wget");
        assert_eq!(Fingerprint::client_ip(&a), Fingerprint::client_ip(&b));
        assert_eq!(Fingerprint::client_ip(&a).unwrap().as_str(), "ip=1.2.3.4");
        assert!(Fingerprint::client_ip(&RequestContext::default()).is_none());
    }

    #[test]
    fn test_empty_context_has_no_fingerprint() {
        let ctx = RequestContext::default();
        assert!(Fingerprint::derive(&ctx, &ua(), &[]).is_none());
    }

    #[test]
    fn test_cache_key_depends_on_rules_and_policy() {
        let ctx = RequestContext::new("1.2.3.4");
        let fp = Fingerprint::derive(&ctx, &[], &[]).unwrap();
        let rules = vec![shield(Mode::Live)];
        let other = vec![fixed_window(Mode::Live, 5, 60).unwrap()];

        let key = fp.cache_key(&rules, Mode::Live, true).unwrap();
        assert_eq!(key, fp.cache_key(&rules, Mode::Live, true).unwrap());
        assert_eq!(key.len(), 64);
        assert_ne!(key, fp.cache_key(&other, Mode::Live, true).unwrap());
        assert_ne!(key, fp.cache_key(&rules, Mode::DryRun, true).unwrap());
        assert_ne!(key, fp.cache_key(&rules, Mode::Live, false).unwrap());
    }

    #[test]
    fn test_rule_characteristics_are_deduplicated() {
        let rules = vec![
            shield(Mode::Live).with_characteristics(["user_id", "ip.src"]),
            fixed_window(Mode::Live, 5, 60)
                .unwrap()
                .with_characteristics(["ip.src", "session"]),
        ];
        assert_eq!(rule_characteristics(&rules), vec!["user_id", "ip.src", "session"]);
    }
}
