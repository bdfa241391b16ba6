// Request Context Module - The normalized request every evaluation starts from
//
// Framework adapters fill a `RequestContext` before calling into the pipeline.
// Header names are stored lowercase; maps are ordered so that the analysis
// payload and the fingerprint are deterministic for identical requests.

use std::collections::BTreeMap;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::Result;

/// A fully materialized request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Client IP as seen by the server socket (or already resolved)
    pub ip: String,
    pub method: String,
    pub protocol: String,
    pub host: String,
    pub path: String,
    /// Lowercased header names
    pub headers: BTreeMap<String, String>,
    /// Raw `Cookie` header value
    pub cookies: String,
    /// Raw query string without the leading `?`
    pub query: String,
    /// Request body, if the adapter read it
    pub body: Option<String>,
    /// Address checked by email validation rules
    pub email: Option<String>,
    /// Tokens charged against token bucket rules
    pub requested: Option<u32>,
    /// Caller-supplied characteristics (e.g. `user_id`)
    pub extra: BTreeMap<String, String>,
    /// Client IP chosen by the caller; only accepted when automatic IP
    /// detection is disabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_src: Option<String>,
}

impl RequestContext {
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            method: "GET".to_string(),
            protocol: "HTTP/1.1".to_string(),
            path: "/".to_string(),
            ..Self::default()
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        let name = name.as_ref().to_ascii_lowercase();
        let value = value.into();
        if name == "cookie" {
            self.cookies = value.clone();
        }
        self.headers.insert(name, value);
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_requested(mut self, tokens: u32) -> Self {
        self.requested = Some(tokens);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Trust `ip` as the client address for this call
    pub fn with_ip_src(mut self, ip: impl Into<String>) -> Self {
        self.ip_src = Some(ip.into());
        self
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// The serialized request handed to the analysis component
    pub fn to_analysis_json(&self) -> Result<String> {
        let payload = json!({
            "ip": self.ip,
            "method": self.method,
            "protocol": self.protocol,
            "host": self.host,
            "path": self.path,
            "headers": self.headers,
            "cookies": self.cookies,
            "query": self.query,
            "extra": self.extra,
        });
        Ok(serde_json::to_string(&payload)?)
    }

    /// Copy of this context with `ip` replaced by the resolved client address
    pub fn with_resolved_ip(&self, proxies: &[IpNet]) -> Self {
        let mut ctx = self.clone();
        if let Some(ip) = resolve_client_ip(self, proxies) {
            ctx.ip = ip.to_string();
        }
        ctx
    }
}

fn is_trusted(ip: &IpAddr, proxies: &[IpNet]) -> bool {
    proxies.iter().any(|net| net.contains(ip))
}

/// Resolve the originating client address
///
/// When the socket peer is a trusted proxy, `X-Forwarded-For` is walked from
/// the right and the first address that is not itself a trusted proxy wins.
/// Otherwise the socket peer is the client. Returns `None` when nothing in
/// the context parses as an address.
pub fn resolve_client_ip(ctx: &RequestContext, proxies: &[IpNet]) -> Option<IpAddr> {
    let peer = ctx.ip.trim().parse::<IpAddr>().ok();

    let peer_is_proxy = peer.map(|ip| is_trusted(&ip, proxies)).unwrap_or(true);
    if !peer_is_proxy {
        return peer;
    }

    let forwarded = ctx
        .header("x-forwarded-for")
        .into_iter()
        .flat_map(|value| value.split(','))
        .filter_map(|hop| hop.trim().parse::<IpAddr>().ok())
        .collect::<Vec<_>>();

    let client = forwarded
        .iter()
        .rev()
        .find(|ip| !is_trusted(ip, proxies))
        .copied();

    if let Some(client) = client {
        debug!(peer = ?peer, client = %client, "Resolved client IP from X-Forwarded-For");
        return Some(client);
    }

    peer.or_else(|| forwarded.first().copied())
}
