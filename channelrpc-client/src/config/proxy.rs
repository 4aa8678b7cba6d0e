//! Proxy selection.

use std::net::IpAddr;

use channelrpc_core::ChannelError;
use futures::future::BoxFuture;
use http::Uri;

/// Where proxy addresses come from.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum ProxyMode {
    /// Connect directly.
    #[default]
    None,
    /// Ask the factory's [`ProxyResolver`] per destination.
    System,
    /// Use this proxy for every destination not bypassed.
    Explicit(Uri),
}

#[derive(Clone, Debug, Default)]
pub struct ProxySettings {
    pub mode: ProxyMode,
    /// Connect directly to local addresses.
    pub bypass_on_local: bool,
    /// Hosts reached directly. Entries are exact host names or
    /// `*.suffix` / `.suffix` patterns.
    pub bypass_list: Vec<String>,
}

impl ProxySettings {
    /// Whether `destination` skips the proxy.
    pub fn bypasses(&self, destination: &Uri) -> bool {
        let Some(host) = destination.host() else {
            return false;
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if self.bypass_on_local && is_local(host) {
            return true;
        }
        self.bypass_list.iter().any(|pattern| host_matches(pattern, host))
    }
}

fn is_local(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback();
    }
    // Single-label names are intranet hosts.
    !host.contains('.')
}

fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim();
    if let Some(suffix) = pattern.strip_prefix("*.").or_else(|| pattern.strip_prefix('.')) {
        let suffix_len = suffix.len();
        return host.len() > suffix_len
            && host[host.len() - suffix_len..].eq_ignore_ascii_case(suffix)
            && host.as_bytes()[host.len() - suffix_len - 1] == b'.';
    }
    pattern.eq_ignore_ascii_case(host)
}

/// Resolves the proxy for a destination under [`ProxyMode::System`].
///
/// Resolution may suspend; the factory runs it inside the caller's budget.
pub trait ProxyResolver: Send + Sync + 'static {
    fn resolve<'a>(
        &'a self,
        destination: &'a Uri,
    ) -> BoxFuture<'a, Result<Option<Uri>, ChannelError>>;
}

/// Resolves proxies from `HTTPS_PROXY`, `HTTP_PROXY` and `NO_PROXY`.
#[derive(Clone, Debug, Default)]
pub struct EnvProxyResolver;

impl EnvProxyResolver {
    fn var(name: &str) -> Option<String> {
        std::env::var(name)
            .or_else(|_| std::env::var(name.to_ascii_lowercase()))
            .ok()
            .filter(|v| !v.trim().is_empty())
    }

    fn no_proxy(host: &str) -> bool {
        let Some(list) = Self::var("NO_PROXY") else {
            return false;
        };
        list.split(',').map(str::trim).any(|entry| {
            entry == "*" || host_matches(entry, host) || {
                let suffix = entry.trim_start_matches('.');
                !suffix.is_empty() && host_matches(&format!(".{suffix}"), host)
            }
        })
    }
}

impl ProxyResolver for EnvProxyResolver {
    fn resolve<'a>(
        &'a self,
        destination: &'a Uri,
    ) -> BoxFuture<'a, Result<Option<Uri>, ChannelError>> {
        Box::pin(async move {
            let host = destination.host().unwrap_or_default();
            if Self::no_proxy(host) {
                return Ok(None);
            }
            let secure = matches!(destination.scheme_str(), Some("https") | Some("wss"));
            let value = if secure {
                Self::var("HTTPS_PROXY").or_else(|| Self::var("ALL_PROXY"))
            } else {
                Self::var("HTTP_PROXY").or_else(|| Self::var("ALL_PROXY"))
            };
            match value {
                None => Ok(None),
                Some(raw) => raw.trim().parse::<Uri>().map(Some).map_err(|e| {
                    ChannelError::configuration(format!("invalid proxy address {raw:?}: {e}"))
                }),
            }
        })
    }
}
