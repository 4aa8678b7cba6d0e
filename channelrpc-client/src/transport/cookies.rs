//! Per-connection cookie container.

use std::collections::BTreeMap;
use std::sync::Mutex;

use http::header::{COOKIE, SET_COOKIE};
use http::{HeaderMap, HeaderValue};

/// Name/value cookies captured from `Set-Cookie` and replayed on later
/// requests over the same pooled connection.
///
/// Attributes other than `Max-Age=0` are ignored; the jar is scoped by the
/// connection fingerprint rather than by domain and path.
#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: Mutex<BTreeMap<String, String>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cookies.lock().map(|c| c.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record every `Set-Cookie` header of a response.
    pub fn store(&self, headers: &HeaderMap) {
        let Ok(mut cookies) = self.cookies.lock() else {
            return;
        };
        for value in headers.get_all(SET_COOKIE) {
            let Ok(value) = value.to_str() else { continue };
            let mut parts = value.split(';');
            let Some((name, val)) = parts.next().and_then(|p| p.split_once('=')) else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let expired = parts.any(|attr| {
                attr.split_once('=').is_some_and(|(k, v)| {
                    k.trim().eq_ignore_ascii_case("max-age") && v.trim() == "0"
                })
            });
            if expired {
                cookies.remove(name);
            } else {
                cookies.insert(name.to_string(), val.trim().to_string());
            }
        }
    }

    /// Add a `Cookie` header when the jar is not empty.
    pub fn apply(&self, headers: &mut HeaderMap) {
        let Ok(cookies) = self.cookies.lock() else {
            return;
        };
        if cookies.is_empty() {
            return;
        }
        let joined = cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ");
        if let Ok(value) = HeaderValue::from_str(&joined) {
            headers.insert(COOKIE, value);
        }
    }
}
