//! Connection pool keyed by connection fingerprint.

use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use channelrpc_core::{ChannelError, SharedMruCache};
use http::{HeaderValue, Uri};
use sha2::{Digest, Sha512};

use crate::transport::{CookieJar, HttpSend};

const FIELD_SEPARATOR: &str = "\u{1f}";

/// Inputs that distinguish one pooled connection from another.
#[derive(Clone, Debug, Default)]
pub struct FingerprintInputs<'a> {
    pub streamed: bool,
    /// Scheme-derived identity of the authenticated principal.
    pub auth_identity: &'a str,
    pub group_prefix: &'a str,
    pub proxy: Option<&'a Uri>,
    pub duplex: bool,
    /// TLS client certificate and peer pin identity.
    pub tls_identity: Option<&'a str>,
}

/// Cache key of a pooled connection.
///
/// base64(SHA-512) of the transport-level inputs, followed by `|` and the
/// TLS identity when one is configured.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionFingerprint(Arc<str>);

impl ConnectionFingerprint {
    pub fn compute(
        inputs: &FingerprintInputs<'_>,
        hash_cache: &SharedMruCache<String, String>,
    ) -> Self {
        let proxy = inputs.proxy.map(|p| p.to_string()).unwrap_or_default();
        let raw = [
            if inputs.streamed { "1" } else { "0" },
            inputs.auth_identity,
            inputs.group_prefix,
            proxy.as_str(),
            if inputs.duplex { "1" } else { "0" },
        ]
        .join(FIELD_SEPARATOR);

        let hash = hash_cache.get_or_insert_with(raw.clone(), || {
            STANDARD.encode(Sha512::digest(raw.as_bytes()))
        });
        let key = match inputs.tls_identity {
            Some(identity) => format!("{hash}|{identity}"),
            None => hash.as_str().to_string(),
        };
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ConnectionFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The hash prefix is enough to tell entries apart in logs.
        let short: String = self.0.chars().take(12).collect();
        write!(f, "ConnectionFingerprint({short}..)")
    }
}

impl fmt::Display for ConnectionFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A live connection shared by every channel with the same fingerprint.
///
/// Immutable once published; the cookie jar synchronizes internally.
pub struct PooledConnection {
    fingerprint: ConnectionFingerprint,
    transport: Arc<dyn HttpSend>,
    cookies: Option<CookieJar>,
    decompression: bool,
    proxy_authorization: Option<HeaderValue>,
    forward_proxy: Option<Uri>,
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("fingerprint", &self.fingerprint)
            .field("cookies", &self.cookies.is_some())
            .field("decompression", &self.decompression)
            .field("proxy_authorization", &self.proxy_authorization.is_some())
            .field("forward_proxy", &self.forward_proxy)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    pub fn new(fingerprint: ConnectionFingerprint, transport: Arc<dyn HttpSend>) -> Self {
        Self {
            fingerprint,
            transport,
            cookies: None,
            decompression: false,
            proxy_authorization: None,
            forward_proxy: None,
        }
    }

    pub fn with_cookies(mut self, enabled: bool) -> Self {
        self.cookies = enabled.then(CookieJar::new);
        self
    }

    pub fn with_decompression(mut self, enabled: bool) -> Self {
        self.decompression = enabled;
        self
    }

    /// Proxy in front of this connection and the `Proxy-Authorization`
    /// value for requests forwarded through it.
    pub fn with_forward_proxy(
        mut self,
        proxy: Option<Uri>,
        authorization: Option<HeaderValue>,
    ) -> Self {
        self.forward_proxy = proxy;
        self.proxy_authorization = authorization;
        self
    }

    pub fn fingerprint(&self) -> &ConnectionFingerprint {
        &self.fingerprint
    }

    pub fn transport(&self) -> &Arc<dyn HttpSend> {
        &self.transport
    }

    pub fn cookies(&self) -> Option<&CookieJar> {
        self.cookies.as_ref()
    }

    pub fn decompression(&self) -> bool {
        self.decompression
    }

    pub fn proxy_authorization(&self) -> Option<&HeaderValue> {
        self.proxy_authorization.as_ref()
    }

    /// Proxy in front of this connection. Plain `http` requests through it
    /// are forwarded in absolute form; secure ones are tunnelled.
    pub fn forward_proxy(&self) -> Option<&Uri> {
        self.forward_proxy.as_ref()
    }
}

/// Pool of live connections.
///
/// Request channels share an entry's HTTP client and its sockets. Duplex
/// channels share only its settings and cookies; see
/// [`WebSocketConnector`](crate::WebSocketConnector).
///
/// Lookup and insert each take the cache lock briefly; building happens
/// outside it, so two callers may race to build the same entry. The first
/// insert wins and the loser is dropped.
#[derive(Debug)]
pub struct ConnectionPool {
    entries: SharedMruCache<ConnectionFingerprint, PooledConnection>,
}

impl ConnectionPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: SharedMruCache::new(capacity),
        }
    }

    pub fn get(&self, fingerprint: &ConnectionFingerprint) -> Option<Arc<PooledConnection>> {
        self.entries.get(fingerprint)
    }

    /// Return the entry for `fingerprint`, building it on a miss.
    pub fn get_or_create<F>(
        &self,
        fingerprint: &ConnectionFingerprint,
        build: F,
    ) -> Result<Arc<PooledConnection>, ChannelError>
    where
        F: FnOnce() -> Result<PooledConnection, ChannelError>,
    {
        if let Some(hit) = self.entries.get(fingerprint) {
            tracing::debug!(?fingerprint, "reusing pooled connection");
            return Ok(hit);
        }
        let built = build()?;
        let (winner, inserted) = self.entries.insert(fingerprint.clone(), built);
        if inserted {
            tracing::debug!(?fingerprint, "created pooled connection");
        } else {
            tracing::warn!(?fingerprint, "discarding connection that lost a pool insert race");
        }
        Ok(winner)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry. Channels still holding one keep it alive.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::transport::{ResponseBody, TransportBody};
    use futures::future::BoxFuture;

    struct NullTransport;

    impl HttpSend for NullTransport {
        fn send(
            &self,
            _request: http::Request<TransportBody>,
        ) -> BoxFuture<'static, Result<http::Response<ResponseBody>, TransportError>> {
            Box::pin(async { Err(TransportError::other("unused")) })
        }
    }

    fn fp(
        inputs: &FingerprintInputs<'_>,
        cache: &SharedMruCache<String, String>,
    ) -> ConnectionFingerprint {
        ConnectionFingerprint::compute(inputs, cache)
    }

    #[test]
    fn test_fingerprint_depends_on_every_input() {
        let cache = SharedMruCache::new(16);
        let proxy: Uri = "http://proxy:3128".parse().unwrap();
        let base = FingerprintInputs {
            auth_identity: "Basic:basic:alice",
            group_prefix: "group",
            ..Default::default()
        };
        let reference = fp(&base, &cache);
        assert_eq!(reference, fp(&base.clone(), &cache));

        let variants = [
            FingerprintInputs { streamed: true, ..base.clone() },
            FingerprintInputs { auth_identity: "Basic:basic:bob", ..base.clone() },
            FingerprintInputs { group_prefix: "other", ..base.clone() },
            FingerprintInputs { proxy: Some(&proxy), ..base.clone() },
            FingerprintInputs { duplex: true, ..base.clone() },
            FingerprintInputs { tls_identity: Some("pin"), ..base.clone() },
        ];
        for variant in &variants {
            assert_ne!(reference, fp(variant, &cache), "{variant:?}");
        }
    }

    #[test]
    fn test_tls_identity_is_appended() {
        let cache = SharedMruCache::new(4);
        let plain = fp(&FingerprintInputs::default(), &cache);
        let pinned = fp(
            &FingerprintInputs { tls_identity: Some("abc"), ..Default::default() },
            &cache,
        );
        assert_eq!(pinned.as_str(), format!("{}|abc", plain.as_str()));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_get_or_create_keeps_first_winner() {
        let cache = SharedMruCache::new(4);
        let pool = ConnectionPool::new(8);
        let key = fp(&FingerprintInputs::default(), &cache);

        let first = pool
            .get_or_create(&key, || Ok(PooledConnection::new(key.clone(), Arc::new(NullTransport))))
            .unwrap();
        let second = pool
            .get_or_create(&key, || panic!("must not build on a hit"))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // A racing builder that inserts after the winner gets the winner back.
        let (winner, inserted) = pool.entries.insert(
            key.clone(),
            PooledConnection::new(key.clone(), Arc::new(NullTransport)).with_cookies(true),
        );
        assert!(!inserted);
        assert!(Arc::ptr_eq(&winner, &first));
        assert!(winner.cookies().is_none());
    }

    #[test]
    fn test_racing_builders_share_the_first_insert() {
        use std::sync::Barrier;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let cache = SharedMruCache::new(4);
        let pool = ConnectionPool::new(8);
        let key = fp(&FingerprintInputs::default(), &cache);
        let builds = AtomicUsize::new(0);
        // Neither build finishes until both callers have missed the lookup.
        let both_missed = Barrier::new(2);
        let build = || {
            builds.fetch_add(1, Ordering::SeqCst);
            both_missed.wait();
            Ok(PooledConnection::new(key.clone(), Arc::new(NullTransport)))
        };

        let (a, b) = std::thread::scope(|scope| {
            let a = scope.spawn(|| pool.get_or_create(&key, build));
            let b = scope.spawn(|| pool.get_or_create(&key, build));
            (a.join().unwrap().unwrap(), b.join().unwrap().unwrap())
        });

        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 1);
        assert!(Arc::ptr_eq(&pool.get(&key).unwrap(), &a));
    }

    #[test]
    fn test_build_failure_leaves_pool_empty() {
        let cache = SharedMruCache::new(4);
        let pool = ConnectionPool::new(8);
        let key = fp(&FingerprintInputs::default(), &cache);
        let err = pool
            .get_or_create(&key, || Err(ChannelError::configuration("no tls")))
            .unwrap_err();
        assert!(matches!(err, ChannelError::Configuration(_)));
        assert!(pool.is_empty());
    }
}
