//! Channel factory.
//!
//! A [`ChannelFactory`] owns everything its channels share: the validated
//! configuration, the message codec and buffer pool, the connection pool,
//! the security token manager and the proxy resolver. Channels hold a
//! reference to it and are cancelled when it closes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use channelrpc_core::{BufferPool, ChannelError, MessageCodec, SharedMruCache};
use http::{HeaderValue, Uri};
use tokio_util::sync::CancellationToken;

use crate::builder::ChannelFactoryBuilder;
use crate::config::{BindingConfig, ProxyMode, ProxyResolver, TransportUsage};
use crate::duplex::{DuplexConnector, DuplexSessionChannel, SessionRegistry};
use crate::pool::{ConnectionFingerprint, ConnectionPool, FingerprintInputs, PooledConnection};
use crate::request_channel::RequestChannel;
use crate::security::{CredentialGrant, SecurityTokenManager, TokenProviders};
use crate::timeout::TimeoutBudget;
use crate::transport::{ConnectionSettings, ProxyRoute, TransportFactory, is_secure};

/// Kind of channel requested from [`ChannelFactory::create_channel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    /// One request, one reply.
    Request,
    /// Long-lived session with independent send and receive.
    Duplex,
}

/// A channel produced by [`ChannelFactory::create_channel`].
#[derive(Debug)]
pub enum Channel {
    Request(RequestChannel),
    Duplex(DuplexSessionChannel),
}

impl Channel {
    pub fn kind(&self) -> ChannelKind {
        match self {
            Channel::Request(_) => ChannelKind::Request,
            Channel::Duplex(_) => ChannelKind::Duplex,
        }
    }

    pub fn into_request(self) -> Option<RequestChannel> {
        match self {
            Channel::Request(channel) => Some(channel),
            Channel::Duplex(_) => None,
        }
    }

    pub fn into_duplex(self) -> Option<DuplexSessionChannel> {
        match self {
            Channel::Duplex(channel) => Some(channel),
            Channel::Request(_) => None,
        }
    }
}

/// A pooled connection plus the credential it was selected with.
#[derive(Clone, Debug)]
pub struct AcquiredConnection {
    pub connection: Arc<PooledConnection>,
    pub grant: CredentialGrant,
    /// Route and TLS settings the connection was built from.
    pub settings: ConnectionSettings,
}

/// State shared by a factory and every channel it creates.
pub(crate) struct FactoryContext {
    pub(crate) config: BindingConfig,
    pub(crate) codec: MessageCodec,
    pub(crate) buffers: BufferPool,
    pub(crate) pool: ConnectionPool,
    pub(crate) hash_cache: SharedMruCache<String, String>,
    pub(crate) token_manager: Option<Arc<SecurityTokenManager>>,
    pub(crate) proxy_resolver: Arc<dyn ProxyResolver>,
    pub(crate) transport_factory: Arc<dyn TransportFactory>,
    pub(crate) duplex_connector: Arc<dyn DuplexConnector>,
    pub(crate) sessions: SessionRegistry,
    pub(crate) cancel: CancellationToken,
}

impl fmt::Debug for FactoryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryContext")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("token_manager", &self.token_manager)
            .field("active_sessions", &self.sessions.active())
            .field("closed", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl FactoryContext {
    pub(crate) fn check_open(&self) -> Result<(), ChannelError> {
        if self.cancel.is_cancelled() {
            return Err(ChannelError::invalid_operation("channel factory is closed"));
        }
        Ok(())
    }

    /// Fresh token provider containers for a destination.
    pub(crate) fn token_providers(&self, to: &Uri, via: &Uri) -> TokenProviders {
        match &self.token_manager {
            Some(manager) => manager.create_providers(to, self.proxy_target(via).as_ref()),
            None => TokenProviders::none(),
        }
    }

    /// Target the proxy credential is requested for.
    fn proxy_target(&self, via: &Uri) -> Option<Uri> {
        let settings = &self.config.proxy;
        match &settings.mode {
            ProxyMode::None => None,
            _ if settings.bypasses(via) => None,
            ProxyMode::Explicit(proxy) => Some(proxy.clone()),
            ProxyMode::System => Some(via.clone()),
        }
    }

    async fn resolve_proxy(
        &self,
        via: &Uri,
        budget: &TimeoutBudget,
    ) -> Result<Option<Uri>, ChannelError> {
        let settings = &self.config.proxy;
        match &settings.mode {
            ProxyMode::None => Ok(None),
            _ if settings.bypasses(via) => Ok(None),
            ProxyMode::Explicit(proxy) => Ok(Some(proxy.clone())),
            ProxyMode::System => {
                budget
                    .run("proxy resolution", self.proxy_resolver.resolve(via))
                    .await
            }
        }
    }

    /// `GetConnection`: credentials and proxy first, then the pool.
    pub(crate) async fn acquire(
        &self,
        via: &Uri,
        providers: &TokenProviders,
        duplex: bool,
        budget: &TimeoutBudget,
    ) -> Result<AcquiredConnection, ChannelError> {
        self.check_open()?;
        budget.check("connection acquisition")?;

        let grant = match &providers.auth {
            Some(container) => container.get_credential(budget).await?,
            None => CredentialGrant::anonymous(),
        };

        let proxy = self.resolve_proxy(via, budget).await?;
        let proxy_authorization: Option<HeaderValue> = match (&proxy, &providers.proxy) {
            (Some(_), Some(container)) => container
                .get_credential(budget)
                .await?
                .credential
                .authorization()?,
            _ => None,
        };
        budget.check("connection acquisition")?;

        let tls_identity = if is_secure(via) {
            self.config.tls.identity()
        } else {
            None
        };
        let auth_identity = grant.fingerprint_identity(self.config.auth_scheme);
        let fingerprint = ConnectionFingerprint::compute(
            &FingerprintInputs {
                streamed: !self.config.transfer_mode.is_buffered(),
                auth_identity: &auth_identity,
                group_prefix: &self.config.connection_group_prefix,
                proxy: proxy.as_ref(),
                duplex,
                tls_identity: tls_identity.as_deref(),
            },
            &self.hash_cache,
        );

        let route = match &proxy {
            Some(proxy) => ProxyRoute::Via {
                proxy: proxy.clone(),
                authorization: proxy_authorization.clone(),
            },
            None => ProxyRoute::Direct,
        };
        let settings = ConnectionSettings {
            route,
            tls: self.config.tls.clone(),
            keep_alive: self.config.keep_alive_enabled,
            pool_idle_timeout: self.config.pool_idle_timeout,
            pool_max_idle_per_host: self.config.pool_max_idle_per_host,
        };

        let connection = self.pool.get_or_create(&fingerprint, || {
            let transport = self.transport_factory.create(&settings)?;
            Ok(PooledConnection::new(fingerprint.clone(), transport)
                .with_cookies(self.config.allow_cookies)
                .with_decompression(self.config.decompression_enabled)
                .with_forward_proxy(proxy.clone(), proxy_authorization.clone()))
        })?;

        Ok(AcquiredConnection {
            connection,
            grant,
            settings,
        })
    }

    fn check_channel(&self, kind: ChannelKind, to: &Uri, via: &Uri) -> Result<(), ChannelError> {
        if !self.config.addressing_enabled && to != via {
            return Err(ChannelError::configuration(format!(
                "addressing is disabled, so the destination {to} must equal the via address {via}"
            )));
        }

        match (kind, self.config.transport_usage) {
            (ChannelKind::Request, TransportUsage::Always) => {
                return Err(ChannelError::configuration(
                    "the binding always upgrades; request channels are not available",
                ));
            }
            (ChannelKind::Duplex, TransportUsage::Never) => {
                return Err(ChannelError::configuration(
                    "the binding never upgrades; duplex channels are not available",
                ));
            }
            _ => {}
        }

        let scheme = via.scheme_str().unwrap_or_default();
        let allowed = self.config.security_mode.schemes();
        let scheme_ok = match kind {
            ChannelKind::Request => {
                allowed.contains(&scheme) && matches!(scheme, "http" | "https")
            }
            ChannelKind::Duplex => {
                let normalized = match scheme {
                    "http" => "ws",
                    "https" => "wss",
                    other => other,
                };
                allowed.contains(&normalized)
            }
        };
        if !scheme_ok || via.host().is_none() {
            return Err(ChannelError::configuration(format!(
                "{via} is not a valid address for a {kind:?} channel under {:?} security \
                 (expected scheme {})",
                self.config.security_mode,
                allowed.join(" or ")
            )));
        }
        Ok(())
    }
}

/// Produces channels and pools the connections behind them.
///
/// Cloning is cheap; clones share one pool.
///
/// # Example
///
/// ```ignore
/// use channelrpc_client::{BindingConfig, ChannelFactory};
/// use channelrpc_core::Message;
/// use std::time::Duration;
///
/// let factory = ChannelFactory::open(BindingConfig::default())?;
/// let channel = factory.create_request_channel("http://localhost:8080/orders".parse()?, None)?;
/// let reply = channel
///     .request(Message::new("urn:orders/Submit").with_body("..."), Duration::from_secs(30))
///     .await?;
/// ```
#[derive(Clone, Debug)]
pub struct ChannelFactory {
    inner: Arc<FactoryContext>,
}

impl ChannelFactory {
    /// `OpenFactory` with the default transport, WebSocket connector and
    /// environment proxy resolver, and no credential provider.
    pub fn open(config: BindingConfig) -> Result<Self, ChannelError> {
        ChannelFactoryBuilder::new().config(config).build()
    }

    pub fn builder() -> ChannelFactoryBuilder {
        ChannelFactoryBuilder::new()
    }

    pub(crate) fn from_context(context: FactoryContext) -> Self {
        Self {
            inner: Arc::new(context),
        }
    }

    pub fn config(&self) -> &BindingConfig {
        &self.inner.config
    }

    pub fn codec(&self) -> &MessageCodec {
        &self.inner.codec
    }

    /// `CreateChannel`.
    ///
    /// `via` defaults to `to`. Fails with `Configuration` when the addresses
    /// break the addressing rule, the scheme does not fit the security mode,
    /// or the transport usage forbids the requested kind.
    pub fn create_channel(
        &self,
        kind: ChannelKind,
        to: Uri,
        via: Option<Uri>,
    ) -> Result<Channel, ChannelError> {
        self.inner.check_open()?;
        let via = via.unwrap_or_else(|| to.clone());
        self.inner.check_channel(kind, &to, &via)?;
        tracing::debug!(?kind, %to, %via, "creating channel");

        Ok(match kind {
            ChannelKind::Request => {
                Channel::Request(RequestChannel::new(Arc::clone(&self.inner), to, via))
            }
            ChannelKind::Duplex => {
                Channel::Duplex(DuplexSessionChannel::new(Arc::clone(&self.inner), to, via))
            }
        })
    }

    pub fn create_request_channel(
        &self,
        to: Uri,
        via: Option<Uri>,
    ) -> Result<RequestChannel, ChannelError> {
        self.create_channel(ChannelKind::Request, to, via)?
            .into_request()
            .ok_or_else(|| ChannelError::invalid_operation("factory returned a duplex channel"))
    }

    pub fn create_duplex_channel(
        &self,
        to: Uri,
        via: Option<Uri>,
    ) -> Result<DuplexSessionChannel, ChannelError> {
        self.create_channel(ChannelKind::Duplex, to, via)?
            .into_duplex()
            .ok_or_else(|| ChannelError::invalid_operation("factory returned a request channel"))
    }

    /// Token provider containers for `to` reached through `via`.
    ///
    /// Empty when both authentication schemes are anonymous.
    pub fn token_providers(&self, to: &Uri, via: &Uri) -> TokenProviders {
        self.inner.token_providers(to, via)
    }

    /// `GetConnection`: the pooled connection for `via`, built on a miss.
    ///
    /// `providers` must be open. Credentials and proxy resolution share the
    /// `timeout` budget.
    pub async fn get_connection(
        &self,
        via: &Uri,
        providers: &TokenProviders,
        duplex: bool,
        timeout: Duration,
    ) -> Result<AcquiredConnection, ChannelError> {
        let budget = TimeoutBudget::new(timeout).with_cancellation(self.inner.cancel.clone());
        self.inner.acquire(via, providers, duplex, &budget).await
    }

    /// Number of pooled connections.
    pub fn pooled_connections(&self) -> usize {
        self.inner.pool.len()
    }

    /// Duplex sessions currently holding a connection.
    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.active()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Close every channel created by this factory and drop the pool.
    pub fn close(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.shutdown();
        tracing::debug!(pooled = self.inner.pool.len(), "channel factory closed");
    }

    /// Like [`close`](Self::close); idempotent and never fails.
    pub fn abort(&self) {
        self.shutdown();
    }

    fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.pool.clear();
        if let Some(manager) = &self.inner.token_manager {
            manager.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyMode, SecurityMode};
    use crate::security::{AuthScheme, Credential, CredentialProvider};
    use crate::testing::{CountingTransportFactory, ScriptedConnector};
    use futures::future::BoxFuture;
    use std::sync::atomic::Ordering;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    fn factory_with(config: BindingConfig) -> (ChannelFactory, Arc<CountingTransportFactory>) {
        let transports = Arc::new(CountingTransportFactory::default());
        let factory = ChannelFactory::builder()
            .config(config)
            .transport_factory(transports.clone())
            .duplex_connector(Arc::new(ScriptedConnector::default()))
            .build()
            .unwrap();
        (factory, transports)
    }

    /// Answers with a user named after the target's first path segment,
    /// after an optional delay.
    struct PerTenantProvider {
        delay: Duration,
    }

    impl CredentialProvider for PerTenantProvider {
        fn get_credential<'a>(
            &'a self,
            _scheme: AuthScheme,
            target: &'a Uri,
            _timeout: Duration,
        ) -> BoxFuture<'a, Result<CredentialGrant, ChannelError>> {
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                let tenant = target.path().split('/').nth(1).unwrap_or_default();
                Ok(CredentialGrant::new(Credential::Basic {
                    username: tenant.to_string(),
                    password: "secret".into(),
                }))
            })
        }
    }

    fn basic_factory(delay: Duration) -> (ChannelFactory, Arc<CountingTransportFactory>) {
        let transports = Arc::new(CountingTransportFactory::default());
        let config = BindingConfig {
            auth_scheme: AuthScheme::Basic,
            ..Default::default()
        };
        let factory = ChannelFactory::builder()
            .config(config)
            .transport_factory(transports.clone())
            .credential_provider(Arc::new(PerTenantProvider { delay }))
            .build()
            .unwrap();
        (factory, transports)
    }

    async fn acquire(factory: &ChannelFactory, to: &str, duplex: bool) -> AcquiredConnection {
        let to = uri(to);
        let providers = factory.token_providers(&to, &to);
        providers.open(&TimeoutBudget::new(Duration::from_secs(5))).unwrap();
        factory
            .get_connection(&to, &providers, duplex, Duration::from_secs(5))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_identical_inputs_share_a_connection() {
        let (factory, transports) = factory_with(BindingConfig::default());
        let a = acquire(&factory, "http://svc/a", false).await;
        let b = acquire(&factory, "http://svc/b", false).await;
        assert!(Arc::ptr_eq(&a.connection, &b.connection));
        assert_eq!(transports.created.load(Ordering::SeqCst), 1);

        let duplex = acquire(&factory, "http://svc/a", true).await;
        assert!(!Arc::ptr_eq(&a.connection, &duplex.connection));
        assert_eq!(factory.pooled_connections(), 2);
    }

    #[tokio::test]
    async fn test_credential_identity_partitions_the_pool() {
        let (factory, transports) = basic_factory(Duration::ZERO);
        let alice = acquire(&factory, "http://svc/alice/orders", false).await;
        let alice_again = acquire(&factory, "http://svc/alice/orders", false).await;
        let bob = acquire(&factory, "http://svc/bob/orders", false).await;

        assert!(Arc::ptr_eq(&alice.connection, &alice_again.connection));
        assert!(!Arc::ptr_eq(&alice.connection, &bob.connection));
        assert_eq!(transports.created.load(Ordering::SeqCst), 2);
        assert!(matches!(
            alice.grant.credential,
            Credential::Basic { ref username, .. } if username == "alice"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_credential_delay_is_charged_to_the_budget() {
        let total = Duration::from_secs(2);
        let (factory, _) = basic_factory(total / 2);
        let to = uri("http://svc/alice/orders");
        let providers = factory.token_providers(&to, &to);
        let budget = TimeoutBudget::new(total);
        providers.open(&budget).unwrap();

        factory.inner.acquire(&to, &providers, false, &budget).await.unwrap();
        assert!(budget.remaining() <= total / 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_credential_times_out() {
        let (factory, transports) = basic_factory(Duration::from_secs(10));
        let to = uri("http://svc/alice/orders");
        let providers = factory.token_providers(&to, &to);
        providers.open(&TimeoutBudget::new(Duration::from_secs(1))).unwrap();

        let err = factory
            .get_connection(&to, &providers, false, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)), "{err:?}");
        assert_eq!(transports.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_zero_budget_fails_before_io() {
        let (factory, transports) = factory_with(BindingConfig::default());
        let to = uri("http://svc/a");
        let err = factory
            .get_connection(&to, &TokenProviders::none(), false, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)));
        assert_eq!(transports.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_open_requires_provider_for_authentication() {
        let config = BindingConfig {
            auth_scheme: AuthScheme::Bearer,
            ..Default::default()
        };
        let err = ChannelFactory::open(config).unwrap_err();
        assert!(matches!(err, ChannelError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_explicit_proxy_is_part_of_the_route() {
        let (factory, _) = factory_with(BindingConfig {
            proxy: crate::config::ProxySettings {
                mode: ProxyMode::Explicit(uri("http://proxy:3128")),
                bypass_on_local: false,
                bypass_list: vec!["direct.example".into()],
            },
            ..Default::default()
        });
        let proxied = acquire(&factory, "http://svc.example/a", false).await;
        assert_eq!(proxied.settings.route.proxy(), Some(&uri("http://proxy:3128")));
        assert_eq!(proxied.connection.forward_proxy(), Some(&uri("http://proxy:3128")));

        let direct = acquire(&factory, "http://direct.example/a", false).await;
        assert_eq!(direct.settings.route, ProxyRoute::Direct);
        assert!(!Arc::ptr_eq(&proxied.connection, &direct.connection));
    }

    #[test]
    fn test_addressing_rule() {
        let (factory, _) = factory_with(BindingConfig {
            addressing_enabled: false,
            ..Default::default()
        });
        let err = factory
            .create_request_channel(uri("http://svc/a"), Some(uri("http://gateway/a")))
            .unwrap_err();
        assert!(matches!(err, ChannelError::Configuration(_)));
        assert!(factory.create_request_channel(uri("http://svc/a"), None).is_ok());
    }

    #[test]
    fn test_scheme_and_usage_rules() {
        let (factory, _) = factory_with(BindingConfig::default());
        assert!(factory.create_request_channel(uri("https://svc/a"), None).is_err());
        assert!(factory.create_request_channel(uri("ws://svc/a"), None).is_err());
        assert!(factory.create_duplex_channel(uri("ws://svc/a"), None).is_ok());
        assert!(factory.create_duplex_channel(uri("http://svc/a"), None).is_ok());

        let (secure, _) = factory_with(BindingConfig {
            security_mode: SecurityMode::Transport,
            ..Default::default()
        });
        assert!(secure.create_request_channel(uri("https://svc/a"), None).is_ok());
        assert!(secure.create_duplex_channel(uri("ws://svc/a"), None).is_err());

        let (always, _) = factory_with(BindingConfig {
            transport_usage: TransportUsage::Always,
            ..Default::default()
        });
        assert!(always.create_request_channel(uri("http://svc/a"), None).is_err());

        let (never, _) = factory_with(BindingConfig {
            transport_usage: TransportUsage::Never,
            ..Default::default()
        });
        assert!(never.create_duplex_channel(uri("ws://svc/a"), None).is_err());
    }

    #[tokio::test]
    async fn test_close_drops_pool_and_refuses_channels() {
        let (factory, _) = factory_with(BindingConfig::default());
        acquire(&factory, "http://svc/a", false).await;
        assert_eq!(factory.pooled_connections(), 1);

        factory.close();
        assert!(factory.is_closed());
        assert_eq!(factory.pooled_connections(), 0);
        let err = factory.create_request_channel(uri("http://svc/a"), None).unwrap_err();
        assert!(matches!(err, ChannelError::InvalidOperation(_)));
        factory.abort();
    }
}
