//! Channel factory builder.
//!
//! Provides a fluent API for configuring and opening a [`ChannelFactory`].

use std::sync::Arc;

use channelrpc_core::{BufferPool, ChannelError, MessageCodec, SharedMruCache};
use tokio_util::sync::CancellationToken;

use crate::config::{BindingConfig, EnvProxyResolver, ProxyResolver, SecurityMode};
use crate::duplex::{DuplexConnector, SessionRegistry, WebSocketConnector};
use crate::factory::{ChannelFactory, FactoryContext};
use crate::pool::ConnectionPool;
use crate::security::{CredentialProvider, SecurityTokenManager};
use crate::transport::{HyperTransportFactory, TransportFactory, has_tls_support};

/// Pooled connections kept per factory.
const CONNECTION_POOL_CAPACITY: usize = 64;

/// Memoized fingerprint hashes kept per factory.
const HASH_CACHE_CAPACITY: usize = 128;

/// Builder for creating a [`ChannelFactory`].
///
/// # Example
///
/// ```ignore
/// use channelrpc_client::{AuthScheme, BindingConfig, ChannelFactoryBuilder, Credential,
///     StaticCredentialProvider};
/// use std::sync::Arc;
///
/// let factory = ChannelFactoryBuilder::new()
///     .config(BindingConfig {
///         auth_scheme: AuthScheme::Basic,
///         ..Default::default()
///     })
///     .credential_provider(Arc::new(StaticCredentialProvider::new(Credential::Basic {
///         username: "alice".into(),
///         password: "secret".into(),
///     })))
///     .build()?;
/// ```
pub struct ChannelFactoryBuilder {
    /// Binding configuration, validated by `build`.
    config: BindingConfig,
    /// Builds the HTTP transport behind each pooled connection.
    transport_factory: Option<Arc<dyn TransportFactory>>,
    /// Opens duplex transports.
    duplex_connector: Option<Arc<dyn DuplexConnector>>,
    /// Source of credentials for non-anonymous schemes.
    credential_provider: Option<Arc<dyn CredentialProvider>>,
    /// Proxy lookup under `ProxyMode::System`.
    proxy_resolver: Option<Arc<dyn ProxyResolver>>,
}

impl std::fmt::Debug for ChannelFactoryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelFactoryBuilder")
            .field("config", &self.config)
            .field("transport_factory", &self.transport_factory.is_some())
            .field("duplex_connector", &self.duplex_connector.is_some())
            .field("credential_provider", &self.credential_provider.is_some())
            .field("proxy_resolver", &self.proxy_resolver.is_some())
            .finish()
    }
}

impl Default for ChannelFactoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelFactoryBuilder {
    /// Create a builder with the default [`BindingConfig`].
    pub fn new() -> Self {
        Self {
            config: BindingConfig::default(),
            transport_factory: None,
            duplex_connector: None,
            credential_provider: None,
            proxy_resolver: None,
        }
    }

    /// Use this binding configuration.
    ///
    /// It is validated once, when [`build`](Self::build) runs.
    pub fn config(mut self, config: BindingConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the HTTP transport.
    ///
    /// Defaults to [`HyperTransportFactory`]. Tests pass an in-memory
    /// factory here.
    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    /// Replace the duplex transport.
    ///
    /// Defaults to [`WebSocketConnector`].
    pub fn duplex_connector(mut self, connector: Arc<dyn DuplexConnector>) -> Self {
        self.duplex_connector = Some(connector);
        self
    }

    /// Set the credential provider.
    ///
    /// Required when either `auth_scheme` or `proxy_auth_scheme` is not
    /// anonymous; ignored otherwise.
    pub fn credential_provider(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credential_provider = Some(provider);
        self
    }

    /// Set the resolver consulted under [`ProxyMode::System`](crate::ProxyMode::System).
    ///
    /// Defaults to [`EnvProxyResolver`].
    pub fn proxy_resolver(mut self, resolver: Arc<dyn ProxyResolver>) -> Self {
        self.proxy_resolver = Some(resolver);
        self
    }

    /// Validate the configuration and open the factory.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Configuration`] if the configuration is
    /// inconsistent, transport security is requested without TLS support,
    /// or a non-anonymous scheme has no credential provider.
    pub fn build(self) -> Result<ChannelFactory, ChannelError> {
        let config = self.config;
        config.validate()?;

        if config.security_mode == SecurityMode::Transport && !has_tls_support() {
            return Err(ChannelError::configuration(
                "transport security requires the `tls` feature \
                 (a crypto provider and root certificates)",
            ));
        }

        let token_manager = if config.needs_token_manager() {
            let provider = self.credential_provider.ok_or_else(|| {
                ChannelError::configuration(format!(
                    "authentication scheme {} / proxy scheme {} requires a credential provider",
                    config.auth_scheme, config.proxy_auth_scheme
                ))
            })?;
            Some(Arc::new(SecurityTokenManager::new(
                provider,
                config.auth_scheme,
                config.proxy_auth_scheme,
            )))
        } else {
            None
        };

        let codec = MessageCodec::new(
            config.encoding,
            config.max_received_message_size,
            config.max_buffer_size,
        );
        let buffers = BufferPool::new(config.max_buffer_pool_size, config.max_buffer_size);

        tracing::debug!(
            transfer_mode = ?config.transfer_mode,
            encoding = ?config.encoding,
            auth_scheme = %config.auth_scheme,
            security_mode = ?config.security_mode,
            "channel factory opened"
        );

        Ok(ChannelFactory::from_context(FactoryContext {
            codec,
            buffers,
            pool: ConnectionPool::new(CONNECTION_POOL_CAPACITY),
            hash_cache: SharedMruCache::new(HASH_CACHE_CAPACITY),
            token_manager,
            proxy_resolver: self
                .proxy_resolver
                .unwrap_or_else(|| Arc::new(EnvProxyResolver)),
            transport_factory: self
                .transport_factory
                .unwrap_or_else(|| Arc::new(HyperTransportFactory)),
            duplex_connector: self
                .duplex_connector
                .unwrap_or_else(|| Arc::new(WebSocketConnector)),
            sessions: SessionRegistry::new(),
            cancel: CancellationToken::new(),
            config,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferMode;
    use crate::security::AuthScheme;

    #[test]
    fn test_build_defaults() {
        let factory = ChannelFactoryBuilder::new().build().unwrap();
        assert!(!factory.is_closed());
        assert_eq!(factory.pooled_connections(), 0);
        assert_eq!(factory.codec().max_message_size(), factory.config().max_received_message_size);
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let err = ChannelFactoryBuilder::new()
            .config(BindingConfig {
                transfer_mode: TransferMode::Streamed,
                auth_scheme: AuthScheme::Basic,
                ..Default::default()
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, ChannelError::Configuration(_)));
    }

    #[test]
    fn test_anonymous_ignores_provider() {
        let factory = ChannelFactoryBuilder::new()
            .credential_provider(Arc::new(crate::security::StaticCredentialProvider::new(
                crate::security::Credential::Bearer("token".into()),
            )))
            .build()
            .unwrap();
        let svc: http::Uri = "http://svc/".parse().unwrap();
        assert!(factory.token_providers(&svc, &svc).is_empty());
    }
}
