//! HTTP transport layer.
//!
//! Channels talk to the network through the [`HttpSend`] seam. The production
//! implementation is [`HyperTransport`]: hyper-util's legacy client over a
//! rustls connector and a [`ProxyConnector`], supporting:
//!
//! - HTTP/1.1 and HTTP/2 with ALPN negotiation
//! - TLS with rustls (feature-gated), client certificates and peer pinning
//! - Forward proxies for `http` and `CONNECT` tunnels for `https`
//!
//! A [`TransportFactory`] builds one transport per pooled connection entry.

mod body;
mod connector;
mod cookies;
mod hyper;
mod proxy;

use std::sync::Arc;
use std::time::Duration;

use channelrpc_core::ChannelError;
use futures::future::BoxFuture;
use http::{Request, Response};

pub use body::{ResponseBody, TransportBody, full_response_body, into_body_stream};
pub use connector::{build_tls_config, has_tls_support, thumbprint};
pub use cookies::CookieJar;
pub use self::hyper::{HyperTransport, HyperTransportBuilder};
pub use proxy::{ProxyConnector, ProxyRoute, ProxyStream};
pub(crate) use proxy::{authority_of, is_secure};

pub use rustls::ClientConfig as TlsClientConfig;

use crate::config::TlsSettings;
use crate::error::TransportError;

/// Sends one HTTP request and resolves to its response head.
///
/// The response body streams afterwards; its errors are already classified.
pub trait HttpSend: Send + Sync + 'static {
    fn send(
        &self,
        request: Request<TransportBody>,
    ) -> BoxFuture<'static, Result<Response<ResponseBody>, TransportError>>;
}

/// Everything a pooled connection is built from.
#[derive(Clone, Debug)]
pub struct ConnectionSettings {
    pub route: ProxyRoute,
    pub tls: TlsSettings,
    pub keep_alive: bool,
    pub pool_idle_timeout: Option<Duration>,
    pub pool_max_idle_per_host: usize,
}

/// Builds the transport behind a new pool entry.
pub trait TransportFactory: Send + Sync + 'static {
    fn create(&self, settings: &ConnectionSettings) -> Result<Arc<dyn HttpSend>, ChannelError>;
}

/// [`TransportFactory`] producing [`HyperTransport`]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct HyperTransportFactory;

impl TransportFactory for HyperTransportFactory {
    fn create(&self, settings: &ConnectionSettings) -> Result<Arc<dyn HttpSend>, ChannelError> {
        let tls = build_tls_config(&settings.tls)?;
        let transport = HyperTransport::builder(tls)
            .route(settings.route.clone())
            .keep_alive(settings.keep_alive)
            .pool_idle_timeout(settings.pool_idle_timeout)
            .pool_max_idle_per_host(settings.pool_max_idle_per_host)
            .build();
        Ok(Arc::new(transport))
    }
}
