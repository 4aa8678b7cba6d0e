//! Hyper-based HTTP transport.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use http_body_util::BodyExt;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use rustls::ClientConfig;
use tower::ServiceExt;
use tower_service::Service;

use super::body::{ResponseBody, TransportBody};
use super::proxy::{ProxyConnector, ProxyRoute};
use super::HttpSend;
use crate::error::TransportError;

type HyperClient = Client<HttpsConnector<ProxyConnector>, TransportBody>;

/// HTTP transport over hyper-util's pooling client.
///
/// One instance backs one pooled connection entry: its TLS identity and
/// proxy route are fixed at construction.
#[derive(Clone)]
pub struct HyperTransport {
    client: HyperClient,
    route: ProxyRoute,
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperTransport")
            .field("route", &self.route)
            .finish_non_exhaustive()
    }
}

impl HyperTransport {
    pub fn builder(tls_config: ClientConfig) -> HyperTransportBuilder {
        HyperTransportBuilder::new(tls_config)
    }

    pub fn route(&self) -> &ProxyRoute {
        &self.route
    }
}

/// Builder for [`HyperTransport`].
pub struct HyperTransportBuilder {
    tls_config: ClientConfig,
    route: ProxyRoute,
    http2_only: bool,
    keep_alive: bool,
    pool_idle_timeout: Option<Duration>,
    pool_max_idle_per_host: usize,
}

impl HyperTransportBuilder {
    pub fn new(tls_config: ClientConfig) -> Self {
        Self {
            tls_config,
            route: ProxyRoute::Direct,
            http2_only: false,
            keep_alive: true,
            pool_idle_timeout: Some(Duration::from_secs(90)),
            pool_max_idle_per_host: 32,
        }
    }

    pub fn route(mut self, route: ProxyRoute) -> Self {
        self.route = route;
        self
    }

    /// Use HTTP/2 without negotiation (h2c for plain destinations).
    pub fn http2_only(mut self, enabled: bool) -> Self {
        self.http2_only = enabled;
        self
    }

    /// When disabled, connections are closed after each exchange.
    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = enabled;
        self
    }

    pub fn pool_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.pool_idle_timeout = timeout;
        self
    }

    pub fn pool_max_idle_per_host(mut self, max: usize) -> Self {
        self.pool_max_idle_per_host = max;
        self
    }

    pub fn build(self) -> HyperTransport {
        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(self.tls_config)
            .https_or_http()
            .enable_all_versions()
            .wrap_connector(ProxyConnector::new(self.route.clone()));

        let mut builder = Client::builder(TokioExecutor::new());
        builder.pool_timer(TokioTimer::new());
        builder.pool_idle_timeout(self.pool_idle_timeout);
        builder.pool_max_idle_per_host(if self.keep_alive {
            self.pool_max_idle_per_host
        } else {
            0
        });
        if self.http2_only {
            builder.http2_only(true);
        }

        HyperTransport {
            client: builder.build(connector),
            route: self.route,
        }
    }
}

impl std::fmt::Debug for HyperTransportBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperTransportBuilder")
            .field("route", &self.route)
            .field("http2_only", &self.http2_only)
            .field("keep_alive", &self.keep_alive)
            .field("pool_idle_timeout", &self.pool_idle_timeout)
            .field("pool_max_idle_per_host", &self.pool_max_idle_per_host)
            .finish_non_exhaustive()
    }
}

impl Service<http::Request<TransportBody>> for HyperTransport {
    type Response = http::Response<ResponseBody>;
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // legacy::Client is always ready
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<TransportBody>) -> Self::Future {
        let client = self.client.clone();
        Box::pin(async move {
            let response = client
                .request(req)
                .await
                .map_err(|e| TransportError::from_hyper(&e))?;
            Ok(response.map(|body| {
                body.map_err(|e| TransportError::from_hyper_body(&e))
                    .boxed_unsync()
            }))
        })
    }
}

impl HttpSend for HyperTransport {
    fn send(
        &self,
        request: http::Request<TransportBody>,
    ) -> futures::future::BoxFuture<'static, Result<http::Response<ResponseBody>, TransportError>>
    {
        Box::pin(self.clone().oneshot(request))
    }
}
