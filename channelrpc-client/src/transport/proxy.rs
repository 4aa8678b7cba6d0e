//! Proxy-aware connector.
//!
//! Sits below the TLS layer. Plain `http` destinations behind a proxy reuse
//! one TCP connection to the proxy and send absolute-form requests; secure
//! destinations are tunnelled with `CONNECT`, after which TLS runs end to
//! end with the origin.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::BoxFuture;
use http::header::{HOST, PROXY_AUTHORIZATION};
use http::{HeaderValue, Method, Request, Uri};
use http_body_util::Empty;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::upgrade::Upgraded;
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use hyper_util::rt::TokioIo;
use pin_project_lite::pin_project;
use tokio::net::TcpStream;
use tower::ServiceExt;
use tower_service::Service;

use crate::error::{TransportError, TransportErrorKind};

/// How a connection reaches its destination.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ProxyRoute {
    #[default]
    Direct,
    Via {
        proxy: Uri,
        /// Sent on `CONNECT` requests; forwarded requests carry it themselves.
        authorization: Option<HeaderValue>,
    },
}

impl ProxyRoute {
    pub fn proxy(&self) -> Option<&Uri> {
        match self {
            ProxyRoute::Direct => None,
            ProxyRoute::Via { proxy, .. } => Some(proxy),
        }
    }

    /// Whether requests to `destination` are forwarded in absolute form
    /// rather than tunnelled.
    pub fn forwards(&self, destination: &Uri) -> bool {
        matches!(self, ProxyRoute::Via { .. }) && !is_secure(destination)
    }
}

pub(crate) fn is_secure(uri: &Uri) -> bool {
    matches!(uri.scheme_str(), Some("https") | Some("wss"))
}

pub(crate) fn default_port(uri: &Uri) -> u16 {
    uri.port_u16()
        .unwrap_or(if is_secure(uri) { 443 } else { 80 })
}

/// `host:port` of `uri`, with the scheme's default port filled in.
pub(crate) fn authority_of(uri: &Uri) -> Result<String, TransportError> {
    let host = uri.host().ok_or_else(|| {
        TransportError::new(TransportErrorKind::Unreachable, format!("{uri} has no host"))
    })?;
    Ok(format!("{host}:{}", default_port(uri)))
}

pin_project! {
    /// Stream returned by [`ProxyConnector`].
    #[project = ProxyStreamProj]
    pub enum ProxyStream {
        Tcp {
            #[pin]
            io: TokioIo<TcpStream>,
            forwarded: bool,
        },
        Tunnel {
            #[pin]
            io: Upgraded,
        },
    }
}

impl std::fmt::Debug for ProxyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyStream::Tcp { forwarded, .. } => f
                .debug_struct("ProxyStream::Tcp")
                .field("forwarded", forwarded)
                .finish_non_exhaustive(),
            ProxyStream::Tunnel { .. } => write!(f, "ProxyStream::Tunnel"),
        }
    }
}

impl Read for ProxyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            ProxyStreamProj::Tcp { io, .. } => io.poll_read(cx, buf),
            ProxyStreamProj::Tunnel { io } => io.poll_read(cx, buf),
        }
    }
}

impl Write for ProxyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            ProxyStreamProj::Tcp { io, .. } => io.poll_write(cx, buf),
            ProxyStreamProj::Tunnel { io } => io.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ProxyStreamProj::Tcp { io, .. } => io.poll_flush(cx),
            ProxyStreamProj::Tunnel { io } => io.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ProxyStreamProj::Tcp { io, .. } => io.poll_shutdown(cx),
            ProxyStreamProj::Tunnel { io } => io.poll_shutdown(cx),
        }
    }
}

impl Connection for ProxyStream {
    fn connected(&self) -> Connected {
        match self {
            ProxyStream::Tcp { io, forwarded } => io.connected().proxy(*forwarded),
            ProxyStream::Tunnel { .. } => Connected::new(),
        }
    }
}

/// Connector implementing [`ProxyRoute`] on top of hyper-util's
/// `HttpConnector`.
#[derive(Clone, Debug)]
pub struct ProxyConnector {
    http: HttpConnector,
    route: ProxyRoute,
}

impl ProxyConnector {
    pub fn new(route: ProxyRoute) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        Self { http, route }
    }

    pub fn route(&self) -> &ProxyRoute {
        &self.route
    }
}

async fn connect_tcp(
    http: HttpConnector,
    target: Uri,
) -> Result<TokioIo<TcpStream>, TransportError> {
    http.oneshot(target)
        .await
        .map_err(|e| TransportError::from_source(&e, TransportErrorKind::Unreachable))
}

/// Open a `CONNECT` tunnel to `destination` through `proxy_io`.
async fn tunnel(
    proxy_io: TokioIo<TcpStream>,
    destination: &Uri,
    authorization: Option<HeaderValue>,
) -> Result<Upgraded, TransportError> {
    let authority = authority_of(destination)?;
    let (mut sender, connection) = hyper::client::conn::http1::handshake(proxy_io)
        .await
        .map_err(|e| TransportError::from_hyper_body(&e))?;
    tokio::spawn(async move {
        if let Err(err) = connection.with_upgrades().await {
            tracing::debug!(error = %err, "proxy tunnel connection ended");
        }
    });

    let mut request = Request::builder()
        .method(Method::CONNECT)
        .uri(authority.as_str())
        .header(HOST, authority.as_str());
    if let Some(value) = authorization {
        request = request.header(PROXY_AUTHORIZATION, value);
    }
    let request = request
        .body(Empty::<Bytes>::new())
        .map_err(|e| TransportError::other(format!("invalid CONNECT request: {e}")))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| TransportError::from_hyper_body(&e))?;
    let status = response.status();
    if !status.is_success() {
        let kind = if status == http::StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            TransportErrorKind::Other
        } else {
            TransportErrorKind::Unreachable
        };
        return Err(TransportError::new(
            kind,
            format!("proxy refused CONNECT to {authority}: {status}"),
        ));
    }
    tracing::debug!(%authority, "proxy tunnel established");
    hyper::upgrade::on(response)
        .await
        .map_err(|e| TransportError::from_hyper_body(&e))
}

impl Service<Uri> for ProxyConnector {
    type Response = ProxyStream;
    type Error = TransportError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Service::<Uri>::poll_ready(&mut self.http, cx)
            .map_err(|e| TransportError::from_source(&e, TransportErrorKind::Other))
    }

    fn call(&mut self, destination: Uri) -> Self::Future {
        let http = self.http.clone();
        let route = self.route.clone();
        Box::pin(async move {
            match route {
                ProxyRoute::Direct => Ok(ProxyStream::Tcp {
                    io: connect_tcp(http, destination).await?,
                    forwarded: false,
                }),
                ProxyRoute::Via { proxy, authorization } => {
                    let proxy_io = connect_tcp(http, proxy).await?;
                    if is_secure(&destination) {
                        let io = tunnel(proxy_io, &destination, authorization).await?;
                        Ok(ProxyStream::Tunnel { io })
                    } else {
                        Ok(ProxyStream::Tcp {
                            io: proxy_io,
                            forwarded: true,
                        })
                    }
                }
            }
        })
    }
}
