//! WebSocket transport for duplex sessions.
//!
//! The upgrade is performed with hyper directly (so the handshake can be
//! validated and routed through the proxy connector), then the upgraded
//! connection is handed to tokio-tungstenite for framing.

use std::pin::Pin;

use bytes::Bytes;
use channelrpc_core::{BodyStream, ChannelError};
use futures::future::BoxFuture;
use futures::{Sink, SinkExt, StreamExt};
use http::uri::PathAndQuery;
use http::{HeaderMap, StatusCode, Uri};
use hyper::upgrade::Upgraded;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tower::ServiceExt;

use super::handshake;
use crate::error::{TransportError, TransportErrorKind};
use crate::transport::{ConnectionSettings, ProxyConnector, build_tls_config};

/// Outbound half of a duplex transport. Each item is written as one
/// binary frame; closing the sink sends the end-of-output signal.
pub type FrameSink = Pin<Box<dyn Sink<Bytes, Error = ChannelError> + Send>>;

/// What a [`DuplexConnector`] needs to open one session.
#[derive(Clone, Debug)]
pub struct UpgradeRequest {
    /// Destination with an `http`/`https` scheme.
    pub uri: Uri,
    /// Extra headers (authorization, cookies, user agent).
    pub headers: HeaderMap,
    pub subprotocols: Vec<String>,
    pub max_message_size: usize,
    pub http2_extended_connect: bool,
}

/// An established bidirectional byte transport.
pub struct DuplexTransport {
    pub sink: FrameSink,
    /// Inbound bytes; ends when the peer closes its output.
    pub source: BodyStream,
    pub subprotocol: Option<String>,
}

impl std::fmt::Debug for DuplexTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexTransport")
            .field("subprotocol", &self.subprotocol)
            .finish_non_exhaustive()
    }
}

/// Opens duplex transports.
pub trait DuplexConnector: Send + Sync + 'static {
    fn connect<'a>(
        &'a self,
        request: UpgradeRequest,
        settings: &'a ConnectionSettings,
    ) -> BoxFuture<'a, Result<DuplexTransport, ChannelError>>;
}

/// [`DuplexConnector`] speaking WebSocket over hyper.
///
/// Every session dials its own socket with the pooled entry's
/// [`ConnectionSettings`]. An upgraded connection belongs to one session and
/// can never return to a keep-alive pool, so for duplex channels the pool
/// entry shares settings and cookie state rather than sockets. Each live
/// session holds a [`ConnectionLease`](super::ConnectionLease) on that entry.
#[derive(Clone, Copy, Debug, Default)]
pub struct WebSocketConnector;

impl DuplexConnector for WebSocketConnector {
    fn connect<'a>(
        &'a self,
        request: UpgradeRequest,
        settings: &'a ConnectionSettings,
    ) -> BoxFuture<'a, Result<DuplexTransport, ChannelError>> {
        Box::pin(async move {
            let destination = request.uri.to_string();
            let (upgraded, subprotocol) = if request.http2_extended_connect {
                match upgrade_http2(&request, settings, &destination).await {
                    Ok(done) => done,
                    Err(err) => {
                        tracing::debug!(
                            %destination,
                            error = %err,
                            "extended CONNECT failed, falling back to HTTP/1.1 upgrade"
                        );
                        upgrade_http1(&request, settings, &destination).await?
                    }
                }
            } else {
                upgrade_http1(&request, settings, &destination).await?
            };
            tracing::debug!(%destination, ?subprotocol, "websocket handshake complete");

            let mut config = WebSocketConfig::default();
            config.max_message_size = Some(request.max_message_size);
            let socket =
                WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Client, Some(config))
                    .await;
            Ok(split(socket, destination, subprotocol))
        })
    }
}

fn https_connector(
    settings: &ConnectionSettings,
    http2: bool,
) -> Result<HttpsConnector<ProxyConnector>, ChannelError> {
    let builder = HttpsConnectorBuilder::new()
        .with_tls_config(build_tls_config(&settings.tls)?)
        .https_or_http();
    let proxy = ProxyConnector::new(settings.route.clone());
    Ok(if http2 {
        builder.enable_http2().wrap_connector(proxy)
    } else {
        builder.enable_http1().wrap_connector(proxy)
    })
}

fn io_error(destination: &str) -> impl Fn(hyper::Error) -> ChannelError + '_ {
    move |err| TransportError::from_hyper_body(&err).into_channel_error(destination)
}

/// Status codes with a meaning of their own, reported before handshake
/// validation.
fn rejected(status: StatusCode, destination: &str) -> Option<ChannelError> {
    let message = format!("upgrade to {destination} rejected with {status}");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Some(ChannelError::Authentication(message))
        }
        StatusCode::NOT_FOUND => Some(ChannelError::EndpointNotFound(message)),
        StatusCode::SERVICE_UNAVAILABLE => Some(ChannelError::ServerBusy(message)),
        _ => None,
    }
}

async fn upgrade_http1(
    request: &UpgradeRequest,
    settings: &ConnectionSettings,
    destination: &str,
) -> Result<(Upgraded, Option<String>), ChannelError> {
    let io = https_connector(settings, false)?
        .oneshot(request.uri.clone())
        .await
        .map_err(|e| {
            TransportError::from_source(e.as_ref(), TransportErrorKind::Unreachable)
                .into_channel_error(destination)
        })?;
    let (mut sender, connection) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(io_error(destination))?;
    tokio::spawn(async move {
        if let Err(err) = connection.with_upgrades().await {
            tracing::debug!(error = %err, "websocket upgrade connection ended");
        }
    });

    let key = handshake::generate_key();
    let mut upgrade = handshake::build_upgrade_request(
        &request.uri,
        &key,
        &request.subprotocols,
        &request.headers,
    )?;
    if !settings.route.forwards(&request.uri) {
        let path = request
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        *upgrade.uri_mut() = Uri::from(path);
    }

    let response = sender
        .send_request(upgrade)
        .await
        .map_err(io_error(destination))?;
    if let Some(err) = rejected(response.status(), destination) {
        return Err(err);
    }
    let subprotocol = handshake::validate_upgrade_response(
        response.status(),
        response.headers(),
        &key,
        &request.subprotocols,
    )
    .map_err(|e| e.with_destination(destination))?;
    let upgraded = hyper::upgrade::on(response)
        .await
        .map_err(io_error(destination))?;
    Ok((upgraded, subprotocol))
}

async fn upgrade_http2(
    request: &UpgradeRequest,
    settings: &ConnectionSettings,
    destination: &str,
) -> Result<(Upgraded, Option<String>), ChannelError> {
    let io = https_connector(settings, true)?
        .oneshot(request.uri.clone())
        .await
        .map_err(|e| {
            TransportError::from_source(e.as_ref(), TransportErrorKind::Unreachable)
                .into_channel_error(destination)
        })?;
    let (mut sender, connection) = hyper::client::conn::http2::handshake(TokioExecutor::new(), io)
        .await
        .map_err(io_error(destination))?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::debug!(error = %err, "extended CONNECT connection ended");
        }
    });

    let connect = handshake::build_extended_connect_request(
        &request.uri,
        &request.subprotocols,
        &request.headers,
    )?;
    let response = sender
        .send_request(connect)
        .await
        .map_err(io_error(destination))?;
    if let Some(err) = rejected(response.status(), destination) {
        return Err(err);
    }
    let subprotocol = handshake::validate_extended_connect_response(
        response.status(),
        response.headers(),
        &request.subprotocols,
    )
    .map_err(|e| e.with_destination(destination))?;
    let upgraded = hyper::upgrade::on(response)
        .await
        .map_err(io_error(destination))?;
    Ok((upgraded, subprotocol))
}

fn split(
    socket: WebSocketStream<TokioIo<Upgraded>>,
    destination: String,
    subprotocol: Option<String>,
) -> DuplexTransport {
    let (sink, stream) = socket.split();

    let sink_destination = destination.clone();
    let sink = sink
        .sink_map_err(move |err| {
            TransportError::from_ws(&err).into_channel_error(&sink_destination)
        })
        .with(|frame: Bytes| {
            futures::future::ready(Ok::<_, ChannelError>(WsMessage::binary(frame.to_vec())))
        });

    let source = futures::stream::unfold(Some(stream), move |state| {
        let destination = destination.clone();
        async move {
            let mut stream = state?;
            loop {
                match stream.next().await {
                    Some(Ok(WsMessage::Binary(data))) => {
                        return Some((Ok(Bytes::from(data)), Some(stream)));
                    }
                    Some(Ok(WsMessage::Text(text))) => {
                        return Some((Ok(Bytes::from(text)), Some(stream)));
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return None,
                    Some(Ok(_)) => continue,
                    Some(Err(WsError::ConnectionClosed)) => return None,
                    Some(Err(err)) => {
                        let err = TransportError::from_ws(&err).into_channel_error(&destination);
                        return Some((Err(err), None));
                    }
                }
            }
        }
    });

    DuplexTransport {
        sink: Box::pin(sink),
        source: Box::pin(source),
        subprotocol,
    }
}
