//! Request/reply channel.
//!
//! Every [`RequestChannel::request`] is one HTTP exchange: the message is
//! encoded into the request body, the pooled connection for the destination
//! sends it, and the response becomes at most one reply message.
//!
//! Status handling:
//!
//! | Status          | Result                                        |
//! |-----------------|-----------------------------------------------|
//! | 2xx, empty body | `Ok(None)`                                    |
//! | 2xx             | decoded reply                                 |
//! | 500             | decoded reply marked as a fault               |
//! | 401, 403        | `Authentication`                              |
//! | 404             | `EndpointNotFound`                            |
//! | 415             | `Protocol` (missing or mismatched media type) |
//! | 503             | `ServerBusy`                                  |
//! | 504             | `Timeout`                                     |
//! | anything else   | `Protocol` quoting the start of the body      |

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use channelrpc_core::{
    BodyStream, ChannelError, ContentEncoding, MAX_EXCERPT_BYTES, Message, body_excerpt,
    read_buffered,
};
use futures::StreamExt;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode, Uri};
use tokio::sync::Notify;
use tracing::Instrument;

use crate::channel::{CloseStart, CommunicationState, Lifecycle};
use crate::factory::{AcquiredConnection, FactoryContext};
use crate::http_property::{HttpRequestProperty, HttpResponseProperty};
use crate::security::TokenProviders;
use crate::timeout::TimeoutBudget;
use crate::transport::{ResponseBody, TransportBody, into_body_stream, is_secure};

/// Header carrying the message action.
pub const ACTION_HEADER: &str = "soapaction";

/// Frames an encoder may queue ahead of the network.
const STREAM_PIPE_CAPACITY: usize = 4;

/// Headers the channel owns; overrides for them are dropped.
fn is_reserved_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "host"
            | "content-length"
            | "content-type"
            | "content-encoding"
            | "accept-encoding"
            | "authorization"
            | "proxy-authorization"
            | "cookie"
            | "upgrade"
            | "te"
            | "trailer"
    )
}

/// Strip whitespace and one pair of surrounding quotes.
fn unquote_action(value: &HeaderValue) -> Result<String, ChannelError> {
    let text = value
        .to_str()
        .map_err(|_| ChannelError::protocol("action header is not valid ASCII"))?
        .trim();
    let text = text
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(text);
    Ok(text.to_string())
}

/// Errors for statuses with a fixed meaning. `None` for 2xx, 500 and
/// statuses reported with a body excerpt.
fn classify_status(
    status: StatusCode,
    reason: Option<&str>,
    destination: &str,
) -> Option<ChannelError> {
    let reason = reason.or(status.canonical_reason()).unwrap_or_default();
    let err = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ChannelError::Authentication(format!(
            "{destination} refused the request: {} {reason}",
            status.as_u16()
        )),
        StatusCode::NOT_FOUND => ChannelError::EndpointNotFound(format!(
            "no endpoint listening at {destination}: {} {reason}",
            status.as_u16()
        )),
        StatusCode::UNSUPPORTED_MEDIA_TYPE => {
            if reason.to_ascii_lowercase().contains("missing") {
                ChannelError::protocol(format!(
                    "{destination} reports the request content-type is missing ({reason})"
                ))
            } else {
                ChannelError::protocol(format!(
                    "{destination} does not accept the request content-type ({reason})"
                ))
            }
        }
        StatusCode::SERVICE_UNAVAILABLE => ChannelError::ServerBusy(format!(
            "{destination} is too busy to process the request: {reason}"
        )),
        StatusCode::GATEWAY_TIMEOUT => ChannelError::Timeout(format!(
            "gateway timed out waiting for {destination}: {reason}"
        )),
        _ => return None,
    };
    Some(err)
}

/// Decode a compressed body chunk by chunk, before any quota counting.
fn decompress(source: BodyStream, encoding: ContentEncoding) -> BodyStream {
    let state = Some((source, encoding.decompressor()));
    Box::pin(futures::stream::unfold(state, |state| async move {
        let (mut source, mut decoder) = state?;
        loop {
            match source.next().await {
                Some(Ok(chunk)) => match decoder.push(chunk) {
                    Ok(out) if out.is_empty() => continue,
                    Ok(out) => return Some((Ok(out), Some((source, decoder)))),
                    Err(err) => return Some((Err(err), None)),
                },
                Some(Err(err)) => return Some((Err(err), None)),
                None => {
                    return match decoder.finish() {
                        Ok(out) if out.is_empty() => None,
                        Ok(out) => Some((Ok(out), None)),
                        Err(err) => Some((Err(err), None)),
                    };
                }
            }
        }
    }))
}

/// First non-empty chunk, or `None` at end of body.
async fn first_chunk(source: &mut BodyStream) -> Result<Option<Bytes>, ChannelError> {
    while let Some(chunk) = source.next().await {
        let chunk = chunk?;
        if !chunk.is_empty() {
            return Ok(Some(chunk));
        }
    }
    Ok(None)
}

/// Up to [`MAX_EXCERPT_BYTES`] of an error body. Best effort.
async fn read_excerpt(mut source: BodyStream, budget: &TimeoutBudget) -> Bytes {
    let read = async {
        let mut buf = BytesMut::new();
        while buf.len() < MAX_EXCERPT_BYTES {
            match source.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                _ => break,
            }
        }
        Ok(buf.freeze())
    };
    budget.run("error body read", read).await.unwrap_or_default()
}

/// Decrements the in-flight count when a request finishes.
struct InFlight<'a> {
    channel: &'a RequestChannel,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.channel.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.channel.idle.notify_waiters();
        }
    }
}

/// One-request, one-reply channel over HTTP.
///
/// Created by
/// [`ChannelFactory::create_request_channel`](crate::ChannelFactory::create_request_channel).
/// The first `request` opens the channel implicitly; concurrent requests are
/// independent exchanges over the same pooled connection.
pub struct RequestChannel {
    ctx: Arc<FactoryContext>,
    to: Uri,
    via: Uri,
    lifecycle: Lifecycle,
    providers: OnceLock<TokenProviders>,
    inflight: AtomicUsize,
    idle: Notify,
}

impl fmt::Debug for RequestChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestChannel")
            .field("to", &self.to)
            .field("via", &self.via)
            .field("state", &self.lifecycle.state())
            .field("inflight", &self.inflight.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl RequestChannel {
    pub(crate) fn new(ctx: Arc<FactoryContext>, to: Uri, via: Uri) -> Self {
        let lifecycle = Lifecycle::new(to.to_string(), &ctx.cancel);
        Self {
            ctx,
            to,
            via,
            lifecycle,
            providers: OnceLock::new(),
            inflight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    /// Logical destination.
    pub fn to(&self) -> &Uri {
        &self.to
    }

    /// Address the request is physically sent to.
    pub fn via(&self) -> &Uri {
        &self.via
    }

    pub fn state(&self) -> CommunicationState {
        self.lifecycle.state()
    }

    /// Open the channel: create and open its token providers.
    ///
    /// Idempotent; concurrent callers share one attempt.
    pub async fn open(&self, timeout: Duration) -> Result<(), ChannelError> {
        let budget = self.lifecycle.budget(timeout);
        self.ensure_open(&budget).await
    }

    /// [`open`](Self::open) with the binding's `open_timeout`.
    pub async fn open_default(&self) -> Result<(), ChannelError> {
        self.open(self.ctx.config.open_timeout).await
    }

    async fn ensure_open(&self, budget: &TimeoutBudget) -> Result<(), ChannelError> {
        self.ctx.check_open()?;
        self.lifecycle
            .ensure_opened(|| async {
                // Under manual addressing providers are per request.
                if self.ctx.config.manual_addressing {
                    return Ok(());
                }
                let providers = self.ctx.token_providers(&self.to, &self.via);
                providers.open(budget)?;
                let _ = self.providers.set(providers);
                Ok(())
            })
            .await
    }

    /// Send `message` and wait for the reply.
    ///
    /// Returns `Ok(None)` when the service answers with an empty 2xx. A 500
    /// with a decodable body is returned as a reply with
    /// [`is_fault`](Message::is_fault) set.
    ///
    /// # Errors
    ///
    /// See the module docs for status mapping. Any failure other than
    /// `Timeout` or `Cancelled` faults the channel.
    pub async fn request(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<Option<Message>, ChannelError> {
        let budget = self.lifecycle.budget(timeout);
        self.request_with_budget(message, &budget).await
    }

    /// [`request`](Self::request) with the binding's `send_timeout`.
    pub async fn request_default(&self, message: Message) -> Result<Option<Message>, ChannelError> {
        self.request(message, self.ctx.config.send_timeout).await
    }

    /// Like [`request`](Self::request), charging an existing budget.
    pub async fn request_with_budget(
        &self,
        message: Message,
        budget: &TimeoutBudget,
    ) -> Result<Option<Message>, ChannelError> {
        let span = tracing::info_span!(
            "channel.request",
            to = %self.to,
            action = message.action().unwrap_or_default(),
        );
        async move {
            if self.lifecycle.state().is_terminal() {
                self.lifecycle.check_opened()?;
            }
            budget.check("request")?;
            self.ensure_open(budget).await?;
            self.lifecycle.check_opened()?;

            self.inflight.fetch_add(1, Ordering::AcqRel);
            let _inflight = InFlight { channel: self };

            let result = tokio::select! {
                biased;
                _ = self.lifecycle.token().cancelled() => Err(ChannelError::Cancelled(format!(
                    "request to {} was aborted",
                    self.to
                ))),
                result = self.exchange(message, budget) => result,
            };
            if let Err(err) = &result {
                if !matches!(err, ChannelError::Timeout(_) | ChannelError::Cancelled(_)) {
                    self.lifecycle.fault(err);
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn exchange(
        &self,
        mut message: Message,
        budget: &TimeoutBudget,
    ) -> Result<Option<Message>, ChannelError> {
        if !self.ctx.config.manual_addressing {
            if message.to().is_none() {
                message.set_to(self.to.to_string());
            }
            let fallback = TokenProviders::none();
            let providers = self.providers.get().unwrap_or(&fallback);
            return self.send_and_receive(message, &self.via, providers, budget).await;
        }

        let target = message_target(&message)?;
        let providers = self.ctx.token_providers(&target, &target);
        providers.open(budget)?;
        let result = self.send_and_receive(message, &target, &providers, budget).await;
        match &result {
            Ok(_) => providers.close()?,
            Err(_) => providers.abort(),
        }
        result
    }

    async fn send_and_receive(
        &self,
        message: Message,
        target: &Uri,
        providers: &TokenProviders,
        budget: &TimeoutBudget,
    ) -> Result<Option<Message>, ChannelError> {
        let acquired = self.ctx.acquire(target, providers, false, budget).await?;
        let destination = target.to_string();
        let request = self.build_request(message, target, &acquired, budget).await?;
        tracing::debug!(
            %destination,
            method = %request.method(),
            streamed = request.body().is_streaming(),
            "sending request"
        );

        let transport = Arc::clone(acquired.connection.transport());
        let response = budget
            .run("request", async {
                transport
                    .send(request)
                    .await
                    .map_err(|e| e.into_channel_error(&destination))
            })
            .await?;
        self.read_reply(response, &acquired, &destination, budget).await
    }

    async fn build_request(
        &self,
        mut message: Message,
        target: &Uri,
        acquired: &AcquiredConnection,
        budget: &TimeoutBudget,
    ) -> Result<Request<TransportBody>, ChannelError> {
        let config = &self.ctx.config;
        let codec = &self.ctx.codec;
        let property = message
            .extensions_mut()
            .remove::<HttpRequestProperty>()
            .unwrap_or_default();
        let method = property.method.clone().unwrap_or(Method::POST);

        let mut headers = HeaderMap::new();
        let mut chunked = false;
        for (name, value) in property.headers.iter() {
            if is_reserved_header(name) {
                tracing::debug!(header = %name, "ignoring override of a reserved header");
                continue;
            }
            if name == header::TRANSFER_ENCODING {
                if value.as_bytes().eq_ignore_ascii_case(b"chunked") {
                    chunked = true;
                    continue;
                }
                return Err(ChannelError::protocol(format!(
                    "unsupported transfer-encoding override {value:?}; only chunked is allowed"
                )));
            }
            if name.as_str() == ACTION_HEADER {
                let action = unquote_action(value)?;
                match message.action() {
                    Some(current) if current != action => {
                        return Err(ChannelError::protocol(format!(
                            "action header '{action}' does not match the message action '{current}'"
                        )));
                    }
                    Some(_) => {}
                    None => message.set_action(action),
                }
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        if let Some(action) = message.action() {
            let quoted = HeaderValue::try_from(format!("\"{action}\"")).map_err(|_| {
                ChannelError::protocol(format!("action '{action}' cannot be sent as a header"))
            })?;
            headers.insert(HeaderName::from_static(ACTION_HEADER), quoted);
        }
        if !headers.contains_key(header::USER_AGENT) {
            if let Some(agent) = &config.user_agent {
                let agent = HeaderValue::try_from(agent.as_str()).map_err(|_| {
                    ChannelError::configuration("user agent is not a valid header value")
                })?;
                headers.insert(header::USER_AGENT, agent);
            }
        }
        if let Some(authorization) = acquired.grant.credential.authorization()? {
            headers.insert(header::AUTHORIZATION, authorization);
        }
        if acquired.connection.forward_proxy().is_some() && !is_secure(target) {
            if let Some(authorization) = acquired.connection.proxy_authorization() {
                headers.insert(header::PROXY_AUTHORIZATION, authorization.clone());
            }
        }
        if acquired.connection.decompression() {
            if let Some(accept) = ContentEncoding::accept_encoding() {
                headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static(accept));
            }
        }
        if let Some(jar) = acquired.connection.cookies() {
            jar.apply(&mut headers);
        }

        let no_entity =
            property.suppress_entity_body || method == Method::GET || method == Method::HEAD;
        let body = if no_entity {
            message.close();
            TransportBody::empty()
        } else {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(codec.content_type()));
            let streamed = (chunked || config.transfer_mode.is_request_streamed())
                && codec.encoding().supports_streaming();
            if streamed {
                TransportBody::streaming(codec.encode_streamed(message, STREAM_PIPE_CAPACITY)?)
            } else {
                let encoded = budget
                    .run("message encoding", codec.encode_buffered(message, &self.ctx.buffers))
                    .await?;
                TransportBody::full(encoded)
            }
        };

        let mut request = Request::builder()
            .method(method)
            .uri(target.clone())
            .body(body)
            .map_err(|e| ChannelError::protocol(format!("failed to build request: {e}")))?;
        *request.headers_mut() = headers;
        Ok(request)
    }

    async fn read_reply(
        &self,
        response: Response<ResponseBody>,
        acquired: &AcquiredConnection,
        destination: &str,
        budget: &TimeoutBudget,
    ) -> Result<Option<Message>, ChannelError> {
        let (parts, body) = response.into_parts();
        if let Some(jar) = acquired.connection.cookies() {
            jar.store(&parts.headers);
        }
        let status = parts.status;
        let reason = parts
            .extensions
            .get::<hyper::ext::ReasonPhrase>()
            .and_then(|r| std::str::from_utf8(r.as_bytes()).ok())
            .map(str::to_owned);
        let mut source = into_body_stream(body, destination.to_string());
        tracing::debug!(%destination, status = status.as_u16(), "response received");

        if let Some(err) = classify_status(status, reason.as_deref(), destination) {
            return Err(err);
        }
        let is_fault = status == StatusCode::INTERNAL_SERVER_ERROR;
        if !status.is_success() && !is_fault {
            let excerpt = read_excerpt(source, budget).await;
            return Err(ChannelError::protocol(format!(
                "{destination} answered {} {}; body: {}",
                status.as_u16(),
                reason.as_deref().unwrap_or_default(),
                body_excerpt(&excerpt)
            )));
        }

        let content_type = parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let mut content_length = parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());

        let content_encoding = match parts.headers.get(header::CONTENT_ENCODING) {
            Some(value) => Some(value.to_str().map_err(|_| {
                ChannelError::protocol("response content-encoding is not valid ASCII")
            })?),
            None => None,
        };
        let encoding = ContentEncoding::from_header(content_encoding).ok_or_else(|| {
            ChannelError::protocol(format!(
                "unsupported response content-encoding {:?}",
                content_encoding.unwrap_or_default()
            ))
        })?;
        if !encoding.is_identity() {
            if !acquired.connection.decompression() {
                return Err(ChannelError::protocol(format!(
                    "response is {}-encoded but decompression is disabled",
                    encoding.as_str()
                )));
            }
            source = decompress(source, encoding);
            content_length = None;
        }

        let declared_empty = status == StatusCode::NO_CONTENT || content_length == Some(0);
        let first = if declared_empty {
            None
        } else {
            budget.run("response read", first_chunk(&mut source)).await?
        };
        let Some(first) = first else {
            if is_fault {
                return Err(ChannelError::protocol(format!(
                    "{destination} answered 500 with an empty body"
                )));
            }
            return Ok(None);
        };
        let source: BodyStream =
            Box::pin(futures::stream::once(async move { Ok(first) }).chain(source));

        let codec = &self.ctx.codec;
        let decoded = if self.ctx.config.transfer_mode.is_response_streamed() {
            budget
                .run("response decoding", codec.decode_streamed(content_type.as_deref(), source))
                .await
        } else {
            budget
                .run("response read", async {
                    let limit = codec.max_message_size();
                    let bytes =
                        read_buffered(source, content_length, limit, &self.ctx.buffers).await?;
                    codec.decode_buffered(content_type.as_deref(), bytes)
                })
                .await
        };
        let mut reply = match decoded {
            Ok(reply) => reply,
            Err(err @ (ChannelError::Timeout(_) | ChannelError::Cancelled(_))) => return Err(err),
            Err(err) if is_fault => {
                return Err(ChannelError::protocol(format!(
                    "{destination} answered 500 and the fault could not be decoded: {}",
                    err.message()
                )));
            }
            Err(err) => return Err(err),
        };

        reply.set_fault(is_fault);
        reply.extensions_mut().insert(HttpResponseProperty {
            status,
            reason,
            headers: parts.headers,
        });
        Ok(Some(reply))
    }

    /// Close gracefully: wait for in-flight requests, then close the token
    /// providers.
    ///
    /// A faulted channel is aborted instead. Requests still running when the
    /// timeout elapses are aborted and `Timeout` is returned.
    pub async fn close(&self, timeout: Duration) -> Result<(), ChannelError> {
        match self.lifecycle.begin_close() {
            CloseStart::Graceful => {}
            CloseStart::Faulted => {
                self.abort();
                return Ok(());
            }
            CloseStart::NotOpened | CloseStart::AlreadyClosed => return Ok(()),
        }

        let budget = self.lifecycle.budget(timeout);
        if let Err(err) = budget.run("channel close", self.wait_idle()).await {
            self.abort();
            return Err(err);
        }
        if let Some(providers) = self.providers.get() {
            if let Err(err) = providers.close() {
                self.abort();
                return Err(err);
            }
        }
        self.lifecycle.end_close();
        Ok(())
    }

    /// [`close`](Self::close) with the binding's `close_timeout`.
    pub async fn close_default(&self) -> Result<(), ChannelError> {
        self.close(self.ctx.config.close_timeout).await
    }

    async fn wait_idle(&self) -> Result<(), ChannelError> {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inflight.load(Ordering::Acquire) == 0 {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Close immediately, cancelling in-flight requests. Never fails.
    pub fn abort(&self) {
        self.lifecycle.abort();
        if let Some(providers) = self.providers.get() {
            providers.abort();
        }
    }
}

/// Destination of a message sent under manual addressing.
fn message_target(message: &Message) -> Result<Uri, ChannelError> {
    let to = message.to().ok_or_else(|| {
        ChannelError::invalid_operation(
            "manual addressing requires every message to carry a destination",
        )
    })?;
    let uri: Uri = to.parse().map_err(|e| {
        ChannelError::invalid_operation(format!(
            "message destination '{to}' is not a valid URI: {e}"
        ))
    })?;
    if !matches!(uri.scheme_str(), Some("http") | Some("https")) || uri.host().is_none() {
        return Err(ChannelError::invalid_operation(format!(
            "message destination '{to}' is not an http or https address"
        )));
    }
    Ok(uri)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChannelFactory;
    use crate::config::{BindingConfig, TransferMode};
    use crate::security::{AuthScheme, Credential, StaticCredentialProvider};
    use crate::testing::{MockTransport, SharedTransportFactory};
    use crate::transport::full_response_body;
    use crate::error::{TransportError, TransportErrorKind};
    use channelrpc_core::{MessageCodec, MessageEncoding};

    const TO: &str = "http://svc.example/orders";

    fn factory(config: BindingConfig, transport: Arc<MockTransport>) -> ChannelFactory {
        ChannelFactory::builder()
            .config(config)
            .transport_factory(Arc::new(SharedTransportFactory(transport)))
            .build()
            .unwrap()
    }

    fn channel(factory: &ChannelFactory) -> RequestChannel {
        factory.create_request_channel(TO.parse().unwrap(), None).unwrap()
    }

    fn codec() -> MessageCodec {
        let config = BindingConfig::default();
        MessageCodec::new(config.encoding, config.max_received_message_size, config.max_buffer_size)
    }

    /// Encode `message` the way a service would answer.
    async fn encoded(message: Message) -> Bytes {
        let pool = channelrpc_core::BufferPool::new(1 << 20, 1 << 16);
        codec().encode_buffered(message, &pool).await.unwrap()
    }

    fn reply_with(status: StatusCode, body: Bytes) -> Arc<MockTransport> {
        MockTransport::new(move |_| {
            let mut response = Response::new(full_response_body(body.clone()));
            *response.status_mut() = status;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(MessageEncoding::Framed.content_type()),
            );
            Ok(response)
        })
    }

    fn with_reason(status: StatusCode, reason: &'static str) -> Arc<MockTransport> {
        MockTransport::new(move |_| {
            let mut response = Response::new(full_response_body(Bytes::new()));
            *response.status_mut() = status;
            response
                .extensions_mut()
                .insert(hyper::ext::ReasonPhrase::from_static(reason.as_bytes()));
            Ok(response)
        })
    }

    #[tokio::test]
    async fn test_round_trip() {
        let body = encoded(Message::new("urn:orders/SubmitResponse").with_body("accepted")).await;
        let transport = reply_with(StatusCode::OK, body);
        let factory = factory(BindingConfig::default(), transport.clone());
        let channel = channel(&factory);

        let mut reply = channel
            .request(Message::new("urn:orders/Submit").with_body("order"), Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.action(), Some("urn:orders/SubmitResponse"));
        assert_eq!(reply.read_body().await.unwrap(), Bytes::from_static(b"accepted"));
        assert!(!reply.is_fault());
        let property = reply.extensions().get::<HttpResponseProperty>().unwrap();
        assert_eq!(property.status, StatusCode::OK);
        assert_eq!(channel.state(), CommunicationState::Opened);

        let requests = transport.requests.lock().unwrap();
        let sent = &requests[0];
        assert_eq!(sent.method(), Method::POST);
        assert_eq!(sent.uri(), TO);
        assert_eq!(sent.headers()[ACTION_HEADER], "\"urn:orders/Submit\"");
        assert_eq!(
            sent.headers()[header::CONTENT_TYPE],
            MessageEncoding::Framed.content_type()
        );
        let decoded = codec()
            .decode_buffered(Some(MessageEncoding::Framed.content_type()), sent.body().clone())
            .unwrap();
        assert_eq!(decoded.to(), Some(TO));
    }

    #[tokio::test]
    async fn test_empty_success_is_no_reply() {
        let transport = MockTransport::status(StatusCode::ACCEPTED);
        let factory = factory(BindingConfig::default(), transport);
        let reply = channel(&factory)
            .request(Message::new("urn:orders/Notify"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_server_error_is_a_fault_reply() {
        let mut fault = Message::new("urn:orders/Fault").with_body("out of stock");
        fault.set_fault(true);
        let transport = reply_with(StatusCode::INTERNAL_SERVER_ERROR, encoded(fault).await);
        let factory = factory(BindingConfig::default(), transport);
        let channel = channel(&factory);

        let reply = channel
            .request(Message::new("urn:orders/Submit"), Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.is_fault());
        assert_eq!(channel.state(), CommunicationState::Opened);
    }

    #[tokio::test]
    async fn test_server_error_without_body_is_protocol() {
        let factory = factory(
            BindingConfig::default(),
            MockTransport::status(StatusCode::INTERNAL_SERVER_ERROR),
        );
        let channel = channel(&factory);
        let err = channel
            .request(Message::new("urn:orders/Submit"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Protocol(_)), "{err:?}");
        assert_eq!(channel.state(), CommunicationState::Faulted);
    }

    #[tokio::test]
    async fn test_status_classification() {
        let cases: Vec<(Arc<MockTransport>, fn(&ChannelError) -> bool)> = vec![
            (MockTransport::status(StatusCode::UNAUTHORIZED), |e| {
                matches!(e, ChannelError::Authentication(_))
            }),
            (MockTransport::status(StatusCode::FORBIDDEN), |e| {
                matches!(e, ChannelError::Authentication(_))
            }),
            (MockTransport::status(StatusCode::NOT_FOUND), |e| {
                matches!(e, ChannelError::EndpointNotFound(_))
            }),
            (with_reason(StatusCode::UNSUPPORTED_MEDIA_TYPE, "Missing Content Type"), |e| {
                matches!(e, ChannelError::Protocol(m) if m.contains("missing"))
            }),
            (with_reason(StatusCode::UNSUPPORTED_MEDIA_TYPE, "Unsupported Media Type"), |e| {
                matches!(e, ChannelError::Protocol(m) if m.contains("does not accept"))
            }),
            (MockTransport::status(StatusCode::SERVICE_UNAVAILABLE), |e| {
                matches!(e, ChannelError::ServerBusy(_))
            }),
            (MockTransport::status(StatusCode::GATEWAY_TIMEOUT), |e| {
                matches!(e, ChannelError::Timeout(_))
            }),
            (reply_with(StatusCode::IM_A_TEAPOT, Bytes::from_static(b"short and stout")), |e| {
                matches!(e, ChannelError::Protocol(m) if m.contains("short and stout"))
            }),
        ];

        for (transport, expected) in cases {
            let factory = factory(BindingConfig::default(), transport);
            let err = channel(&factory)
                .request(Message::new("urn:orders/Submit"), Duration::from_secs(5))
                .await
                .unwrap_err();
            assert!(expected(&err), "unexpected {err:?}");
        }
    }

    #[tokio::test]
    async fn test_gateway_timeout_does_not_fault() {
        let transport = MockTransport::status(StatusCode::GATEWAY_TIMEOUT);
        let factory = factory(BindingConfig::default(), transport);
        let channel = channel(&factory);
        let _ = channel
            .request(Message::new("urn:orders/Submit"), Duration::from_secs(5))
            .await;
        assert_eq!(channel.state(), CommunicationState::Opened);
    }

    #[tokio::test]
    async fn test_error_excerpt_is_bounded() {
        let body = Bytes::from(vec![b'x'; 4 * MAX_EXCERPT_BYTES]);
        let factory = factory(BindingConfig::default(), reply_with(StatusCode::BAD_REQUEST, body));
        let err = channel(&factory)
            .request(Message::new("urn:orders/Submit"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.message().len() < 2 * MAX_EXCERPT_BYTES);
    }

    #[tokio::test]
    async fn test_transport_failure_faults() {
        let transport = MockTransport::new(|_| {
            Err(TransportError::new(TransportErrorKind::Unreachable, "connection refused"))
        });
        let factory = factory(BindingConfig::default(), transport);
        let channel = channel(&factory);
        let err = channel
            .request(Message::new("urn:orders/Submit"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::EndpointNotFound(_)), "{err:?}");
        assert_eq!(channel.state(), CommunicationState::Faulted);

        let again = channel
            .request(Message::new("urn:orders/Submit"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(again, ChannelError::Communication(_)), "{again:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_reply_times_out_without_fault() {
        let transport = MockTransport::with_delay(Duration::from_secs(10), |_| {
            Ok(Response::new(full_response_body(Bytes::new())))
        });
        let factory = factory(BindingConfig::default(), transport);
        let channel = channel(&factory);
        let err = channel
            .request(Message::new("urn:orders/Submit"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)), "{err:?}");
        assert_eq!(channel.state(), CommunicationState::Opened);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_budgets_come_from_the_binding() {
        let transport = MockTransport::with_delay(Duration::from_secs(10), |_| {
            Ok(Response::new(full_response_body(Bytes::new())))
        });
        let config = BindingConfig {
            send_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let factory = factory(config, transport);
        let channel = channel(&factory);
        channel.open_default().await.unwrap();

        let started = tokio::time::Instant::now();
        let err = channel
            .request_default(Message::new("urn:orders/Submit"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(10));

        channel.close_default().await.unwrap();
        assert_eq!(channel.state(), CommunicationState::Closed);
    }

    #[tokio::test]
    async fn test_header_overrides() {
        let transport = MockTransport::status(StatusCode::NO_CONTENT);
        let factory = factory(
            BindingConfig {
                user_agent: Some("orders-client/1.0".into()),
                ..Default::default()
            },
            transport.clone(),
        );
        let channel = channel(&factory);

        let mut message = Message::empty();
        message.extensions_mut().insert(
            HttpRequestProperty::new()
                .with_method(Method::PUT)
                .with_header(
                    HeaderName::from_static(ACTION_HEADER),
                    HeaderValue::from_static("\"urn:orders/Put\""),
                )
                .with_header(header::HOST, HeaderValue::from_static("evil.example"))
                .with_header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))
                .with_header(header::ACCEPT, HeaderValue::from_static("*/*"))
                .with_header(HeaderName::from_static("x-tenant"), HeaderValue::from_static("blue")),
        );
        channel.request(message, Duration::from_secs(5)).await.unwrap();

        let requests = transport.requests.lock().unwrap();
        let sent = &requests[0];
        assert_eq!(sent.method(), Method::PUT);
        assert!(sent.headers().get(header::HOST).is_none());
        assert_eq!(sent.headers()[header::CONTENT_TYPE], MessageEncoding::Framed.content_type());
        assert_eq!(sent.headers()[header::ACCEPT], "*/*");
        assert_eq!(sent.headers()["x-tenant"], "blue");
        assert_eq!(sent.headers()[header::USER_AGENT], "orders-client/1.0");
        assert_eq!(sent.headers()[ACTION_HEADER], "\"urn:orders/Put\"");
    }

    #[tokio::test]
    async fn test_mismatched_action_header_is_protocol() {
        let transport = MockTransport::status(StatusCode::NO_CONTENT);
        let factory = factory(BindingConfig::default(), transport.clone());
        let mut message = Message::new("urn:orders/Submit");
        message.extensions_mut().insert(
            HttpRequestProperty::new()
                .with_header(
                    HeaderName::from_static(ACTION_HEADER),
                    HeaderValue::from_static("urn:orders/Cancel"),
                ),
        );
        let err = channel(&factory)
            .request(message, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Protocol(_)));
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_get_sends_no_body() {
        let transport = MockTransport::status(StatusCode::NO_CONTENT);
        let factory = factory(BindingConfig::default(), transport.clone());
        let mut message = Message::new("urn:orders/List").with_body("ignored");
        message
            .extensions_mut()
            .insert(HttpRequestProperty::new().with_method(Method::GET));
        channel(&factory).request(message, Duration::from_secs(5)).await.unwrap();

        let requests = transport.requests.lock().unwrap();
        assert!(requests[0].body().is_empty());
        assert!(requests[0].headers().get(header::CONTENT_TYPE).is_none());
    }

    #[tokio::test]
    async fn test_basic_credentials_are_sent() {
        let transport = MockTransport::status(StatusCode::NO_CONTENT);
        let factory = ChannelFactory::builder()
            .config(BindingConfig {
                auth_scheme: AuthScheme::Basic,
                ..Default::default()
            })
            .transport_factory(Arc::new(SharedTransportFactory(transport.clone())))
            .credential_provider(Arc::new(StaticCredentialProvider::new(Credential::Basic {
                username: "alice".into(),
                password: "secret".into(),
            })))
            .build()
            .unwrap();
        channel(&factory)
            .request(Message::new("urn:orders/Submit"), Duration::from_secs(5))
            .await
            .unwrap();

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].headers()[header::AUTHORIZATION], "Basic YWxpY2U6c2VjcmV0");
    }

    #[tokio::test]
    async fn test_streamed_request_round_trips() {
        let transport = MockTransport::status(StatusCode::NO_CONTENT);
        let factory = factory(
            BindingConfig {
                transfer_mode: TransferMode::StreamedRequest,
                ..Default::default()
            },
            transport.clone(),
        );
        let body = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"part one, ")),
            Ok(Bytes::from_static(b"part two")),
        ]);
        let upload = Message::new("urn:orders/Upload").with_body_stream(body);
        channel(&factory)
            .request(upload, Duration::from_secs(5))
            .await
            .unwrap();

        let sent = transport.requests.lock().unwrap()[0].body().clone();
        let mut decoded = codec()
            .decode_buffered(Some(MessageEncoding::Framed.content_type()), sent)
            .unwrap();
        assert_eq!(decoded.read_body().await.unwrap(), Bytes::from_static(b"part one, part two"));
    }

    #[tokio::test]
    async fn test_oversized_reply_is_quota_exceeded() {
        let body = encoded(Message::new("urn:orders/Big").with_body(vec![0u8; 4096])).await;
        let factory = factory(
            BindingConfig {
                max_received_message_size: 1024,
                max_buffer_size: 1024,
                ..Default::default()
            },
            reply_with(StatusCode::OK, body),
        );
        let err = channel(&factory)
            .request(Message::new("urn:orders/Get"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::QuotaExceeded(_)), "{err:?}");
    }

    fn encoded_reply(body: Bytes, encoding: &'static str) -> Arc<MockTransport> {
        MockTransport::new(move |_| {
            let mut response = Response::new(full_response_body(body.clone()));
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(MessageEncoding::Framed.content_type()),
            );
            headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static(encoding));
            Ok(response)
        })
    }

    #[cfg(feature = "compression")]
    #[tokio::test]
    async fn test_gzip_reply_is_decompressed() {
        use std::io::Write;

        let plain = encoded(Message::new("urn:orders/Report").with_body(vec![b'x'; 2048])).await;
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(&plain).unwrap();
        let compressed = Bytes::from(gz.finish().unwrap());
        assert!(compressed.len() < plain.len());

        let transport = encoded_reply(compressed, "gzip");
        let factory = factory(BindingConfig::default(), transport.clone());
        let mut reply = channel(&factory)
            .request(Message::new("urn:orders/Report"), Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.read_body().await.unwrap().len(), 2048);
        let requests = transport.requests.lock().unwrap();
        assert!(requests[0].headers().contains_key(header::ACCEPT_ENCODING));
    }

    #[tokio::test]
    async fn test_unknown_content_encoding_is_protocol() {
        let body = encoded(Message::new("urn:orders/Report")).await;
        let factory = factory(BindingConfig::default(), encoded_reply(body, "x-custom"));
        let err = channel(&factory)
            .request(Message::new("urn:orders/Report"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Protocol(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_manual_addressing_requires_destination() {
        let transport = MockTransport::status(StatusCode::NO_CONTENT);
        let factory = factory(
            BindingConfig {
                manual_addressing: true,
                ..Default::default()
            },
            transport.clone(),
        );
        let channel = channel(&factory);
        let err = channel
            .request(Message::new("urn:orders/Submit"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::InvalidOperation(_)));

        let other = factory
            .create_request_channel(TO.parse().unwrap(), None)
            .unwrap();
        other
            .request(
                Message::new("urn:orders/Submit").with_to("http://replica.example/orders"),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(
            transport.requests.lock().unwrap()[0].uri(),
            "http://replica.example/orders"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_waits_for_in_flight_requests() {
        let transport = MockTransport::with_delay(Duration::from_millis(500), |_| {
            let mut response = Response::new(full_response_body(Bytes::new()));
            *response.status_mut() = StatusCode::NO_CONTENT;
            Ok(response)
        });
        let factory = factory(BindingConfig::default(), transport);
        let channel = Arc::new(channel(&factory));
        channel.open(Duration::from_secs(5)).await.unwrap();

        let pending = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .request(Message::new("urn:orders/Submit"), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        channel.close(Duration::from_secs(5)).await.unwrap();
        assert!(pending.await.unwrap().unwrap().is_none());
        assert_eq!(channel.state(), CommunicationState::Closed);

        let err = channel
            .request(Message::new("urn:orders/Submit"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::InvalidOperation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_cancels_in_flight_request() {
        let transport = MockTransport::with_delay(Duration::from_secs(60), |_| {
            Ok(Response::new(full_response_body(Bytes::new())))
        });
        let factory = factory(BindingConfig::default(), transport);
        let channel = Arc::new(channel(&factory));

        let pending = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .request(Message::new("urn:orders/Submit"), Duration::from_secs(120))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.abort();
        channel.abort();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, ChannelError::Cancelled(_)), "{err:?}");
        assert_eq!(channel.state(), CommunicationState::Closed);
    }

    #[test]
    fn test_reserved_headers() {
        assert!(is_reserved_header(&header::HOST));
        assert!(is_reserved_header(&header::AUTHORIZATION));
        assert!(!is_reserved_header(&header::ACCEPT));
        assert!(!is_reserved_header(&header::USER_AGENT));
    }
}
