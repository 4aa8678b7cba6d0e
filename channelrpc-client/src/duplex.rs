//! Duplex session channel.
//!
//! A [`DuplexSessionChannel`] upgrades one connection and then sends and
//! receives messages independently over it:
//!
//! - sends are serialized by a capacity-one mutex, so the frames of two
//!   messages never interleave
//! - receives are serialized among themselves and never block sends
//! - each direction closes on its own; the connection lease is returned once
//!   both are closed
//!
//! The transport behind a session is a [`DuplexConnector`]. The production
//! connector speaks WebSocket ([`WebSocketConnector`]).

mod handshake;
mod session;
mod websocket;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, OnceLock};
use std::time::Duration;

use channelrpc_core::{ChannelError, FrameReader, Message};
use futures::{SinkExt, StreamExt};
use http::header::{self, HeaderMap, HeaderValue};
use http::uri::{PathAndQuery, Scheme};
use http::Uri;
use tokio::sync::Mutex;
use tracing::Instrument;

use crate::channel::{CloseStart, CommunicationState, Lifecycle};
use crate::factory::{AcquiredConnection, FactoryContext};
use crate::security::TokenProviders;
use crate::timeout::TimeoutBudget;
use crate::transport::is_secure;

pub use handshake::{
    WEBSOCKET_GUID, build_extended_connect_request, build_upgrade_request, expected_accept,
    generate_key, validate_extended_connect_response, validate_upgrade_response,
};
pub use session::{ConnectionLease, SessionRegistry};
pub use websocket::{
    DuplexConnector, DuplexTransport, FrameSink, UpgradeRequest, WebSocketConnector,
};

/// Frames a streamed send may queue ahead of the socket.
const STREAM_PIPE_CAPACITY: usize = 4;

/// Result of [`DuplexSessionChannel::try_receive`].
#[derive(Debug)]
pub enum ReceiveOutcome {
    Message(Message),
    /// The peer closed its output; no more messages will arrive.
    Closed,
    /// Nothing arrived in time. The channel is still usable.
    TimedOut,
}

struct Session {
    sink: Mutex<FrameSink>,
    reader: Mutex<FrameReader>,
    lease: ConnectionLease,
}

/// Map a duplex address onto the HTTP URI its upgrade request targets.
fn upgrade_uri(via: &Uri) -> Result<Uri, ChannelError> {
    let scheme = match via.scheme_str() {
        Some("ws") | Some("http") => Scheme::HTTP,
        Some("wss") | Some("https") => Scheme::HTTPS,
        _ => {
            return Err(ChannelError::configuration(format!(
                "{via} is not a ws, wss, http or https address"
            )));
        }
    };
    let mut parts = via.clone().into_parts();
    parts.scheme = Some(scheme);
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    Uri::from_parts(parts)
        .map_err(|e| ChannelError::configuration(format!("invalid upgrade address {via}: {e}")))
}

/// Long-lived bidirectional session channel.
///
/// Created by
/// [`ChannelFactory::create_duplex_channel`](crate::ChannelFactory::create_duplex_channel).
/// The first `send` or `receive` opens it implicitly.
pub struct DuplexSessionChannel {
    ctx: Arc<FactoryContext>,
    to: Uri,
    via: Uri,
    lifecycle: Lifecycle,
    providers: OnceLock<TokenProviders>,
    /// Emptied by `abort` and `close`, which drops the transport.
    session: std::sync::Mutex<Option<Arc<Session>>>,
    subprotocol: OnceLock<String>,
    output_closed: AtomicBool,
    input_closed: AtomicBool,
}

impl fmt::Debug for DuplexSessionChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexSessionChannel")
            .field("to", &self.to)
            .field("via", &self.via)
            .field("state", &self.lifecycle.state())
            .field("output_closed", &self.output_closed.load(Ordering::Relaxed))
            .field("input_closed", &self.input_closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl DuplexSessionChannel {
    pub(crate) fn new(ctx: Arc<FactoryContext>, to: Uri, via: Uri) -> Self {
        let lifecycle = Lifecycle::new(to.to_string(), &ctx.cancel);
        Self {
            ctx,
            to,
            via,
            lifecycle,
            providers: OnceLock::new(),
            session: std::sync::Mutex::new(None),
            subprotocol: OnceLock::new(),
            output_closed: AtomicBool::new(false),
            input_closed: AtomicBool::new(false),
        }
    }

    pub fn to(&self) -> &Uri {
        &self.to
    }

    pub fn via(&self) -> &Uri {
        &self.via
    }

    pub fn state(&self) -> CommunicationState {
        self.lifecycle.state()
    }

    /// Subprotocol the peer selected during the upgrade.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.get().map(String::as_str)
    }

    pub fn is_output_closed(&self) -> bool {
        self.output_closed.load(Ordering::Acquire)
    }

    pub fn is_input_closed(&self) -> bool {
        self.input_closed.load(Ordering::Acquire)
    }

    /// Open the session: credentials, connection and upgrade handshake.
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
        if self.lifecycle.state().is_terminal() {
            self.lifecycle.check_opened()?;
        }
        self.ctx.check_open()?;
        let span = tracing::info_span!("channel.duplex.open", to = %self.to, via = %self.via);
        self.lifecycle
            .ensure_opened(|| self.connect(budget).instrument(span))
            .await
    }

    async fn connect(&self, budget: &TimeoutBudget) -> Result<(), ChannelError> {
        let providers = self.ctx.token_providers(&self.to, &self.via);
        providers.open(budget)?;
        let providers = self.providers.get_or_init(|| providers);

        let acquired = self.ctx.acquire(&self.via, providers, true, budget).await?;
        let request = self.upgrade_request(&acquired)?;
        let destination = self.via.to_string();
        let transport = budget
            .run(
                "upgrade handshake",
                self.ctx.duplex_connector.connect(request, &acquired.settings),
            )
            .await
            .map_err(|e| e.with_destination(&destination))?;

        let lease = self
            .ctx
            .sessions
            .lease(acquired.connection.fingerprint().clone());
        if let Some(subprotocol) = transport.subprotocol {
            let _ = self.subprotocol.set(subprotocol);
        }
        let session = Session {
            sink: Mutex::new(transport.sink),
            reader: Mutex::new(self.ctx.codec.frame_reader(transport.source)),
            lease,
        };

        let mut slot = self.slot();
        // `abort` cancels before emptying the slot, so a session stored
        // after that point is dropped here.
        if self.lifecycle.token().is_cancelled() {
            session.lease.abort();
            return Err(ChannelError::Cancelled(format!(
                "duplex session to {} was aborted while opening",
                self.to
            )));
        }
        if slot.is_some() {
            return Err(ChannelError::invalid_operation("duplex session opened twice"));
        }
        *slot = Some(Arc::new(session));
        Ok(())
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<Session>>> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Drop our handle on the transport. Operations still holding the
    /// session release it as they return.
    fn take_session(&self) -> Option<Arc<Session>> {
        self.slot().take()
    }

    fn upgrade_request(
        &self,
        acquired: &AcquiredConnection,
    ) -> Result<UpgradeRequest, ChannelError> {
        let config = &self.ctx.config;
        let uri = upgrade_uri(&self.via)?;

        let mut headers = HeaderMap::new();
        if let Some(authorization) = acquired.grant.credential.authorization()? {
            headers.insert(header::AUTHORIZATION, authorization);
        }
        if acquired.connection.forward_proxy().is_some() && !is_secure(&uri) {
            if let Some(authorization) = acquired.connection.proxy_authorization() {
                headers.insert(header::PROXY_AUTHORIZATION, authorization.clone());
            }
        }
        if let Some(agent) = &config.user_agent {
            let agent = HeaderValue::try_from(agent.as_str()).map_err(|_| {
                ChannelError::configuration("user agent is not a valid header value")
            })?;
            headers.insert(header::USER_AGENT, agent);
        }
        if let Some(jar) = acquired.connection.cookies() {
            jar.apply(&mut headers);
        }

        Ok(UpgradeRequest {
            uri,
            headers,
            subprotocols: config.subprotocols.clone(),
            max_message_size: self.ctx.codec.max_message_size(),
            http2_extended_connect: config.http2_extended_connect,
        })
    }

    fn session(&self) -> Result<Arc<Session>, ChannelError> {
        self.slot()
            .clone()
            .ok_or_else(|| {
                ChannelError::invalid_operation(format!("session to {} is not open", self.to))
            })
    }

    /// Return the lease once both directions are closed.
    fn release_if_done(&self, session: &Session) {
        if self.is_output_closed() && self.is_input_closed() && session.lease.release() {
            tracing::debug!(to = %self.to, "duplex session fully closed");
        }
    }

    /// Send one message.
    ///
    /// Sends are totally ordered: a send waits for the previous one to finish
    /// writing. A failure while writing faults the channel.
    pub async fn send(&self, message: Message, timeout: Duration) -> Result<(), ChannelError> {
        let budget = self.lifecycle.budget(timeout);
        let span = tracing::info_span!(
            "channel.duplex.send",
            to = %self.to,
            action = message.action().unwrap_or_default(),
        );
        async move {
            self.ensure_open(&budget).await?;
            budget.check("send")?;
            let session = self.session()?;

            let mut sink = budget
                .run("send", async { Ok(session.sink.lock().await) })
                .await?;
            self.lifecycle.check_opened()?;
            if self.is_output_closed() {
                return Err(ChannelError::invalid_operation(format!(
                    "output session to {} is closed",
                    self.to
                )));
            }

            let result = self.write(&mut sink, message, &budget).await;
            if let Err(err) = &result {
                self.lifecycle.fault(err);
            }
            result
        }
        .instrument(span)
        .await
    }

    /// [`send`](Self::send) with the binding's `send_timeout`.
    pub async fn send_default(&self, message: Message) -> Result<(), ChannelError> {
        self.send(message, self.ctx.config.send_timeout).await
    }

    async fn write(
        &self,
        sink: &mut FrameSink,
        message: Message,
        budget: &TimeoutBudget,
    ) -> Result<(), ChannelError> {
        let codec = &self.ctx.codec;
        let streamed = self.ctx.config.transfer_mode.is_request_streamed();
        if streamed && codec.encoding().supports_streaming() {
            let mut pipe = codec.encode_streamed(message, STREAM_PIPE_CAPACITY)?;
            budget
                .run("send", async {
                    while let Some(frame) = pipe.next().await {
                        sink.feed(frame?).await?;
                    }
                    sink.flush().await
                })
                .await
        } else {
            let encoded = budget
                .run("message encoding", codec.encode_buffered(message, &self.ctx.buffers))
                .await?;
            budget.run("send", sink.send(encoded)).await
        }
    }

    /// Receive the next message.
    ///
    /// Returns `Ok(None)` once the peer has closed its output. A timeout
    /// leaves the channel usable: bytes of a partly arrived message stay
    /// buffered for the next call. Any other failure faults the channel.
    pub async fn receive(&self, timeout: Duration) -> Result<Option<Message>, ChannelError> {
        let budget = self.lifecycle.budget(timeout);
        let span = tracing::info_span!("channel.duplex.receive", to = %self.to);
        async move {
            self.ensure_open(&budget).await?;
            budget.check("receive")?;
            let session = self.session()?;
            if self.is_input_closed() {
                return Ok(None);
            }

            let mut reader = budget
                .run("receive", async { Ok(session.reader.lock().await) })
                .await?;
            if self.is_input_closed() {
                return Ok(None);
            }
            match budget.run("receive", self.ctx.codec.read_message(&mut reader)).await {
                Ok(Some(message)) => Ok(Some(message)),
                Ok(None) => {
                    self.input_closed.store(true, Ordering::Release);
                    tracing::debug!(to = %self.to, "peer closed its output");
                    self.release_if_done(&session);
                    Ok(None)
                }
                Err(err @ (ChannelError::Timeout(_) | ChannelError::Cancelled(_))) => Err(err),
                Err(err) => {
                    self.lifecycle.fault(&err);
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// [`receive`](Self::receive) with the binding's `receive_timeout`.
    pub async fn receive_default(&self) -> Result<Option<Message>, ChannelError> {
        self.receive(self.ctx.config.receive_timeout).await
    }

    /// [`receive`](Self::receive) with the timeout reported as a value.
    pub async fn try_receive(&self, timeout: Duration) -> Result<ReceiveOutcome, ChannelError> {
        match self.receive(timeout).await {
            Ok(Some(message)) => Ok(ReceiveOutcome::Message(message)),
            Ok(None) => Ok(ReceiveOutcome::Closed),
            Err(ChannelError::Timeout(_)) => Ok(ReceiveOutcome::TimedOut),
            Err(err) => Err(err),
        }
    }

    /// Wait until data is available or the input is closed, without
    /// consuming a message. Returns `false` on timeout.
    pub async fn wait_for_message(&self, timeout: Duration) -> Result<bool, ChannelError> {
        let budget = self.lifecycle.budget(timeout);
        self.ensure_open(&budget).await?;
        let session = self.session()?;
        if self.is_input_closed() {
            return Ok(true);
        }
        let reader = budget
            .run("wait for message", async { Ok(session.reader.lock().await) })
            .await;
        let mut reader = match reader {
            Ok(reader) => reader,
            Err(ChannelError::Timeout(_)) => return Ok(false),
            Err(err) => return Err(err),
        };
        match budget.run("wait for message", reader.wait_ready()).await {
            Ok(()) => Ok(true),
            Err(ChannelError::Timeout(_)) => Ok(false),
            Err(err @ ChannelError::Cancelled(_)) => Err(err),
            Err(err) => {
                self.lifecycle.fault(&err);
                Err(err)
            }
        }
    }

    /// Signal the end of output. Receiving continues until the peer closes
    /// its side. Idempotent.
    pub async fn close_output_session(&self, timeout: Duration) -> Result<(), ChannelError> {
        let budget = self.lifecycle.budget(timeout);
        self.lifecycle.check_opened()?;
        let session = self.session()?;
        self.close_output(&session, &budget).await
    }

    async fn close_output(
        &self,
        session: &Session,
        budget: &TimeoutBudget,
    ) -> Result<(), ChannelError> {
        let mut sink = budget
            .run("output close", async { Ok(session.sink.lock().await) })
            .await?;
        if self.is_output_closed() {
            return Ok(());
        }
        match budget.run("output close", sink.close()).await {
            Ok(()) => {
                self.output_closed.store(true, Ordering::Release);
                tracing::debug!(to = %self.to, "output session closed");
                self.release_if_done(session);
                Ok(())
            }
            Err(err) => {
                self.lifecycle.fault(&err);
                Err(err)
            }
        }
    }

    /// Close gracefully: end output, drain the input until the peer closes,
    /// then return the connection.
    ///
    /// A message arriving during the drain aborts the session with
    /// `Protocol`. A faulted channel is aborted instead.
    pub async fn close(&self, timeout: Duration) -> Result<(), ChannelError> {
        match self.lifecycle.begin_close() {
            CloseStart::Graceful => {}
            CloseStart::Faulted => {
                self.abort();
                return Ok(());
            }
            CloseStart::NotOpened | CloseStart::AlreadyClosed => return Ok(()),
        }
        let Some(session) = self.slot().clone() else {
            self.lifecycle.end_close();
            return Ok(());
        };

        let budget = self.lifecycle.budget(timeout);
        let result = async {
            self.close_output(&session, &budget).await?;
            if !self.is_input_closed() {
                let mut reader = budget
                    .run("channel close", async { Ok(session.reader.lock().await) })
                    .await?;
                let trailing = budget
                    .run("channel close", self.ctx.codec.read_message(&mut reader))
                    .await?;
                if trailing.is_some() {
                    return Err(ChannelError::protocol(format!(
                        "{} sent a message while the session was closing",
                        self.to
                    )));
                }
                self.input_closed.store(true, Ordering::Release);
            }
            if let Some(providers) = self.providers.get() {
                providers.close()?;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.release_if_done(&session);
                self.lifecycle.end_close();
                drop(self.take_session());
                Ok(())
            }
            Err(err) => {
                drop(session);
                self.abort();
                Err(err)
            }
        }
    }

    /// [`close`](Self::close) with the binding's `close_timeout`.
    pub async fn close_default(&self) -> Result<(), ChannelError> {
        self.close(self.ctx.config.close_timeout).await
    }

    /// Close immediately, dropping the upgraded connection and returning
    /// its lease. Never fails.
    pub fn abort(&self) {
        self.lifecycle.abort();
        if let Some(session) = self.take_session() {
            session.lease.abort();
        }
        if let Some(providers) = self.providers.get() {
            providers.abort();
        }
    }
}
