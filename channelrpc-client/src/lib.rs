//! HTTP and WebSocket channel transport for channelrpc.
//!
//! A [`ChannelFactory`] turns a validated [`BindingConfig`] into channels
//! that carry [`Message`]s to a destination address:
//!
//! - [`RequestChannel`]: one HTTP exchange per request, reply or fault
//! - [`DuplexSessionChannel`]: a long-lived upgraded connection with
//!   independent send and receive
//!
//! Channels created by one factory share its connection pool, buffer pool
//! and credential providers. Connections are keyed by a fingerprint of
//! everything that makes them non-interchangeable: transfer mode, credential
//! identity, proxy, duplex-ness and client certificate.
//!
//! ## Example
//!
//! ```ignore
//! use channelrpc_client::{BindingConfig, ChannelFactory, Message};
//! use std::time::Duration;
//!
//! let factory = ChannelFactory::open(BindingConfig::default())?;
//! let channel = factory.create_request_channel("http://localhost:8080/orders".parse()?, None)?;
//!
//! let reply = channel
//!     .request(Message::new("urn:orders/Submit").with_body("..."), Duration::from_secs(30))
//!     .await?;
//! match reply {
//!     Some(reply) if reply.is_fault() => eprintln!("fault: {:?}", reply.action()),
//!     Some(reply) => println!("reply: {:?}", reply.action()),
//!     None => println!("no reply body"),
//! }
//! channel.close(Duration::from_secs(5)).await?;
//! ```
//!
//! ## Duplex Sessions
//!
//! ```ignore
//! use channelrpc_client::{ChannelFactory, Message, ReceiveOutcome};
//!
//! let session = factory.create_duplex_channel("ws://localhost:8080/chat".parse()?, None)?;
//! session.send(Message::new("urn:chat/Join"), Duration::from_secs(5)).await?;
//!
//! loop {
//!     match session.try_receive(Duration::from_secs(30)).await? {
//!         ReceiveOutcome::Message(message) => handle(message),
//!         ReceiveOutcome::TimedOut => continue,
//!         ReceiveOutcome::Closed => break,
//!     }
//! }
//! session.close(Duration::from_secs(5)).await?;
//! ```
//!
//! Sends on one session are totally ordered and never interleave on the
//! wire. [`close_output_session`](DuplexSessionChannel::close_output_session)
//! ends the output while receiving continues.
//!
//! ## Timeouts and Cancellation
//!
//! Every operation takes a timeout that is charged across all of its
//! phases: credential lookup, proxy resolution, connecting, writing and
//! reading. A phase that starts with nothing left fails with
//! [`ChannelError::Timeout`] before doing any I/O.
//!
//! [`abort`](RequestChannel::abort) on a channel, or
//! [`ChannelFactory::close`] on its factory, wakes every pending operation
//! with [`ChannelError::Cancelled`].
//!
//! ## Errors
//!
//! Failures surface as [`ChannelError`]. Transport failures are classified
//! before they reach callers:
//!
//! | Cause | Error |
//! |-------|-------|
//! | DNS failure, connection refused, HTTP 404 | `EndpointNotFound` |
//! | TLS failure | `SecurityNegotiation` |
//! | HTTP 401 / 403 | `Authentication` |
//! | HTTP 503 | `ServerBusy` |
//! | HTTP 504, elapsed budget | `Timeout` |
//! | Bad content type, framing or status | `Protocol` |
//! | Message over the size limit | `QuotaExceeded` |
//! | Anything else on the wire | `Communication` |
//!
//! Errors other than `Timeout` and `Cancelled` fault the channel; a faulted
//! channel only supports `abort` and `close`.
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `tls` (default) | `tls-ring` plus `tls-native-roots` |
//! | `tls-ring` / `tls-aws-lc` | rustls crypto provider |
//! | `tls-native-roots` / `tls-webpki-roots` | Root certificate source |
//! | `compression` (default) | gzip and deflate reply decompression |
//!
//! ## Retry Logic
//!
//! Channels never retry on their own. Wrap an operation in [`retry`] or
//! [`retry_with_policy`] to retry the retryable error kinds with
//! exponential backoff and jitter.

mod builder;
mod channel;
pub mod config;
mod duplex;
mod error;
mod factory;
mod http_property;
mod pool;
mod request_channel;
mod security;
mod timeout;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use builder::ChannelFactoryBuilder;
pub use channel::CommunicationState;
pub use duplex::{
    ConnectionLease, DuplexConnector, DuplexSessionChannel, DuplexTransport, FrameSink,
    ReceiveOutcome, SessionRegistry, UpgradeRequest, WebSocketConnector,
};
pub use error::{TransportError, TransportErrorKind};
pub use factory::{AcquiredConnection, Channel, ChannelFactory, ChannelKind};
pub use http_property::{HttpRequestProperty, HttpResponseProperty};
pub use pool::{ConnectionFingerprint, ConnectionPool, FingerprintInputs, PooledConnection};
pub use request_channel::{ACTION_HEADER, RequestChannel};
pub use security::{
    AuthScheme, AuthenticationLevel, Credential, CredentialGrant, CredentialProvider,
    ImpersonationLevel, ProviderState, SecurityTokenManager, SecurityTokenProviderContainer,
    StaticCredentialProvider, TokenProviders,
};
pub use timeout::TimeoutBudget;

/// WebSocket upgrade handshake helpers.
pub mod handshake {
    pub use crate::duplex::{
        WEBSOCKET_GUID, build_extended_connect_request, build_upgrade_request, expected_accept,
        generate_key, validate_extended_connect_response, validate_upgrade_response,
    };
}

// Re-export configuration types
pub use config::{
    BindingConfig, ClientCertificate, EnvProxyResolver, ExponentialBackoff, ProxyMode,
    ProxyResolver, ProxySettings, RetryPolicy, SecurityMode, TlsSettings, TransferMode,
    TransportUsage, retry, retry_with_policy,
};

// Re-export transport types
pub use transport::{
    ConnectionSettings, HttpSend, HyperTransport, HyperTransportBuilder, HyperTransportFactory,
    TlsClientConfig, TransportBody, TransportFactory,
};

// Re-export core types
pub use channelrpc_core::{
    Body, BodyStream, ChannelError, ContentEncoding, ErrorKind, Message, MessageCodec,
    MessageEncoding, MessageHeaders,
};

// Re-export Bytes for convenience
pub use bytes::Bytes;
