//! Binding configuration consumed by the channel factory.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use channelrpc_core::{ChannelError, MessageEncoding};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};

use super::proxy::{ProxyMode, ProxySettings};
use crate::security::AuthScheme;

/// Default size limit for messages and buffers (64 KiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Default total size of idle pooled buffers (512 KiB).
pub const DEFAULT_MAX_BUFFER_POOL_SIZE: usize = 512 * 1024;

/// How message bodies move over the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// Requests and responses are fully materialized.
    #[default]
    Buffered,
    /// Requests and responses are both streamed.
    Streamed,
    /// Requests are streamed, responses buffered.
    StreamedRequest,
    /// Requests are buffered, responses streamed.
    StreamedResponse,
}

impl TransferMode {
    pub fn is_request_streamed(&self) -> bool {
        matches!(self, TransferMode::Streamed | TransferMode::StreamedRequest)
    }

    pub fn is_response_streamed(&self) -> bool {
        matches!(self, TransferMode::Streamed | TransferMode::StreamedResponse)
    }

    pub fn is_buffered(&self) -> bool {
        matches!(self, TransferMode::Buffered)
    }
}

/// When the factory produces duplex sessions instead of request channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TransportUsage {
    /// Never upgrade; only request/reply channels.
    Never,
    /// Upgrade only when a duplex channel is requested.
    #[default]
    WhenDuplex,
    /// Always upgrade; request/reply channels are refused.
    Always,
}

/// Transport security requirement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SecurityMode {
    /// Plain `http`/`ws`.
    #[default]
    None,
    /// TLS (`https`/`wss`).
    Transport,
}

impl SecurityMode {
    /// URI schemes accepted under this mode.
    pub fn schemes(&self) -> &'static [&'static str] {
        match self {
            SecurityMode::None => &["http", "ws"],
            SecurityMode::Transport => &["https", "wss"],
        }
    }
}

/// A client certificate chain and its private key.
#[derive(Debug)]
pub struct ClientCertificate {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// TLS capabilities layered on top of a plain channel.
#[derive(Clone, Debug, Default)]
pub struct TlsSettings {
    /// Certificate presented to the server.
    pub client_certificate: Option<Arc<ClientCertificate>>,
    /// SHA-256 of the DER-encoded server certificate the peer must present.
    pub peer_thumbprint: Option<[u8; 32]>,
    /// Extra trust anchors added to the platform roots.
    pub extra_roots: Vec<CertificateDer<'static>>,
    /// Skip server certificate validation. Testing only.
    pub accept_invalid_certs: bool,
}

impl TlsSettings {
    /// Whether any setting requires transport security.
    pub fn requires_transport(&self) -> bool {
        self.client_certificate.is_some() || self.peer_thumbprint.is_some()
    }

    /// Identity folded into the connection fingerprint.
    ///
    /// `None` when neither a client certificate nor a peer pin is set.
    pub fn identity(&self) -> Option<String> {
        if !self.requires_transport() {
            return None;
        }
        let mut hasher = Sha256::new();
        if let Some(cert) = self
            .client_certificate
            .as_ref()
            .and_then(|c| c.cert_chain.first())
        {
            hasher.update(b"client:");
            hasher.update(cert.as_ref());
        }
        if let Some(pin) = &self.peer_thumbprint {
            hasher.update(b"peer:");
            hasher.update(pin);
        }
        Some(STANDARD.encode(hasher.finalize()))
    }
}

/// Plain configuration struct read by [`ChannelFactory`](crate::ChannelFactory).
///
/// Validated exactly once, when the factory opens.
#[derive(Clone, Debug)]
pub struct BindingConfig {
    pub transfer_mode: TransferMode,
    /// Largest single buffer the codec may allocate.
    pub max_buffer_size: usize,
    /// Largest message accepted from the wire.
    pub max_received_message_size: usize,
    /// Total bytes of idle buffers kept for reuse.
    pub max_buffer_pool_size: usize,
    pub encoding: MessageEncoding,
    pub auth_scheme: AuthScheme,
    pub proxy_auth_scheme: AuthScheme,
    pub proxy: ProxySettings,
    pub tls: TlsSettings,
    pub security_mode: SecurityMode,
    pub transport_usage: TransportUsage,
    /// WebSocket subprotocols offered during the upgrade, in preference order.
    pub subprotocols: Vec<String>,
    /// Callers address each message themselves; security tokens are then
    /// obtained per request rather than once per channel.
    pub manual_addressing: bool,
    /// When false, a channel's `to` address must equal its `via` address.
    pub addressing_enabled: bool,
    pub allow_cookies: bool,
    pub decompression_enabled: bool,
    pub keep_alive_enabled: bool,
    /// Folded into the connection fingerprint to partition pools.
    pub connection_group_prefix: String,
    pub user_agent: Option<String>,
    /// Try HTTP/2 extended CONNECT before the HTTP/1.1 upgrade.
    pub http2_extended_connect: bool,
    pub pool_idle_timeout: Option<Duration>,
    pub pool_max_idle_per_host: usize,
    /// Budget of the channels' `open_default`.
    pub open_timeout: Duration,
    /// Budget of the channels' `close_default`.
    pub close_timeout: Duration,
    /// Budget of `request_default` and the duplex `send_default`.
    pub send_timeout: Duration,
    /// Budget of the duplex `receive_default`.
    pub receive_timeout: Duration,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            transfer_mode: TransferMode::Buffered,
            max_buffer_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_received_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_buffer_pool_size: DEFAULT_MAX_BUFFER_POOL_SIZE,
            encoding: MessageEncoding::Framed,
            auth_scheme: AuthScheme::Anonymous,
            proxy_auth_scheme: AuthScheme::Anonymous,
            proxy: ProxySettings::default(),
            tls: TlsSettings::default(),
            security_mode: SecurityMode::None,
            transport_usage: TransportUsage::WhenDuplex,
            subprotocols: Vec::new(),
            manual_addressing: false,
            addressing_enabled: true,
            allow_cookies: false,
            decompression_enabled: true,
            keep_alive_enabled: true,
            connection_group_prefix: String::new(),
            user_agent: None,
            http2_extended_connect: false,
            pool_idle_timeout: Some(Duration::from_secs(90)),
            pool_max_idle_per_host: 32,
            open_timeout: Duration::from_secs(60),
            close_timeout: Duration::from_secs(60),
            send_timeout: Duration::from_secs(60),
            receive_timeout: Duration::from_secs(600),
        }
    }
}

impl BindingConfig {
    /// Check the configuration for internal consistency.
    ///
    /// Every failure is a [`ChannelError::Configuration`].
    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.max_received_message_size == 0 {
            return Err(ChannelError::configuration(
                "max_received_message_size must be greater than zero",
            ));
        }
        if self.max_buffer_size == 0 {
            return Err(ChannelError::configuration(
                "max_buffer_size must be greater than zero",
            ));
        }

        if self.transfer_mode.is_buffered()
            && self.max_buffer_size != self.max_received_message_size
        {
            return Err(ChannelError::configuration(format!(
                "buffered transfer mode requires max_buffer_size ({}) to equal \
                 max_received_message_size ({})",
                self.max_buffer_size, self.max_received_message_size
            )));
        }
        if self.transfer_mode.is_response_streamed()
            && self.max_buffer_size > self.max_received_message_size
        {
            return Err(ChannelError::configuration(format!(
                "max_buffer_size ({}) must not exceed max_received_message_size ({})",
                self.max_buffer_size, self.max_received_message_size
            )));
        }

        if self.transfer_mode.is_request_streamed() && !self.auth_scheme.is_anonymous() {
            return Err(ChannelError::configuration(format!(
                "streamed requests cannot use the {} authentication scheme",
                self.auth_scheme
            )));
        }

        if !self.transfer_mode.is_buffered() && !self.encoding.supports_streaming() {
            return Err(ChannelError::configuration(format!(
                "{} encoding cannot be used with {:?} transfer mode",
                self.encoding.content_type(),
                self.transfer_mode
            )));
        }

        let mut seen = HashSet::new();
        for protocol in &self.subprotocols {
            if !is_token(protocol) {
                return Err(ChannelError::configuration(format!(
                    "subprotocol {protocol:?} is not a valid token"
                )));
            }
            if !seen.insert(protocol.to_ascii_lowercase()) {
                return Err(ChannelError::configuration(format!(
                    "subprotocol {protocol:?} is listed more than once"
                )));
            }
        }

        if self.tls.requires_transport() && self.security_mode != SecurityMode::Transport {
            return Err(ChannelError::configuration(
                "client certificates and peer pinning require transport security",
            ));
        }

        if !self.proxy_auth_scheme.is_anonymous() && self.proxy.mode == ProxyMode::None {
            return Err(ChannelError::configuration(format!(
                "proxy authentication scheme {} requires a proxy",
                self.proxy_auth_scheme
            )));
        }

        Ok(())
    }

    /// Whether the factory needs a security token manager.
    pub fn needs_token_manager(&self) -> bool {
        !self.auth_scheme.is_anonymous() || !self.proxy_auth_scheme.is_anonymous()
    }
}

/// RFC 9110 token.
pub(crate) fn is_token(value: &str) -> bool {
    !value.is_empty()
        && value.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}
