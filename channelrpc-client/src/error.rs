//! Raw transport failures.
//!
//! [`TransportError`] is what the HTTP and WebSocket layers produce. It is
//! classified once, close to the failing library call, and converted into a
//! [`ChannelError`] at the channel boundary so no hyper, rustls or tungstenite
//! error type reaches callers.

use std::error::Error as StdError;

use channelrpc_core::ChannelError;

/// Classification of a raw transport failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// DNS lookup failed.
    NameResolution,
    /// Connection refused, no route, or host unreachable.
    Unreachable,
    /// TLS handshake or certificate validation failed.
    Tls,
    /// Connection reset, aborted or closed mid-exchange.
    ConnectionReset,
    /// The peer violated HTTP or WebSocket framing.
    Protocol,
    /// A size limit enforced below the codec was exceeded.
    QuotaExceeded,
    /// Anything else.
    Other,
}

/// A classified transport failure.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new<S: Into<String>>(kind: TransportErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::new(TransportErrorKind::Other, message)
    }

    /// Classify a hyper-util client error by walking its source chain.
    pub fn from_hyper(err: &hyper_util::client::legacy::Error) -> Self {
        let message = render_chain(err);
        let kind = classify_chain(err).unwrap_or(if err.is_connect() {
            TransportErrorKind::Unreachable
        } else {
            TransportErrorKind::Other
        });
        Self::new(kind, message)
    }

    /// Classify an error from a hyper connection or body.
    pub fn from_hyper_body(err: &hyper::Error) -> Self {
        let message = render_chain(err);
        let kind = classify_chain(err).unwrap_or(if err.is_incomplete_message() {
            TransportErrorKind::ConnectionReset
        } else if err.is_parse() || err.is_parse_status() {
            TransportErrorKind::Protocol
        } else {
            TransportErrorKind::Other
        });
        Self::new(kind, message)
    }

    /// Classify an I/O error.
    pub fn from_io(err: &std::io::Error) -> Self {
        let message = render_chain(err);
        let kind = classify_chain(err).unwrap_or(TransportErrorKind::Other);
        Self::new(kind, message)
    }

    /// Classify any error by walking its source chain.
    pub fn from_source(err: &(dyn StdError + 'static), fallback: TransportErrorKind) -> Self {
        let kind = classify_chain(err).unwrap_or(fallback);
        Self::new(kind, render_chain(err))
    }

    /// Classify a WebSocket error.
    pub fn from_ws(err: &tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        let kind = match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                TransportErrorKind::ConnectionReset
            }
            WsError::Io(io) => io_kind(io.kind()),
            WsError::Tls(_) => TransportErrorKind::Tls,
            WsError::Capacity(_) => TransportErrorKind::QuotaExceeded,
            WsError::Protocol(_) | WsError::Utf8 | WsError::HttpFormat(_) => {
                TransportErrorKind::Protocol
            }
            _ => TransportErrorKind::Other,
        };
        Self::new(kind, err.to_string())
    }

    /// Convert into the caller-facing taxonomy.
    pub fn into_channel_error(self, destination: &str) -> ChannelError {
        let message = format!("{} (destination: {destination})", self.message);
        match self.kind {
            TransportErrorKind::NameResolution | TransportErrorKind::Unreachable => {
                ChannelError::EndpointNotFound(message)
            }
            TransportErrorKind::Tls => ChannelError::SecurityNegotiation(message),
            TransportErrorKind::Protocol => ChannelError::Protocol(message),
            TransportErrorKind::QuotaExceeded => ChannelError::QuotaExceeded(message),
            TransportErrorKind::ConnectionReset | TransportErrorKind::Other => {
                ChannelError::Communication(message)
            }
        }
    }
}

impl From<ChannelError> for TransportError {
    fn from(err: ChannelError) -> Self {
        let kind = match &err {
            ChannelError::QuotaExceeded(_) => TransportErrorKind::QuotaExceeded,
            ChannelError::Protocol(_) => TransportErrorKind::Protocol,
            _ => TransportErrorKind::Other,
        };
        Self::new(kind, err.to_string())
    }
}

fn io_kind(kind: std::io::ErrorKind) -> TransportErrorKind {
    use std::io::ErrorKind;

    match kind {
        ErrorKind::ConnectionRefused
        | ErrorKind::AddrNotAvailable
        | ErrorKind::HostUnreachable
        | ErrorKind::NetworkUnreachable => TransportErrorKind::Unreachable,
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => TransportErrorKind::ConnectionReset,
        _ => TransportErrorKind::Other,
    }
}

fn classify_chain(err: &(dyn StdError + 'static)) -> Option<TransportErrorKind> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        // Already classified by a lower layer, e.g. the proxy connector.
        if let Some(inner) = e.downcast_ref::<TransportError>() {
            return Some(inner.kind);
        }
        if e.downcast_ref::<rustls::Error>().is_some() {
            return Some(TransportErrorKind::Tls);
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            // rustls surfaces handshake failures as io::Error(InvalidData, rustls::Error).
            if let Some(inner) = io.get_ref() {
                if inner.downcast_ref::<rustls::Error>().is_some() {
                    return Some(TransportErrorKind::Tls);
                }
            }
            let kind = io_kind(io.kind());
            if kind != TransportErrorKind::Other {
                return Some(kind);
            }
        }
        // hyper-util's resolver wraps getaddrinfo failures in "dns error".
        if e.to_string().starts_with("dns error") {
            return Some(TransportErrorKind::NameResolution);
        }
        current = e.source();
    }
    None
}

fn render_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(e) = source {
        let text = e.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = e.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use channelrpc_core::ErrorKind;

    #[test]
    fn test_io_classification() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(
            TransportError::from_io(&refused).kind,
            TransportErrorKind::Unreachable
        );

        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(
            TransportError::from_io(&reset).kind,
            TransportErrorKind::ConnectionReset
        );
    }

    #[test]
    fn test_tls_inside_io_is_tls() {
        let io = std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer),
        );
        assert_eq!(TransportError::from_io(&io).kind, TransportErrorKind::Tls);
    }

    #[test]
    fn test_channel_error_mapping() {
        let cases = [
            (TransportErrorKind::NameResolution, ErrorKind::EndpointNotFound),
            (TransportErrorKind::Unreachable, ErrorKind::EndpointNotFound),
            (TransportErrorKind::Tls, ErrorKind::SecurityNegotiation),
            (TransportErrorKind::ConnectionReset, ErrorKind::Communication),
            (TransportErrorKind::Protocol, ErrorKind::Protocol),
            (TransportErrorKind::QuotaExceeded, ErrorKind::QuotaExceeded),
            (TransportErrorKind::Other, ErrorKind::Communication),
        ];
        for (kind, expected) in cases {
            let err = TransportError::new(kind, "boom").into_channel_error("http://svc/a");
            assert_eq!(err.kind(), expected);
            assert!(err.message().contains("http://svc/a"));
        }
    }
}
