//! Channel error taxonomy.
//!
//! Every failure that leaves a channel is one of the kinds in [`ErrorKind`].
//! [`ChannelError`] carries the kind together with a message that names the
//! destination and, where it applies, the offending header, status or
//! content type.

use std::str::FromStr;

/// Maximum number of body bytes quoted in a diagnostic message.
pub const MAX_EXCERPT_BYTES: usize = 1024;

/// Error kinds surfaced by channels and factories.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Timeout,
    Cancelled,
    EndpointNotFound,
    SecurityNegotiation,
    Authentication,
    ServerBusy,
    Protocol,
    QuotaExceeded,
    Communication,
    Handshake,
    InvalidOperation,
}

impl ErrorKind {
    /// Get the string representation of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::EndpointNotFound => "endpoint_not_found",
            ErrorKind::SecurityNegotiation => "security_negotiation",
            ErrorKind::Authentication => "authentication",
            ErrorKind::ServerBusy => "server_busy",
            ErrorKind::Protocol => "protocol",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::Communication => "communication",
            ErrorKind::Handshake => "handshake",
            ErrorKind::InvalidOperation => "invalid_operation",
        }
    }

    /// Returns whether a caller may reasonably retry the operation with a
    /// fresh budget.
    ///
    /// ```
    /// use channelrpc_core::ErrorKind;
    ///
    /// assert!(ErrorKind::Timeout.is_retryable());
    /// assert!(ErrorKind::ServerBusy.is_retryable());
    /// assert!(!ErrorKind::Configuration.is_retryable());
    /// assert!(!ErrorKind::Authentication.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::ServerBusy | ErrorKind::Communication
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an [`ErrorKind`] from a string fails.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseErrorKindError(());

impl std::fmt::Display for ParseErrorKindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown error kind")
    }
}

impl std::error::Error for ParseErrorKindError {}

impl FromStr for ErrorKind {
    type Err = ParseErrorKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "configuration" => Ok(ErrorKind::Configuration),
            "timeout" => Ok(ErrorKind::Timeout),
            "cancelled" | "canceled" => Ok(ErrorKind::Cancelled),
            "endpoint_not_found" => Ok(ErrorKind::EndpointNotFound),
            "security_negotiation" => Ok(ErrorKind::SecurityNegotiation),
            "authentication" => Ok(ErrorKind::Authentication),
            "server_busy" => Ok(ErrorKind::ServerBusy),
            "protocol" => Ok(ErrorKind::Protocol),
            "quota_exceeded" => Ok(ErrorKind::QuotaExceeded),
            "communication" => Ok(ErrorKind::Communication),
            "handshake" => Ok(ErrorKind::Handshake),
            "invalid_operation" => Ok(ErrorKind::InvalidOperation),
            _ => Err(ParseErrorKindError(())),
        }
    }
}

/// Error produced by channels, factories and the message codec.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// Invalid or inconsistent configuration. Reported at open, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The operation's timeout budget was exhausted.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The operation was cancelled by a signal other than its own timeout.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The remote endpoint could not be found or reached.
    #[error("endpoint not found: {0}")]
    EndpointNotFound(String),

    /// TLS or certificate negotiation failed.
    #[error("security negotiation failed: {0}")]
    SecurityNegotiation(String),

    /// The server rejected the caller's credentials.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The server is too busy to process the request.
    #[error("server busy: {0}")]
    ServerBusy(String),

    /// Framing, content-type or header violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A configured size limit was exceeded.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Catch-all transport failure.
    #[error("communication error: {0}")]
    Communication(String),

    /// The WebSocket upgrade handshake was rejected or malformed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The operation is not valid in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl ChannelError {
    /// Create an error of the given kind.
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Configuration => ChannelError::Configuration(message),
            ErrorKind::Timeout => ChannelError::Timeout(message),
            ErrorKind::Cancelled => ChannelError::Cancelled(message),
            ErrorKind::EndpointNotFound => ChannelError::EndpointNotFound(message),
            ErrorKind::SecurityNegotiation => ChannelError::SecurityNegotiation(message),
            ErrorKind::Authentication => ChannelError::Authentication(message),
            ErrorKind::ServerBusy => ChannelError::ServerBusy(message),
            ErrorKind::Protocol => ChannelError::Protocol(message),
            ErrorKind::QuotaExceeded => ChannelError::QuotaExceeded(message),
            ErrorKind::Communication => ChannelError::Communication(message),
            ErrorKind::Handshake => ChannelError::Handshake(message),
            ErrorKind::InvalidOperation => ChannelError::InvalidOperation(message),
        }
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChannelError::Configuration(_) => ErrorKind::Configuration,
            ChannelError::Timeout(_) => ErrorKind::Timeout,
            ChannelError::Cancelled(_) => ErrorKind::Cancelled,
            ChannelError::EndpointNotFound(_) => ErrorKind::EndpointNotFound,
            ChannelError::SecurityNegotiation(_) => ErrorKind::SecurityNegotiation,
            ChannelError::Authentication(_) => ErrorKind::Authentication,
            ChannelError::ServerBusy(_) => ErrorKind::ServerBusy,
            ChannelError::Protocol(_) => ErrorKind::Protocol,
            ChannelError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            ChannelError::Communication(_) => ErrorKind::Communication,
            ChannelError::Handshake(_) => ErrorKind::Handshake,
            ChannelError::InvalidOperation(_) => ErrorKind::InvalidOperation,
        }
    }

    /// Get the error message.
    pub fn message(&self) -> &str {
        match self {
            ChannelError::Configuration(msg)
            | ChannelError::Timeout(msg)
            | ChannelError::Cancelled(msg)
            | ChannelError::EndpointNotFound(msg)
            | ChannelError::SecurityNegotiation(msg)
            | ChannelError::Authentication(msg)
            | ChannelError::ServerBusy(msg)
            | ChannelError::Protocol(msg)
            | ChannelError::QuotaExceeded(msg)
            | ChannelError::Communication(msg)
            | ChannelError::Handshake(msg)
            | ChannelError::InvalidOperation(msg) => msg,
        }
    }

    /// Append the destination to the message unless it already mentions it.
    pub fn with_destination(self, destination: &str) -> Self {
        if self.message().contains(destination) {
            return self;
        }
        let message = format!("{} (destination: {})", self.message(), destination);
        ChannelError::new(self.kind(), message)
    }

    /// Returns whether this error may be resolved by retrying.
    ///
    /// Convenience wrapper for [`ErrorKind::is_retryable()`].
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Returns true for the timeout kind.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ChannelError::Timeout(_))
    }

    // Convenience constructors

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        ChannelError::Protocol(message.into())
    }

    pub fn quota_exceeded<S: Into<String>>(message: S) -> Self {
        ChannelError::QuotaExceeded(message.into())
    }

    pub fn communication<S: Into<String>>(message: S) -> Self {
        ChannelError::Communication(message.into())
    }

    pub fn invalid_operation<S: Into<String>>(message: S) -> Self {
        ChannelError::InvalidOperation(message.into())
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        ChannelError::Configuration(message.into())
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => ChannelError::Timeout(err.to_string()),
            _ => ChannelError::Communication(err.to_string()),
        }
    }
}

/// Render at most [`MAX_EXCERPT_BYTES`] of a body for use in a message.
///
/// Invalid UTF-8 is replaced rather than rejected; a trailing marker notes
/// truncation.
pub fn body_excerpt(body: &[u8]) -> String {
    let cut = body.len().min(MAX_EXCERPT_BYTES);
    let mut text = String::from_utf8_lossy(&body[..cut]).into_owned();
    if body.len() > MAX_EXCERPT_BYTES {
        text.push_str("...");
    }
    text
}
