//! The message model carried by channels.
//!
//! A [`Message`] has a small header bag (action, destination, string
//! properties), a body that is readable exactly once, and a typed extension
//! bag for transport-local data that never reaches the wire.

use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// A boxed body stream.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, ChannelError>> + Send>>;

/// Wire-visible message headers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeaders {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    /// Set when the message carries a fault rather than a normal reply.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fault: bool,
}

/// Message body.
pub enum Body {
    /// No body.
    Empty,
    /// Body bytes already in memory.
    Buffered(Bytes),
    /// Body produced incrementally.
    Streamed(BodyStream),
}

impl Body {
    /// Collect the whole body into memory.
    pub async fn collect(self) -> Result<Bytes, ChannelError> {
        match self {
            Body::Empty => Ok(Bytes::new()),
            Body::Buffered(bytes) => Ok(bytes),
            Body::Streamed(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }

    /// Convert any body into a stream of chunks.
    pub fn into_stream(self) -> BodyStream {
        match self {
            Body::Empty => Box::pin(futures::stream::empty()),
            Body::Buffered(bytes) => Box::pin(futures::stream::once(async move { Ok(bytes) })),
            Body::Streamed(stream) => stream,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => write!(f, "Body::Empty"),
            Body::Buffered(bytes) => f
                .debug_struct("Body::Buffered")
                .field("len", &bytes.len())
                .finish(),
            Body::Streamed(_) => write!(f, "Body::Streamed"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BodyState {
    Unread,
    Consumed,
    Closed,
}

/// A unit of communication.
///
/// # Example
///
/// ```
/// use channelrpc_core::Message;
///
/// let message = Message::new("urn:orders/Submit")
///     .with_to("http://orders.example/svc")
///     .with_property("tenant", "blue")
///     .with_body("payload");
///
/// assert_eq!(message.action(), Some("urn:orders/Submit"));
/// assert_eq!(message.properties().get("tenant").map(String::as_str), Some("blue"));
/// ```
pub struct Message {
    headers: MessageHeaders,
    body: Option<Body>,
    state: BodyState,
    extensions: http::Extensions,
}

impl Message {
    /// Create a message with the given action and no body.
    pub fn new<S: Into<String>>(action: S) -> Self {
        let mut message = Self::empty();
        message.headers.action = Some(action.into());
        message
    }

    /// Create a message with no action and no body.
    pub fn empty() -> Self {
        Self::from_parts(MessageHeaders::default(), Body::Empty)
    }

    /// Assemble a message from decoded headers and a body.
    pub fn from_parts(headers: MessageHeaders, body: Body) -> Self {
        Self {
            headers,
            body: Some(body),
            state: BodyState::Unread,
            extensions: http::Extensions::new(),
        }
    }

    /// Set a buffered body.
    pub fn with_body<B: Into<Bytes>>(mut self, body: B) -> Self {
        self.body = Some(Body::Buffered(body.into()));
        self
    }

    /// Set a streamed body.
    pub fn with_body_stream<S>(mut self, stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, ChannelError>> + Send + 'static,
    {
        self.body = Some(Body::Streamed(Box::pin(stream)));
        self
    }

    /// Set the destination address.
    pub fn with_to<S: Into<String>>(mut self, to: S) -> Self {
        self.headers.to = Some(to.into());
        self
    }

    /// Add a custom property.
    pub fn with_property<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.properties.insert(key.into(), value.into());
        self
    }

    pub fn action(&self) -> Option<&str> {
        self.headers.action.as_deref()
    }

    pub fn set_action<S: Into<String>>(&mut self, action: S) {
        self.headers.action = Some(action.into());
    }

    pub fn to(&self) -> Option<&str> {
        self.headers.to.as_deref()
    }

    pub fn set_to<S: Into<String>>(&mut self, to: S) {
        self.headers.to = Some(to.into());
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.headers.properties
    }

    pub fn properties_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.headers.properties
    }

    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut MessageHeaders {
        &mut self.headers
    }

    /// Whether the message carries a fault.
    pub fn is_fault(&self) -> bool {
        self.headers.fault
    }

    pub fn set_fault(&mut self, fault: bool) {
        self.headers.fault = fault;
    }

    /// Transport-local typed properties. Never encoded.
    pub fn extensions(&self) -> &http::Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut http::Extensions {
        &mut self.extensions
    }

    /// Whether the body has no content and is known to be empty.
    pub fn is_empty_body(&self) -> bool {
        match &self.body {
            Some(Body::Empty) => true,
            Some(Body::Buffered(bytes)) => bytes.is_empty(),
            _ => false,
        }
    }

    /// Whether the body has already been taken or the message closed.
    pub fn is_consumed(&self) -> bool {
        self.state != BodyState::Unread
    }

    /// Take the body. A body can be taken at most once.
    pub fn take_body(&mut self) -> Result<Body, ChannelError> {
        match self.state {
            BodyState::Unread => {}
            BodyState::Consumed => {
                return Err(ChannelError::invalid_operation(
                    "message body has already been read",
                ));
            }
            BodyState::Closed => {
                return Err(ChannelError::invalid_operation("message has been closed"));
            }
        }
        self.state = BodyState::Consumed;
        Ok(self.body.take().unwrap_or(Body::Empty))
    }

    /// Take and collect the body into memory.
    pub async fn read_body(&mut self) -> Result<Bytes, ChannelError> {
        self.take_body()?.collect().await
    }

    /// Split into headers and body, consuming the body.
    pub fn into_parts(mut self) -> Result<(MessageHeaders, Body), ChannelError> {
        let body = self.take_body()?;
        Ok((self.headers, body))
    }

    /// Release the body without reading it.
    pub fn close(&mut self) {
        self.body = None;
        self.state = BodyState::Closed;
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_body_is_read_once() {
        let mut message = Message::new("urn:a").with_body("hello");
        assert!(!message.is_consumed());

        let body = message.read_body().await.unwrap();
        assert_eq!(body, Bytes::from("hello"));
        assert!(message.is_consumed());

        let err = message.read_body().await.unwrap_err();
        assert!(matches!(err, ChannelError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_streamed_body_collects_in_order() {
        let chunks = vec![Ok(Bytes::from("ab")), Ok(Bytes::from("cd"))];
        let mut message = Message::empty().with_body_stream(futures::stream::iter(chunks));
        assert!(!message.is_empty_body());
        assert_eq!(message.read_body().await.unwrap(), Bytes::from("abcd"));
    }

    #[tokio::test]
    async fn test_streamed_body_error_propagates() {
        let chunks = vec![
            Ok(Bytes::from("ab")),
            Err(ChannelError::communication("reset")),
        ];
        let mut message = Message::empty().with_body_stream(futures::stream::iter(chunks));
        let err = message.read_body().await.unwrap_err();
        assert_eq!(err, ChannelError::communication("reset"));
    }

    #[test]
    fn test_closed_message_rejects_reads() {
        let mut message = Message::new("urn:a").with_body("x");
        message.close();
        assert!(message.is_consumed());
        assert!(message.take_body().is_err());
    }

    #[test]
    fn test_extensions_are_not_headers() {
        #[derive(Clone, Debug, PartialEq)]
        struct Marker(u8);

        let mut message = Message::new("urn:a");
        message.extensions_mut().insert(Marker(7));
        assert_eq!(message.extensions().get::<Marker>(), Some(&Marker(7)));
        assert!(message.properties().is_empty());
    }
}
