//! Request and response body types.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use channelrpc_core::{BodyStream, ChannelError};
use futures::{Stream, StreamExt};
use http_body::{Body, Frame};
use http_body_util::BodyExt;
use http_body_util::combinators::UnsyncBoxBody;
use pin_project_lite::pin_project;

use crate::error::TransportError;

/// Boxed response body produced by every [`HttpSend`](super::HttpSend).
pub type ResponseBody = UnsyncBoxBody<Bytes, TransportError>;

pin_project! {
    /// Outbound HTTP body.
    ///
    /// Buffered requests use `Full`, streamed requests drain an encoder
    /// pipe through `Streaming`, and methods without an entity use `Empty`.
    #[project = TransportBodyProj]
    pub enum TransportBody {
        Empty,
        Full {
            data: Option<Bytes>,
        },
        Streaming {
            #[pin]
            stream: Pin<Box<dyn Stream<Item = Result<Bytes, ChannelError>> + Send>>,
        },
    }
}

impl TransportBody {
    pub fn empty() -> Self {
        TransportBody::Empty
    }

    pub fn full(data: Bytes) -> Self {
        TransportBody::Full { data: Some(data) }
    }

    pub fn streaming<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, ChannelError>> + Send + 'static,
    {
        TransportBody::Streaming {
            stream: Box::pin(stream),
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, TransportBody::Streaming { .. })
    }
}

impl Body for TransportBody {
    type Data = Bytes;
    type Error = ChannelError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.project() {
            TransportBodyProj::Empty => Poll::Ready(None),
            TransportBodyProj::Full { data } => {
                Poll::Ready(data.take().map(|d| Ok(Frame::data(d))))
            }
            TransportBodyProj::Streaming { stream } => stream
                .poll_next(cx)
                .map(|chunk| chunk.map(|chunk| chunk.map(Frame::data))),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            TransportBody::Empty => true,
            TransportBody::Full { data } => data.is_none(),
            TransportBody::Streaming { .. } => false,
        }
    }

    fn size_hint(&self) -> http_body::SizeHint {
        match self {
            TransportBody::Empty => http_body::SizeHint::with_exact(0),
            TransportBody::Full { data } => {
                http_body::SizeHint::with_exact(data.as_ref().map_or(0, |d| d.len() as u64))
            }
            TransportBody::Streaming { .. } => http_body::SizeHint::default(),
        }
    }
}

impl Default for TransportBody {
    fn default() -> Self {
        TransportBody::Empty
    }
}

impl std::fmt::Debug for TransportBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (kind, len) = match self {
            TransportBody::Empty => ("empty", Some(0)),
            TransportBody::Full { data } => ("full", data.as_ref().map(Bytes::len)),
            TransportBody::Streaming { .. } => ("streaming", None),
        };
        f.debug_struct("TransportBody")
            .field("kind", &kind)
            .field("len", &len)
            .finish()
    }
}

/// A response body with a fixed payload, for mock transports and errors.
pub fn full_response_body(data: impl Into<Bytes>) -> ResponseBody {
    http_body_util::Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Adapt a response body into the codec's byte stream.
///
/// Trailers are skipped; transport failures are classified against
/// `destination`.
pub fn into_body_stream(body: ResponseBody, destination: String) -> BodyStream {
    let stream = http_body_util::BodyStream::new(body).filter_map(move |frame| {
        let destination = destination.clone();
        async move {
            match frame {
                Ok(frame) => frame.into_data().ok().map(Ok),
                Err(err) => Some(Err(err.into_channel_error(&destination))),
            }
        }
    });
    Box::pin(stream)
}
