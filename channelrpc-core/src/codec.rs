//! Message codec.
//!
//! Maps a [`Message`] to wire bytes and back, in two strategies:
//!
//! - **Buffered**: the whole message is encoded into one pooled buffer before
//!   any byte is written, and decoding reads a complete, size-checked body.
//! - **Streamed**: encoding runs in its own task feeding a bounded pipe that
//!   the network writer drains, and decoding parses frames incrementally
//!   under a running byte quota.

use std::pin::Pin;
use std::task::{Context, Poll};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::{Buf, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::buffer::BufferPool;
use crate::envelope::{self, FRAME_HEADER_SIZE, FrameKind, frame_flags};
use crate::error::{ChannelError, body_excerpt};
use crate::message::{Body, BodyStream, Message, MessageHeaders};

/// Content type of the framed encoding.
pub const FRAMED_CONTENT_TYPE: &str = "application/vnd.channelrpc.framed";

/// Content type of the JSON encoding.
pub const JSON_CONTENT_TYPE: &str = "application/vnd.channelrpc+json";

/// Wire encoding of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageEncoding {
    /// Length-prefixed frames; supports both buffered and streamed transfer.
    #[default]
    Framed,
    /// A single JSON document with a base64 body; buffered only.
    Json,
}

impl MessageEncoding {
    pub fn content_type(&self) -> &'static str {
        match self {
            MessageEncoding::Framed => FRAMED_CONTENT_TYPE,
            MessageEncoding::Json => JSON_CONTENT_TYPE,
        }
    }

    /// Parse a `Content-Type` header value, ignoring parameters and case.
    pub fn from_content_type(value: &str) -> Option<Self> {
        let essence = value.split(';').next().unwrap_or_default().trim();
        if essence.eq_ignore_ascii_case(FRAMED_CONTENT_TYPE) {
            Some(MessageEncoding::Framed)
        } else if essence.eq_ignore_ascii_case(JSON_CONTENT_TYPE) {
            Some(MessageEncoding::Json)
        } else {
            None
        }
    }

    pub fn supports_streaming(&self) -> bool {
        matches!(self, MessageEncoding::Framed)
    }
}

/// Running byte counter for incremental reads.
#[derive(Debug, Clone, Copy)]
pub struct QuotaLimiter {
    max: usize,
    consumed: usize,
}

impl QuotaLimiter {
    pub fn new(max: usize) -> Self {
        Self { max, consumed: 0 }
    }

    /// Account for `n` more bytes. Fails as soon as the total passes the maximum.
    pub fn consume(&mut self, n: usize) -> Result<(), ChannelError> {
        self.consumed = self.consumed.saturating_add(n);
        if self.consumed > self.max {
            return Err(ChannelError::quota_exceeded(format!(
                "message size exceeds the maximum of {} bytes",
                self.max
            )));
        }
        Ok(())
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn max(&self) -> usize {
        self.max
    }

    fn reset(&mut self, already: usize) {
        self.consumed = already;
    }
}

#[derive(Serialize, Deserialize)]
struct JsonEnvelope {
    #[serde(flatten)]
    headers: MessageHeaders,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<String>,
}

/// Encoder/decoder bound to one encoding and one set of size limits.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    encoding: MessageEncoding,
    max_message_size: usize,
    max_buffer_size: usize,
}

impl MessageCodec {
    pub fn new(encoding: MessageEncoding, max_message_size: usize, max_buffer_size: usize) -> Self {
        Self {
            encoding,
            max_message_size,
            max_buffer_size: max_buffer_size.max(1),
        }
    }

    pub fn encoding(&self) -> MessageEncoding {
        self.encoding
    }

    pub fn content_type(&self) -> &'static str {
        self.encoding.content_type()
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }

    /// Encode a whole message into one buffer drawn from `pool`.
    ///
    /// The body is consumed. An encoded size above the buffer limit fails
    /// with `QuotaExceeded` before anything is written.
    pub async fn encode_buffered(
        &self,
        message: Message,
        pool: &BufferPool,
    ) -> Result<Bytes, ChannelError> {
        let (headers, body) = message.into_parts()?;
        let body = body.collect().await?;

        let mut buf = pool.take();
        match self.encoding {
            MessageEncoding::Framed => {
                let json = serde_json::to_vec(&headers).map_err(|e| {
                    ChannelError::protocol(format!("failed to encode message headers: {e}"))
                })?;
                envelope::put_frame(&mut buf, frame_flags::HEADERS, &json);
                if !body.is_empty() {
                    envelope::put_frame(&mut buf, frame_flags::BODY, &body);
                }
                envelope::put_frame(&mut buf, frame_flags::END, &[]);
            }
            MessageEncoding::Json => {
                let doc = JsonEnvelope {
                    headers,
                    body: (!body.is_empty()).then(|| STANDARD.encode(&body)),
                };
                let json = serde_json::to_vec(&doc).map_err(|e| {
                    ChannelError::protocol(format!("failed to encode message: {e}"))
                })?;
                buf.extend_from_slice(&json);
            }
        }

        if buf.len() > self.max_buffer_size {
            return Err(ChannelError::quota_exceeded(format!(
                "encoded message of {} bytes exceeds the buffer limit of {} bytes",
                buf.len(),
                self.max_buffer_size
            )));
        }
        tracing::trace!(len = buf.len(), encoding = ?self.encoding, "encoded buffered message");
        Ok(buf.split().freeze())
    }

    /// Start encoding a message onto a bounded pipe.
    ///
    /// The encoder runs in a spawned task and suspends whenever `capacity`
    /// frames are waiting. Dropping the returned [`EncodePipe`] aborts the
    /// encoder. Must be called from within a tokio runtime.
    pub fn encode_streamed(
        &self,
        message: Message,
        capacity: usize,
    ) -> Result<EncodePipe, ChannelError> {
        if !self.encoding.supports_streaming() {
            return Err(ChannelError::invalid_operation(format!(
                "{} cannot be streamed",
                self.encoding.content_type()
            )));
        }
        let (headers, body) = message.into_parts()?;
        let headers_frame = envelope::headers_frame(&headers)?;
        let max_chunk = self.max_buffer_size;

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(async move {
            if tx.send(Ok(headers_frame)).await.is_err() {
                return;
            }
            let mut body = body.into_stream();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                };
                let mut offset = 0;
                while offset < chunk.len() {
                    let end = (offset + max_chunk).min(chunk.len());
                    let frame = envelope::frame(frame_flags::BODY, &chunk[offset..end]);
                    if tx.send(Ok(frame)).await.is_err() {
                        return;
                    }
                    offset = end;
                }
            }
            let _ = tx.send(Ok(envelope::end_frame())).await;
            tracing::trace!("streamed encoder finished");
        });

        Ok(EncodePipe {
            rx: ReceiverStream::new(rx),
            task,
        })
    }

    /// Validate a response content type against this codec.
    ///
    /// `excerpt` is the start of the body, quoted (bounded) in the error.
    pub fn check_content_type(
        &self,
        content_type: Option<&str>,
        body_present: bool,
        excerpt: &[u8],
    ) -> Result<(), ChannelError> {
        match content_type.map(str::trim) {
            None | Some("") if body_present => Err(ChannelError::protocol(format!(
                "response has a body but no content-type; body: {}",
                body_excerpt(excerpt)
            ))),
            None | Some("") => Ok(()),
            Some(ct) => match MessageEncoding::from_content_type(ct) {
                Some(encoding) if encoding == self.encoding => Ok(()),
                _ => Err(ChannelError::protocol(format!(
                    "content-type '{ct}' does not match the expected '{}'; body: {}",
                    self.encoding.content_type(),
                    body_excerpt(excerpt)
                ))),
            },
        }
    }

    /// Decode a complete body.
    pub fn decode_buffered(
        &self,
        content_type: Option<&str>,
        body: Bytes,
    ) -> Result<Message, ChannelError> {
        self.check_content_type(content_type, !body.is_empty(), &body)?;
        if body.len() > self.max_message_size {
            return Err(ChannelError::quota_exceeded(format!(
                "message of {} bytes exceeds the maximum of {} bytes",
                body.len(),
                self.max_message_size
            )));
        }
        match self.encoding {
            MessageEncoding::Framed => decode_framed(body),
            MessageEncoding::Json => decode_json(&body),
        }
    }

    /// Decode a message whose body stays on the wire.
    ///
    /// The headers frame is read before this returns; the message body is a
    /// lazy stream over the remaining frames, counted against the quota.
    pub async fn decode_streamed(
        &self,
        content_type: Option<&str>,
        source: BodyStream,
    ) -> Result<Message, ChannelError> {
        let mut reader = self.frame_reader(source);
        if !self.encoding.supports_streaming() {
            // Buffered-only encodings are read whole under the same quota.
            let body = reader.read_to_end().await?;
            return self.decode_buffered(content_type, body);
        }
        self.check_content_type(content_type, true, &[])?;

        let headers = match reader.next_frame().await? {
            Some((FrameKind::Headers, payload)) => envelope::parse_headers(&payload)?,
            Some((kind, _)) => {
                return Err(ChannelError::protocol(format!(
                    "expected a headers frame, got {kind:?}"
                )));
            }
            None => return Err(ChannelError::protocol("message ended before its headers")),
        };

        let body = futures::stream::unfold(Some(reader), |state| async move {
            let mut reader = state?;
            match reader.next_frame().await {
                Ok(Some((FrameKind::Body, payload))) => Some((Ok(payload), Some(reader))),
                Ok(Some((FrameKind::End, _))) if reader.has_buffered() => Some((
                    Err(ChannelError::protocol("unexpected data after end of message")),
                    None,
                )),
                Ok(Some((FrameKind::End, _))) => None,
                Ok(Some((FrameKind::Headers, _))) => Some((
                    Err(ChannelError::protocol("unexpected headers frame in message body")),
                    None,
                )),
                Ok(None) => Some((
                    Err(ChannelError::protocol("message body ended without an end frame")),
                    None,
                )),
                Err(err) => Some((Err(err), None)),
            }
        });
        Ok(Message::from_parts(headers, Body::Streamed(Box::pin(body))))
    }

    /// Wrap a byte source for incremental decoding under this codec's quota.
    pub fn frame_reader(&self, source: BodyStream) -> FrameReader {
        FrameReader::new(source, self.max_message_size)
    }

    /// Read the next complete message from a long-lived source.
    ///
    /// Returns `Ok(None)` when the source ends cleanly between messages.
    pub async fn read_message(
        &self,
        reader: &mut FrameReader,
    ) -> Result<Option<Message>, ChannelError> {
        reader.start_message();
        match self.encoding {
            MessageEncoding::Framed => reader.read_framed_message().await,
            MessageEncoding::Json => match reader.next_chunk().await? {
                Some(chunk) => decode_json(&chunk).map(Some),
                None => Ok(None),
            },
        }
    }
}

/// Read a response body into memory.
///
/// A declared `content_length` above `max` fails immediately. Without a
/// declared length, reads up to `max` bytes and then probes for more; any
/// further data fails with `QuotaExceeded`.
pub async fn read_buffered(
    mut source: BodyStream,
    content_length: Option<u64>,
    max: usize,
    pool: &BufferPool,
) -> Result<Bytes, ChannelError> {
    if let Some(declared) = content_length {
        if declared > max as u64 {
            return Err(ChannelError::quota_exceeded(format!(
                "declared content-length {declared} exceeds the maximum of {max} bytes"
            )));
        }
    }

    let mut buf = pool.take();
    if let Some(declared) = content_length {
        buf.reserve(declared as usize);
    }
    while let Some(chunk) = source.next().await {
        let chunk = chunk?;
        if buf.len() + chunk.len() > max {
            return Err(ChannelError::quota_exceeded(format!(
                "response body exceeds the maximum of {max} bytes"
            )));
        }
        buf.extend_from_slice(&chunk);
    }

    if let Some(declared) = content_length {
        if buf.len() as u64 != declared {
            return Err(ChannelError::protocol(format!(
                "response body of {} bytes does not match content-length {declared}",
                buf.len()
            )));
        }
    }
    Ok(buf.split().freeze())
}

fn take_frame(body: &mut Bytes) -> Result<(FrameKind, Bytes), ChannelError> {
    if body.len() < FRAME_HEADER_SIZE {
        return Err(ChannelError::protocol("message ended inside a frame header"));
    }
    let (kind, length) = envelope::parse_frame_header(&body[..FRAME_HEADER_SIZE])?;
    if body.len() - FRAME_HEADER_SIZE < length {
        return Err(ChannelError::protocol(format!(
            "frame declares {length} bytes but only {} remain",
            body.len() - FRAME_HEADER_SIZE
        )));
    }
    body.advance(FRAME_HEADER_SIZE);
    Ok((kind, body.split_to(length)))
}

fn decode_framed(mut body: Bytes) -> Result<Message, ChannelError> {
    let headers = match take_frame(&mut body)? {
        (FrameKind::Headers, payload) => envelope::parse_headers(&payload)?,
        (kind, _) => {
            return Err(ChannelError::protocol(format!(
                "expected a headers frame, got {kind:?}"
            )));
        }
    };

    let mut chunks: Vec<Bytes> = Vec::new();
    loop {
        match take_frame(&mut body)? {
            (FrameKind::Body, payload) => chunks.push(payload),
            (FrameKind::End, _) => break,
            (FrameKind::Headers, _) => {
                return Err(ChannelError::protocol("unexpected headers frame in message body"));
            }
        }
    }
    if !body.is_empty() {
        return Err(ChannelError::protocol(format!(
            "{} unexpected bytes after end of message",
            body.len()
        )));
    }

    let body = match chunks.len() {
        0 => Body::Empty,
        1 => Body::Buffered(chunks.remove(0)),
        _ => {
            let mut joined = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
            for chunk in &chunks {
                joined.extend_from_slice(chunk);
            }
            Body::Buffered(joined.freeze())
        }
    };
    Ok(Message::from_parts(headers, body))
}

fn decode_json(body: &[u8]) -> Result<Message, ChannelError> {
    let doc: JsonEnvelope = serde_json::from_slice(body).map_err(|e| {
        ChannelError::protocol(format!(
            "malformed JSON message ({e}); body: {}",
            body_excerpt(body)
        ))
    })?;
    let payload = match doc.body {
        Some(encoded) => Body::Buffered(Bytes::from(STANDARD.decode(encoded).map_err(|e| {
            ChannelError::protocol(format!("message body is not valid base64: {e}"))
        })?)),
        None => Body::Empty,
    };
    Ok(Message::from_parts(doc.headers, payload))
}

/// Incremental frame parser over a byte stream.
///
/// Every byte pulled from the source is counted against the quota; the read
/// that carries the total past the maximum fails with `QuotaExceeded`.
pub struct FrameReader {
    source: BodyStream,
    buf: BytesMut,
    limiter: QuotaLimiter,
    exhausted: bool,
}

impl std::fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader")
            .field("buffered", &self.buf.len())
            .field("limiter", &self.limiter)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

impl FrameReader {
    pub fn new(source: BodyStream, max_message_size: usize) -> Self {
        Self {
            source,
            buf: BytesMut::new(),
            limiter: QuotaLimiter::new(max_message_size),
            exhausted: false,
        }
    }

    /// Whether unparsed bytes remain buffered.
    pub fn has_buffered(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Restart the quota for the next message. Bytes already buffered count
    /// toward it.
    pub fn start_message(&mut self) {
        let already = self.buf.len();
        self.limiter.reset(already);
    }

    async fn fill(&mut self) -> Result<bool, ChannelError> {
        if self.exhausted {
            return Ok(false);
        }
        match self.source.next().await {
            Some(Ok(chunk)) => {
                self.limiter.consume(chunk.len())?;
                self.buf.extend_from_slice(&chunk);
                Ok(true)
            }
            Some(Err(err)) => Err(err),
            None => {
                self.exhausted = true;
                Ok(false)
            }
        }
    }

    /// Next complete frame, or `None` if the source ended on a frame boundary.
    pub async fn next_frame(&mut self) -> Result<Option<(FrameKind, Bytes)>, ChannelError> {
        loop {
            if let Some(frame) = envelope::try_split_frame(&mut self.buf, self.limiter.max())? {
                return Ok(Some(frame));
            }
            if !self.fill().await? {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(ChannelError::protocol(format!(
                    "stream ended inside a frame ({} bytes pending)",
                    self.buf.len()
                )));
            }
        }
    }

    /// Wait until unparsed bytes are buffered or the source has ended,
    /// without consuming anything.
    pub async fn wait_ready(&mut self) -> Result<(), ChannelError> {
        if self.buf.is_empty() {
            self.fill().await?;
        }
        Ok(())
    }

    /// Next raw chunk: buffered bytes first, then the source.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, ChannelError> {
        if !self.buf.is_empty() {
            return Ok(Some(self.buf.split().freeze()));
        }
        if self.fill().await? {
            return Ok(Some(self.buf.split().freeze()));
        }
        Ok(None)
    }

    /// Drain the source into memory under the quota.
    pub async fn read_to_end(&mut self) -> Result<Bytes, ChannelError> {
        while self.fill().await? {}
        Ok(self.buf.split().freeze())
    }

    /// Buffer frames until a whole message (through its end frame) is held,
    /// without consuming any of them. Returns `false` if the source ended
    /// cleanly first.
    ///
    /// Only appends to the buffer, so dropping the future loses nothing.
    async fn buffer_framed_message(&mut self) -> Result<bool, ChannelError> {
        let max_frame = self.limiter.max();
        let mut offset = 0;
        loop {
            while self.buf.len() >= offset + FRAME_HEADER_SIZE {
                let header = &self.buf[offset..offset + FRAME_HEADER_SIZE];
                let (kind, length) = envelope::parse_frame_header(header)?;
                if length > max_frame {
                    return Err(ChannelError::quota_exceeded(format!(
                        "frame of {length} bytes exceeds the maximum of {max_frame} bytes"
                    )));
                }
                let end = offset + FRAME_HEADER_SIZE + length;
                if self.buf.len() < end {
                    break;
                }
                if kind == FrameKind::End {
                    return Ok(true);
                }
                offset = end;
            }
            if !self.fill().await? {
                if self.buf.is_empty() {
                    return Ok(false);
                }
                return Err(ChannelError::protocol(format!(
                    "stream ended inside a message ({} bytes pending)",
                    self.buf.len()
                )));
            }
        }
    }

    async fn read_framed_message(&mut self) -> Result<Option<Message>, ChannelError> {
        if !self.buffer_framed_message().await? {
            return Ok(None);
        }
        let headers = match self.next_frame().await? {
            None => return Ok(None),
            Some((FrameKind::Headers, payload)) => envelope::parse_headers(&payload)?,
            Some((kind, _)) => {
                return Err(ChannelError::protocol(format!(
                    "expected a headers frame, got {kind:?}"
                )));
            }
        };
        let mut body = BytesMut::new();
        loop {
            match self.next_frame().await? {
                Some((FrameKind::Body, payload)) => body.extend_from_slice(&payload),
                Some((FrameKind::End, _)) => break,
                Some((FrameKind::Headers, _)) => {
                    return Err(ChannelError::protocol("unexpected headers frame in message body"));
                }
                None => return Err(ChannelError::protocol("message ended without an end frame")),
            }
        }
        let body = if body.is_empty() {
            Body::Empty
        } else {
            Body::Buffered(body.freeze())
        };
        tracing::trace!(consumed = self.limiter.consumed(), "read framed message");
        Ok(Some(Message::from_parts(headers, body)))
    }
}

/// Consumer side of a streamed encode.
///
/// Yields encoded frames in order. Dropping it aborts the encoder task.
pub struct EncodePipe {
    rx: ReceiverStream<Result<Bytes, ChannelError>>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for EncodePipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodePipe").finish_non_exhaustive()
    }
}

impl Stream for EncodePipe {
    type Item = Result<Bytes, ChannelError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().rx).poll_next(cx)
    }
}

impl Drop for EncodePipe {
    fn drop(&mut self) {
        self.task.abort();
    }
}
