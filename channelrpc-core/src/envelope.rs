//! Framed message envelope.
//!
//! A framed message on the wire is a sequence of frames:
//!
//! ```text
//! [flags:1][length:4][payload:length]
//! ```
//!
//! One `HEADERS` frame carrying the JSON-encoded [`MessageHeaders`], zero or
//! more `BODY` frames, then an empty `END` frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ChannelError;
use crate::message::MessageHeaders;

/// Frame flags.
pub mod frame_flags {
    /// Body chunk.
    pub const BODY: u8 = 0x00;
    /// JSON message headers. Always the first frame.
    pub const HEADERS: u8 = 0x01;
    /// End of message. Carries no payload.
    pub const END: u8 = 0x02;
}

/// Frame header size (flags + length).
pub const FRAME_HEADER_SIZE: usize = 5;

/// Kind of a decoded frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Headers,
    Body,
    End,
}

impl FrameKind {
    fn from_flags(flags: u8) -> Result<Self, ChannelError> {
        match flags {
            frame_flags::HEADERS => Ok(FrameKind::Headers),
            frame_flags::BODY => Ok(FrameKind::Body),
            frame_flags::END => Ok(FrameKind::End),
            other => Err(ChannelError::protocol(format!(
                "invalid frame flags: 0x{other:02x}"
            ))),
        }
    }
}

/// Append one frame to `dst`.
pub fn put_frame(dst: &mut BytesMut, flags: u8, payload: &[u8]) {
    dst.reserve(FRAME_HEADER_SIZE + payload.len());
    dst.put_u8(flags);
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
}

/// Encode a frame into a fresh buffer.
pub fn frame(flags: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    put_frame(&mut buf, flags, payload);
    buf.freeze()
}

/// Encode the headers frame for a message.
pub fn headers_frame(headers: &MessageHeaders) -> Result<Bytes, ChannelError> {
    let json = serde_json::to_vec(headers)
        .map_err(|e| ChannelError::protocol(format!("failed to encode message headers: {e}")))?;
    Ok(frame(frame_flags::HEADERS, &json))
}

/// Empty end-of-message frame.
pub fn end_frame() -> Bytes {
    frame(frame_flags::END, &[])
}

/// Parse a frame header from bytes.
///
/// Returns `(kind, length)`.
pub fn parse_frame_header(data: &[u8]) -> Result<(FrameKind, usize), ChannelError> {
    if data.len() < FRAME_HEADER_SIZE {
        return Err(ChannelError::protocol(format!(
            "incomplete frame header: expected {} bytes, got {}",
            FRAME_HEADER_SIZE,
            data.len()
        )));
    }
    let kind = FrameKind::from_flags(data[0])?;
    let length = u32::from_be_bytes([data[1], data[2], data[3], data[4]]) as usize;
    if kind == FrameKind::End && length != 0 {
        return Err(ChannelError::protocol("end frame must be empty"));
    }
    Ok((kind, length))
}

/// Split one complete frame off the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a whole frame. A declared
/// length above `max_frame` fails with `QuotaExceeded` before the payload
/// arrives.
pub fn try_split_frame(
    buf: &mut BytesMut,
    max_frame: usize,
) -> Result<Option<(FrameKind, Bytes)>, ChannelError> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }
    let (kind, length) = parse_frame_header(&buf[..FRAME_HEADER_SIZE])?;
    if length > max_frame {
        return Err(ChannelError::quota_exceeded(format!(
            "frame of {length} bytes exceeds the maximum of {max_frame} bytes"
        )));
    }
    if buf.len() < FRAME_HEADER_SIZE + length {
        return Ok(None);
    }
    buf.advance(FRAME_HEADER_SIZE);
    let payload = buf.split_to(length).freeze();
    tracing::trace!(?kind, length, "split frame");
    Ok(Some((kind, payload)))
}

/// Decode the payload of a headers frame.
pub fn parse_headers(payload: &[u8]) -> Result<MessageHeaders, ChannelError> {
    serde_json::from_slice(payload)
        .map_err(|e| ChannelError::protocol(format!("malformed message headers: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let frame = frame(frame_flags::BODY, b"hello");
        assert_eq!(frame[0], frame_flags::BODY);
        assert_eq!(
            u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]),
            5
        );
        assert_eq!(&frame[5..], b"hello");
    }

    #[test]
    fn test_parse_frame_header_incomplete() {
        assert!(parse_frame_header(&[0x00, 0x00, 0x00]).is_err());
    }

    #[test]
    fn test_unknown_flags_are_protocol_errors() {
        let err = parse_frame_header(&[0x7f, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, ChannelError::Protocol(_)));
    }

    #[test]
    fn test_try_split_frame_waits_for_payload() {
        let whole = frame(frame_flags::BODY, b"abcdef");
        let mut buf = BytesMut::from(&whole[..7]);
        assert!(try_split_frame(&mut buf, 64).unwrap().is_none());

        buf.extend_from_slice(&whole[7..]);
        let (kind, payload) = try_split_frame(&mut buf, 64).unwrap().unwrap();
        assert_eq!(kind, FrameKind::Body);
        assert_eq!(payload, Bytes::from_static(b"abcdef"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_try_split_frame_rejects_oversized_length() {
        let mut buf = BytesMut::from(&frame(frame_flags::BODY, &[0u8; 10])[..FRAME_HEADER_SIZE]);
        let err = try_split_frame(&mut buf, 9).unwrap_err();
        assert!(matches!(err, ChannelError::QuotaExceeded(_)));
    }

    #[test]
    fn test_headers_frame_round_trip() {
        let mut headers = MessageHeaders {
            action: Some("urn:a".into()),
            to: Some("http://svc".into()),
            ..Default::default()
        };
        headers.properties.insert("k".into(), "v".into());

        let mut buf = BytesMut::from(&headers_frame(&headers).unwrap()[..]);
        let (kind, payload) = try_split_frame(&mut buf, 1024).unwrap().unwrap();
        assert_eq!(kind, FrameKind::Headers);
        assert_eq!(parse_headers(&payload).unwrap(), headers);
    }

    #[test]
    fn test_end_frame_must_be_empty() {
        let err = parse_frame_header(&[frame_flags::END, 0, 0, 0, 1]).unwrap_err();
        assert!(matches!(err, ChannelError::Protocol(_)));
        assert!(parse_frame_header(&end_frame()).is_ok());
    }
}
