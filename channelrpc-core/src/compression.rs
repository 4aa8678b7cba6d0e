//! HTTP response content decompression.
//!
//! - [`ContentEncoding`]: `Content-Encoding` values the client understands
//! - [`Decompressor`]: incremental decoder applied to a response body before
//!   quota counting, so the quota bounds decoded bytes

use bytes::Bytes;

use crate::error::ChannelError;

#[cfg(any(feature = "compression-gzip", feature = "compression-deflate"))]
use std::io::Write;

/// Supported response content encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentEncoding {
    #[default]
    Identity,
    #[cfg(feature = "compression-gzip")]
    Gzip,
    #[cfg(feature = "compression-deflate")]
    Deflate,
}

impl ContentEncoding {
    /// Parse a `Content-Encoding` header value.
    /// Returns `None` for encodings this build cannot decode.
    pub fn from_header(value: Option<&str>) -> Option<Self> {
        let value = value.map(str::trim);
        match value {
            None | Some("") => Some(Self::Identity),
            Some(v) if v.eq_ignore_ascii_case("identity") => Some(Self::Identity),
            #[cfg(feature = "compression-gzip")]
            Some(v) if v.eq_ignore_ascii_case("gzip") || v.eq_ignore_ascii_case("x-gzip") => {
                Some(Self::Gzip)
            }
            #[cfg(feature = "compression-deflate")]
            Some(v) if v.eq_ignore_ascii_case("deflate") => Some(Self::Deflate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            #[cfg(feature = "compression-gzip")]
            Self::Gzip => "gzip",
            #[cfg(feature = "compression-deflate")]
            Self::Deflate => "deflate",
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Self::Identity)
    }

    /// `Accept-Encoding` value advertising every encoding compiled in.
    ///
    /// Returns `None` when only identity is available.
    pub fn accept_encoding() -> Option<&'static str> {
        match (
            cfg!(feature = "compression-gzip"),
            cfg!(feature = "compression-deflate"),
        ) {
            (true, true) => Some("gzip, deflate"),
            (true, false) => Some("gzip"),
            (false, true) => Some("deflate"),
            (false, false) => None,
        }
    }

    /// Create an incremental decoder for this encoding.
    pub fn decompressor(&self) -> Decompressor {
        let inner = match self {
            Self::Identity => Inner::Identity,
            #[cfg(feature = "compression-gzip")]
            Self::Gzip => Inner::Gzip(flate2::write::GzDecoder::new(Vec::new())),
            #[cfg(feature = "compression-deflate")]
            Self::Deflate => Inner::Deflate(flate2::write::ZlibDecoder::new(Vec::new())),
        };
        Decompressor { inner }
    }
}

enum Inner {
    Identity,
    #[cfg(feature = "compression-gzip")]
    Gzip(flate2::write::GzDecoder<Vec<u8>>),
    #[cfg(feature = "compression-deflate")]
    Deflate(flate2::write::ZlibDecoder<Vec<u8>>),
}

/// Incremental content decoder.
///
/// Feed compressed chunks with [`push`](Self::push); each call returns
/// whatever decoded output is available so far.
pub struct Decompressor {
    inner: Inner,
}

impl std::fmt::Debug for Decompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match &self.inner {
            Inner::Identity => "identity",
            #[cfg(feature = "compression-gzip")]
            Inner::Gzip(_) => "gzip",
            #[cfg(feature = "compression-deflate")]
            Inner::Deflate(_) => "deflate",
        };
        f.debug_tuple("Decompressor").field(&name).finish()
    }
}

#[cfg(any(feature = "compression-gzip", feature = "compression-deflate"))]
fn decode_error(e: std::io::Error) -> ChannelError {
    ChannelError::protocol(format!("failed to decompress response body: {e}"))
}

impl Decompressor {
    /// Decode one chunk of input.
    pub fn push(&mut self, chunk: Bytes) -> Result<Bytes, ChannelError> {
        match &mut self.inner {
            Inner::Identity => Ok(chunk),
            #[cfg(feature = "compression-gzip")]
            Inner::Gzip(decoder) => {
                decoder.write_all(&chunk).map_err(decode_error)?;
                Ok(Bytes::from(std::mem::take(decoder.get_mut())))
            }
            #[cfg(feature = "compression-deflate")]
            Inner::Deflate(decoder) => {
                decoder.write_all(&chunk).map_err(decode_error)?;
                Ok(Bytes::from(std::mem::take(decoder.get_mut())))
            }
        }
    }

    /// Flush any buffered output at end of input.
    pub fn finish(&mut self) -> Result<Bytes, ChannelError> {
        match &mut self.inner {
            Inner::Identity => Ok(Bytes::new()),
            #[cfg(feature = "compression-gzip")]
            Inner::Gzip(decoder) => {
                decoder.try_finish().map_err(decode_error)?;
                Ok(Bytes::from(std::mem::take(decoder.get_mut())))
            }
            #[cfg(feature = "compression-deflate")]
            Inner::Deflate(decoder) => {
                decoder.try_finish().map_err(decode_error)?;
                Ok(Bytes::from(std::mem::take(decoder.get_mut())))
            }
        }
    }
}
