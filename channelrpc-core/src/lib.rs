//! Core types for channelrpc transports.
//!
//! This crate provides the pieces shared by every transport: the message
//! model, the error taxonomy, and the wire codec.
//!
//! ## Modules
//!
//! - [`error`]: Error kinds and the channel error type
//! - [`message`]: Messages with a read-once body
//! - [`buffer`]: Bounded buffer pool
//! - [`mru`]: Fixed-capacity MRU cache
//! - [`envelope`]: Frame layout
//! - [`codec`]: Buffered and streamed message encoding
//! - [`compression`]: HTTP response decompression

pub mod buffer;
pub mod codec;
pub mod compression;
pub mod envelope;
pub mod error;
pub mod message;
pub mod mru;

pub use buffer::{BufferPool, PooledBuffer};
pub use codec::{
    EncodePipe, FRAMED_CONTENT_TYPE, FrameReader, JSON_CONTENT_TYPE, MessageCodec,
    MessageEncoding, QuotaLimiter, read_buffered,
};
pub use compression::{ContentEncoding, Decompressor};
pub use error::{ChannelError, ErrorKind, MAX_EXCERPT_BYTES, body_excerpt};
pub use message::{Body, BodyStream, Message, MessageHeaders};
pub use mru::{MruCache, SharedMruCache};
