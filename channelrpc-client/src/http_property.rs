//! HTTP details carried in a message's extensions.
//!
//! A caller attaches an [`HttpRequestProperty`] to an outgoing message to
//! override the method or selected headers; the request channel attaches an
//! [`HttpResponseProperty`] to every reply.

use http::{HeaderMap, Method, StatusCode};

/// Outbound overrides merged into the request built for a message.
///
/// Only these headers are honoured: `accept`, `connection`, `expect`,
/// `soapaction`, `referer`, `transfer-encoding`, `user-agent`,
/// `if-modified-since`, plus any non-reserved custom header. Reserved
/// headers (`host`, `content-length`, `content-type`, `authorization`, ...)
/// are ignored.
#[derive(Clone, Debug, Default)]
pub struct HttpRequestProperty {
    /// Defaults to `POST`.
    pub method: Option<Method>,
    pub headers: HeaderMap,
    /// Send no entity body even if the method allows one.
    pub suppress_entity_body: bool,
}

impl HttpRequestProperty {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn with_header(mut self, name: http::header::HeaderName, value: http::HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn suppress_entity_body(mut self, suppress: bool) -> Self {
        self.suppress_entity_body = suppress;
        self
    }
}

/// Status line and headers of the HTTP response a reply arrived in.
#[derive(Clone, Debug)]
pub struct HttpResponseProperty {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub headers: HeaderMap,
}
