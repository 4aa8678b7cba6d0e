//! WebSocket opening handshake (RFC 6455 §4) and its HTTP/2 variant
//! (RFC 8441).

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use channelrpc_core::ChannelError;
use http::header::{
    CONNECTION, HOST, HeaderMap, HeaderName, HeaderValue, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::{Method, Request, StatusCode, Uri, Version};
use http_body_util::Empty;
use sha1::{Digest, Sha1};

/// Magic value appended to the key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Headers the handshake owns; caller-supplied copies are dropped.
const HANDSHAKE_HEADERS: [HeaderName; 6] = [
    HOST,
    CONNECTION,
    UPGRADE,
    SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_VERSION,
    SEC_WEBSOCKET_PROTOCOL,
];

/// A fresh `Sec-WebSocket-Key`: 16 random bytes, base64-encoded.
pub fn generate_key() -> String {
    let random_bytes: [u8; 16] = rand::random();
    STANDARD.encode(random_bytes)
}

/// `base64(SHA-1(key ++ GUID))`.
pub fn expected_accept(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(sha.finalize())
}

fn handshake_error(message: impl Into<String>) -> ChannelError {
    ChannelError::Handshake(message.into())
}

fn invalid_header(name: &str, err: impl std::fmt::Display) -> ChannelError {
    handshake_error(format!("cannot encode {name} header: {err}"))
}

fn host_header(uri: &Uri) -> Result<HeaderValue, ChannelError> {
    let authority = uri
        .authority()
        .ok_or_else(|| handshake_error(format!("{uri} has no authority")))?;
    HeaderValue::from_str(authority.as_str()).map_err(|e| invalid_header("host", e))
}

fn protocol_header(subprotocols: &[String]) -> Result<Option<HeaderValue>, ChannelError> {
    if subprotocols.is_empty() {
        return Ok(None);
    }
    HeaderValue::from_str(&subprotocols.join(", "))
        .map(Some)
        .map_err(|e| invalid_header("sec-websocket-protocol", e))
}

fn copy_extra(headers: &mut HeaderMap, extra: &HeaderMap) {
    for (name, value) in extra {
        if !HANDSHAKE_HEADERS.contains(name) {
            headers.append(name.clone(), value.clone());
        }
    }
}

/// HTTP/1.1 `GET` upgrade request for `uri` (scheme `http`/`https`).
pub fn build_upgrade_request(
    uri: &Uri,
    key: &str,
    subprotocols: &[String],
    extra: &HeaderMap,
) -> Result<Request<Empty<Bytes>>, ChannelError> {
    let mut request = Request::new(Empty::new());
    *request.method_mut() = Method::GET;
    *request.uri_mut() = uri.clone();
    *request.version_mut() = Version::HTTP_11;

    let headers = request.headers_mut();
    copy_extra(headers, extra);
    headers.insert(HOST, host_header(uri)?);
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
    headers.insert(
        SEC_WEBSOCKET_KEY,
        HeaderValue::from_str(key).map_err(|e| invalid_header("sec-websocket-key", e))?,
    );
    if let Some(value) = protocol_header(subprotocols)? {
        headers.insert(SEC_WEBSOCKET_PROTOCOL, value);
    }
    Ok(request)
}

/// HTTP/2 extended `CONNECT` request (`:protocol = websocket`).
pub fn build_extended_connect_request(
    uri: &Uri,
    subprotocols: &[String],
    extra: &HeaderMap,
) -> Result<Request<Empty<Bytes>>, ChannelError> {
    let mut request = Request::new(Empty::new());
    *request.method_mut() = Method::CONNECT;
    *request.uri_mut() = uri.clone();
    *request.version_mut() = Version::HTTP_2;
    request
        .extensions_mut()
        .insert(hyper::ext::Protocol::from_static("websocket"));

    let headers = request.headers_mut();
    copy_extra(headers, extra);
    headers.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
    if let Some(value) = protocol_header(subprotocols)? {
        headers.insert(SEC_WEBSOCKET_PROTOCOL, value);
    }
    Ok(request)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn require_header(
    headers: &HeaderMap,
    name: &HeaderName,
    expected: &str,
) -> Result<(), ChannelError> {
    match header_str(headers, name) {
        Some(actual) if actual.eq_ignore_ascii_case(expected) => Ok(()),
        Some(actual) => Err(handshake_error(format!(
            "{name} header is {actual:?}, expected {expected:?}"
        ))),
        None => Err(handshake_error(format!("{name} header is missing"))),
    }
}

/// The subprotocol selected by the server, if it is one we offered.
fn selected_subprotocol(
    headers: &HeaderMap,
    offered: &[String],
) -> Result<Option<String>, ChannelError> {
    let Some(selected) = header_str(headers, &SEC_WEBSOCKET_PROTOCOL) else {
        return Ok(None);
    };
    if offered.is_empty() {
        return Err(handshake_error(format!(
            "server selected subprotocol {selected:?} but none was offered"
        )));
    }
    offered
        .iter()
        .find(|p| p.eq_ignore_ascii_case(selected))
        .map(|p| Some(p.clone()))
        .ok_or_else(|| {
            handshake_error(format!(
                "server selected subprotocol {selected:?}, which was not offered ({})",
                offered.join(", ")
            ))
        })
}

/// Validate an HTTP/1.1 upgrade response.
///
/// Returns the negotiated subprotocol.
pub fn validate_upgrade_response(
    status: StatusCode,
    headers: &HeaderMap,
    key: &str,
    offered: &[String],
) -> Result<Option<String>, ChannelError> {
    if status != StatusCode::SWITCHING_PROTOCOLS {
        return Err(handshake_error(format!(
            "server answered the upgrade with {status}, expected 101 Switching Protocols"
        )));
    }
    require_header(headers, &CONNECTION, "Upgrade")?;
    require_header(headers, &UPGRADE, "websocket")?;
    match header_str(headers, &SEC_WEBSOCKET_ACCEPT) {
        Some(accept) if accept == expected_accept(key) => {}
        Some(accept) => {
            return Err(handshake_error(format!(
                "sec-websocket-accept {accept:?} does not match the key"
            )));
        }
        None => return Err(handshake_error("sec-websocket-accept header is missing")),
    }
    selected_subprotocol(headers, offered)
}

/// Validate an extended `CONNECT` response.
pub fn validate_extended_connect_response(
    status: StatusCode,
    headers: &HeaderMap,
    offered: &[String],
) -> Result<Option<String>, ChannelError> {
    if !status.is_success() {
        return Err(handshake_error(format!(
            "server answered extended CONNECT with {status}"
        )));
    }
    selected_subprotocol(headers, offered)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RFC_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    /// Validate a 101 answer to a request made with [`RFC_KEY`].
    fn switched(headers: &HeaderMap, offered: &[String]) -> Result<Option<String>, ChannelError> {
        validate_upgrade_response(StatusCode::SWITCHING_PROTOCOLS, headers, RFC_KEY, offered)
    }

    fn response(key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(UPGRADE, HeaderValue::from_static("WebSocket"));
        headers.insert(
            SEC_WEBSOCKET_ACCEPT,
            HeaderValue::from_str(&expected_accept(key)).unwrap(),
        );
        headers
    }

    #[test]
    fn test_accept_matches_rfc_example() {
        assert_eq!(expected_accept(RFC_KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_generated_keys_are_16_bytes() {
        let key = generate_key();
        assert_eq!(STANDARD.decode(&key).unwrap().len(), 16);
        assert_ne!(key, generate_key());
    }

    #[test]
    fn test_valid_response_is_accepted() {
        let negotiated = switched(&response(RFC_KEY), &[]).unwrap();
        assert_eq!(negotiated, None);
    }

    #[test]
    fn test_wrong_accept_is_rejected() {
        let mut headers = response(RFC_KEY);
        headers.insert(SEC_WEBSOCKET_ACCEPT, HeaderValue::from_static("bm9wZQ=="));
        let err = switched(&headers, &[]).unwrap_err();
        assert!(matches!(err, ChannelError::Handshake(_)), "{err:?}");
    }

    #[test]
    fn test_status_and_headers_are_checked() {
        let headers = response(RFC_KEY);
        let err = validate_upgrade_response(StatusCode::OK, &headers, RFC_KEY, &[]).unwrap_err();
        assert!(matches!(err, ChannelError::Handshake(_)));

        let mut headers = response(RFC_KEY);
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        let err = switched(&headers, &[]).unwrap_err();
        assert!(err.to_string().contains("connection"), "{err}");

        let mut headers = response(RFC_KEY);
        headers.remove(UPGRADE);
        assert!(switched(&headers, &[]).is_err());
    }

    #[test]
    fn test_subprotocol_selection_rules() {
        let offered = vec!["chat".to_string(), "superchat".to_string()];

        let mut headers = response(RFC_KEY);
        headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("SuperChat"));
        let negotiated = switched(&headers, &offered).unwrap();
        assert_eq!(negotiated.as_deref(), Some("superchat"));

        headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("other"));
        assert!(switched(&headers, &offered).is_err());

        // Selecting one when none were offered is fatal.
        headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("chat"));
        assert!(switched(&headers, &[]).is_err());
    }

    #[test]
    fn test_upgrade_request_headers() {
        let uri: Uri = "http://svc.example:8080/session".parse().unwrap();
        let mut extra = HeaderMap::new();
        extra.insert("x-tenant", HeaderValue::from_static("blue"));
        extra.insert(UPGRADE, HeaderValue::from_static("h2c"));

        let offered = ["chat".to_string(), "v2".to_string()];
        let request = build_upgrade_request(&uri, RFC_KEY, &offered, &extra).unwrap();
        let headers = request.headers();
        assert_eq!(request.method(), Method::GET);
        assert_eq!(headers[HOST], "svc.example:8080");
        assert_eq!(headers[UPGRADE], "websocket");
        assert_eq!(headers[SEC_WEBSOCKET_KEY], RFC_KEY);
        assert_eq!(headers[SEC_WEBSOCKET_PROTOCOL], "chat, v2");
        assert_eq!(headers["x-tenant"], "blue");
    }

    #[test]
    fn test_extended_connect_carries_protocol() {
        let uri: Uri = "https://svc/session".parse().unwrap();
        let request = build_extended_connect_request(&uri, &[], &HeaderMap::new()).unwrap();
        assert_eq!(request.method(), Method::CONNECT);
        assert_eq!(
            request.extensions().get::<hyper::ext::Protocol>().map(|p| p.as_str()),
            Some("websocket")
        );
        assert!(validate_extended_connect_response(StatusCode::OK, &HeaderMap::new(), &[]).is_ok());
        let rejected =
            validate_extended_connect_response(StatusCode::BAD_REQUEST, &HeaderMap::new(), &[]);
        assert!(rejected.is_err());
    }
}
