//! The HTTP/1.1 Upgrade exchange, per
//! [RFC 6455 Section 4](https://datatracker.ietf.org/doc/html/rfc6455#section-4).
//!
//! Both sides buffer transport bytes until the `CRLF CRLF` terminator
//! arrives, parse the HTTP message with `httparse`, and validate the headers
//! the Upgrade requires. Bytes past the terminator are left in the buffer and
//! seed the frame codec, so frames the peer pipelines right behind the
//! handshake are never lost.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};
use url::Url;

use crate::{compression::DeflateExtension, Result, WsError};

/// Fixed GUID every accept key derivation appends (RFC 6455 §1.3).
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the Upgrade request/response size.
pub(crate) const MAX_HANDSHAKE_SIZE: usize = 16 * 1024;

const MAX_HEADERS: usize = 32;

/// Derives the `Sec-WebSocket-Accept` value for a client key.
pub(crate) fn accept_key(key: &[u8]) -> String {
    let mut sha = Sha1::new();
    sha.update(key);
    sha.update(WS_GUID.as_bytes());
    BASE64.encode(sha.finalize())
}

/// Generates a fresh `Sec-WebSocket-Key`: 16 random bytes, base64-encoded.
pub(crate) fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64.encode(nonce)
}

/// The parsed Upgrade request of an accepted connection.
///
/// Surfaced to the application through the `on_request` callback and
/// [`ConnectionHandle::request`](crate::ConnectionHandle::request) so it can
/// inspect the path, query string and headers of the connection.
#[derive(Debug, Clone)]
pub struct Request {
    method: String,
    target: String,
    headers: Vec<(String, String)>,
}

impl Request {
    /// The HTTP method, normally `GET`.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The full request target, including any query string.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The path component of the request target.
    pub fn path(&self) -> &str {
        self.target
            .split_once('?')
            .map_or(self.target.as_str(), |(path, _)| path)
    }

    /// The query string, without the leading `?`.
    pub fn query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, query)| query)
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// All headers in arrival order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }
}

fn to_owned_headers(headers: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .take_while(|h| !h.name.is_empty())
        .map(|h| {
            (
                h.name.to_owned(),
                String::from_utf8_lossy(h.value).trim().to_owned(),
            )
        })
        .collect()
}

/// Tries to parse a complete Upgrade request out of `buf`.
///
/// Returns `Ok(None)` while the terminator has not arrived, and the parsed
/// request plus the number of consumed bytes once it has.
pub(crate) fn parse_request(buf: &[u8]) -> Result<Option<(Request, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => {
            let request = Request {
                method: req.method.unwrap_or("").to_owned(),
                target: req.path.unwrap_or("").to_owned(),
                headers: to_owned_headers(req.headers),
            };
            Ok(Some((request, consumed)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(_) => Err(WsError::BadHttpMessage),
    }
}

/// Checks the headers RFC 6455 requires of an Upgrade request and returns the
/// client's `Sec-WebSocket-Key`.
pub(crate) fn validate_request(request: &Request) -> Result<String> {
    if request.header("Host").is_none() {
        return Err(WsError::MissingHeader("Host"));
    }
    if request.header("Upgrade").is_none() {
        return Err(WsError::MissingHeader("Upgrade"));
    }
    if request.header("Connection").is_none() {
        return Err(WsError::MissingHeader("Connection"));
    }

    if request.header("Sec-WebSocket-Version") != Some("13") {
        return Err(WsError::InvalidVersion);
    }

    request
        .header("Sec-WebSocket-Key")
        .map(str::to_owned)
        .ok_or(WsError::MissingHeader("Sec-WebSocket-Key"))
}

/// Renders the `101 Switching Protocols` response.
///
/// Each header line carries a trailing space before its CRLF; the reference
/// peers emit and accept this quirk, and compliant parsers strip optional
/// whitespace around header values, so the bytes are kept identical for
/// interoperability.
pub(crate) fn build_response(accept: &str, extensions: Option<&DeflateExtension>) -> String {
    let mut response = String::with_capacity(192);
    response.push_str("HTTP/1.1 101 Switching Protocols\r\n");
    response.push_str("Upgrade: websocket \r\n");
    response.push_str("Connection: Upgrade \r\n");
    response.push_str(&format!("Sec-WebSocket-Accept: {accept} \r\n"));
    if let Some(extensions) = extensions {
        response.push_str(&format!("Sec-WebSocket-Extensions: {extensions}\r\n"));
    }
    response.push_str("\r\n");
    response
}

/// Renders the client's Upgrade request for `url`.
pub(crate) fn build_request(
    url: &Url,
    key: &str,
    extra_headers: &[(String, String)],
    offer: Option<&DeflateExtension>,
) -> Result<String> {
    let host = url.host_str().ok_or(WsError::MissingHost)?;
    let port = url.port_or_known_default().ok_or(WsError::MissingHost)?;
    let target = &url[url::Position::BeforePath..];

    let mut request = String::with_capacity(256);
    request.push_str(&format!("GET {target} HTTP/1.1\r\n"));
    request.push_str(&format!("Host: {host}:{port}\r\n"));
    request.push_str("Upgrade: websocket\r\n");
    request.push_str("Connection: Upgrade\r\n");
    request.push_str("Sec-WebSocket-Version: 13\r\n");
    request.push_str(&format!("Sec-WebSocket-Key: {key}\r\n"));
    if let Some(offer) = offer {
        request.push_str(&format!("Sec-WebSocket-Extensions: {offer}\r\n"));
    }
    for (name, value) in extra_headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    Ok(request)
}

/// The parsed Upgrade response seen by the client.
pub(crate) struct Response {
    code: u16,
    headers: Vec<(String, String)>,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Tries to parse a complete Upgrade response out of `buf`.
pub(crate) fn parse_response(buf: &[u8]) -> Result<Option<(Response, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);

    match resp.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => {
            let response = Response {
                code: resp.code.ok_or(WsError::BadHttpMessage)?,
                headers: to_owned_headers(resp.headers),
            };
            Ok(Some((response, consumed)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(_) => Err(WsError::BadHttpMessage),
    }
}

/// Verifies the server's Upgrade response against the key the client sent
/// and extracts the negotiated extension parameters.
pub(crate) fn verify_response(
    response: &Response,
    sent_key: &str,
) -> Result<Option<DeflateExtension>> {
    if response.code != 101 {
        return Err(WsError::InvalidStatusCode(response.code));
    }

    if !response
        .header("Upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
    {
        return Err(WsError::MissingHeader("Upgrade"));
    }

    if !response
        .header("Connection")
        .map(|v| v.eq_ignore_ascii_case("upgrade"))
        .unwrap_or(false)
    {
        return Err(WsError::MissingHeader("Connection"));
    }

    match response.header("Sec-WebSocket-Accept") {
        Some(got) if got == accept_key(sent_key.as_bytes()) => {}
        Some(_) => return Err(WsError::InvalidAcceptKey),
        None => return Err(WsError::MissingHeader("Sec-WebSocket-Accept")),
    }

    Ok(response
        .header("Sec-WebSocket-Extensions")
        .and_then(crate::compression::parse_offer))
}
