//! HTTP request classification and WebSocket opening handshake.
//!
//! A freshly accepted socket speaks plain HTTP until proven otherwise. This
//! module scans the connection's receive buffer, classifies the request as a
//! WebSocket upgrade, a `POST /command` bridge request, or garbage, and
//! builds the wire responses for each case.
//!
//! Header names are normalized to ASCII lowercase during parsing, so lookups
//! are exact regardless of the casing a peer sends.
//!
//! # Accept token
//!
//! Per RFC 6455 §4.2.2 the server proves it understood the upgrade by
//! answering with `base64(SHA1(key + GUID))`. SHA-1 appears nowhere else in
//! the protocol, so it is implemented locally rather than pulled in as a
//! dependency.

// ============================================================================
// Imports
// ============================================================================

use base64::Engine;
use base64::engine::general_purpose::STANDARD as Base64Standard;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Fixed GUID appended to the client key before hashing (RFC 6455).
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Marks the end of the HTTP request head.
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Request line prefix selecting the HTTP bridge path.
const COMMAND_REQUEST_PREFIX: &str = "POST /command ";

// ============================================================================
// HandshakeOutcome
// ============================================================================

/// Classification of the buffered bytes on a not-yet-promoted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// The buffer does not yet hold a complete request. Nothing consumed.
    NeedMoreData,
    /// A WebSocket upgrade request.
    Upgrade {
        /// Value of the `Sec-WebSocket-Key` header.
        key: String,
        /// Bytes to drop from the buffer (the full request head).
        consumed: usize,
    },
    /// A `POST /command` bridge request with a complete body.
    Command {
        /// Raw request body bytes (expected to be JSON).
        body: Vec<u8>,
        /// Bytes to drop from the buffer (head + body).
        consumed: usize,
    },
}

// ============================================================================
// Classification
// ============================================================================

/// Classifies the front of `buf` as upgrade, bridge command, or neither.
///
/// Returns [`HandshakeOutcome::NeedMoreData`] until the request head (and,
/// for bridge requests, the full `Content-Length` body) is buffered,
/// consuming nothing in that case.
///
/// # Errors
///
/// Returns [`Error::Handshake`] for requests that are neither a WebSocket
/// upgrade nor a well-formed `POST /command`; the caller answers `400` and
/// closes.
pub fn classify_request(buf: &[u8]) -> Result<HandshakeOutcome> {
    let Some(head_end) = find_header_end(buf) else {
        return Ok(HandshakeOutcome::NeedMoreData);
    };

    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| Error::handshake("request head is not valid UTF-8"))?;
    let (request_line, headers) = parse_head(head)?;

    if let Some(key) = headers.get("sec-websocket-key") {
        return Ok(HandshakeOutcome::Upgrade {
            key: key.clone(),
            consumed: head_end,
        });
    }

    if request_line.starts_with(COMMAND_REQUEST_PREFIX) {
        let content_length: usize = match headers.get("content-length") {
            Some(value) => value
                .parse()
                .map_err(|_| Error::handshake(format!("bad Content-Length: {value}")))?,
            None => 0,
        };

        let total = head_end + content_length;
        if buf.len() < total {
            return Ok(HandshakeOutcome::NeedMoreData);
        }

        return Ok(HandshakeOutcome::Command {
            body: buf[head_end..total].to_vec(),
            consumed: total,
        });
    }

    Err(Error::handshake(format!(
        "unsupported request: {request_line}"
    )))
}

/// Finds the offset just past the `\r\n\r\n` terminating the request head.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_END.len())
        .position(|window| window == HEADER_END)
        .map(|pos| pos + HEADER_END.len())
}

/// Splits the request head into its request line and a lowercased header map.
fn parse_head(head: &str) -> Result<(&str, FxHashMap<String, String>)> {
    let mut lines = head.split("\r\n");
    let request_line = lines
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| Error::handshake("empty request head"))?;

    let mut headers = FxHashMap::default();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(Error::handshake(format!("malformed header line: {line}")));
        };
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    Ok((request_line, headers))
}

// ============================================================================
// Accept Token
// ============================================================================

/// Computes the `Sec-WebSocket-Accept` value for a client key.
#[must_use]
pub fn compute_accept(key: &str) -> String {
    let mut input = String::with_capacity(key.len() + WEBSOCKET_GUID.len());
    input.push_str(key.trim());
    input.push_str(WEBSOCKET_GUID);
    Base64Standard.encode(sha1_digest(input.as_bytes()))
}

/// SHA-1 digest (FIPS 180-1), used only for the handshake accept token.
fn sha1_digest(data: &[u8]) -> [u8; 20] {
    let mut h: [u32; 5] = [0x67452301, 0xEFCDAB89, 0x98BADCFE, 0x10325476, 0xC3D2E1F0];

    let bit_len = (data.len() as u64) * 8;
    let mut msg = data.to_vec();
    msg.push(0x80);
    while msg.len() % 64 != 56 {
        msg.push(0x00);
    }
    msg.extend_from_slice(&bit_len.to_be_bytes());

    for chunk in msg.chunks(64) {
        let mut w = [0u32; 80];
        for i in 0..16 {
            w[i] = u32::from_be_bytes([
                chunk[i * 4],
                chunk[i * 4 + 1],
                chunk[i * 4 + 2],
                chunk[i * 4 + 3],
            ]);
        }
        for i in 16..80 {
            w[i] = (w[i - 3] ^ w[i - 8] ^ w[i - 14] ^ w[i - 16]).rotate_left(1);
        }

        let (mut a, mut b, mut c, mut d, mut e) = (h[0], h[1], h[2], h[3], h[4]);

        for (i, &word) in w.iter().enumerate() {
            let (f, k) = match i {
                0..=19 => ((b & c) | ((!b) & d), 0x5A82_7999u32),
                20..=39 => (b ^ c ^ d, 0x6ED9_EBA1u32),
                40..=59 => ((b & c) | (b & d) | (c & d), 0x8F1B_BCDCu32),
                _ => (b ^ c ^ d, 0xCA62_C1D6u32),
            };
            let temp = a
                .rotate_left(5)
                .wrapping_add(f)
                .wrapping_add(e)
                .wrapping_add(k)
                .wrapping_add(word);
            e = d;
            d = c;
            c = b.rotate_left(30);
            b = a;
            a = temp;
        }

        h[0] = h[0].wrapping_add(a);
        h[1] = h[1].wrapping_add(b);
        h[2] = h[2].wrapping_add(c);
        h[3] = h[3].wrapping_add(d);
        h[4] = h[4].wrapping_add(e);
    }

    let mut digest = [0u8; 20];
    for (i, &word) in h.iter().enumerate() {
        digest[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
    }
    digest
}

// ============================================================================
// HttpStatus
// ============================================================================

/// HTTP statuses the gateway answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpStatus {
    /// 200: correlated reply delivered.
    Ok,
    /// 400: malformed or unactionable request.
    BadRequest,
    /// 503: no browser peer connected.
    ServiceUnavailable,
}

impl HttpStatus {
    /// Numeric status code.
    #[inline]
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::BadRequest => 400,
            Self::ServiceUnavailable => 503,
        }
    }

    /// Reason phrase for the status line.
    #[inline]
    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::BadRequest => "Bad Request",
            Self::ServiceUnavailable => "Service Unavailable",
        }
    }
}

// ============================================================================
// Response Builders
// ============================================================================

/// Builds the `101 Switching Protocols` reply completing the upgrade.
#[must_use]
pub fn switching_protocols(accept: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    )
    .into_bytes()
}

/// Builds a JSON HTTP response with `Connection: close` semantics.
#[must_use]
pub fn json_response(status: HttpStatus, body: &serde_json::Value) -> Vec<u8> {
    let body = body.to_string();
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{}",
        status.code(),
        status.reason(),
        body.len(),
        body,
    )
    .into_bytes()
}

/// Builds the standard `{"error": ...}` JSON error response.
#[must_use]
pub fn error_response(status: HttpStatus, message: &str) -> Vec<u8> {
    json_response(status, &serde_json::json!({ "error": message }))
}

// ============================================================================
// Tests
// ============================================================================
