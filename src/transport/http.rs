//! Minimal HTTP/1.1 request/response parsing over an already-accepted
//! TLS stream (C5). This crate never needs the generality of a full web
//! framework: five fixed routes, a small JSON body cap, and one upgrade
//! path. A hand-rolled parser also keeps the validated peer certificate
//! fingerprint available to every handler without fighting a framework's
//! connection abstraction for it.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CribCallError;

pub const MAX_BODY_LEN: usize = 64 * 1024;
const MAX_HEADER_LEN: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_upgrade(&self) -> bool {
        self.header("connection")
            .map(|v| v.to_ascii_lowercase().contains("upgrade"))
            .unwrap_or(false)
            && self
                .header("upgrade")
                .map(|v| v.eq_ignore_ascii_case("cribcall-control"))
                .unwrap_or(false)
    }

    /// Build a client request posting a JSON body.
    pub fn post_json(path: &str, body: Vec<u8>) -> Self {
        Self {
            method: "POST".into(),
            path: path.into(),
            headers: vec![("Content-Type".into(), "application/json".into())],
            body,
        }
    }

    /// Build a client `GET` request, optionally requesting the
    /// `/control/ws` upgrade (spec.md §6 "Connection: Upgrade").
    pub fn get(path: &str, upgrade: bool) -> Self {
        let mut headers = Vec::new();
        if upgrade {
            headers.push(("Connection".into(), "Upgrade".into()));
            headers.push(("Upgrade".into(), "cribcall-control".into()));
        }
        Self {
            method: "GET".into(),
            path: path.into(),
            headers,
            body: Vec::new(),
        }
    }

    /// Serialize as the wire form a server's [`read_request`] parses.
    /// Client-side counterpart to [`Response::to_bytes`].
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} HTTP/1.1\r\n", self.method, self.path).into_bytes();
        for (k, v) in &self.headers {
            out.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
        }
        if self.header("content-length").is_none() {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
    pub extra_headers: Vec<(String, String)>,
}

impl Response {
    pub fn json(status: u16, body: &[u8]) -> Self {
        Self {
            status,
            body: body.to_vec(),
            extra_headers: vec![("Content-Type".into(), "application/json".into())],
        }
    }

    pub fn error(err: &CribCallError) -> Self {
        let status = err.http_status();
        let payload = serde_json::json!({ "error": err.to_string(), "code": err.code() });
        Self::json(status, &serde_json::to_vec(&payload).unwrap_or_default())
    }

    pub fn upgrade() -> Self {
        Self {
            status: 101,
            body: Vec::new(),
            extra_headers: vec![
                ("Connection".into(), "Upgrade".into()),
                ("Upgrade".into(), "cribcall-control".into()),
            ],
        }
    }

    /// Serialize the status line, fixed headers (including the
    /// transport-wide `Cache-Control: no-store`, spec.md §6), and body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let reason = status_reason(self.status);
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, reason).into_bytes();
        out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        out.extend_from_slice(b"Cache-Control: no-store\r\n");
        for (k, v) in &self.extra_headers {
            out.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

fn status_reason(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        410 => "Gone",
        413 => "Payload Too Large",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}

/// Read one HTTP/1.1 request from `stream`: request line, headers
/// (bounded by [`MAX_HEADER_LEN`]), and a `Content-Length` body bounded by
/// [`MAX_BODY_LEN`]. Chunked transfer encoding is not supported — every
/// request body on this control plane is a single small JSON document.
pub async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Request, CribCallError> {
    let mut header_buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if header_buf.len() > MAX_HEADER_LEN {
            return Err(CribCallError::BadRequest("request headers too large".into()));
        }
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| CribCallError::ProtocolError(e.to_string()))?;
        if n == 0 {
            return Err(CribCallError::BadRequest("connection closed before headers completed".into()));
        }
        header_buf.push(byte[0]);
        if header_buf.ends_with(b"\r\n\r\n") {
            break;
        }
    }

    let header_text = String::from_utf8(header_buf)
        .map_err(|_| CribCallError::BadRequest("request headers are not valid UTF-8".into()))?;
    let mut lines = header_text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split(' ');
    let method = parts
        .next()
        .ok_or_else(|| CribCallError::BadRequest("missing request line".into()))?
        .to_string();
    let path = parts
        .next()
        .ok_or_else(|| CribCallError::BadRequest("missing request path".into()))?
        .to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(CribCallError::BadRequest(format!("malformed header line: {line}")));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);

    if content_length > MAX_BODY_LEN {
        return Err(CribCallError::BodyTooLarge);
    }

    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        stream
            .read_exact(&mut body)
            .await
            .map_err(|e| CribCallError::ProtocolError(e.to_string()))?;
    }

    Ok(Request { method, path, headers, body })
}

/// A parsed HTTP/1.1 response, read by the client half of the pairing
/// and control transports (spec.md §6).
#[derive(Debug, Clone)]
pub struct ClientResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ClientResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_upgrade(&self) -> bool {
        self.status == 101
    }

    /// Decode a JSON body, or surface the transport's own `{error, code}`
    /// body as a [`CribCallError::ProtocolError`] when the status isn't 2xx.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, CribCallError> {
        if !(200..300).contains(&self.status) {
            let detail = String::from_utf8_lossy(&self.body);
            return Err(CribCallError::ProtocolError(format!(
                "request failed with status {}: {detail}",
                self.status
            )));
        }
        serde_json::from_slice(&self.body)
            .map_err(|e| CribCallError::ProtocolError(format!("invalid response body: {e}")))
    }
}

/// Write a client request, the counterpart to [`read_request`].
pub async fn write_request<S: AsyncWrite + Unpin>(
    stream: &mut S,
    request: &Request,
) -> Result<(), CribCallError> {
    stream
        .write_all(&request.to_bytes())
        .await
        .map_err(|e| CribCallError::ProtocolError(e.to_string()))
}

/// Read one HTTP/1.1 response from `stream`, bounded the same way
/// [`read_request`] bounds an inbound request.
pub async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> Result<ClientResponse, CribCallError> {
    let mut header_buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if header_buf.len() > MAX_HEADER_LEN {
            return Err(CribCallError::ProtocolError("response headers too large".into()));
        }
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| CribCallError::ProtocolError(e.to_string()))?;
        if n == 0 {
            return Err(CribCallError::ProtocolError(
                "connection closed before response headers completed".into(),
            ));
        }
        header_buf.push(byte[0]);
        if header_buf.ends_with(b"\r\n\r\n") {
            break;
        }
    }

    let header_text = String::from_utf8(header_buf)
        .map_err(|_| CribCallError::ProtocolError("response headers are not valid UTF-8".into()))?;
    let mut lines = header_text.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| CribCallError::ProtocolError(format!("malformed status line: {status_line}")))?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(CribCallError::ProtocolError(format!("malformed header line: {line}")));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        stream
            .read_exact(&mut body)
            .await
            .map_err(|e| CribCallError::ProtocolError(e.to_string()))?;
    }

    Ok(ClientResponse { status, headers, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn parses_simple_get() {
        let raw = b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let mut cursor = Cursor::new(raw.to_vec());
        let req = read_request(&mut cursor).await.unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/health");
        assert_eq!(req.header("host"), Some("localhost"));
    }

    #[tokio::test]
    async fn parses_post_with_body() {
        let body = b"{\"delivery_token\":\"T1\"}";
        let raw = format!(
            "POST /noise/subscribe HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        let mut full = raw.into_bytes();
        full.extend_from_slice(body);
        let mut cursor = Cursor::new(full);
        let req = read_request(&mut cursor).await.unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.body, body);
    }

    #[tokio::test]
    async fn rejects_oversize_body() {
        let raw = format!(
            "POST /pair/init HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            MAX_BODY_LEN + 1
        );
        let mut cursor = Cursor::new(raw.into_bytes());
        let result = read_request(&mut cursor).await;
        assert!(matches!(result, Err(CribCallError::BodyTooLarge)));
    }

    #[test]
    fn upgrade_response_has_expected_headers() {
        let resp = Response::upgrade();
        let bytes = resp.to_bytes();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols"));
        assert!(text.contains("Cache-Control: no-store"));
        assert!(text.contains("Upgrade: cribcall-control"));
    }

    #[test]
    fn client_request_round_trips_through_server_parser() {
        let request = Request::post_json("/pair/init", b"{\"a\":1}".to_vec());
        let bytes = request.to_bytes();
        assert!(bytes.starts_with(b"POST /pair/init HTTP/1.1\r\n"));
        assert!(String::from_utf8_lossy(&bytes).contains("Content-Length: 7"));
    }

    #[tokio::test]
    async fn client_parses_server_written_response() {
        let resp = Response::json(200, b"{\"status\":\"ok\"}");
        let mut cursor = Cursor::new(resp.to_bytes());
        let parsed = read_response(&mut cursor).await.unwrap();
        assert_eq!(parsed.status, 200);
        assert_eq!(parsed.body, b"{\"status\":\"ok\"}");
    }

    #[tokio::test]
    async fn client_parses_upgrade_response() {
        let resp = Response::upgrade();
        let mut cursor = Cursor::new(resp.to_bytes());
        let parsed = read_response(&mut cursor).await.unwrap();
        assert!(parsed.is_upgrade());
        assert_eq!(parsed.header("upgrade"), Some("cribcall-control"));
    }

    #[tokio::test]
    async fn client_response_json_surfaces_error_status_as_protocol_error() {
        let resp = Response::error(&CribCallError::PairingExpired);
        let mut cursor = Cursor::new(resp.to_bytes());
        let parsed = read_response(&mut cursor).await.unwrap();
        assert_eq!(parsed.status, 410);
        let decoded: Result<serde_json::Value, _> = parsed.json();
        assert!(decoded.is_err());
    }
}
