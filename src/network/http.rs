//! # Minimal HTTP/1.1 Codec
//!
//! Just enough HTTP for the portal and the status page: one request per
//! connection, `Content-Length` bodies only, `Connection: close` always.
//! Clients are served one at a time from the control loop.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::error::HttpError;

/// Request line plus headers
pub const MAX_HEAD_BYTES: usize = 8 * 1024;

/// Request body
pub const MAX_BODY_BYTES: usize = 16 * 1024;

/// Time a client gets to deliver its whole request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// A parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    /// Path without the query string
    pub path: String,
    pub query: Option<String>,
    /// Header names are lower-cased
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Build a request without going through the wire format.
    pub fn new(method: &str, target: &str, body: &[u8]) -> Self {
        let (path, query) = split_target(target);
        Self {
            method: method.to_ascii_uppercase(),
            path,
            query,
            headers: Vec::new(),
            body: body.to_vec(),
        }
    }

    /// First value of header `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_get(&self) -> bool {
        self.method == "GET" || self.method == "HEAD"
    }

    pub fn is_post(&self) -> bool {
        self.method == "POST"
    }
}

/// A response ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn html(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: "text/html; charset=utf-8",
            body: body.into().into_bytes(),
        }
    }

    pub fn json<T: serde::Serialize>(status: u16, value: &T) -> Self {
        // Serializing our own plain structs cannot fail; fall back to null anyway
        let body = serde_json::to_vec(value).unwrap_or_else(|_| b"null".to_vec());
        Self {
            status,
            content_type: "application/json",
            body,
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.into().into_bytes(),
        }
    }

    pub fn not_found() -> Self {
        Self::text(404, "Not Found")
    }

    /// Serialize status line, headers and body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
            self.status,
            reason_phrase(self.status),
            self.content_type,
            self.body.len()
        );
        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        302 => "Found",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn split_target(target: &str) -> (String, Option<String>) {
    match target.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (target.to_string(), None),
    }
}

/// Parse the request line and headers (without the blank terminator line).
pub fn parse_head(head: &str) -> Result<HttpRequest, HttpError> {
    let mut lines = head.split("\r\n");
    let request_line = lines
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| HttpError::Malformed("empty request".to_string()))?;

    let mut parts = request_line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => (m, t, v),
        _ => return Err(HttpError::Malformed(format!("bad request line {:?}", request_line))),
    };
    if !version.starts_with("HTTP/1.") || !target.starts_with('/') {
        return Err(HttpError::Malformed(format!("bad request line {:?}", request_line)));
    }

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HttpError::Malformed(format!("bad header {:?}", line)))?;
        headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
    }

    let mut request = HttpRequest::new(method, target, &[]);
    request.headers = headers;
    Ok(request)
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|window| window == HEAD_TERMINATOR)
}

/// Read one request from `stream`, bounded by [`REQUEST_TIMEOUT`].
///
/// # Errors
///
/// Returns error if:
/// - The client closes or stalls before the request is complete
/// - The head or the declared body exceeds its size limit
/// - The request line, a header, or `Content-Length` is malformed
pub async fn read_request<S>(stream: &mut S) -> Result<HttpRequest, HttpError>
where
    S: AsyncRead + Unpin,
{
    tokio::time::timeout(REQUEST_TIMEOUT, read_request_inner(stream))
        .await
        .map_err(|_| HttpError::Timeout)?
}

async fn read_request_inner<S>(stream: &mut S) -> Result<HttpRequest, HttpError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    let head_end = loop {
        if let Some(pos) = find_terminator(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(HttpError::TooLarge(MAX_HEAD_BYTES));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HttpError::Malformed("connection closed mid-request".to_string()));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| HttpError::Malformed("request head is not UTF-8".to_string()))?;
    let mut request = parse_head(head)?;

    let content_length = match request.header("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| HttpError::Malformed(format!("bad Content-Length {:?}", value)))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(HttpError::TooLarge(MAX_BODY_BYTES));
    }

    let mut body = buf.split_off(head_end + HEAD_TERMINATOR.len());
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HttpError::Malformed("connection closed mid-body".to_string()));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);
    request.body = body;

    Ok(request)
}

/// Write `response` and flush.
pub async fn write_response<S>(stream: &mut S, response: &HttpResponse) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&response.to_bytes()).await?;
    stream.flush().await
}

/// Response for a request that could not be read.
pub fn error_response(err: &HttpError) -> Option<HttpResponse> {
    match err {
        HttpError::TooLarge(_) => Some(HttpResponse::text(413, "Payload Too Large")),
        HttpError::Malformed(_) => Some(HttpResponse::text(400, "Bad Request")),
        HttpError::Io(_) | HttpError::Timeout => None,
    }
}

/// An accepted client connection.
#[derive(Debug)]
pub struct HttpConnection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl HttpConnection {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn read_request(&mut self) -> Result<HttpRequest, HttpError> {
        read_request(&mut self.stream).await
    }

    pub async fn respond(mut self, response: &HttpResponse) {
        if let Err(e) = write_response(&mut self.stream, response).await {
            debug!(peer = %self.peer, error = %e, "Client went away before the response");
        }
        let _ = self.stream.shutdown().await;
    }
}

/// Listening socket polled from the control loop.
#[derive(Debug)]
pub struct HttpServer {
    listener: TcpListener,
}

impl HttpServer {
    /// Bind on all interfaces at `port`.
    pub async fn bind(port: u16) -> std::io::Result<Self> {
        let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).await?;
        info!(port, "HTTP server listening");
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept a client that is already waiting, without waiting for one.
    pub async fn try_accept(&self) -> Option<HttpConnection> {
        tokio::select! {
            biased;
            accepted = self.listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "HTTP client connected");
                    Some(HttpConnection { stream, peer })
                }
                Err(e) => {
                    debug!(error = %e, "HTTP accept failed");
                    None
                }
            },
            _ = tokio::task::yield_now() => None,
        }
    }
}
