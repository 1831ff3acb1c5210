//! Request handler - logs every HTTP request on a terminated stream
//!
//! The handler owns one connection after TLS termination (or straight from
//! accept in plaintext mode). It loops over requests until the client closes,
//! logging each one in full before writing the fixed acknowledgment.

use bytes::{Buf, BytesMut};
use chrono::Local;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

use super::http_parser::{
    check_request_prefix, leading_empty_lines, parse_request_head, BodyFraming, Headers,
    ParseError, RequestHead,
};
use super::response::AckResponse;
use crate::logger::{EventKind, LogEvent, SharedConnectionLogger};

pub const DEFAULT_MAX_HEADER_BYTES: usize = 32 * 1024;
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Bytes of unparseable input echoed into the log
const PREVIEW_BYTES: usize = 200;

/// Longest chunk-size or trailer line accepted in a chunked body
const MAX_CHUNK_LINE: usize = 4096;

const READ_CHUNK: usize = 8192;

/// Limits applied to every session
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    /// Idle time allowed between reads
    pub read_timeout: Duration,

    /// Largest request head accepted
    pub max_header_bytes: usize,

    /// Largest body captured into the log
    pub max_body_bytes: usize,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Everything logged about one request
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub timestamp: String,
    pub client: String,
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: Headers,

    /// Decoded body, or an `<error reading body: ..>` marker
    pub body: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_error: Option<String>,
}

impl RequestRecord {
    fn new(peer: SocketAddr, head: &RequestHead, body: &BodyRead) -> Self {
        let body_text = match (&body.error, &body.bytes) {
            (Some(e), _) => Some(format!("<error reading body: {}>", e)),
            (None, Some(bytes)) => Some(String::from_utf8_lossy(bytes).into_owned()),
            (None, None) => None,
        };

        Self {
            timestamp: Local::now().to_rfc3339(),
            client: peer.to_string(),
            method: head.method.to_string(),
            path: head.path.clone(),
            version: head.version.clone(),
            headers: head.headers.clone(),
            body: body_text,
            body_error: body.error.clone(),
        }
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Client closed, or the request asked not to keep the connection
    Closed,

    /// No new request arrived within the read timeout
    Idle,

    /// Bytes that could not be parsed as a request
    Malformed(String),

    /// Reading or writing the stream failed
    ReadError(String),
}

/// Result of serving one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub requests: usize,
    pub end: SessionEnd,
}

enum HeadRead {
    Head(RequestHead),
    Closed,
    Idle,
    Malformed(String),
    Failed(String),
}

#[derive(Debug, Default)]
struct BodyRead {
    bytes: Option<Vec<u8>>,
    error: Option<String>,
}

impl BodyRead {
    fn complete(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Some(bytes),
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            bytes: None,
            error: Some(error.into()),
        }
    }
}

/// Parses, logs and acknowledges HTTP requests
#[derive(Debug, Clone)]
pub struct RequestHandler {
    logger: SharedConnectionLogger,
    settings: HandlerSettings,
}

impl RequestHandler {
    pub fn new(logger: SharedConnectionLogger, settings: HandlerSettings) -> Self {
        Self { logger, settings }
    }

    pub fn settings(&self) -> &HandlerSettings {
        &self.settings
    }

    /// Serve requests on `stream` until it closes or fails
    pub async fn serve<S>(&self, mut stream: S, peer: SocketAddr) -> SessionSummary
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let mut requests = 0;

        let end = loop {
            let head = match self.read_head(&mut stream, &mut buf, peer).await {
                HeadRead::Head(head) => head,
                HeadRead::Closed => break SessionEnd::Closed,
                HeadRead::Idle => break SessionEnd::Idle,
                HeadRead::Malformed(reason) => break SessionEnd::Malformed(reason),
                HeadRead::Failed(e) => break SessionEnd::ReadError(e),
            };

            let body = self.read_body(&mut stream, &mut buf, &head).await;

            // The record goes out before any response byte does
            let record = RequestRecord::new(peer, &head, &body);
            self.logger
                .record(LogEvent::json(EventKind::HttpRequest, &record))
                .await;
            requests += 1;

            if let Some(e) = &body.error {
                self.logger
                    .log_peer(
                        EventKind::ReadError,
                        peer,
                        format!("{} {}: body read failed: {}", head.method, head.path, e),
                    )
                    .await;
            }

            let keep_alive = head.keep_alive() && body.error.is_none();
            let response = AckResponse::for_request(&head.method, &head.path);
            let encoded = response.encode(keep_alive);

            let written = async {
                stream.write_all(&encoded).await?;
                stream.flush().await
            }
            .await;

            if let Err(e) = written {
                self.logger
                    .log_peer(
                        EventKind::ReadError,
                        peer,
                        format!("Failed to send response: {}", e),
                    )
                    .await;
                break SessionEnd::ReadError(e.to_string());
            }

            self.logger
                .log_peer(
                    EventKind::HttpAccess,
                    peer,
                    format!(
                        "\"{} {} {}\" {} {}",
                        head.method,
                        head.path,
                        head.version,
                        response.status,
                        response.body.len()
                    ),
                )
                .await;

            if let Some(e) = body.error {
                break SessionEnd::ReadError(e);
            }
            if !keep_alive {
                break SessionEnd::Closed;
            }
        };

        // Best effort close_notify / FIN
        let _ = stream.shutdown().await;

        debug!(peer = %peer, requests = requests, end = ?end, "Session finished");
        SessionSummary { requests, end }
    }

    async fn read_head<S>(&self, stream: &mut S, buf: &mut BytesMut, peer: SocketAddr) -> HeadRead
    where
        S: AsyncRead + Unpin,
    {
        loop {
            let blank = leading_empty_lines(buf);
            if blank > 0 {
                buf.advance(blank);
            }

            if !buf.is_empty() {
                match parse_request_head(buf) {
                    Ok((head, consumed)) => {
                        buf.advance(consumed);
                        return HeadRead::Head(head);
                    }
                    Err(ParseError::Incomplete) => {
                        if let Err(e) = check_request_prefix(buf) {
                            return self.malformed(peer, buf, e.to_string()).await;
                        }
                        if buf.len() >= self.settings.max_header_bytes {
                            let e = ParseError::HeadersTooLarge(self.settings.max_header_bytes);
                            return self.malformed(peer, buf, e.to_string()).await;
                        }
                    }
                    Err(e) => return self.malformed(peer, buf, e.to_string()).await,
                }
            }

            buf.reserve(READ_CHUNK);
            match timeout(self.settings.read_timeout, stream.read_buf(buf)).await {
                Err(_) if buf.is_empty() => {
                    debug!(peer = %peer, "Connection idle, closing");
                    return HeadRead::Idle;
                }
                Err(_) => {
                    let reason = format!(
                        "Timed out after {}s waiting for request head",
                        self.settings.read_timeout.as_secs()
                    );
                    return self.malformed(peer, buf, reason).await;
                }
                Ok(Ok(0)) if buf.is_empty() => return HeadRead::Closed,
                Ok(Ok(0)) => {
                    return self
                        .malformed(peer, buf, "Connection closed mid-request".to_string())
                        .await;
                }
                Ok(Ok(_)) => {}
                // Peers that drop TCP without close_notify between requests
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof && buf.is_empty() => {
                    return HeadRead::Closed;
                }
                Ok(Err(e)) => {
                    self.logger
                        .log_peer(EventKind::ReadError, peer, e.to_string())
                        .await;
                    return HeadRead::Failed(e.to_string());
                }
            }
        }
    }

    /// Log unparseable input with a preview of what arrived
    async fn malformed(&self, peer: SocketAddr, buf: &mut BytesMut, reason: String) -> HeadRead {
        let preview = buf[..buf.len().min(PREVIEW_BYTES)].escape_ascii().to_string();
        self.logger
            .log_peer(
                EventKind::RequestError,
                peer,
                format!(
                    "{}; received {} bytes: b\"{}\"",
                    reason,
                    buf.len(),
                    preview
                ),
            )
            .await;
        buf.clear();
        HeadRead::Malformed(reason)
    }

    async fn read_body<S>(&self, stream: &mut S, buf: &mut BytesMut, head: &RequestHead) -> BodyRead
    where
        S: AsyncRead + Unpin,
    {
        let result = match head.body_framing() {
            Err(e) => Err(e.to_string()),
            Ok(BodyFraming::None) => return BodyRead::default(),
            Ok(BodyFraming::Length(len)) => self.read_sized_body(stream, buf, len).await,
            Ok(BodyFraming::Chunked) => self.read_chunked_body(stream, buf).await,
        };

        match result {
            Ok(bytes) => BodyRead::complete(bytes),
            Err(e) => {
                // Framing is lost; the connection closes after the response
                buf.clear();
                BodyRead::failed(e)
            }
        }
    }

    async fn read_sized_body<S>(
        &self,
        stream: &mut S,
        buf: &mut BytesMut,
        len: usize,
    ) -> Result<Vec<u8>, String>
    where
        S: AsyncRead + Unpin,
    {
        if len > self.settings.max_body_bytes {
            return Err(format!(
                "declared length {} exceeds capture limit of {} bytes",
                len, self.settings.max_body_bytes
            ));
        }

        while buf.len() < len {
            self.fill(stream, buf)
                .await
                .map_err(|e| format!("{} after {} of {} bytes", e, buf.len(), len))?;
        }

        Ok(buf.split_to(len).to_vec())
    }

    async fn read_chunked_body<S>(
        &self,
        stream: &mut S,
        buf: &mut BytesMut,
    ) -> Result<Vec<u8>, String>
    where
        S: AsyncRead + Unpin,
    {
        let mut body = Vec::new();

        loop {
            let size_line = self.read_line(stream, buf).await?;
            let size_field = size_line.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_field, 16)
                .map_err(|_| format!("invalid chunk size '{}'", size_field))?;

            if size == 0 {
                // Trailer section ends with an empty line
                while !self.read_line(stream, buf).await?.is_empty() {}
                return Ok(body);
            }

            // Chunk data plus its CRLF must be addressable
            let needed = size
                .checked_add(2)
                .ok_or_else(|| format!("chunk size '{}' too large", size_field))?;

            if body.len().saturating_add(size) > self.settings.max_body_bytes {
                return Err(format!(
                    "chunked body exceeds capture limit of {} bytes",
                    self.settings.max_body_bytes
                ));
            }

            while buf.len() < needed {
                self.fill(stream, buf).await.map_err(|e| {
                    format!("{} after {} bytes of chunked body", e, body.len() + buf.len())
                })?;
            }
            body.extend_from_slice(&buf[..size]);
            if &buf[size..needed] != b"\r\n" {
                return Err("chunk not terminated by CRLF".to_string());
            }
            buf.advance(needed);
        }
    }

    /// Read one CRLF/LF terminated line, without the terminator
    async fn read_line<S>(&self, stream: &mut S, buf: &mut BytesMut) -> Result<String, String>
    where
        S: AsyncRead + Unpin,
    {
        loop {
            if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line = buf.split_to(pos + 1);
                let text = String::from_utf8_lossy(&line);
                return Ok(text.trim_end_matches(['\r', '\n']).to_string());
            }
            if buf.len() > MAX_CHUNK_LINE {
                return Err("chunk line too long".to_string());
            }
            self.fill(stream, buf).await?;
        }
    }

    /// Read at least one more byte into `buf`
    async fn fill<S>(&self, stream: &mut S, buf: &mut BytesMut) -> Result<(), String>
    where
        S: AsyncRead + Unpin,
    {
        buf.reserve(READ_CHUNK);
        match timeout(self.settings.read_timeout, stream.read_buf(buf)).await {
            Err(_) => Err(format!(
                "timed out after {}s",
                self.settings.read_timeout.as_secs()
            )),
            Ok(Ok(0)) => Err("connection closed".to_string()),
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
        }
    }
}
