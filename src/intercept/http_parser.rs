//! HTTP/1.x request-head parser
//!
//! Lightweight parser for the requests a device sends once TLS is terminated.
//! It is deliberately lenient: anything that looks like a request line plus
//! headers is accepted so it can be logged, and header bytes that are not valid
//! UTF-8 are decoded with replacement instead of being rejected.

use serde::ser::{Serialize, SerializeMap, Serializer};
use thiserror::Error;

/// HTTP parsing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid request line: {0}")]
    InvalidRequestLine(String),

    #[error("Incomplete HTTP message")]
    Incomplete,

    #[error("Request headers exceed {0} bytes")]
    HeadersTooLarge(usize),

    #[error("Header parse error: {0}")]
    InvalidHeader(String),

    #[error("Invalid Content-Length: {0}")]
    InvalidContentLength(String),
}

/// Request method, with every unrecognized token kept verbatim
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Other(String),
}

impl Method {
    pub fn parse(token: &str) -> Self {
        match token {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "HEAD" => Method::Head,
            "OPTIONS" => Method::Options,
            other => Method::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Other(token) => token,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header list in arrival order; lookups ignore ASCII case
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name`
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// Serialized as a JSON object keeping arrival order (repeated names repeat)
impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Parsed request line and headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Method,

    /// Request target as sent (`/path?query`, `*`, or absolute-form)
    pub path: String,

    /// HTTP version (HTTP/1.1, HTTP/1.0)
    pub version: String,

    pub headers: Headers,
}

/// How the request body is framed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Length(usize),
    Chunked,
}

impl RequestHead {
    /// Declared Content-Length; conflicting or non-numeric values are errors
    pub fn content_length(&self) -> Result<Option<usize>, ParseError> {
        let mut declared: Option<usize> = None;
        for raw in self.headers.get_all("content-length") {
            for part in raw.split(',') {
                let part = part.trim();
                let len = part
                    .parse::<usize>()
                    .map_err(|_| ParseError::InvalidContentLength(raw.to_string()))?;
                match declared {
                    Some(prev) if prev != len => {
                        return Err(ParseError::InvalidContentLength(raw.to_string()))
                    }
                    _ => declared = Some(len),
                }
            }
        }
        Ok(declared)
    }

    /// Body framing; chunked transfer coding wins over Content-Length
    pub fn body_framing(&self) -> Result<BodyFraming, ParseError> {
        let chunked = self.headers.get_all("transfer-encoding").any(|v| {
            v.split(',')
                .last()
                .map(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
                .unwrap_or(false)
        });
        if chunked {
            return Ok(BodyFraming::Chunked);
        }

        Ok(match self.content_length()? {
            Some(len) => BodyFraming::Length(len),
            None => BodyFraming::None,
        })
    }

    /// Whether the client expects the connection to stay open
    pub fn keep_alive(&self) -> bool {
        let connection = self.headers.get_all("connection").collect::<Vec<_>>();
        let has_token = |token: &str| {
            connection
                .iter()
                .flat_map(|v| v.split(','))
                .any(|t| t.trim().eq_ignore_ascii_case(token))
        };

        if has_token("close") {
            return false;
        }
        if self.version.eq_ignore_ascii_case("HTTP/1.0") {
            return has_token("keep-alive");
        }
        true
    }

    pub fn host(&self) -> Option<&str> {
        self.headers.get("host")
    }
}

/// Find the end of the request head
///
/// Returns `(head_len, terminator_len)`; CRLF CRLF and bare LF LF both count.
pub fn find_header_end(data: &[u8]) -> Option<(usize, usize)> {
    for i in 0..data.len() {
        if data[i] != b'\n' {
            continue;
        }
        if data[i + 1..].starts_with(b"\r\n") {
            return Some((i + 1, 2));
        }
        if data[i + 1..].starts_with(b"\n") {
            return Some((i + 1, 1));
        }
    }
    None
}

/// Parse a request head from the start of `data`
///
/// On success returns the head and the number of bytes it occupied, so the
/// caller can treat whatever follows as body or the next pipelined request.
pub fn parse_request_head(data: &[u8]) -> Result<(RequestHead, usize), ParseError> {
    let skipped = leading_empty_lines(data);
    let data = &data[skipped..];
    let (head_len, terminator_len) = find_header_end(data).ok_or(ParseError::Incomplete)?;

    let text = String::from_utf8_lossy(&data[..head_len]);
    let mut lines = text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

    let request_line = lines
        .next()
        .ok_or_else(|| ParseError::InvalidRequestLine(String::new()))?;
    let (method, path, version) = parse_request_line(request_line)?;

    let headers = parse_headers(lines)?;

    Ok((
        RequestHead {
            method,
            path,
            version,
            headers,
        },
        skipped + head_len + terminator_len,
    ))
}

/// Number of CR/LF bytes before the request line
///
/// Empty lines ahead of a request are ignored (RFC 9112 section 2.2); some
/// clients send a stray CRLF after a body.
pub fn leading_empty_lines(data: &[u8]) -> usize {
    data.iter().take_while(|b| matches!(b, b'\r' | b'\n')).count()
}

/// Quick rejection of bytes that cannot become an HTTP request
///
/// Lets binary protocols be reported as soon as their first bytes arrive
/// instead of waiting for a header terminator that never comes.
pub fn check_request_prefix(data: &[u8]) -> Result<(), ParseError> {
    let data = &data[leading_empty_lines(data)..];
    let invalid = || {
        let preview = &data[..data.len().min(64)];
        ParseError::InvalidRequestLine(preview.escape_ascii().to_string())
    };

    let method_len = data.iter().take_while(|b| is_token_byte(**b)).count();
    match data.get(method_len) {
        // Method still arriving
        None => Ok(()),
        Some(b' ') if method_len > 0 => {
            match data.iter().position(|b| *b == b'\n') {
                Some(end) => {
                    let line = String::from_utf8_lossy(&data[..end]);
                    parse_request_line(line.trim_end_matches('\r')).map(|_| ())
                }
                None => Ok(()),
            }
        }
        Some(_) => Err(invalid()),
    }
}

fn parse_request_line(line: &str) -> Result<(Method, String, String), ParseError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 3 {
        return Err(ParseError::InvalidRequestLine(line.to_string()));
    }

    let (method, path, version) = (parts[0], parts[1], parts[2]);

    if !method.bytes().all(is_token_byte) || !version.starts_with("HTTP/") {
        return Err(ParseError::InvalidRequestLine(line.to_string()));
    }

    Ok((Method::parse(method), path.to_string(), version.to_string()))
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Headers, ParseError> {
    let mut headers: Vec<(String, String)> = Vec::new();

    for line in lines {
        if line.is_empty() {
            break;
        }

        // Obsolete line folding continues the previous value
        if line.starts_with(' ') || line.starts_with('\t') {
            match headers.last_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                    continue;
                }
                None => return Err(ParseError::InvalidHeader(line.to_string())),
            }
        }

        let colon_pos = line
            .find(':')
            .ok_or_else(|| ParseError::InvalidHeader(line.to_string()))?;
        let name = &line[..colon_pos];
        if name.is_empty() || !name.bytes().all(is_token_byte) {
            return Err(ParseError::InvalidHeader(line.to_string()));
        }

        let value = line[colon_pos + 1..].trim().to_string();
        headers.push((name.to_string(), value));
    }

    Ok(Headers(headers))
}

/// RFC 9110 token characters
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
