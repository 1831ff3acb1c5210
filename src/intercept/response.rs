//! Fixed acknowledgment responses
//!
//! The listener never judges a request: every method gets a 200, the shape of
//! which depends only on the method.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use super::http_parser::Method;

/// Methods advertised in the `Allow` header of an OPTIONS reply
pub const ALLOWED_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";

const SERVER_NAME: &str = concat!("tlstrap/", env!("CARGO_PKG_VERSION"));

/// JSON body of the acknowledgment
#[derive(Debug, Serialize)]
struct Acknowledgment<'a> {
    status: &'static str,
    method: &'a str,
    path: &'a str,
}

/// A response ready to be written to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckResponse {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
    pub body: Bytes,
}

impl AckResponse {
    /// Build the response for a request
    pub fn for_request(method: &Method, path: &str) -> Self {
        match method {
            Method::Get | Method::Post | Method::Put | Method::Delete => {
                Self::acknowledge(method, path)
            }
            Method::Options => Self::allow(),
            Method::Head => Self::empty(),
            Method::Other(_) => Self::acknowledge(method, path),
        }
    }

    /// 200 with `{"status":"intercepted","method":..,"path":..}`
    pub fn acknowledge(method: &Method, path: &str) -> Self {
        let ack = Acknowledgment {
            status: "intercepted",
            method: method.as_str(),
            path,
        };
        let body = serde_json::to_vec(&ack).unwrap_or_default();

        Self {
            status: 200,
            headers: vec![
                ("Content-Type", "application/json".to_string()),
                ("Content-Length", body.len().to_string()),
            ],
            body: Bytes::from(body),
        }
    }

    /// 200 advertising the supported methods, empty body
    pub fn allow() -> Self {
        Self {
            status: 200,
            headers: vec![
                ("Allow", ALLOWED_METHODS.to_string()),
                ("Content-Length", "0".to_string()),
            ],
            body: Bytes::new(),
        }
    }

    /// 200 with headers only
    pub fn empty() -> Self {
        Self {
            status: 200,
            headers: vec![("Content-Length", "0".to_string())],
            body: Bytes::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Serialize status line, headers and body
    pub fn encode(&self, keep_alive: bool) -> Bytes {
        let mut out = BytesMut::with_capacity(256 + self.body.len());
        out.put_slice(format!("HTTP/1.1 {} OK\r\n", self.status).as_bytes());
        out.put_slice(format!("Server: {}\r\n", SERVER_NAME).as_bytes());
        out.put_slice(
            format!(
                "Date: {}\r\n",
                chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT")
            )
            .as_bytes(),
        );
        for (name, value) in &self.headers {
            out.put_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        let connection = if keep_alive { "keep-alive" } else { "close" };
        out.put_slice(format!("Connection: {}\r\n\r\n", connection).as_bytes());
        out.put_slice(&self.body);
        out.freeze()
    }
}
