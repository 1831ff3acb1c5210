//! TLS interception listener
//!
//! This module provides everything between the listening socket and the log:
//! - Self-signed certificate provisioning for the intercepted hostnames
//! - Per-connection TLS termination with ClientHello capture
//! - A lenient HTTP/1.x reader that logs every request in full
//! - Fixed acknowledgment responses

pub mod certificate;
pub mod connection;
pub mod error;
pub mod handler;
pub mod http_parser;
pub mod listener;
pub mod response;

// Re-export main types
pub use certificate::{
    ensure_certificate, CertificateBundle, CertificateError, CertificateProvisioner,
};
pub use connection::{ConnectionAttempt, ConnectionOutcome};
pub use error::{InterceptError, Result};
pub use handler::{HandlerSettings, RequestHandler, RequestRecord, SessionEnd, SessionSummary};
pub use http_parser::{
    parse_request_head, BodyFraming, Headers, Method, ParseError as HttpParseError, RequestHead,
};
pub use listener::{InterceptListener, ListenerMode, ListenerSettings};
pub use response::AckResponse;
