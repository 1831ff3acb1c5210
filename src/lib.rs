//! tlstrap - TLS interception listener for device traffic capture
//!
//! tlstrap presents a self-signed certificate for a chosen set of hostnames,
//! terminates every TLS connection a device opens to it, and writes what it
//! sees to an append-only audit log: each TCP connect, each handshake outcome,
//! and every HTTP request in full. Each request gets a fixed 200 JSON
//! acknowledgment so the client carries on.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tlstrap::{ConnectionLogger, InterceptListener, ListenerMode, ListenerSettings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let logger = Arc::new(ConnectionLogger::open("logs/intercept.log", true).await?);
//!
//!     let listener = InterceptListener::bind(
//!         "127.0.0.1",
//!         8080,
//!         ListenerMode::Plaintext,
//!         logger,
//!         ListenerSettings::default(),
//!     )
//!     .await?;
//!     listener.run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - `intercept` - listener, request handler and certificate provisioning
//! - `logger` - the audit log
//! - `tls` - rustls configuration and handshake descriptions
//! - `config` - command line and environment configuration
//! - `server` - wires the pieces together for the binary

pub mod config;
pub mod intercept;
pub mod logger;
pub mod server;
pub mod tls;

// Re-export commonly used types

/// Configuration types
pub use config::Config;

/// Audit log
pub use logger::{ConnectionLogger, EventKind, LogEvent, SharedConnectionLogger};

/// Interception types
pub use intercept::{
    ensure_certificate, AckResponse, CertificateBundle, CertificateError, CertificateProvisioner,
    ConnectionAttempt, ConnectionOutcome, HandlerSettings, InterceptError, InterceptListener,
    ListenerMode, ListenerSettings, RequestHandler, RequestRecord,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
