//! Connection logger - the append-only audit trail
//!
//! Every observation the listener makes ends up here as one timestamped event.
//! Events are appended to the log file and echoed to the console under a single
//! lock, so concurrent connections never splice their lines together.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::error;

use crate::intercept::error::{InterceptError, Result};

/// ISO-8601 local timestamp with microseconds and offset
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f%:z";

/// Category of a logged event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Server,
    Cert,
    TcpConnect,
    ClientHello,
    TlsSuccess,
    TlsFailure,
    AcceptError,
    HttpRequest,
    HttpAccess,
    RequestError,
    ReadError,
}

impl EventKind {
    /// Machine name of the event (`tcp_connect`, `tls_failure`, ...)
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Server => "server",
            EventKind::Cert => "cert",
            EventKind::TcpConnect => "tcp_connect",
            EventKind::ClientHello => "client_hello",
            EventKind::TlsSuccess => "tls_success",
            EventKind::TlsFailure => "tls_failure",
            EventKind::AcceptError => "accept_error",
            EventKind::HttpRequest => "http_request",
            EventKind::HttpAccess => "http_access",
            EventKind::RequestError => "request_error",
            EventKind::ReadError => "read_error",
        }
    }

    /// Bracketed tag written into the log line
    pub fn tag(&self) -> &'static str {
        match self {
            EventKind::Server => "SERVER",
            EventKind::Cert => "CERT",
            EventKind::TcpConnect => "TCP CONNECT",
            EventKind::ClientHello => "CLIENT HELLO",
            EventKind::TlsSuccess => "TLS SUCCESS",
            EventKind::TlsFailure => "TLS FAILED",
            EventKind::AcceptError => "ACCEPT ERROR",
            EventKind::HttpRequest => "HTTP REQUEST",
            EventKind::HttpAccess => "HTTP",
            EventKind::RequestError => "REQUEST ERROR",
            EventKind::ReadError => "READ ERROR",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of log output
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub timestamp: DateTime<Local>,
    pub kind: EventKind,
    pub peer: Option<SocketAddr>,
    pub message: String,
}

impl LogEvent {
    /// Free-text event stamped with the current local time
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            kind,
            peer: None,
            message: message.into(),
        }
    }

    /// Attach the peer address the event concerns
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Structured event; the payload is embedded as pretty-printed JSON
    pub fn json<T: Serialize>(kind: EventKind, payload: &T) -> Self {
        let message = serde_json::to_string_pretty(payload)
            .unwrap_or_else(|e| format!("<unserializable payload: {}>", e));
        Self::new(kind, message)
    }

    /// Render the event as it appears in the log file
    pub fn render(&self) -> String {
        let ts = self.timestamp.format(TIMESTAMP_FORMAT);
        match (&self.peer, self.message.is_empty()) {
            (Some(peer), true) => format!("[{}] [{}] {}", ts, self.kind.tag(), peer),
            (Some(peer), false) => {
                format!("[{}] [{}] {} - {}", ts, self.kind.tag(), peer, self.message)
            }
            (None, _) => format!("[{}] [{}] {}", ts, self.kind.tag(), self.message),
        }
    }
}

/// Append-only audit log shared by every connection task
#[derive(Debug)]
pub struct ConnectionLogger {
    path: PathBuf,
    echo: bool,
    sink: Mutex<File>,
}

impl ConnectionLogger {
    /// Open (or create) the log file in append mode
    ///
    /// Missing parent directories are created. Failure here is fatal for the
    /// service: it must not run without an audit trail.
    pub async fn open(path: impl AsRef<Path>, echo: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let open_failed = |source| InterceptError::LogOpenFailed {
            path: path.display().to_string(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(open_failed)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(open_failed)?;

        Ok(Self {
            path,
            echo,
            sink: Mutex::new(file),
        })
    }

    /// Destination path of the log
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event and flush before returning
    pub async fn record(&self, event: LogEvent) {
        let mut line = event.render();
        line.push('\n');

        let mut file = self.sink.lock().await;

        if let Err(e) = file.write_all(line.as_bytes()).await {
            error!(path = %self.path.display(), error = %e, "Failed to append log event");
        } else if let Err(e) = file.flush().await {
            error!(path = %self.path.display(), error = %e, "Failed to flush log event");
        }

        // Console echo happens under the same lock to keep the two streams in step
        if self.echo {
            let mut stdout = tokio::io::stdout();
            let echoed = async {
                stdout.write_all(line.as_bytes()).await?;
                stdout.flush().await
            }
            .await;
            if let Err(e) = echoed {
                error!(error = %e, "Failed to echo log event to stdout");
            }
        }
    }

    /// Shorthand for a free-text event
    pub async fn log(&self, kind: EventKind, message: impl Into<String>) {
        self.record(LogEvent::new(kind, message)).await;
    }

    /// Shorthand for a free-text event about a peer
    pub async fn log_peer(&self, kind: EventKind, peer: SocketAddr, message: impl Into<String>) {
        self.record(LogEvent::new(kind, message).with_peer(peer)).await;
    }
}

pub type SharedConnectionLogger = Arc<ConnectionLogger>;
