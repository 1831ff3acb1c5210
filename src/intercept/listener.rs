//! Accept loop and per-connection TLS termination

use rustls::server::Acceptor;
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info, warn};

use super::connection::{ConnectionAttempt, ConnectionOutcome};
use super::error::{InterceptError, Result};
use super::handler::{HandlerSettings, RequestHandler, SessionEnd, SessionSummary};
use crate::logger::{EventKind, SharedConnectionLogger};
use crate::tls::{describe_session, ClientHelloSummary};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after a failed accept so a persistent error (EMFILE) does not spin
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// How accepted sockets are terminated
#[derive(Clone)]
pub enum ListenerMode {
    /// Terminate TLS with this configuration
    Tls(Arc<ServerConfig>),

    /// Serve HTTP directly on the socket
    Plaintext,
}

impl std::fmt::Debug for ListenerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerMode::Tls(_) => f.write_str("Tls"),
            ListenerMode::Plaintext => f.write_str("Plaintext"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub handshake_timeout: Duration,
    pub handler: HandlerSettings,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            handler: HandlerSettings::default(),
        }
    }
}

/// The interception listener
pub struct InterceptListener {
    listener: TcpListener,
    mode: ListenerMode,
    logger: SharedConnectionLogger,
    handler: Arc<RequestHandler>,
    handshake_timeout: Duration,
}

impl InterceptListener {
    /// Bind `host:port`; port 0 picks an ephemeral port
    pub async fn bind(
        host: &str,
        port: u16,
        mode: ListenerMode,
        logger: SharedConnectionLogger,
        settings: ListenerSettings,
    ) -> Result<Self> {
        let addr = bind_address(host, port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| InterceptError::BindFailed {
                addr: addr.clone(),
                source,
            })?;

        info!(addr = %addr, mode = ?mode, "Listener bound");

        let handler = Arc::new(RequestHandler::new(Arc::clone(&logger), settings.handler));

        Ok(Self {
            listener,
            mode,
            logger,
            handler,
            handshake_timeout: settings.handshake_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn mode(&self) -> &ListenerMode {
        &self.mode
    }

    /// Accept connections until the task is dropped
    ///
    /// `tcp_connect` is logged here, before the connection task exists, so it
    /// always precedes that connection's outcome in the log.
    pub async fn run(self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    self.logger.log_peer(EventKind::TcpConnect, peer, "").await;

                    let mode = self.mode.clone();
                    let logger = Arc::clone(&self.logger);
                    let handler = Arc::clone(&self.handler);
                    let handshake_timeout = self.handshake_timeout;

                    tokio::spawn(async move {
                        handle_connection(stream, peer, mode, logger, handler, handshake_timeout)
                            .await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    self.logger
                        .log(EventKind::AcceptError, e.to_string())
                        .await;
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                }
            }
        }
    }
}

/// `host:port`, bracketing bare IPv6 literals
fn bind_address(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    mode: ListenerMode,
    logger: SharedConnectionLogger,
    handler: Arc<RequestHandler>,
    handshake_timeout: Duration,
) {
    let mut attempt = ConnectionAttempt::accept(peer);

    let (outcome, requests) = match mode {
        ListenerMode::Plaintext => {
            let summary = handler.serve(stream, peer).await;
            (session_outcome(&summary, ConnectionOutcome::Plaintext), summary.requests)
        }
        ListenerMode::Tls(config) => {
            match terminate_tls(stream, peer, config, &logger, handshake_timeout).await {
                Ok(tls_stream) => {
                    let summary = handler.serve(tls_stream, peer).await;
                    (session_outcome(&summary, ConnectionOutcome::TlsSuccess), summary.requests)
                }
                Err(e) => {
                    logger
                        .log_peer(EventKind::TlsFailure, peer, e.to_string())
                        .await;
                    (ConnectionOutcome::TlsFailure, 0)
                }
            }
        }
    };

    attempt.resolve(outcome);
    debug!(
        peer = %peer,
        outcome = outcome.as_str(),
        requests = requests,
        elapsed_ms = attempt.elapsed().as_millis() as u64,
        "Connection closed"
    );
}

/// Run the handshake, logging the ClientHello and the negotiated session
async fn terminate_tls(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<ServerConfig>,
    logger: &SharedConnectionLogger,
    handshake_timeout: Duration,
) -> Result<TlsStream<TcpStream>> {
    let handshake = async {
        let start = LazyConfigAcceptor::new(Acceptor::default(), stream)
            .await
            .map_err(|e| InterceptError::tls_handshake(e.to_string()))?;

        let hello = ClientHelloSummary::from_client_hello(&start.client_hello());
        logger
            .log_peer(EventKind::ClientHello, peer, hello.describe())
            .await;

        start
            .into_stream(config)
            .await
            .map_err(|e| InterceptError::tls_handshake(e.to_string()))
    };

    let tls_stream = timeout(handshake_timeout, handshake)
        .await
        .map_err(|_| InterceptError::HandshakeTimeout(handshake_timeout))??;

    let (_, session) = tls_stream.get_ref();
    logger
        .log_peer(EventKind::TlsSuccess, peer, describe_session(session))
        .await;

    Ok(tls_stream)
}

/// Terminal outcome once the request session is over
fn session_outcome(summary: &SessionSummary, clean: ConnectionOutcome) -> ConnectionOutcome {
    match summary.end {
        SessionEnd::ReadError(_) => ConnectionOutcome::ReadError,
        _ => clean,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_address() {
        assert_eq!(bind_address("0.0.0.0", 443), "0.0.0.0:443");
        assert_eq!(bind_address("::", 8443), "[::]:8443");
        assert_eq!(bind_address("[::1]", 8443), "[::1]:8443");
    }

    #[test]
    fn test_session_outcome() {
        let failed = SessionSummary {
            requests: 1,
            end: SessionEnd::ReadError("connection reset".to_string()),
        };
        let closed = SessionSummary {
            requests: 2,
            end: SessionEnd::Closed,
        };
        let garbage = SessionSummary {
            requests: 0,
            end: SessionEnd::Malformed("bad request line".to_string()),
        };

        assert_eq!(
            session_outcome(&failed, ConnectionOutcome::TlsSuccess),
            ConnectionOutcome::ReadError
        );
        assert_eq!(
            session_outcome(&closed, ConnectionOutcome::TlsSuccess),
            ConnectionOutcome::TlsSuccess
        );
        assert_eq!(
            session_outcome(&garbage, ConnectionOutcome::Plaintext),
            ConnectionOutcome::Plaintext
        );
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let logger = Arc::new(
            crate::logger::ConnectionLogger::open(dir.path().join("l.log"), false)
                .await
                .unwrap(),
        );

        let first = InterceptListener::bind(
            "127.0.0.1",
            0,
            ListenerMode::Plaintext,
            Arc::clone(&logger),
            ListenerSettings::default(),
        )
        .await
        .unwrap();
        let port = first.local_addr().unwrap().port();

        let second = InterceptListener::bind(
            "127.0.0.1",
            port,
            ListenerMode::Plaintext,
            logger,
            ListenerSettings::default(),
        )
        .await;
        assert!(matches!(second, Err(InterceptError::BindFailed { .. })));
    }
}
