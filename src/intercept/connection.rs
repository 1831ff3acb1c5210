//! Per-connection bookkeeping

use chrono::{DateTime, Local};
use serde::Serialize;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Terminal outcome of one accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionOutcome {
    /// Handshake completed and the session ended cleanly
    TlsSuccess,

    /// Handshake failed, timed out, or the client aborted it
    TlsFailure,

    /// Reading the session after termination failed
    ReadError,

    /// Plaintext listener mode; no handshake was attempted
    Plaintext,
}

impl ConnectionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionOutcome::TlsSuccess => "tls_success",
            ConnectionOutcome::TlsFailure => "tls_failure",
            ConnectionOutcome::ReadError => "read_error",
            ConnectionOutcome::Plaintext => "plaintext",
        }
    }
}

/// One accepted socket, from accept until its outcome is known
#[derive(Debug, Clone)]
pub struct ConnectionAttempt {
    peer: SocketAddr,
    accepted_at: DateTime<Local>,
    started: Instant,
    outcome: Option<ConnectionOutcome>,
}

impl ConnectionAttempt {
    pub fn accept(peer: SocketAddr) -> Self {
        Self {
            peer,
            accepted_at: Local::now(),
            started: Instant::now(),
            outcome: None,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn accepted_at(&self) -> DateTime<Local> {
        self.accepted_at
    }

    pub fn outcome(&self) -> Option<ConnectionOutcome> {
        self.outcome
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Record the outcome; only the first call has any effect
    ///
    /// Returns `true` when this call set the outcome.
    pub fn resolve(&mut self, outcome: ConnectionOutcome) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        self.outcome = Some(outcome);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_is_set_once() {
        let mut attempt = ConnectionAttempt::accept("10.0.0.7:40000".parse().unwrap());
        assert_eq!(attempt.outcome(), None);

        assert!(attempt.resolve(ConnectionOutcome::TlsFailure));
        assert!(!attempt.resolve(ConnectionOutcome::TlsSuccess));
        assert_eq!(attempt.outcome(), Some(ConnectionOutcome::TlsFailure));
    }

    #[test]
    fn test_attempt_keeps_peer() {
        let peer: SocketAddr = "[::1]:8443".parse().unwrap();
        let attempt = ConnectionAttempt::accept(peer);
        assert_eq!(attempt.peer(), peer);
        assert!(attempt.accepted_at() <= Local::now());
    }

    #[test]
    fn test_outcome_names() {
        assert_eq!(ConnectionOutcome::TlsSuccess.as_str(), "tls_success");
        assert_eq!(ConnectionOutcome::ReadError.as_str(), "read_error");
        assert_eq!(
            serde_json::to_string(&ConnectionOutcome::TlsFailure).unwrap(),
            "\"tls_failure\""
        );
    }
}
