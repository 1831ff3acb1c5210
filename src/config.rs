use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::intercept::handler::HandlerSettings;
use crate::intercept::listener::ListenerSettings;

/// Runtime configuration, from the command line or `TLSTRAP_*` variables
#[derive(Debug, Clone, Parser)]
#[command(name = "tlstrap", version, about = "TLS interception listener that logs every request")]
pub struct Config {
    /// Address to bind
    #[arg(long, env = "TLSTRAP_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "TLSTRAP_PORT", default_value_t = 443)]
    pub port: u16,

    /// Directory holding cert.pem and key.pem
    #[arg(long, env = "TLSTRAP_CERT_DIR", default_value = "certs")]
    pub cert_dir: PathBuf,

    /// Append-only audit log
    #[arg(long, env = "TLSTRAP_LOG_FILE", default_value = "logs/intercept.log")]
    pub log_file: PathBuf,

    /// Hostname or IP the certificate must cover (repeatable)
    #[arg(
        long = "domain",
        env = "TLSTRAP_DOMAINS",
        value_delimiter = ',',
        default_value = "localhost"
    )]
    pub domains: Vec<String>,

    /// Generate a new certificate even if a usable one exists
    #[arg(long, env = "TLSTRAP_REGENERATE_CERT")]
    pub regenerate_cert: bool,

    #[arg(long, env = "TLSTRAP_HANDSHAKE_TIMEOUT_SECS", default_value_t = 30)]
    pub handshake_timeout_secs: u64,

    /// Idle time allowed between reads on a terminated connection
    #[arg(long, env = "TLSTRAP_READ_TIMEOUT_SECS", default_value_t = 60)]
    pub read_timeout_secs: u64,

    #[arg(long, env = "TLSTRAP_MAX_HEADER_BYTES", default_value_t = 32 * 1024)]
    pub max_header_bytes: usize,

    /// Largest request body captured into the log
    #[arg(long, env = "TLSTRAP_MAX_BODY_BYTES", default_value_t = 16 * 1024 * 1024)]
    pub max_body_bytes: usize,

    /// Serve plain HTTP, without TLS
    #[arg(long, env = "TLSTRAP_PLAINTEXT")]
    pub plaintext: bool,

    /// Do not echo audit events to stdout
    #[arg(long, short, env = "TLSTRAP_QUIET")]
    pub quiet: bool,
}

impl Config {
    /// Load from `.env`, the environment and the process arguments
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    /// Parse an explicit argument list; used by tests and embedders
    pub fn from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let config = Self::try_parse_from(args)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.handshake_timeout_secs == 0 {
            bail!("handshake timeout must be greater than zero");
        }
        if self.read_timeout_secs == 0 {
            bail!("read timeout must be greater than zero");
        }
        if self.max_header_bytes == 0 {
            bail!("max header bytes must be greater than zero");
        }
        if self.domains.iter().all(|d| d.trim().is_empty()) {
            bail!("at least one domain is required");
        }
        if self.host.trim().is_empty() {
            bail!("host cannot be empty");
        }
        Ok(())
    }

    /// Domains with blanks and surrounding whitespace removed
    pub fn domains(&self) -> Vec<String> {
        self.domains
            .iter()
            .map(|d| d.trim())
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn listener_settings(&self) -> ListenerSettings {
        ListenerSettings {
            handshake_timeout: self.handshake_timeout(),
            handler: HandlerSettings {
                read_timeout: self.read_timeout(),
                max_header_bytes: self.max_header_bytes,
                max_body_bytes: self.max_body_bytes,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_args(["tlstrap"]).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 443);
        assert_eq!(config.cert_dir, PathBuf::from("certs"));
        assert_eq!(config.log_file, PathBuf::from("logs/intercept.log"));
        assert_eq!(config.domains(), vec!["localhost".to_string()]);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(30));
        assert_eq!(config.read_timeout(), Duration::from_secs(60));
        assert!(!config.plaintext);
        assert!(!config.regenerate_cert);
    }

    #[test]
    fn test_domains_repeatable_and_comma_separated() {
        let config = Config::from_args([
            "tlstrap",
            "--domain",
            "ws.example.com,localhost",
            "--domain",
            "192.168.60.1",
        ])
        .unwrap();
        assert_eq!(
            config.domains(),
            vec![
                "ws.example.com".to_string(),
                "localhost".to_string(),
                "192.168.60.1".to_string()
            ]
        );
    }

    #[test]
    fn test_rejects_zero_timeouts() {
        assert!(Config::from_args(["tlstrap", "--handshake-timeout-secs", "0"]).is_err());
        assert!(Config::from_args(["tlstrap", "--read-timeout-secs", "0"]).is_err());
    }

    #[test]
    fn test_rejects_blank_domains() {
        assert!(Config::from_args(["tlstrap", "--domain", " , "]).is_err());
    }

    #[test]
    fn test_rejects_invalid_port() {
        assert!(Config::from_args(["tlstrap", "--port", "70000"]).is_err());
    }

    #[test]
    fn test_listener_settings() {
        let config = Config::from_args([
            "tlstrap",
            "--port",
            "8443",
            "--max-header-bytes",
            "4096",
            "--read-timeout-secs",
            "5",
        ])
        .unwrap();
        let settings = config.listener_settings();

        assert_eq!(config.bind_addr(), "0.0.0.0:8443");
        assert_eq!(settings.handler.max_header_bytes, 4096);
        assert_eq!(settings.handler.read_timeout, Duration::from_secs(5));
        assert_eq!(settings.handshake_timeout, Duration::from_secs(30));
    }
}
