use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ServerConnection};
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use serde::Serialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// Load TLS certificates and private key from files
///
/// The key may be PKCS#8, PKCS#1 or SEC1, so bundles produced by other tools
/// load as well as our own.
pub fn load_certs_and_key(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    // Load certificates
    let cert_file = File::open(cert_path)
        .with_context(|| format!("Failed to open certificate {}", cert_path.display()))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<CertificateDer> = certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificate {}", cert_path.display()))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", cert_path.display());
    }

    // Load private key
    let key_file = File::open(key_path)
        .with_context(|| format!("Failed to open private key {}", key_path.display()))?;
    let mut key_reader = BufReader::new(key_file);
    let key = private_key(&mut key_reader)
        .with_context(|| format!("Failed to parse private key {}", key_path.display()))?
        .ok_or_else(|| anyhow::anyhow!("No private keys found in {}", key_path.display()))?;

    Ok((certs, key))
}

/// Build the server-side TLS configuration for the interception listener
///
/// No ALPN protocols are advertised: whatever the client offers, the handshake
/// falls back to plain HTTP/1.x over TLS.
pub fn create_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let (certs, key) = load_certs_and_key(cert_path, key_path)?;

    let tls_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("Failed to create TLS config: {}", e))?;

    Ok(Arc::new(tls_config))
}

/// What a client revealed in its ClientHello
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientHelloSummary {
    /// Server Name Indication, if sent
    pub sni: Option<String>,

    /// ALPN protocols offered, in client preference order
    pub alpn: Vec<String>,

    /// Number of cipher suites offered
    pub cipher_suites: usize,
}

impl ClientHelloSummary {
    pub fn from_client_hello(hello: &ClientHello<'_>) -> Self {
        let alpn = hello
            .alpn()
            .map(|protocols| {
                protocols
                    .map(|p| String::from_utf8_lossy(p).into_owned())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            sni: hello.server_name().map(str::to_string),
            alpn,
            cipher_suites: hello.cipher_suites().len(),
        }
    }

    /// One-line description for the audit log
    pub fn describe(&self) -> String {
        let alpn = if self.alpn.is_empty() {
            "-".to_string()
        } else {
            self.alpn.join(",")
        };
        format!(
            "sni={} alpn={} cipher_suites={}",
            self.sni.as_deref().unwrap_or("-"),
            alpn,
            self.cipher_suites
        )
    }
}

/// Describe the negotiated session of a completed handshake
pub fn describe_session(conn: &ServerConnection) -> String {
    let version = conn
        .protocol_version()
        .map(|v| format!("{:?}", v))
        .unwrap_or_else(|| "unknown".to_string());
    let suite = conn
        .negotiated_cipher_suite()
        .map(|s| format!("{:?}", s.suite()))
        .unwrap_or_else(|| "unknown".to_string());
    format!("version={} cipher={}", version, suite)
}
