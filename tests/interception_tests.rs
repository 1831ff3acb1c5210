//! End-to-end interception tests
//!
//! Each test runs a real listener on loopback with its own log file and
//! certificate directory, then drives it with a rustls client that accepts any
//! certificate.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{self, ClientConfig};
use tokio_rustls::TlsConnector;

use tlstrap::tls::create_server_config;
use tlstrap::{
    CertificateProvisioner, ConnectionLogger, InterceptListener, ListenerMode, ListenerSettings,
};

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    addr: SocketAddr,
    log_path: PathBuf,
    task: JoinHandle<()>,
    _dir: TempDir,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn start(plaintext: bool, settings: ListenerSettings) -> Harness {
    let dir = TempDir::new().unwrap();
    let log_path = dir.path().join("logs").join("intercept.log");
    let logger = Arc::new(ConnectionLogger::open(&log_path, false).await.unwrap());

    let mode = if plaintext {
        ListenerMode::Plaintext
    } else {
        let bundle = CertificateProvisioner::new(
            dir.path().join("certs"),
            vec!["localhost".to_string(), "127.0.0.1".to_string()],
        )
        .ensure(&logger, false)
        .await
        .unwrap();
        ListenerMode::Tls(create_server_config(&bundle.cert_path, &bundle.key_path).unwrap())
    };

    let listener = InterceptListener::bind("127.0.0.1", 0, mode, logger, settings)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let _ = listener.run().await;
    });

    Harness {
        addr,
        log_path,
        task,
        _dir: dir,
    }
}

async fn start_tls() -> Harness {
    start(false, ListenerSettings::default()).await
}

fn client_config() -> Arc<ClientConfig> {
    #[derive(Debug)]
    struct DangerousNoVerifier;

    impl rustls::client::danger::ServerCertVerifier for DangerousNoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls::pki_types::CertificateDer<'_>,
            _intermediates: &[rustls::pki_types::CertificateDer<'_>],
            _server_name: &rustls::pki_types::ServerName<'_>,
            _ocsp_response: &[u8],
            _now: rustls::pki_types::UnixTime,
        ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            vec![
                rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
                rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
                rustls::SignatureScheme::RSA_PKCS1_SHA256,
                rustls::SignatureScheme::RSA_PSS_SHA256,
                rustls::SignatureScheme::ED25519,
            ]
        }
    }

    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(DangerousNoVerifier))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Arc::new(config)
}

async fn tls_connect(addr: SocketAddr) -> TlsStream<TcpStream> {
    let connector = TlsConnector::from(client_config());
    let tcp = TcpStream::connect(addr).await.unwrap();
    let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
    connector.connect(server_name, tcp).await.unwrap()
}

/// Send `request` over TLS and return the whole response
async fn tls_exchange(addr: SocketAddr, request: &[u8]) -> String {
    let mut stream = tls_connect(addr).await;
    stream.write_all(request).await.unwrap();
    stream.flush().await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

/// Poll the log until `predicate` holds
async fn wait_for_log(path: &Path, predicate: impl Fn(&str) -> bool) -> String {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let contents = std::fs::read_to_string(path).unwrap_or_default();
        if predicate(&contents) {
            return contents;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("log never matched; contents:\n{}", contents);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn position(log: &str, needle: &str) -> usize {
    log.find(needle)
        .unwrap_or_else(|| panic!("'{}' missing from log:\n{}", needle, log))
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_get_is_intercepted_and_logged() {
    let harness = start_tls().await;

    let response = tls_exchange(
        harness.addr,
        b"GET /status HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Content-Type: application/json\r\n"));
    assert!(response.ends_with(r#"{"status":"intercepted","method":"GET","path":"/status"}"#));

    let log = wait_for_log(&harness.log_path, |l| l.contains("\"GET /status HTTP/1.1\" 200")).await;

    let connect = position(&log, "[TCP CONNECT]");
    let hello = position(&log, "[CLIENT HELLO]");
    let success = position(&log, "[TLS SUCCESS]");
    let request = position(&log, "[HTTP REQUEST]");
    assert!(connect < hello && hello < success && success < request);

    assert_eq!(log.matches("[TCP CONNECT]").count(), 1);
    assert_eq!(log.matches("[HTTP REQUEST]").count(), 1);
    assert!(log.contains("sni=localhost alpn=http/1.1"));
    assert!(log.contains("\"method\": \"GET\""));
    assert!(log.contains("\"path\": \"/status\""));
    assert!(log.contains("\"Host\": \"example.com\""));
}

#[tokio::test]
async fn test_garbage_instead_of_client_hello() {
    let harness = start_tls().await;

    let mut tcp = TcpStream::connect(harness.addr).await.unwrap();
    tcp.write_all(b"\x00\x01\x02").await.unwrap();
    tcp.shutdown().await.unwrap();

    let log = wait_for_log(&harness.log_path, |l| l.contains("[TLS FAILED]")).await;

    assert!(position(&log, "[TCP CONNECT]") < position(&log, "[TLS FAILED]"));
    assert!(!log.contains("[TLS SUCCESS]"));
    assert!(!log.contains("[HTTP REQUEST]"));
}

#[tokio::test]
async fn test_truncated_body_still_logs_request() {
    let harness = start_tls().await;

    let mut stream = tls_connect(harness.addr).await;
    let mut request =
        b"POST /upload HTTP/1.1\r\nHost: example.com\r\nContent-Length: 1000\r\n\r\n".to_vec();
    request.extend_from_slice(&[b'x'; 200]);
    stream.write_all(&request).await.unwrap();
    stream.shutdown().await.unwrap();

    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await;

    let log = wait_for_log(&harness.log_path, |l| l.contains("[READ ERROR]")).await;

    assert!(log.contains("\"method\": \"POST\""));
    assert!(log.contains("\"path\": \"/upload\""));
    assert!(log.contains("\"Content-Length\": \"1000\""));
    assert!(log.contains("<error reading body:"));
    assert!(log.contains("\"body_error\":"));
    assert!(position(&log, "[TLS SUCCESS]") < position(&log, "[HTTP REQUEST]"));
}

#[tokio::test]
async fn test_options_advertises_allowed_methods() {
    let harness = start_tls().await;

    let response = tls_exchange(
        harness.addr,
        b"OPTIONS * HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Allow: GET, POST, PUT, DELETE, OPTIONS\r\n"));
    assert!(response.ends_with("\r\n\r\n"));

    wait_for_log(&harness.log_path, |l| l.contains("\"method\": \"OPTIONS\"")).await;
}

#[tokio::test]
async fn test_head_has_no_body() {
    let harness = start_tls().await;

    let response = tls_exchange(
        harness.addr,
        b"HEAD /firmware.bin HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("\r\n\r\n"));
    wait_for_log(&harness.log_path, |l| l.contains("\"method\": \"HEAD\"")).await;
}

#[tokio::test]
async fn test_keep_alive_connection_logs_each_request() {
    let harness = start_tls().await;

    let response = tls_exchange(
        harness.addr,
        b"POST /telemetry HTTP/1.1\r\nHost: a\r\nContent-Type: application/json\r\nContent-Length: 13\r\n\r\n{\"temp\":21.5}\
          PUT /config HTTP/1.1\r\nHost: a\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
    )
    .await;

    assert_eq!(response.matches("HTTP/1.1 200 OK").count(), 2);
    assert!(response.contains(r#"{"status":"intercepted","method":"POST","path":"/telemetry"}"#));
    assert!(response.contains(r#"{"status":"intercepted","method":"PUT","path":"/config"}"#));

    let log = wait_for_log(&harness.log_path, |l| l.matches("[HTTP]").count() == 2).await;
    assert_eq!(log.matches("[HTTP REQUEST]").count(), 2);
    assert!(log.contains(r#""body": "{\"temp\":21.5}""#));
}

#[tokio::test]
async fn test_non_http_payload_is_previewed() {
    let harness = start_tls().await;

    let mut stream = tls_connect(harness.addr).await;
    stream.write_all(b"\x10\x0c\x00\x04MQTT\x04\x02\x00\x3c").await.unwrap();
    stream.flush().await.unwrap();

    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await;
    assert!(response.is_empty());

    let log = wait_for_log(&harness.log_path, |l| l.contains("[REQUEST ERROR]")).await;
    assert!(log.contains("received 12 bytes"));
    assert!(!log.contains("[HTTP REQUEST]"));
}

// ============================================================================
// Timeouts and concurrency
// ============================================================================

#[tokio::test]
async fn test_handshake_timeout_is_a_tls_failure() {
    let settings = ListenerSettings {
        handshake_timeout: Duration::from_millis(200),
        ..ListenerSettings::default()
    };
    let harness = start(false, settings).await;

    let _silent = TcpStream::connect(harness.addr).await.unwrap();

    let log = wait_for_log(&harness.log_path, |l| l.contains("[TLS FAILED]")).await;
    assert!(log.contains("timed out"));
    assert!(!log.contains("[CLIENT HELLO]"));
}

#[tokio::test]
async fn test_stalled_clients_do_not_block_others() {
    let harness = start_tls().await;

    let mut stalled = Vec::new();
    for _ in 0..8 {
        stalled.push(TcpStream::connect(harness.addr).await.unwrap());
    }

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        tls_exchange(
            harness.addr,
            b"GET /ping HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n",
        ),
    )
    .await
    .expect("request behind stalled clients timed out");

    assert!(response.ends_with(r#"{"status":"intercepted","method":"GET","path":"/ping"}"#));

    let log = wait_for_log(&harness.log_path, |l| l.contains("\"path\": \"/ping\"")).await;
    assert_eq!(log.matches("[TCP CONNECT]").count(), 9);
    assert_eq!(log.matches("[TLS SUCCESS]").count(), 1);
}

#[tokio::test]
async fn test_parallel_clients_are_all_logged() {
    let harness = start_tls().await;
    let addr = harness.addr;

    let mut clients = Vec::new();
    for i in 0..10 {
        clients.push(tokio::spawn(async move {
            let request = format!(
                "GET /device/{} HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n",
                i
            );
            tls_exchange(addr, request.as_bytes()).await
        }));
    }
    for client in clients {
        assert!(client.await.unwrap().starts_with("HTTP/1.1 200 OK"));
    }

    let log = wait_for_log(&harness.log_path, |l| l.matches("[HTTP]").count() == 10).await;
    assert_eq!(log.matches("[HTTP REQUEST]").count(), 10);
    for i in 0..10 {
        assert!(log.contains(&format!("\"path\": \"/device/{}\"", i)));
    }
}

// ============================================================================
// Plaintext mode
// ============================================================================

#[tokio::test]
async fn test_plaintext_mode_skips_tls() {
    let harness = start(true, ListenerSettings::default()).await;

    let mut tcp = TcpStream::connect(harness.addr).await.unwrap();
    tcp.write_all(b"DELETE /session HTTP/1.0\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    tcp.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8(response).unwrap();
    assert!(response.contains("Connection: close\r\n"));
    assert!(response.ends_with(r#"{"status":"intercepted","method":"DELETE","path":"/session"}"#));

    let log = wait_for_log(&harness.log_path, |l| l.contains("[HTTP]")).await;
    assert!(position(&log, "[TCP CONNECT]") < position(&log, "[HTTP REQUEST]"));
    assert!(!log.contains("[TLS SUCCESS]"));
    assert!(!log.contains("[TLS FAILED]"));
}
