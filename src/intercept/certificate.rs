//! Certificate provisioning for the interception listener
//!
//! Produces a self-signed certificate whose SANs cover every hostname a device
//! might dial, and keeps it on disk so repeated runs present the same identity.

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, Ia5String, KeyPair,
    KeyUsagePurpose, SanType,
};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::logger::{ConnectionLogger, EventKind};
use crate::tls::load_certs_and_key;

/// File name of the PEM certificate inside the certificate directory
pub const CERT_FILE_NAME: &str = "cert.pem";

/// File name of the PEM private key inside the certificate directory
pub const KEY_FILE_NAME: &str = "key.pem";

/// Domains the bundle was issued for, one per line
pub const DOMAINS_FILE_NAME: &str = "domains.txt";

/// Default certificate validity in days
pub const DEFAULT_VALIDITY_DAYS: i64 = 365;

/// Certificate provisioning errors
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("At least one domain is required")]
    NoDomains,

    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),

    #[error("Certificate generation failed: {0}")]
    GenerationFailed(String),

    #[error("Failed to write {path}: {source}")]
    WriteFailed {
        path: String,
        source: std::io::Error,
    },
}

/// Locations of a provisioned key and certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub domains_path: PathBuf,
}

impl CertificateBundle {
    /// Bundle paths inside a certificate directory
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            cert_path: dir.join(CERT_FILE_NAME),
            key_path: dir.join(KEY_FILE_NAME),
            domains_path: dir.join(DOMAINS_FILE_NAME),
        }
    }

    /// Both files exist and parse as a certificate chain plus private key
    pub fn is_loadable(&self) -> bool {
        self.cert_path.exists()
            && self.key_path.exists()
            && load_certs_and_key(&self.cert_path, &self.key_path).is_ok()
    }

    /// Normalized domain set recorded at generation time
    pub fn recorded_domains(&self) -> Option<Vec<String>> {
        let text = fs::read_to_string(&self.domains_path).ok()?;
        Some(normalize_domains(text.lines()))
    }
}

/// What is already on disk
#[derive(Debug, Clone, PartialEq, Eq)]
enum BundleState {
    Missing,
    Unloadable,
    /// Loads, but was issued for another domain set
    DomainsChanged(Vec<String>),
    Reusable,
}

/// Generates or reuses the listener's self-signed certificate
#[derive(Debug, Clone)]
pub struct CertificateProvisioner {
    dir: PathBuf,
    domains: Vec<String>,
    validity_days: i64,
}

impl CertificateProvisioner {
    pub fn new(dir: impl Into<PathBuf>, domains: Vec<String>) -> Self {
        Self {
            dir: dir.into(),
            domains,
            validity_days: DEFAULT_VALIDITY_DAYS,
        }
    }

    pub fn with_validity_days(mut self, days: i64) -> Self {
        self.validity_days = days;
        self
    }

    pub fn bundle(&self) -> CertificateBundle {
        CertificateBundle::in_dir(&self.dir)
    }

    /// Return a loadable bundle covering exactly our domains
    ///
    /// An existing bundle issued for the same domain set is returned untouched
    /// unless `force` is set; anything else is regenerated.
    pub async fn ensure(
        &self,
        logger: &ConnectionLogger,
        force: bool,
    ) -> Result<CertificateBundle, CertificateError> {
        if self.domains.is_empty() {
            return Err(CertificateError::NoDomains);
        }

        let bundle = self.bundle();

        if !force {
            let provisioner = self.clone();
            match run_blocking(move || Ok(provisioner.inspect())).await? {
                BundleState::Reusable => {
                    debug!(cert = %bundle.cert_path.display(), "Reusing existing certificate");
                    logger
                        .log(
                            EventKind::Cert,
                            format!("Reusing existing cert: {}", bundle.cert_path.display()),
                        )
                        .await;
                    return Ok(bundle);
                }
                BundleState::Missing => {}
                BundleState::Unloadable => {
                    warn!(dir = %self.dir.display(), "Existing certificate bundle is unusable, regenerating");
                }
                BundleState::DomainsChanged(previous) => {
                    let previous = if previous.is_empty() {
                        "unknown".to_string()
                    } else {
                        previous.join(", ")
                    };
                    logger
                        .log(
                            EventKind::Cert,
                            format!("Existing cert was issued for: {}; regenerating", previous),
                        )
                        .await;
                }
            }
        }

        logger
            .log(
                EventKind::Cert,
                format!("Generating self-signed cert for: {}", self.domains.join(", ")),
            )
            .await;

        let provisioner = self.clone();
        let target = bundle.clone();
        if let Err(e) = run_blocking(move || provisioner.write_bundle(&target)).await {
            logger
                .log(EventKind::Cert, format!("Certificate generation failed: {}", e))
                .await;
            return Err(e);
        }

        logger
            .log(
                EventKind::Cert,
                format!("Generated: {}", bundle.cert_path.display()),
            )
            .await;

        Ok(bundle)
    }

    fn inspect(&self) -> BundleState {
        let bundle = self.bundle();

        if !bundle.cert_path.exists() && !bundle.key_path.exists() {
            return BundleState::Missing;
        }
        if !bundle.is_loadable() {
            return BundleState::Unloadable;
        }

        let wanted = normalize_domains(self.domains.iter().map(String::as_str));
        match bundle.recorded_domains() {
            Some(recorded) if recorded == wanted => BundleState::Reusable,
            recorded => BundleState::DomainsChanged(recorded.unwrap_or_default()),
        }
    }

    fn write_bundle(&self, bundle: &CertificateBundle) -> Result<(), CertificateError> {
        let (cert_pem, key_pem) = self.generate()?;

        fs::create_dir_all(&self.dir).map_err(|source| CertificateError::WriteFailed {
            path: self.dir.display().to_string(),
            source,
        })?;

        write_private_file(&bundle.key_path, &key_pem)?;
        write_file(&bundle.cert_path, &cert_pem)?;

        // Written last: an interrupted run leaves no record and regenerates
        let mut domains = self.domains.join("\n");
        domains.push('\n');
        write_file(&bundle.domains_path, &domains)?;

        Ok(())
    }

/// Generate a PEM certificate and PEM private key
    fn generate(&self) -> Result<(String, String), CertificateError> {
        let common_name = self.domains.first().ok_or(CertificateError::NoDomains)?;

        let mut params = CertificateParams::default();

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, common_name.clone());
        params.distinguished_name = distinguished_name;

        params.subject_alt_names = self
            .domains
            .iter()
            .map(|d| subject_alt_name(d))
            .collect::<Result<Vec<_>, _>>()?;

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(self.validity_days);

        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let key_pair =
            KeyPair::generate().map_err(|e| CertificateError::GenerationFailed(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CertificateError::GenerationFailed(e.to_string()))?;

        Ok((cert.pem(), key_pair.serialize_pem()))
    }
}

/// Provision a certificate for `domains` in `dir`, reusing a loadable one
pub async fn ensure_certificate(
    domains: &[String],
    dir: &Path,
    logger: &ConnectionLogger,
) -> Result<CertificateBundle, CertificateError> {
    CertificateProvisioner::new(dir, domains.to_vec())
        .ensure(logger, false)
        .await
}

/// IP literals become IP SANs, everything else a DNS SAN
fn subject_alt_name(domain: &str) -> Result<SanType, CertificateError> {
    let domain = domain.trim();
    if domain.is_empty() {
        return Err(CertificateError::InvalidDomain(domain.to_string()));
    }

    if let Ok(ip) = domain.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }

    let name = Ia5String::try_from(domain.to_string())
        .map_err(|_| CertificateError::InvalidDomain(domain.to_string()))?;
    Ok(SanType::DnsName(name))
}

/// Trimmed, lowercased, sorted and deduplicated
fn normalize_domains<'a>(domains: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut normalized: Vec<String> = domains
        .into_iter()
        .map(|d| d.trim().to_ascii_lowercase())
        .filter(|d| !d.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    normalized
}

/// Run file and key work off the async worker threads
async fn run_blocking<T, F>(f: F) -> Result<T, CertificateError>
where
    F: FnOnce() -> Result<T, CertificateError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CertificateError::GenerationFailed(e.to_string()))?
}

fn write_file(path: &Path, contents: &str) -> Result<(), CertificateError> {
    fs::write(path, contents).map_err(|source| CertificateError::WriteFailed {
        path: path.display().to_string(),
        source,
    })
}

/// Write a file that is owner-only from the moment it exists
#[cfg(unix)]
fn write_private_file(path: &Path, contents: &str) -> Result<(), CertificateError> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let failed = |source: std::io::Error| CertificateError::WriteFailed {
        path: path.display().to_string(),
        source,
    };

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(failed)?;

    // mode() only applies on creation; an older key file may be wider
    file.set_permissions(fs::Permissions::from_mode(0o600))
        .map_err(failed)?;
    file.write_all(contents.as_bytes()).map_err(failed)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private_file(path: &Path, contents: &str) -> Result<(), CertificateError> {
    write_file(path, contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_alt_name_kinds() {
        assert!(matches!(
            subject_alt_name("192.168.60.1").unwrap(),
            SanType::IpAddress(_)
        ));
        assert!(matches!(
            subject_alt_name("::1").unwrap(),
            SanType::IpAddress(_)
        ));
        assert!(matches!(
            subject_alt_name("ws.example.com").unwrap(),
            SanType::DnsName(_)
        ));
    }

    #[test]
    fn test_subject_alt_name_rejects_empty_and_non_ascii() {
        assert!(matches!(
            subject_alt_name("  "),
            Err(CertificateError::InvalidDomain(_))
        ));
        assert!(matches!(
            subject_alt_name("bücher.example"),
            Err(CertificateError::InvalidDomain(_))
        ));
    }

    #[test]
    fn test_generate_produces_pem_pair() {
        let provisioner = CertificateProvisioner::new(
            "unused",
            vec!["localhost".to_string(), "10.0.0.1".to_string()],
        );
        let (cert_pem, key_pem) = provisioner.generate().unwrap();

        assert!(cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(key_pem.contains("PRIVATE KEY-----"));
    }

    #[test]
    fn test_bundle_paths() {
        let bundle = CertificateBundle::in_dir(Path::new("certs"));
        assert_eq!(bundle.cert_path, Path::new("certs/cert.pem"));
        assert_eq!(bundle.key_path, Path::new("certs/key.pem"));
        assert_eq!(bundle.domains_path, Path::new("certs/domains.txt"));
    }

    #[test]
    fn test_normalize_domains() {
        assert_eq!(
            normalize_domains(["Localhost", " ws.example.com ", "", "localhost"]),
            vec!["localhost".to_string(), "ws.example.com".to_string()]
        );
    }

    #[test]
    fn test_inspect_states() {
        let dir = tempfile::TempDir::new().unwrap();
        let provisioner =
            CertificateProvisioner::new(dir.path(), vec!["old.example".to_string()]);
        assert_eq!(provisioner.inspect(), BundleState::Missing);

        provisioner.write_bundle(&provisioner.bundle()).unwrap();
        assert_eq!(provisioner.inspect(), BundleState::Reusable);

        let renamed = CertificateProvisioner::new(dir.path(), vec!["new.example".to_string()]);
        assert_eq!(
            renamed.inspect(),
            BundleState::DomainsChanged(vec!["old.example".to_string()])
        );

        fs::remove_file(provisioner.bundle().domains_path).unwrap();
        assert_eq!(provisioner.inspect(), BundleState::DomainsChanged(Vec::new()));

        fs::write(provisioner.bundle().cert_path, "garbage").unwrap();
        assert_eq!(provisioner.inspect(), BundleState::Unloadable);
    }
}
