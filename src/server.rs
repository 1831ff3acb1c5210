use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info};

use crate::config::Config;
use crate::intercept::certificate::CertificateProvisioner;
use crate::intercept::listener::{InterceptListener, ListenerMode};
use crate::logger::{ConnectionLogger, EventKind};
use crate::tls::create_server_config;

/// Provision, bind and serve until Ctrl-C
///
/// Every failure returned from here is fatal: no log, no certificate or no
/// socket means nothing can be captured.
pub async fn run(config: Config) -> Result<()> {
    let logger = Arc::new(
        ConnectionLogger::open(&config.log_file, !config.quiet)
            .await
            .context("Failed to open audit log")?,
    );

    let domains = config.domains();
    logger
        .log(
            EventKind::Server,
            format!(
                "{} {} starting (log: {})",
                crate::NAME,
                crate::VERSION,
                config.log_file.display()
            ),
        )
        .await;

    let mode = if config.plaintext {
        logger
            .log(EventKind::Server, "Plaintext mode: TLS termination disabled")
            .await;
        ListenerMode::Plaintext
    } else {
        let bundle = CertificateProvisioner::new(&config.cert_dir, domains.clone())
            .ensure(&logger, config.regenerate_cert)
            .await
            .context("Certificate provisioning failed")?;

        let tls_config = create_server_config(&bundle.cert_path, &bundle.key_path)
            .context("Failed to load provisioned certificate")?;
        info!(cert = %bundle.cert_path.display(), "TLS configured without ALPN");
        logger
            .log(
                EventKind::Server,
                format!(
                    "Certificate: {} Key: {}",
                    bundle.cert_path.display(),
                    bundle.key_path.display()
                ),
            )
            .await;
        ListenerMode::Tls(tls_config)
    };

    let listener = InterceptListener::bind(
        &config.host,
        config.port,
        mode,
        Arc::clone(&logger),
        config.listener_settings(),
    )
    .await?;

    let local_addr = listener.local_addr()?;
    logger
        .log(EventKind::Server, format!("Listening on {}", local_addr))
        .await;
    logger
        .log(
            EventKind::Server,
            format!("Intercepting for: {}", domains.join(", ")),
        )
        .await;

    tokio::select! {
        result = listener.run() => {
            if let Err(e) = &result {
                error!("Listener stopped: {}", e);
            }
            result?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
            logger.log(EventKind::Server, "Stopped").await;
        }
    }

    Ok(())
}
