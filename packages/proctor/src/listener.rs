//! The agent stream listener: agents dial out to us over TLS (or
//! plaintext in tests and local dev) and everything after accept is the
//! session layer's business.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use utils::context::AppContext;

use crate::config::Config;
use crate::health::{set_subsystem_health, SharedHealthStatus, SubsystemHealth};
use crate::orchestrator::Orchestrator;
use crate::subsystems::session::auth::AuthMode;

pub fn start(
    ctx: AppContext,
    config: Config,
    orchestrator: Arc<Orchestrator>,
    health: SharedHealthStatus,
) -> Result<()> {
    ctx.rt.clone().block_on(async move {
        let addr = format!("{}:{}", config.host, config.agent_port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding agent listener on {}", addr))?;
        let acceptor = load_tls_acceptor(&config)?;

        tracing::info!(
            "Agent listener on {} ({})",
            addr,
            if acceptor.is_some() { "tls" } else { "plaintext" }
        );
        set_subsystem_health(&health, "agent_listener", SubsystemHealth::Healthy);

        let mut kill_receiver = ctx.get_kill_receiver();
        loop {
            tokio::select! {
                _ = kill_receiver.recv() => {
                    tracing::debug!("Agent listener shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            tracing::warn!("Accept failed: {}", err);
                            continue;
                        }
                    };
                    tracing::debug!("Agent connection from {}", peer);

                    let orchestrator = orchestrator.clone();
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        let result = match acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(stream) => {
                                    let client_cert_verified = stream
                                        .get_ref()
                                        .1
                                        .peer_certificates()
                                        .is_some();
                                    orchestrator.serve_agent(stream, client_cert_verified).await
                                }
                                Err(err) => {
                                    tracing::warn!("TLS handshake from {} failed: {}", peer, err);
                                    return;
                                }
                            },
                            None => orchestrator.serve_agent(stream, false).await,
                        };
                        if let Err(err) = result {
                            tracing::info!("Session from {} ended: {}", peer, err);
                        }
                    });
                }
            }
        }

        // give connected agents the chance to finish and reconnect elsewhere
        orchestrator.drain_all();
        Ok(())
    })
}

fn load_tls_acceptor(config: &Config) -> Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) => (cert, key),
        (None, None) => {
            if config.auth_mode == AuthMode::Mtls {
                bail!("auth_mode mtls requires tls_cert and tls_key");
            }
            return Ok(None);
        }
        _ => bail!("tls_cert and tls_key must both be set or both be unset"),
    };

    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let builder = rustls::ServerConfig::builder();
    let server_config = match (&config.tls_client_ca, config.auth_mode) {
        (Some(ca_path), _) => {
            let mut roots = rustls::RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                roots
                    .add(cert)
                    .context("adding client ca certificate to the root store")?;
            }
            let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .context("building the client certificate verifier")?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)?
        }
        (None, AuthMode::Mtls) => bail!("auth_mode mtls requires tls_client_ca"),
        (None, _) => builder.with_no_client_auth().with_single_cert(certs, key)?,
    };

    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}

fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("opening certificate file {:?}", path))?,
    );
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("parsing certificates from {:?}", path))?;
    if certs.is_empty() {
        bail!("no certificates found in {:?}", path);
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("opening key file {:?}", path))?,
    );
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("parsing private key from {:?}", path))?
        .with_context(|| format!("no private key found in {:?}", path))
}
