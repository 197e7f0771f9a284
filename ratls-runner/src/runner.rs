use anyhow::{anyhow, Context, Result};
use ratls_attest::attestation::AttestationService;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::handlers::shutdown_signal;
use crate::router::build_ratls_router;
use crate::server::serve_ratls_https;
use crate::state::{CertificateIssuer, PublicState};

/// Top-level orchestrator for the RA-TLS HTTP server.
pub struct Runner {
    service: AttestationService,
    issuer: Arc<CertificateIssuer>,
    public_listener: TcpListener,
    shutdown: CancellationToken,
}

impl Runner {
    /// Bind a TCP listener, annotating errors with context.
    async fn bind(addr: SocketAddr, description: &str) -> Result<TcpListener> {
        info!(%addr, "binding {} listener", description);
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {} addr {}", description, addr))
    }

    pub fn builder(cfg: Config, service: AttestationService) -> RunnerBuilder {
        RunnerBuilder::from(cfg, service)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.public_listener
            .local_addr()
            .context("public listener address")
    }

    /// Token that stops the runner when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs the server until a shutdown signal is received or the token is cancelled.
    pub async fn run(self) -> Result<()> {
        tracing::debug!("starting runner");

        let Runner {
            service,
            issuer,
            public_listener,
            shutdown,
        } = self;

        let app = build_ratls_router(PublicState { service });
        let ratls_handle = tokio::spawn(serve_ratls_https(
            public_listener,
            app,
            issuer,
            shutdown.clone(),
        ));

        tokio::select! {
            _ = shutdown_signal() => info!("shutdown signal received, exiting"),
            _ = shutdown.cancelled() => info!("shutdown requested, exiting"),
        }
        shutdown.cancel();

        if let Err(e) = ratls_handle.await {
            error!(error = ?e, "RA-TLS server task panicked");
        }

        Ok(())
    }
}

pub struct RunnerBuilder {
    cfg: Config,
    service: AttestationService,
    public_listener: Option<TcpListener>,
    shutdown: CancellationToken,
}

impl RunnerBuilder {
    pub fn from(cfg: Config, service: AttestationService) -> Self {
        Self {
            cfg,
            service,
            public_listener: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn bind_public(mut self) -> Result<Self> {
        let listener = Runner::bind(self.cfg.public_addr, "public").await?;
        self.public_listener = Some(listener);
        Ok(self)
    }

    fn issuer(&self) -> CertificateIssuer {
        CertificateIssuer::new(
            self.service.clone(),
            self.cfg.server_names.clone(),
            self.cfg.certificate_validity(),
        )
    }

    /// Mints and discards one set of RA-TLS material so a broken evidence
    /// source fails startup instead of every handshake.
    pub async fn check_evidence_source(self) -> Result<Self> {
        let served = self
            .issuer()
            .issue()
            .await
            .context("startup RA-TLS material check")?;
        info!(format = %served.material.evidence.format(), "evidence source ready");
        Ok(self)
    }

    pub async fn build(self) -> Result<Runner> {
        let issuer = Arc::new(self.issuer());
        let public_listener = self
            .public_listener
            .ok_or_else(|| anyhow!("public listener not bound"))?;

        Ok(Runner {
            service: self.service,
            issuer,
            public_listener,
            shutdown: self.shutdown,
        })
    }
}
