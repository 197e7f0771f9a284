use anyhow::Result;
use ratls_attest::attestation::{select_source, AttestationService, PolicyConfig, SourceConfig};
use std::sync::Arc;

mod config;
mod handlers;
mod logging;
mod router;
mod runner;
mod server;
mod state;

use runner::Runner;

/// Parses configuration, initialises logging, and runs the RA-TLS HTTP server.
#[tokio::main]
async fn main() -> Result<()> {
    let cfg = config::Config::from_env()?;
    logging::setup_logging(&cfg)?;
    cfg.info();

    let policy_cfg = PolicyConfig::from_env()?;
    policy_cfg.info();
    let policy = Arc::new(policy_cfg.into_policy()?);
    let source = select_source(&SourceConfig::from_env()?, &policy)?;
    let service = AttestationService::new(source, policy);

    let runner = Runner::builder(cfg, service)
        .bind_public()
        .await?
        .check_evidence_source()
        .await?
        .build()
        .await?;

    runner.run().await
}
