use crate::config::Config;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVES: &str = "info,ratls_attest=info,tower_http=info";

/// `RUST_LOG` wins; otherwise `RUNNER_LOG_LEVEL`, then the built-in directives.
fn filter_for(cfg: &Config, rust_log: Option<&str>) -> EnvFilter {
    let directives = rust_log
        .or(cfg.log_level.as_deref())
        .unwrap_or(DEFAULT_DIRECTIVES);
    EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Installs the process-wide `tracing` subscriber.
pub fn setup_logging(cfg: &Config) -> anyhow::Result<()> {
    let rust_log = std::env::var("RUST_LOG").ok();
    tracing_subscriber::fmt()
        .with_env_filter(filter_for(cfg, rust_log.as_deref()))
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("install tracing subscriber: {e}"))?;

    debug!(log_level = ?cfg.log_level, "logging initialized");
    Ok(())
}
