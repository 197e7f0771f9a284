use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
/// Runtime configuration loaded from `RUNNER_*` environment variables.
pub struct Config {
    pub log_level: Option<String>,

    #[serde(default = "def_public_addr")]
    pub public_addr: SocketAddr,

    /// Lifetime of each per-connection RA-TLS certificate.
    #[serde(default = "def_cert_validity_secs")]
    pub cert_validity_secs: u64,

    /// Subject alternative names placed in the RA-TLS certificate.
    #[serde(default = "def_server_names")]
    pub server_names: Vec<String>,
}

impl Config {
    /// Populates the configuration from environment variables, honoring `.env`.
    pub fn from_env() -> anyhow::Result<Self> {
        tracing::debug!("fetching config");
        let _ = dotenvy::dotenv();
        let cfg: Self = envy::prefixed("RUNNER_").from_env()?;
        anyhow::ensure!(cfg.cert_validity_secs > 0, "RUNNER_CERT_VALIDITY_SECS must be positive");
        Ok(cfg)
    }

    pub fn certificate_validity(&self) -> Duration {
        Duration::from_secs(self.cert_validity_secs)
    }

    /// Emit the effective configuration via tracing.
    pub fn info(&self) {
        tracing::info!(
            public_addr = %self.public_addr,
            cert_validity_secs = self.cert_validity_secs,
            server_names = ?self.server_names,
            "effective config"
        );
        if self.public_addr.ip().is_unspecified() {
            tracing::warn!("binding to 0.0.0.0; make sure this is intentional");
        }
    }
}

fn def_public_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8443))
}

fn def_cert_validity_secs() -> u64 {
    3600
}

fn def_server_names() -> Vec<String> {
    vec!["localhost".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_unset() {
        let cfg: Config = envy::from_iter(Vec::<(String, String)>::new()).expect("config");
        assert_eq!(cfg.public_addr, def_public_addr());
        assert_eq!(cfg.certificate_validity(), Duration::from_secs(3600));
        assert_eq!(cfg.server_names, vec!["localhost".to_string()]);
    }

    #[test]
    fn reads_overrides() {
        let cfg: Config = envy::from_iter(vec![
            ("PUBLIC_ADDR".to_string(), "0.0.0.0:9443".to_string()),
            ("CERT_VALIDITY_SECS".to_string(), "60".to_string()),
            ("SERVER_NAMES".to_string(), "a.example,b.example".to_string()),
        ])
        .expect("config");
        assert_eq!(cfg.public_addr.port(), 9443);
        assert_eq!(cfg.certificate_validity(), Duration::from_secs(60));
        assert_eq!(cfg.server_names.len(), 2);
    }
}
