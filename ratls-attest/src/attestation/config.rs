use crate::attestation::certs::load_pinned_root;
use crate::attestation::util::{hex_to_bytes, normalize_fingerprint};
use anyhow::{anyhow, Context};
use serde::Deserialize;
use std::{collections::HashSet, path::PathBuf, time::Duration};

/// Default ceiling on certificate chain length.
pub const DEFAULT_MAX_CHAIN_LEN: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Certificate serials (lowercase hex of the raw DER integer) that must be rejected.
pub struct RevocationList {
    serials: HashSet<String>,
}

impl RevocationList {
    pub fn new<I, S>(serials: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            serials: serials
                .into_iter()
                .map(|s| s.as_ref().trim().trim_start_matches("0x").to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn is_revoked(&self, serial_hex: &str) -> bool {
        self.serials.contains(&serial_hex.to_ascii_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.serials.is_empty()
    }
}

#[derive(Debug, Clone)]
/// Acceptance policy and trust anchor for verification.
///
/// Built once, then shared read-only (typically behind an `Arc`) by every
/// verification attempt.
pub struct Policy {
    /// Image digests that may run in the attested environment.
    pub allowed_image_digests: HashSet<Vec<u8>>,
    /// Oldest evidence accepted, measured from its `iat` claim.
    pub max_evidence_age: Duration,
    /// Drift absorbed on `not_before` edges and future `iat` values.
    pub clock_skew_tolerance: Duration,
    pub require_secure_boot: bool,
    pub allow_debug: bool,
    /// Test-only: accept evidence from the simulated generator.
    pub simulate_allowed: bool,
    /// SHA-256 fingerprint of the hardware root (uppercase hex with colons).
    pub pinned_root: String,
    pub expected_issuer: Option<String>,
    pub max_chain_len: usize,
    pub revocation: Option<RevocationList>,
}

impl Policy {
    /// A policy pinned to `pinned_root` with the two time bounds supplied explicitly.
    ///
    /// Everything else starts at its strict setting: no allowed digests,
    /// secure boot required, debug and simulation rejected.
    pub fn new(pinned_root: &str, max_evidence_age: Duration, clock_skew_tolerance: Duration) -> Self {
        Self {
            allowed_image_digests: HashSet::new(),
            max_evidence_age,
            clock_skew_tolerance,
            require_secure_boot: true,
            allow_debug: false,
            simulate_allowed: false,
            pinned_root: normalize_fingerprint(pinned_root),
            expected_issuer: None,
            max_chain_len: DEFAULT_MAX_CHAIN_LEN,
            revocation: None,
        }
    }

    pub fn allow_image_digest(mut self, digest: impl Into<Vec<u8>>) -> Self {
        self.allowed_image_digests.insert(digest.into());
        self
    }

    pub fn with_simulation(mut self, allowed: bool) -> Self {
        self.simulate_allowed = allowed;
        self
    }

    pub fn with_expected_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.expected_issuer = Some(issuer.into());
        self
    }

    pub fn with_revocation(mut self, list: RevocationList) -> Self {
        self.revocation = Some(list);
        self
    }
}

fn default_true() -> bool {
    true
}

fn default_max_chain_len() -> usize {
    DEFAULT_MAX_CHAIN_LEN
}

#[derive(Clone, Debug, Deserialize)]
/// Policy as read from `ATTEST_*` environment variables.
///
/// Evidence age and clock skew have no defaults: they must be configured.
pub struct PolicyConfig {
    #[serde(default)]
    pub allowed_image_digests: Vec<String>,
    pub max_evidence_age_secs: u64,
    pub clock_skew_tolerance_secs: u64,
    #[serde(default)]
    pub simulate_allowed: bool,
    #[serde(default = "default_true")]
    pub require_secure_boot: bool,
    #[serde(default)]
    pub allow_debug: bool,
    pub pinned_root_fingerprint: Option<String>,
    pub pinned_root_pem_path: Option<PathBuf>,
    pub expected_issuer: Option<String>,
    #[serde(default = "default_max_chain_len")]
    pub max_chain_len: usize,
    #[serde(default)]
    pub revoked_serials: Vec<String>,
}

impl PolicyConfig {
    /// Populates the configuration from environment variables, honoring `.env`.
    pub fn from_env() -> anyhow::Result<Self> {
        tracing::debug!("fetching attestation policy config");
        let _ = dotenvy::dotenv();
        let cfg: Self = envy::prefixed("ATTEST_")
            .from_env()
            .context("read ATTEST_* policy configuration")?;
        Ok(cfg)
    }

    /// Resolves the pinned root and digests into an immutable [`Policy`].
    pub fn into_policy(self) -> anyhow::Result<Policy> {
        let pinned_root = match (&self.pinned_root_fingerprint, &self.pinned_root_pem_path) {
            (Some(fp), _) => normalize_fingerprint(fp),
            (None, Some(path)) => {
                let root = load_pinned_root(path)?;
                tracing::info!(subject = %root.subject_display, path = ?path, "pinned root loaded");
                root.fingerprint
            }
            (None, None) => {
                return Err(anyhow!(
                    "set ATTEST_PINNED_ROOT_FINGERPRINT or ATTEST_PINNED_ROOT_PEM_PATH"
                ))
            }
        };
        anyhow::ensure!(self.max_chain_len >= 1, "max_chain_len must be at least 1");

        let mut allowed = HashSet::with_capacity(self.allowed_image_digests.len());
        for entry in &self.allowed_image_digests {
            let digest = hex_to_bytes(entry.trim_start_matches("sha256:"))
                .with_context(|| format!("allowed image digest {entry:?}"))?;
            allowed.insert(digest);
        }

        // Blank entries (e.g. an empty env var) leave revocation disabled.
        let revocation = Some(RevocationList::new(&self.revoked_serials)).filter(|l| !l.is_empty());

        Ok(Policy {
            allowed_image_digests: allowed,
            max_evidence_age: Duration::from_secs(self.max_evidence_age_secs),
            clock_skew_tolerance: Duration::from_secs(self.clock_skew_tolerance_secs),
            require_secure_boot: self.require_secure_boot,
            allow_debug: self.allow_debug,
            simulate_allowed: self.simulate_allowed,
            pinned_root,
            expected_issuer: self.expected_issuer,
            max_chain_len: self.max_chain_len,
            revocation,
        })
    }

    /// Emit the effective policy via tracing.
    pub fn info(&self) {
        tracing::info!(
            allowed_digests = self.allowed_image_digests.len(),
            max_evidence_age_secs = self.max_evidence_age_secs,
            clock_skew_tolerance_secs = self.clock_skew_tolerance_secs,
            require_secure_boot = self.require_secure_boot,
            "effective attestation policy"
        );
        if self.simulate_allowed {
            tracing::warn!("simulated evidence is accepted; never enable this in production");
        }
        if self.allow_debug {
            tracing::warn!("debug-mode TEEs are accepted");
        }
    }
}

fn default_provider_socket() -> PathBuf {
    PathBuf::from("/run/container_launcher/teeserver.sock")
}

fn default_provider_timeout_secs() -> u64 {
    10
}

fn default_audience() -> String {
    "https://sts.google.com".to_string()
}

#[derive(Clone, Debug, Deserialize)]
/// Evidence source selection, read from `EVIDENCE_*` environment variables.
pub struct SourceConfig {
    /// Forces the simulated generator; local testing only.
    #[serde(default)]
    pub force_simulated: bool,
    #[serde(default = "default_provider_socket")]
    pub provider_socket: PathBuf,
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
    #[serde(default = "default_audience")]
    pub audience: String,
    /// Hex image digest the simulated generator reports.
    pub simulated_image_digest: Option<String>,
    /// PEM bundle holding the simulated chain and signing key; created on
    /// first use so its root can be pinned ahead of time.
    pub simulated_identity_path: Option<PathBuf>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            force_simulated: false,
            provider_socket: default_provider_socket(),
            provider_timeout_secs: default_provider_timeout_secs(),
            audience: default_audience(),
            simulated_image_digest: None,
            simulated_identity_path: None,
        }
    }
}

impl SourceConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();
        let cfg: Self = envy::prefixed("EVIDENCE_")
            .from_env()
            .context("read EVIDENCE_* source configuration")?;
        Ok(cfg)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> PolicyConfig {
        PolicyConfig {
            allowed_image_digests: vec!["sha256:".to_string() + &"ab".repeat(32)],
            max_evidence_age_secs: 300,
            clock_skew_tolerance_secs: 30,
            simulate_allowed: false,
            require_secure_boot: true,
            allow_debug: false,
            pinned_root_fingerprint: Some("aa".repeat(32)),
            pinned_root_pem_path: None,
            expected_issuer: None,
            max_chain_len: DEFAULT_MAX_CHAIN_LEN,
            revoked_serials: vec!["0x0A0B".into()],
        }
    }

    #[test]
    fn into_policy_normalizes_inputs() {
        let policy = base_config().into_policy().expect("policy");
        assert!(policy.allowed_image_digests.contains(&vec![0xAB; 32]));
        assert_eq!(policy.pinned_root, normalize_fingerprint(&"AA".repeat(32)));
        assert_eq!(policy.max_evidence_age, Duration::from_secs(300));
        assert!(policy.revocation.as_ref().expect("revocation").is_revoked("0a0b"));
    }

    #[test]
    fn blank_revoked_serials_disable_revocation() {
        let mut cfg = base_config();
        cfg.revoked_serials = vec![" ".into(), String::new()];
        assert!(cfg.into_policy().expect("policy").revocation.is_none());
    }

    #[test]
    fn pinned_root_is_required() {
        let mut cfg = base_config();
        cfg.pinned_root_fingerprint = None;
        assert!(cfg.into_policy().is_err());
    }

    #[test]
    fn bad_digest_hex_is_rejected() {
        let mut cfg = base_config();
        cfg.allowed_image_digests = vec!["not-hex".into()];
        assert!(cfg.into_policy().is_err());
    }

    #[test]
    fn time_bounds_have_no_defaults() {
        let vars = vec![
            ("PINNED_ROOT_FINGERPRINT".to_string(), "AA".to_string()),
            ("CLOCK_SKEW_TOLERANCE_SECS".to_string(), "30".to_string()),
        ];
        let parsed: Result<PolicyConfig, _> = envy::from_iter(vars);
        assert!(parsed.is_err());
    }

    #[test]
    fn policy_config_reads_lists_from_env_style_pairs() {
        let vars = vec![
            ("MAX_EVIDENCE_AGE_SECS".to_string(), "60".to_string()),
            ("CLOCK_SKEW_TOLERANCE_SECS".to_string(), "5".to_string()),
            ("PINNED_ROOT_FINGERPRINT".to_string(), "AB:CD".to_string()),
            (
                "ALLOWED_IMAGE_DIGESTS".to_string(),
                format!("{},{}", "01".repeat(32), "02".repeat(32)),
            ),
        ];
        let cfg: PolicyConfig = envy::from_iter(vars).expect("config");
        assert_eq!(cfg.allowed_image_digests.len(), 2);
        assert!(cfg.require_secure_boot);
        assert!(!cfg.simulate_allowed);
        let policy = cfg.into_policy().expect("policy");
        assert_eq!(policy.pinned_root, "AB:CD");
    }
}
