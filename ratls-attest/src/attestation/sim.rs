//! Test-only attestation identity: a locally generated root, intermediate and
//! signing leaf that produce documents shaped exactly like hardware evidence.

use crate::attestation::certs::public_key_of;
use crate::attestation::cose;
use crate::attestation::errors::AttnError;
use crate::attestation::types::{claims, CertificateChain, ClaimValue};
use crate::attestation::util::{sha256_fingerprint, unix_secs};
use anyhow::{anyhow, Context};
use pem::{EncodeConfig, LineEnding, Pem};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa,
    KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use rustls_pemfile::Item;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{self, Cursor, Write};
use std::path::Path;
use std::time::{Duration, SystemTime};
use time::OffsetDateTime;
use x509_parser::parse_x509_certificate;
use zeroize::Zeroizing;

/// Issuer claim carried by simulated evidence.
pub const SIMULATED_ISSUER: &str = "https://confidentialcomputing.simulated";
const SIMULATED_DEBUG_STATUS: &str = "disabled-since-boot";
const SIMULATED_SOFTWARE: &str = "CONFIDENTIAL_SPACE";

const DAY: Duration = Duration::from_secs(86_400);

/// Validity windows of the three generated certificates.
#[derive(Debug, Clone, Copy)]
pub struct IdentityWindows {
    pub root: (SystemTime, SystemTime),
    pub intermediate: (SystemTime, SystemTime),
    pub leaf: (SystemTime, SystemTime),
}

impl IdentityWindows {
    /// Windows that comfortably contain `now`, widest at the root.
    pub fn around(now: SystemTime) -> Self {
        Self {
            root: (now - 365 * DAY, now + 3650 * DAY),
            intermediate: (now - 30 * DAY, now + 365 * DAY),
            leaf: (now - DAY, now + 30 * DAY),
        }
    }

    /// Windows for an identity written to disk and reused across restarts.
    pub fn persistent(now: SystemTime) -> Self {
        Self {
            root: (now - DAY, now + 3650 * DAY),
            intermediate: (now - DAY, now + 1825 * DAY),
            leaf: (now - DAY, now + 365 * DAY),
        }
    }
}

/// Root → intermediate → leaf chain plus the leaf's signing key.
pub struct SimulatedIdentity {
    /// Leaf first, root last.
    chain: Vec<Vec<u8>>,
    pkcs8: Zeroizing<Vec<u8>>,
    signing_key: EcdsaKeyPair,
    rng: SystemRandom,
}

impl SimulatedIdentity {
    pub fn generate() -> anyhow::Result<Self> {
        Self::generate_with(IdentityWindows::around(SystemTime::now()))
    }

    pub fn generate_with(windows: IdentityWindows) -> anyhow::Result<Self> {
        let root = build_certificate("Simulated Root CA", windows.root, true)?;
        // Every serialize call re-signs, so each DER is produced exactly once.
        let root_der = root.serialize_der().context("rcgen: serialize root")?;

        let intermediate =
            build_certificate("Simulated Intermediate CA", windows.intermediate, true)?;
        let intermediate_der = intermediate
            .serialize_der_with_signer(&root)
            .context("rcgen: sign intermediate")?;

        let leaf = build_certificate("Simulated Attestation Signer", windows.leaf, false)?;
        let leaf_der = leaf
            .serialize_der_with_signer(&intermediate)
            .context("rcgen: sign leaf")?;

        let pkcs8 = Zeroizing::new(leaf.serialize_private_key_der());
        let identity = Self::from_parts(vec![leaf_der, intermediate_der, root_der], pkcs8)?;
        tracing::debug!(
            root = %identity.root_fingerprint(),
            "generated simulated attestation identity"
        );
        Ok(identity)
    }

    /// Parses a PEM bundle holding the chain (leaf first) and the leaf's
    /// PKCS#8 private key, as written by [`SimulatedIdentity::to_pem`].
    pub fn from_pem(pem: &[u8]) -> anyhow::Result<Self> {
        let mut chain = Vec::new();
        let mut pkcs8 = None;
        for item in rustls_pemfile::read_all(&mut Cursor::new(pem)) {
            match item.context("parse simulated identity PEM")? {
                Item::X509Certificate(der) => chain.push(der.as_ref().to_vec()),
                Item::Pkcs8Key(key) => {
                    pkcs8 = Some(Zeroizing::new(key.secret_pkcs8_der().to_vec()));
                }
                _ => {}
            }
        }
        anyhow::ensure!(!chain.is_empty(), "simulated identity has no certificates");
        let pkcs8 = pkcs8.ok_or_else(|| anyhow!("simulated identity has no PKCS#8 key"))?;
        Self::from_parts(chain, pkcs8)
    }

    /// Loads the identity at `path`, or generates one and writes it there so
    /// later runs (and verifiers pinning its root) see the same chain.
    pub fn load_or_create(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => {
                let identity = Self::from_pem(&bytes)
                    .with_context(|| format!("load simulated identity {:?}", path))?;
                tracing::info!(path = ?path, root = %identity.root_fingerprint(), "loaded simulated identity");
                Ok(identity)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let identity = Self::generate_with(IdentityWindows::persistent(SystemTime::now()))?;
                write_private(path, identity.to_pem().as_bytes())?;
                tracing::info!(path = ?path, root = %identity.root_fingerprint(), "created simulated identity");
                Ok(identity)
            }
            Err(e) => Err(e).with_context(|| format!("read simulated identity {:?}", path)),
        }
    }

    fn from_parts(chain: Vec<Vec<u8>>, pkcs8: Zeroizing<Vec<u8>>) -> anyhow::Result<Self> {
        let rng = SystemRandom::new();
        let signing_key = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &pkcs8, &rng)
            .map_err(|e| anyhow!("load simulated signing key: {e}"))?;

        let leaf = chain.first().ok_or_else(|| anyhow!("empty simulated chain"))?;
        let (_, leaf) = parse_x509_certificate(leaf)
            .map_err(|e| anyhow!("parse simulated leaf certificate: {e}"))?;
        anyhow::ensure!(
            public_key_of(&leaf) == signing_key.public_key().as_ref(),
            "simulated signing key does not match the leaf certificate"
        );

        Ok(Self {
            chain,
            pkcs8,
            signing_key,
            rng,
        })
    }

    /// PEM bundle of the chain followed by the leaf's private key.
    pub fn to_pem(&self) -> Zeroizing<String> {
        let mut blocks: Vec<Pem> = self
            .chain
            .iter()
            .map(|der| Pem::new("CERTIFICATE", der.clone()))
            .collect();
        blocks.push(Pem::new("PRIVATE KEY", self.pkcs8.to_vec()));
        Zeroizing::new(pem::encode_many_config(&blocks, pem_config()))
    }

    pub fn chain(&self) -> CertificateChain {
        CertificateChain::new(self.chain.clone())
    }

    fn root_der(&self) -> &[u8] {
        // from_parts rejects an empty chain.
        self.chain.last().map(Vec::as_slice).unwrap_or_default()
    }

    /// Fingerprint to pin when trusting this identity.
    pub fn root_fingerprint(&self) -> String {
        sha256_fingerprint(self.root_der())
    }

    pub fn root_pem(&self) -> String {
        pem::encode_config(&Pem::new("CERTIFICATE", self.root_der().to_vec()), pem_config())
    }

    /// Fixed-width ES256 signature over `data` with the leaf key.
    pub fn sign_raw(&self, data: &[u8]) -> Result<Vec<u8>, AttnError> {
        self.signing_key
            .sign(&self.rng, data)
            .map(|sig| sig.as_ref().to_vec())
            .map_err(|_| AttnError::unavailable("simulated signing failed"))
    }

    /// Signs an arbitrary claim map into a COSE_Sign1 document carrying this chain.
    pub fn sign_claims(&self, claims: &BTreeMap<String, ClaimValue>) -> Result<Vec<u8>, AttnError> {
        cose::encode(claims, &self.chain(), |tbs| self.sign_raw(tbs))
    }
}

/// The claim set the simulated generator reports for one request.
pub fn simulated_claims(
    image_digest: &[u8],
    nonce: &[u8],
    issued_at: SystemTime,
    lifetime_secs: u64,
) -> BTreeMap<String, ClaimValue> {
    let iat = unix_secs(issued_at).max(0) as u64;
    let mut map = BTreeMap::new();
    map.insert(claims::ISSUER.into(), ClaimValue::Text(SIMULATED_ISSUER.into()));
    map.insert(claims::IMAGE_DIGEST.into(), ClaimValue::Digest(image_digest.to_vec()));
    map.insert(claims::ISSUED_AT.into(), ClaimValue::Timestamp(iat));
    map.insert(
        claims::EXPIRY.into(),
        ClaimValue::Timestamp(iat.saturating_add(lifetime_secs)),
    );
    map.insert(claims::NONCE.into(), ClaimValue::Digest(nonce.to_vec()));
    map.insert(claims::SECURE_BOOT.into(), ClaimValue::Bool(true));
    map.insert(
        claims::DEBUG_STATUS.into(),
        ClaimValue::Text(SIMULATED_DEBUG_STATUS.into()),
    );
    map.insert(
        claims::HARDWARE_MODEL.into(),
        ClaimValue::Text(claims::SIMULATED_HARDWARE.into()),
    );
    map.insert(
        claims::SOFTWARE_NAME.into(),
        ClaimValue::Text(SIMULATED_SOFTWARE.into()),
    );
    map
}

fn pem_config() -> EncodeConfig {
    EncodeConfig::new().set_line_ending(LineEnding::LF)
}

/// Creates `path` readable by the owner only; never overwrites.
fn write_private(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("create simulated identity {:?}", path))?;
    file.write_all(contents)
        .with_context(|| format!("write simulated identity {:?}", path))
}

fn build_certificate(
    common_name: &str,
    window: (SystemTime, SystemTime),
    is_ca: bool,
) -> anyhow::Result<Certificate> {
    let mut params = CertificateParams::default();
    params.alg = &PKCS_ECDSA_P256_SHA256;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "ratls-attest");
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;

    params.not_before = OffsetDateTime::from(window.0);
    params.not_after = OffsetDateTime::from(window.1);

    if is_ca {
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
    } else {
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    }

    Certificate::from_params(params).with_context(|| format!("rcgen: build {common_name}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::certs::ChainValidator;
    use crate::attestation::types::{Evidence, EvidenceFormat};

    #[test]
    fn generated_chain_is_leaf_first_with_ca_flags() {
        let identity = SimulatedIdentity::generate().expect("identity");
        let chain = identity.chain();
        assert_eq!(chain.len(), 3);

        let (_, leaf) = parse_x509_certificate(chain.get(0).expect("leaf")).expect("parse leaf");
        let (_, root) = parse_x509_certificate(chain.get(2).expect("root")).expect("parse root");
        assert!(!leaf.is_ca());
        assert!(root.is_ca());
        assert_eq!(root.subject(), root.issuer());
    }

    #[test]
    fn root_pem_matches_fingerprint() {
        let identity = SimulatedIdentity::generate().expect("identity");
        let pem = identity.root_pem();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.lines().all(|l| l.len() <= 64 || l.starts_with("-----")));
        assert_eq!(identity.root_fingerprint(), sha256_fingerprint(identity.root_der()));
    }

    #[test]
    fn pem_bundle_restores_the_same_identity() {
        let identity = SimulatedIdentity::generate().expect("identity");
        let restored = SimulatedIdentity::from_pem(identity.to_pem().as_bytes()).expect("restore");
        assert_eq!(restored.root_fingerprint(), identity.root_fingerprint());

        let map = simulated_claims(&[1; 32], &[2; 32], SystemTime::now(), 60);
        let document = restored.sign_claims(&map).expect("sign");
        let decoded = cose::decode(&Evidence::new(EvidenceFormat::Simulated, document)).expect("decode");
        ChainValidator::new(&identity.root_fingerprint(), 5, Duration::from_secs(30))
            .validate(&decoded.chain, SystemTime::now())
            .expect("restored chain validates");
    }

    #[test]
    fn pem_bundle_with_foreign_key_is_rejected() {
        let identity = SimulatedIdentity::generate().expect("identity");
        let other = SimulatedIdentity::generate().expect("other identity");
        let certs: String = identity
            .chain
            .iter()
            .map(|der| pem::encode_config(&Pem::new("CERTIFICATE", der.clone()), pem_config()))
            .collect();
        let key = pem::encode_config(&Pem::new("PRIVATE KEY", other.pkcs8.to_vec()), pem_config());
        let err = SimulatedIdentity::from_pem(format!("{certs}{key}").as_bytes())
            .err()
            .expect("mismatched key");
        assert!(err.to_string().contains("does not match"), "{err}");

        assert!(SimulatedIdentity::from_pem(certs.as_bytes()).is_err());
    }

    #[test]
    fn load_or_create_persists_the_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("identity.pem");
        let created = SimulatedIdentity::load_or_create(&path).expect("create");
        assert!(path.exists());
        let loaded = SimulatedIdentity::load_or_create(&path).expect("load");
        assert_eq!(loaded.root_fingerprint(), created.root_fingerprint());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
            assert_eq!(mode & 0o077, 0);
        }
    }

    #[test]
    fn simulated_claims_expire_after_lifetime() {
        let at = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let map = simulated_claims(&[1; 32], &[2; 32], at, 60);
        assert_eq!(map[claims::ISSUED_AT], ClaimValue::Timestamp(1_000));
        assert_eq!(map[claims::EXPIRY], ClaimValue::Timestamp(1_060));
        assert_eq!(
            map[claims::HARDWARE_MODEL],
            ClaimValue::Text(claims::SIMULATED_HARDWARE.into())
        );
    }
}
