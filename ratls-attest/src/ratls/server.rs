use crate::attestation::{AttestationService, BindingDigest, Evidence, SessionMaterial};
use crate::ratls::EVIDENCE_EXTENSION_OID;
use anyhow::{Context, Result};
use rcgen::{
    Certificate, CertificateParams, CustomExtension, DistinguishedName, DnType, KeyPair,
    PKCS_ECDSA_P256_SHA256,
};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use time::OffsetDateTime;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Backdating applied to `not_before` so slightly slow peer clocks still accept the cert.
const NOT_BEFORE_BACKDATE: Duration = Duration::from_secs(60);

/// One generation of RA-TLS key, certificate and the evidence bound to it.
pub struct RaTlsMaterial {
    pub cert_der: Vec<u8>,
    key_der: Zeroizing<Vec<u8>>,
    pub spki_der: Vec<u8>,
    pub evidence: Evidence,
    pub binding: BindingDigest,
    pub generated_at: SystemTime,
}

impl RaTlsMaterial {
    /// rustls server configuration presenting this certificate.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        tls_server_no_client_auth(&self.cert_der, &self.key_der)
    }
}

/// Generates a fresh ephemeral key, obtains evidence bound to its SPKI and
/// embeds that evidence in a self-signed certificate for the same key.
pub async fn generate_ratls_material(
    service: &AttestationService,
    subject_alt_names: &[String],
    validity: Duration,
) -> Result<RaTlsMaterial> {
    let key = KeyPair::generate(&PKCS_ECDSA_P256_SHA256).context("rcgen: generate key")?;
    let pkcs8 = Zeroizing::new(key.serialize_der());

    // Throwaway certificate for the same key: its SPKI is exactly what peers
    // will extract from the final certificate.
    let probe = Certificate::from_params(params(subject_alt_names, validity, key, None))
        .context("rcgen: probe certificate")?;
    let probe_der = probe.serialize_der().context("rcgen: serialize probe")?;
    let material = SessionMaterial::from_certificate(&probe_der)?;

    let evidence = service.issue(&material).await?;
    let binding = material.digest();

    let key = KeyPair::from_der(&pkcs8).context("rcgen: reload key")?;
    let cert = Certificate::from_params(params(
        subject_alt_names,
        validity,
        key,
        Some(evidence.to_bundle()),
    ))
    .context("rcgen: RA-TLS certificate")?;
    let cert_der = cert.serialize_der().context("rcgen: serialize RA-TLS certificate")?;
    let presented = SessionMaterial::from_certificate(&cert_der)?;
    debug_assert_eq!(presented.digest(), binding);

    info!(binding = %binding, format = %evidence.format(), "generated RA-TLS material");
    Ok(RaTlsMaterial {
        spki_der: presented.as_bytes().to_vec(),
        cert_der,
        key_der: Zeroizing::new(cert.serialize_private_key_der()),
        evidence,
        binding,
        generated_at: SystemTime::now(),
    })
}

fn params(
    subject_alt_names: &[String],
    validity: Duration,
    key: KeyPair,
    bundle: Option<Vec<u8>>,
) -> CertificateParams {
    let now = SystemTime::now();
    let mut params = CertificateParams::new(subject_alt_names.to_vec());
    params.alg = &PKCS_ECDSA_P256_SHA256;
    params.key_pair = Some(key);

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "ratls-attest");
    params.distinguished_name = dn;

    params.not_before = OffsetDateTime::from(now - NOT_BEFORE_BACKDATE);
    params.not_after = OffsetDateTime::from(now + validity);

    if let Some(bundle) = bundle {
        params.custom_extensions = vec![CustomExtension::from_oid_content(
            EVIDENCE_EXTENSION_OID,
            bundle,
        )];
    }
    params
}

/// TLS for the public listener: no client auth; the server is authenticated by its evidence.
pub fn tls_server_no_client_auth(cert_der: &[u8], key_der: &[u8]) -> Result<Arc<ServerConfig>> {
    debug!(cert_len = cert_der.len(), "building rustls ServerConfig");
    let certs = vec![CertificateDer::from(cert_der.to_vec())];
    let key = PrivatePkcs8KeyDer::from(key_der.to_vec()).into();

    let mut cfg = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .context("rustls protocol versions")?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .context("failed to configure rustls with certificate and key")?;

    cfg.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(cfg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::sim::SimulatedIdentity;
    use crate::attestation::{Policy, SimulatedSource};
    use crate::ratls::extract_evidence;

    #[tokio::test]
    async fn certificate_carries_evidence_bound_to_its_key() {
        let identity = SimulatedIdentity::generate().expect("identity");
        let policy = Policy::new(
            &identity.root_fingerprint(),
            Duration::from_secs(300),
            Duration::from_secs(30),
        )
        .allow_image_digest(vec![1; 32])
        .with_simulation(true);
        let service = AttestationService::new(
            Arc::new(SimulatedSource::new(identity, vec![1; 32])),
            Arc::new(policy),
        );

        let material = generate_ratls_material(&service, &["localhost".into()], Duration::from_secs(600))
            .await
            .expect("material");
        let bundle = extract_evidence(&material.cert_der).expect("extension");
        assert_eq!(Evidence::from_bundle(&bundle).expect("bundle"), material.evidence);

        let session = SessionMaterial::from_certificate(&material.cert_der).expect("spki");
        assert_eq!(session.digest(), material.binding);
        assert!(service
            .verify(&bundle, &session, SystemTime::now())
            .is_accepted());
        material.server_config().expect("server config");
    }
}
