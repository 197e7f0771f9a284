pub mod binding;
pub mod config;
pub mod errors;
pub mod policy;
pub mod service;
pub mod sim;
pub mod source;
pub mod types;

mod certs;
mod cose;
mod util;

pub use binding::{BindingDigest, ChannelBinder, SessionMaterial};
pub use certs::{load_pinned_root, ChainSummary, ChainValidator, RootMetadata};
pub use config::{Policy, PolicyConfig, RevocationList, SourceConfig};
pub use cose::{decode as decode_evidence, DecodedEvidence};
pub use errors::{AttnError, ErrorContext, ErrorKind, PolicyCheck};
pub use policy::PolicyEngine;
pub use service::{AttestationService, RetryPolicy, Stage};
pub use source::{select_source, EvidenceSource, HardwareSource, SimulatedSource};
pub use types::{
    CertificateChain, ClaimSet, ClaimValue, Evidence, EvidenceFormat, Nonce, VerificationResult,
};
