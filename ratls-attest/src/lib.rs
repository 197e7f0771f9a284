//! Remote attestation for TLS sessions: evidence acquisition, verification
//! against a pinned hardware root and policy, and binding to the handshake key.

pub mod attestation;
pub mod ratls;
