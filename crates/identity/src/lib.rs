//! Attestation-backed device registration for TrustClient.
//!
//! This crate establishes trust between a device and a registration service:
//! it proves device identity with hardware key attestation, runs a
//! replay-protected registration handshake, and obtains and rotates a
//! mutual-TLS client certificate bound to a hardware key.
//!
//! # Core Concepts
//!
//! - **Identities**: a device signing key and an mTLS key per context, both
//!   resident in an injected [`KeyStore`]
//! - **Attestation**: platform evidence bound to the signing key's JWK
//!   thumbprint and the server nonce
//! - **Envelopes**: ES256 compact JWS carrying the JWK, the nonce and the
//!   attestation or assertion
//! - **CSRs**: PKCS#10 requests encoded by hand and self-verified before use
//!
//! # Collaborators
//!
//! Key storage, certificate storage, platform attestation and settings
//! persistence are traits. [`SoftwareKeyStore`] and [`MemorySettings`] are
//! in-process implementations for hosts without secure hardware and for
//! tests.

pub mod attestation;
pub mod certificate;
pub mod csr;
pub mod der;
pub mod error;
pub mod identity;
pub mod jose;
pub mod keys;
pub mod keystore;
pub mod registration;
pub mod schema;

pub use attestation::{
    AttestationProvider, AttestationService, Attester, MemorySettings, SettingsStore,
};
pub use certificate::Certificate;
pub use csr::{build_csr, CsrBuilder, CsrOptions, DistinguishedName};
pub use der::IntegerPadding;
pub use error::{Result, TrustClientError};
pub use identity::{ClientIdentity, IdentityManager, IdentityProfile, KeyTags};
pub use jose::{AttestationExtension, CompactJws, Jwk, JwsHeader};
pub use keys::{EcCurve, KeyAccessPolicy, KeyGenParams, PublicKey};
pub use keystore::{CertificateStore, HardwareKey, KeyStore, SoftwareKeyStore};
pub use registration::{derive_state, ClientState, RegistrationEngine, StateTransition};
pub use schema::{
    EchoOutput, RegisteredClient, RegistrationChallenge, RegistrationInput, RegistrationOutput,
    RegistrationStatus, TlsCertificate,
};

// Re-export core types for convenience
pub use trustclient_core::{ClientConfig, Endpoints};
