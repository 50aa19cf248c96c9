//! Hardware-backed client identities and their lifecycle.
//!
//! A context owns two identities: the device signing key used for protocol
//! JWS messages, and the mTLS key with the certificate the server issued for
//! it. Both are plain tags in the injected stores; what differs between them
//! (curve, access policy) is an [`IdentityProfile`].
//!
//! Operations that delete and recreate entries under a tag are not safe to
//! run concurrently for the same context. Callers serialize them.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::certificate::Certificate;
use crate::error::{Result, TrustClientError};
use crate::keys::{EcCurve, KeyAccessPolicy, KeyGenParams};
use crate::keystore::{CertificateStore, HardwareKey, KeyStore};

/// Store tags for one identity context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTags {
    /// Device signing key (`<prefix>:device:<context>`)
    pub device: String,
    /// mTLS key and certificate label (`<prefix>:mtls:<context>`)
    pub mtls: String,
    /// Settings key of the attestation key id (`<prefix>:attest:<context>`)
    pub attest: String,
}

impl KeyTags {
    pub fn new(prefix: &str, context: &str) -> Self {
        Self {
            device: format!("{prefix}:device:{context}"),
            mtls: format!("{prefix}:mtls:{context}"),
            attest: format!("{prefix}:attest:{context}"),
        }
    }
}

/// How keys under a tag are generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityProfile {
    pub curve: EcCurve,
    pub policy: KeyAccessPolicy,
}

impl Default for IdentityProfile {
    fn default() -> Self {
        Self {
            curve: EcCurve::P256,
            policy: KeyAccessPolicy::hardware_bound(),
        }
    }
}

impl IdentityProfile {
    fn key_gen_params(&self) -> KeyGenParams {
        KeyGenParams {
            curve: self.curve,
            policy: self.policy,
        }
    }
}

/// A key together with its installed certificate, if any.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub key: HardwareKey,
    /// `None` until the server issued a certificate; client TLS then
    /// proceeds without a client certificate.
    pub certificate: Option<Certificate>,
}

impl ClientIdentity {
    /// Whether the certificate certifies this identity's key.
    pub fn certificate_matches_key(&self) -> bool {
        self.certificate
            .as_ref()
            .map_or(false, |cert| cert.spki == self.key.public_key().spki_der())
    }
}

/// Owns key and certificate lifecycle for the tags it is asked about.
pub struct IdentityManager {
    key_store: Arc<dyn KeyStore>,
    cert_store: Arc<dyn CertificateStore>,
    default_profile: IdentityProfile,
    profiles: HashMap<String, IdentityProfile>,
}

impl IdentityManager {
    pub fn new(key_store: Arc<dyn KeyStore>, cert_store: Arc<dyn CertificateStore>) -> Self {
        Self {
            key_store,
            cert_store,
            default_profile: IdentityProfile::default(),
            profiles: HashMap::new(),
        }
    }

    /// Use `profile` when generating keys under `tag`.
    pub fn with_profile(mut self, tag: impl Into<String>, profile: IdentityProfile) -> Self {
        self.profiles.insert(tag.into(), profile);
        self
    }

    pub fn profile(&self, tag: &str) -> IdentityProfile {
        self.profiles
            .get(tag)
            .copied()
            .unwrap_or(self.default_profile)
    }

    /// Existing key under `tag`, or a freshly generated one.
    pub fn ensure_key(&self, tag: &str) -> Result<HardwareKey> {
        if let Some(public_key) = self.key_store.find_key(tag)? {
            return Ok(HardwareKey::new(self.key_store.clone(), tag, public_key));
        }

        // A lookup miss can still leave an unusable entry behind
        self.key_store.delete_key(tag)?;
        let profile = self.profile(tag);
        let public_key = self.key_store.generate_key(tag, &profile.key_gen_params())?;
        info!(tag, curve = ?profile.curve, "Generated hardware key");
        Ok(HardwareKey::new(self.key_store.clone(), tag, public_key))
    }

    /// Installed certificate under `tag`, if any.
    pub fn certificate(&self, tag: &str) -> Result<Option<Certificate>> {
        self.cert_store
            .find_certificate(tag)?
            .map(|der| Certificate::from_der(&der))
            .transpose()
    }

    /// Replace the certificate under `tag` and return the reloaded identity.
    pub fn install_certificate(&self, tag: &str, certificate: &Certificate) -> Result<ClientIdentity> {
        self.cert_store.delete_certificate(tag)?;
        self.cert_store.store_certificate(tag, &certificate.der)?;
        info!(
            tag,
            serial = %certificate.serial,
            not_after = certificate.not_after,
            "Installed certificate"
        );

        let identity = self.current_identity(tag)?;
        if !identity.certificate_matches_key() {
            warn!(tag, "Installed certificate does not certify the key under this tag");
        }
        Ok(identity)
    }

    /// Key under `tag` with its certificate. A missing key is an error.
    pub fn current_identity(&self, tag: &str) -> Result<ClientIdentity> {
        let public_key = self
            .key_store
            .find_key(tag)?
            .ok_or_else(|| TrustClientError::key_store(format!("no key for tag {tag}")))?;
        let certificate = self.certificate(tag)?;
        if certificate.is_none() {
            warn!(tag, "No certificate installed; client TLS proceeds without one");
        }
        Ok(ClientIdentity {
            key: HardwareKey::new(self.key_store.clone(), tag, public_key),
            certificate,
        })
    }

    /// Delete certificate and key under `tag`, then generate a new key.
    pub fn reset(&self, tag: &str) -> Result<HardwareKey> {
        self.cert_store.delete_certificate(tag)?;
        self.key_store.delete_key(tag)?;
        info!(tag, "Reset identity");
        self.ensure_key(tag)
    }
}
