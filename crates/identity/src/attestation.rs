//! Platform key attestation bound to the registration handshake.
//!
//! The registration engine only sees [`AttestationProvider`]. [`Attester`]
//! implements it over a platform [`AttestationService`] and a
//! [`SettingsStore`] that remembers which platform key has been attested.
//!
//! # Challenge binding
//!
//! Every attestation or assertion is bound to
//! `thumbprint_bytes ‖ nonce_utf8`, i.e. to both the device signing key and
//! the nonce of the request that carries it. [`Attester`] hands the
//! platform `SHA-256` of that challenge as its client-data hash.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{Result, TrustClientError};

/// Attestation and assertion production as consumed by the registration engine.
#[async_trait]
pub trait AttestationProvider: Send + Sync {
    /// Whether attestation is available on this runtime.
    async fn is_ready(&self) -> bool;

    /// Attestation object for `challenge`, creating the attestation key on
    /// first use.
    async fn attest(&self, challenge: &[u8]) -> Result<Vec<u8>>;

    /// Assertion over `challenge` from the already attested key.
    async fn assertion(&self, challenge: &[u8]) -> Result<Vec<u8>>;
}

/// Challenge bytes for a JWK thumbprint (base64url) and a server nonce.
pub fn challenge(thumbprint: &str, nonce: &str) -> Result<Vec<u8>> {
    let mut bytes = URL_SAFE_NO_PAD
        .decode(thumbprint)
        .map_err(|e| TrustClientError::protocol(format!("invalid thumbprint encoding: {e}")))?;
    bytes.extend_from_slice(nonce.as_bytes());
    Ok(bytes)
}

/// Hash handed to the platform for a challenge.
pub fn client_data_hash(challenge: &[u8]) -> [u8; 32] {
    Sha256::digest(challenge).into()
}

/// Platform attestation primitives (App Attest, Play Integrity, a TPM...).
#[async_trait]
pub trait AttestationService: Send + Sync {
    fn is_supported(&self) -> bool;

    /// Create a new platform key and return its opaque identifier.
    async fn generate_key(&self) -> Result<String>;

    async fn attest_key(&self, key_id: &str, client_data_hash: &[u8]) -> Result<Vec<u8>>;

    async fn generate_assertion(&self, key_id: &str, client_data_hash: &[u8]) -> Result<Vec<u8>>;
}

/// Small persistent string settings.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;
}

/// Process-local [`SettingsStore`].
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.values
            .lock()
            .map_err(|_| TrustClientError::key_store("settings lock poisoned"))
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values()?.remove(key);
        Ok(())
    }
}

/// [`AttestationProvider`] over a platform service, persisting the
/// attestation key id under `settings_key`.
pub struct Attester {
    service: Arc<dyn AttestationService>,
    settings: Arc<dyn SettingsStore>,
    settings_key: String,
}

impl Attester {
    pub fn new(
        service: Arc<dyn AttestationService>,
        settings: Arc<dyn SettingsStore>,
        settings_key: impl Into<String>,
    ) -> Self {
        Self {
            service,
            settings,
            settings_key: settings_key.into(),
        }
    }

    /// Persisted attestation key id, if one was created.
    pub fn key_id(&self) -> Result<Option<String>> {
        self.settings.get(&self.settings_key)
    }

    /// Forget the attestation key; the next `attest` creates a new one.
    pub fn forget_key(&self) -> Result<()> {
        self.settings.remove(&self.settings_key)
    }

    fn ensure_supported(&self) -> Result<()> {
        if self.service.is_supported() {
            Ok(())
        } else {
            Err(TrustClientError::RuntimeUnsupported(
                "platform attestation is not available".to_string(),
            ))
        }
    }
}

#[async_trait]
impl AttestationProvider for Attester {
    async fn is_ready(&self) -> bool {
        self.service.is_supported()
    }

    async fn attest(&self, challenge: &[u8]) -> Result<Vec<u8>> {
        self.ensure_supported()?;

        let key_id = match self.key_id()? {
            Some(id) => id,
            None => {
                let id = self.service.generate_key().await?;
                self.settings.set(&self.settings_key, &id)?;
                info!(settings_key = %self.settings_key, "Created attestation key");
                id
            }
        };

        let hash = client_data_hash(challenge);
        debug!(client_data_hash = %hex::encode(hash), "Requesting attestation");
        let object = self.service.attest_key(&key_id, &hash).await?;
        debug!(len = object.len(), "Produced attestation object");
        Ok(object)
    }

    async fn assertion(&self, challenge: &[u8]) -> Result<Vec<u8>> {
        self.ensure_supported()?;
        let key_id = self.key_id()?.ok_or(TrustClientError::NotYetAttested)?;

        let hash = client_data_hash(challenge);
        let assertion = self.service.generate_assertion(&key_id, &hash).await?;
        debug!(len = assertion.len(), "Produced assertion");
        Ok(assertion)
    }
}
