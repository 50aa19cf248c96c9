//! Key and certificate storage seams.
//!
//! A [`KeyStore`] owns private keys addressed by tag and signs on request;
//! a [`CertificateStore`] holds DER certificates addressed by label. On a
//! device both are backed by the platform keychain or secure element. The
//! [`SoftwareKeyStore`] keeps everything in process memory and is what the
//! tests and non-hardware hosts use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use p256::ecdsa::signature::hazmat::PrehashSigner;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Result, TrustClientError};
use crate::keys::{der_signature_to_raw, EcCurve, KeyGenParams, PublicKey};

/// Private key storage addressed by tag.
pub trait KeyStore: Send + Sync {
    /// Create a key under `tag`. Fails if the tag is already taken.
    fn generate_key(&self, tag: &str, params: &KeyGenParams) -> Result<PublicKey>;

    /// Public key stored under `tag`, if any.
    fn find_key(&self, tag: &str) -> Result<Option<PublicKey>>;

    /// Remove the key under `tag`. Removing an absent key is not an error.
    fn delete_key(&self, tag: &str) -> Result<()>;

    /// ECDSA over SHA-256(`message`), returned as an X9.62 DER signature.
    fn sign(&self, tag: &str, message: &[u8]) -> Result<Vec<u8>>;
}

/// DER certificate storage addressed by label.
pub trait CertificateStore: Send + Sync {
    fn find_certificate(&self, label: &str) -> Result<Option<Vec<u8>>>;

    /// Store `der` under `label`, replacing any previous entry.
    fn store_certificate(&self, label: &str, der: &[u8]) -> Result<()>;

    fn delete_certificate(&self, label: &str) -> Result<()>;
}

/// Handle to a private key that lives inside a [`KeyStore`].
#[derive(Clone)]
pub struct HardwareKey {
    store: Arc<dyn KeyStore>,
    tag: String,
    public_key: PublicKey,
}

impl std::fmt::Debug for HardwareKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareKey")
            .field("tag", &self.tag)
            .field("curve", &self.public_key.curve())
            .finish()
    }
}

impl HardwareKey {
    pub fn new(store: Arc<dyn KeyStore>, tag: impl Into<String>, public_key: PublicKey) -> Self {
        Self {
            store,
            tag: tag.into(),
            public_key,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn curve(&self) -> EcCurve {
        self.public_key.curve()
    }

    /// Signature exactly as the store produced it (X9.62 DER).
    pub fn sign_der(&self, message: &[u8]) -> Result<Vec<u8>> {
        self.store.sign(&self.tag, message)
    }

    /// Fixed-length `r ‖ s` signature, each half left-padded to the curve's
    /// coordinate size.
    pub fn sign_raw(&self, message: &[u8]) -> Result<Vec<u8>> {
        let der = self.sign_der(message)?;
        der_signature_to_raw(self.curve(), &der)
    }
}

enum SoftwareSigningKey {
    P256(p256::ecdsa::SigningKey),
    P384(p384::ecdsa::SigningKey),
}

impl SoftwareSigningKey {
    fn generate(curve: EcCurve) -> Self {
        match curve {
            EcCurve::P256 => Self::P256(p256::ecdsa::SigningKey::random(&mut OsRng)),
            EcCurve::P384 => Self::P384(p384::ecdsa::SigningKey::random(&mut OsRng)),
        }
    }

    fn public_key(&self) -> Result<PublicKey> {
        match self {
            Self::P256(key) => PublicKey::from_sec1(
                EcCurve::P256,
                key.verifying_key().to_encoded_point(false).as_bytes(),
            ),
            Self::P384(key) => PublicKey::from_sec1(
                EcCurve::P384,
                key.verifying_key().to_encoded_point(false).as_bytes(),
            ),
        }
    }

    fn sign_sha256(&self, message: &[u8]) -> Result<Vec<u8>> {
        let digest = Sha256::digest(message);
        let failed = |e: signature::Error| TrustClientError::key_store(format!("signing failed: {e}"));
        match self {
            Self::P256(key) => {
                let sig: p256::ecdsa::Signature = key.sign_prehash(&digest).map_err(failed)?;
                Ok(sig.to_der().as_bytes().to_vec())
            }
            Self::P384(key) => {
                let sig: p384::ecdsa::Signature = key.sign_prehash(&digest).map_err(failed)?;
                Ok(sig.to_der().as_bytes().to_vec())
            }
        }
    }
}

struct SoftwareKeyRecord {
    key: SoftwareSigningKey,
    params: KeyGenParams,
}

/// In-memory key and certificate store.
#[derive(Default)]
pub struct SoftwareKeyStore {
    keys: Mutex<HashMap<String, SoftwareKeyRecord>>,
    certificates: Mutex<HashMap<String, Vec<u8>>>,
}

impl SoftwareKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Access policy recorded when the key under `tag` was generated.
    pub fn key_params(&self, tag: &str) -> Result<Option<KeyGenParams>> {
        Ok(lock(&self.keys)?.get(tag).map(|record| record.params))
    }

    pub fn key_count(&self) -> Result<usize> {
        Ok(lock(&self.keys)?.len())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| TrustClientError::key_store("store lock poisoned"))
}

impl KeyStore for SoftwareKeyStore {
    fn generate_key(&self, tag: &str, params: &KeyGenParams) -> Result<PublicKey> {
        let mut keys = lock(&self.keys)?;
        if keys.contains_key(tag) {
            return Err(TrustClientError::key_store(format!(
                "duplicate item for tag {tag}"
            )));
        }
        if params.policy.exportable {
            warn!(tag, "Software key store generating an exportable key");
        }

        let key = SoftwareSigningKey::generate(params.curve);
        let public_key = key.public_key()?;
        keys.insert(
            tag.to_string(),
            SoftwareKeyRecord {
                key,
                params: *params,
            },
        );
        debug!(tag, curve = ?params.curve, "Generated key");
        Ok(public_key)
    }

    fn find_key(&self, tag: &str) -> Result<Option<PublicKey>> {
        lock(&self.keys)?
            .get(tag)
            .map(|record| record.key.public_key())
            .transpose()
    }

    fn delete_key(&self, tag: &str) -> Result<()> {
        if lock(&self.keys)?.remove(tag).is_some() {
            debug!(tag, "Deleted key");
        }
        Ok(())
    }

    fn sign(&self, tag: &str, message: &[u8]) -> Result<Vec<u8>> {
        let keys = lock(&self.keys)?;
        let record = keys
            .get(tag)
            .ok_or_else(|| TrustClientError::key_store(format!("no key for tag {tag}")))?;
        record.key.sign_sha256(message)
    }
}

impl CertificateStore for SoftwareKeyStore {
    fn find_certificate(&self, label: &str) -> Result<Option<Vec<u8>>> {
        Ok(lock(&self.certificates)?.get(label).cloned())
    }

    fn store_certificate(&self, label: &str, der: &[u8]) -> Result<()> {
        lock(&self.certificates)?.insert(label.to_string(), der.to_vec());
        Ok(())
    }

    fn delete_certificate(&self, label: &str) -> Result<()> {
        lock(&self.certificates)?.remove(label);
        Ok(())
    }
}
