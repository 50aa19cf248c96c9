//! EC key material as seen from outside the key store.
//!
//! Private keys never leave the [`KeyStore`](crate::keystore::KeyStore);
//! this module only handles public points, signatures and the parameters
//! used to ask the store for a new key.

use p256::ecdsa::signature::hazmat::PrehashVerifier;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::der;
use crate::error::{Result, TrustClientError};

/// id-ecPublicKey (1.2.840.10045.2.1)
pub const OID_EC_PUBLIC_KEY: &[u64] = &[1, 2, 840, 10045, 2, 1];
/// prime256v1 (1.2.840.10045.3.1.7)
pub const OID_PRIME256V1: &[u64] = &[1, 2, 840, 10045, 3, 1, 7];
/// secp384r1 (1.3.132.0.34)
pub const OID_SECP384R1: &[u64] = &[1, 3, 132, 0, 34];

/// Elliptic curves a hardware identity may live on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EcCurve {
    P256,
    P384,
}

impl EcCurve {
    /// Size in bytes of one field element (and of `r` or `s`).
    pub fn coordinate_size(self) -> usize {
        match self {
            EcCurve::P256 => 32,
            EcCurve::P384 => 48,
        }
    }

    /// JOSE curve name.
    pub fn jwk_name(self) -> &'static str {
        match self {
            EcCurve::P256 => "P-256",
            EcCurve::P384 => "P-384",
        }
    }

    pub fn from_jwk_name(name: &str) -> Result<Self> {
        match name {
            "P-256" => Ok(EcCurve::P256),
            "P-384" => Ok(EcCurve::P384),
            other => Err(TrustClientError::UnsupportedCurve(other.to_string())),
        }
    }

    pub fn named_curve_oid(self) -> &'static [u64] {
        match self {
            EcCurve::P256 => OID_PRIME256V1,
            EcCurve::P384 => OID_SECP384R1,
        }
    }

    /// Length of an uncompressed SEC1 point on this curve.
    pub fn uncompressed_point_len(self) -> usize {
        1 + 2 * self.coordinate_size()
    }
}

/// Protection the key store must apply to a generated key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAccessPolicy {
    /// Private key may be exported from the store
    pub exportable: bool,
    /// Key is usable only while a device passcode is set
    pub require_passcode: bool,
    /// Key stays on this device (excluded from backup/migration)
    pub this_device_only: bool,
}

impl KeyAccessPolicy {
    /// Non-exportable, passcode-gated, bound to this device.
    pub const fn hardware_bound() -> Self {
        Self {
            exportable: false,
            require_passcode: true,
            this_device_only: true,
        }
    }
}

impl Default for KeyAccessPolicy {
    fn default() -> Self {
        Self::hardware_bound()
    }
}

/// Parameters handed to [`KeyStore::generate_key`](crate::keystore::KeyStore::generate_key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGenParams {
    pub curve: EcCurve,
    pub policy: KeyAccessPolicy,
}

/// Public half of a store-resident EC key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublicKey {
    curve: EcCurve,
    /// Uncompressed SEC1 point (`0x04 ‖ x ‖ y`)
    point: Vec<u8>,
}

impl PublicKey {
    /// Accepts compressed or uncompressed SEC1 encodings and normalizes
    /// to the uncompressed form.
    pub fn from_sec1(curve: EcCurve, bytes: &[u8]) -> Result<Self> {
        let point = match curve {
            EcCurve::P256 => p256::ecdsa::VerifyingKey::from_sec1_bytes(bytes)
                .map(|k| k.to_encoded_point(false).as_bytes().to_vec()),
            EcCurve::P384 => p384::ecdsa::VerifyingKey::from_sec1_bytes(bytes)
                .map(|k| k.to_encoded_point(false).as_bytes().to_vec()),
        }
        .map_err(|_| TrustClientError::key_store("invalid SEC1 public key"))?;
        Ok(Self { curve, point })
    }

    /// Build from JOSE affine coordinates.
    pub fn from_coordinates(curve: EcCurve, x: &[u8], y: &[u8]) -> Result<Self> {
        let size = curve.coordinate_size();
        if x.len() != size || y.len() != size {
            return Err(TrustClientError::key_store(format!(
                "coordinates must be {size} bytes for {}",
                curve.jwk_name()
            )));
        }
        let mut point = Vec::with_capacity(curve.uncompressed_point_len());
        point.push(0x04);
        point.extend_from_slice(x);
        point.extend_from_slice(y);
        Self::from_sec1(curve, &point)
    }

    pub fn curve(&self) -> EcCurve {
        self.curve
    }

    pub fn sec1_uncompressed(&self) -> &[u8] {
        &self.point
    }

    pub fn x(&self) -> &[u8] {
        let size = self.curve.coordinate_size();
        &self.point[1..1 + size]
    }

    pub fn y(&self) -> &[u8] {
        let size = self.curve.coordinate_size();
        &self.point[1 + size..]
    }

    /// DER SubjectPublicKeyInfo:
    /// `SEQUENCE { SEQUENCE { id-ecPublicKey, namedCurve }, BIT STRING point }`.
    pub fn spki_der(&self) -> Vec<u8> {
        let algorithm = der::sequence(&[
            &der::oid(OID_EC_PUBLIC_KEY),
            &der::oid(self.curve.named_curve_oid()),
        ]);
        der::sequence(&[&algorithm, &der::bit_string(&self.point)])
    }

    /// Verify a fixed-length `r ‖ s` ECDSA signature over SHA-256(`message`).
    pub fn verify_sha256(&self, message: &[u8], raw_signature: &[u8]) -> Result<()> {
        let digest = Sha256::digest(message);
        let invalid = |_| TrustClientError::protocol("signature verification failed");
        match self.curve {
            EcCurve::P256 => {
                let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(&self.point)
                    .map_err(|_| TrustClientError::key_store("invalid P-256 point"))?;
                let sig = p256::ecdsa::Signature::from_slice(raw_signature)
                    .map_err(|_| TrustClientError::protocol("malformed P-256 signature"))?;
                key.verify_prehash(&digest, &sig).map_err(invalid)
            }
            EcCurve::P384 => {
                let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(&self.point)
                    .map_err(|_| TrustClientError::key_store("invalid P-384 point"))?;
                let sig = p384::ecdsa::Signature::from_slice(raw_signature)
                    .map_err(|_| TrustClientError::protocol("malformed P-384 signature"))?;
                key.verify_prehash(&digest, &sig).map_err(invalid)
            }
        }
    }
}

/// Convert an X9.62 DER ECDSA signature into fixed-length `r ‖ s`.
pub fn der_signature_to_raw(curve: EcCurve, der_signature: &[u8]) -> Result<Vec<u8>> {
    let malformed = |_| TrustClientError::key_store("key store returned a malformed signature");
    match curve {
        EcCurve::P256 => p256::ecdsa::Signature::from_der(der_signature)
            .map(|s| s.to_bytes().to_vec())
            .map_err(malformed),
        EcCurve::P384 => p384::ecdsa::Signature::from_der(der_signature)
            .map(|s| s.to_bytes().to_vec())
            .map_err(malformed),
    }
}
