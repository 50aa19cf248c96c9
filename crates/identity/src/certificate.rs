//! Parsed X.509 certificates as issued by the registration server.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use x509_parser::prelude::*;

use crate::error::{Result, TrustClientError};

/// Maximum certificate size (16KB is generous for a single cert)
pub const MAX_CERT_SIZE: usize = 16 * 1024;

const PEM_LABEL: &str = "CERTIFICATE";

/// An X.509 certificate with the fields the client acts on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Certificate {
    /// Serial number, colon-separated hex
    pub serial: String,
    /// Subject distinguished name (RFC 4514 form)
    pub subject: String,
    /// Issuer distinguished name (RFC 4514 form)
    pub issuer: String,
    /// Not valid before (Unix timestamp)
    pub not_before: i64,
    /// Not valid after (Unix timestamp)
    pub not_after: i64,
    /// SubjectPublicKeyInfo (DER)
    pub spki: Vec<u8>,
    /// Complete certificate (DER)
    pub der: Vec<u8>,
}

impl Certificate {
    pub fn from_der(der: &[u8]) -> Result<Self> {
        if der.len() > MAX_CERT_SIZE {
            return Err(TrustClientError::protocol(format!(
                "certificate too large: {} bytes (max {MAX_CERT_SIZE})",
                der.len()
            )));
        }

        let (_, cert) = X509Certificate::from_der(der).map_err(|e| {
            TrustClientError::protocol(format!("failed to parse X.509 certificate: {e:?}"))
        })?;

        Ok(Self {
            serial: cert.tbs_certificate.raw_serial_as_string(),
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            spki: cert.public_key().raw.to_vec(),
            der: der.to_vec(),
        })
    }

    /// Parse the first `CERTIFICATE` block of a PEM document.
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let (_, block) = x509_parser::pem::parse_x509_pem(pem)
            .map_err(|e| TrustClientError::protocol(format!("invalid PEM: {e:?}")))?;
        if block.label != PEM_LABEL {
            return Err(TrustClientError::protocol(format!(
                "expected {PEM_LABEL} PEM block, found {}",
                block.label
            )));
        }
        Self::from_der(&block.contents)
    }

    /// Accepts either PEM text or raw DER.
    pub fn from_pem_or_der(bytes: &[u8]) -> Result<Self> {
        let trimmed = bytes
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .map_or(&[][..], |start| &bytes[start..]);
        if trimmed.starts_with(b"-----BEGIN") {
            Self::from_pem(trimmed)
        } else {
            Self::from_der(bytes)
        }
    }

    pub fn to_pem(&self) -> String {
        let body = STANDARD.encode(&self.der);
        let mut pem = format!("-----BEGIN {PEM_LABEL}-----\n");
        for line in body.as_bytes().chunks(64) {
            // base64 output is ASCII
            pem.push_str(&String::from_utf8_lossy(line));
            pem.push('\n');
        }
        pem.push_str(&format!("-----END {PEM_LABEL}-----\n"));
        pem
    }

    /// Expired once `notAfter` has been reached.
    pub fn is_expired_at(&self, unix_time: i64) -> bool {
        self.not_after <= unix_time
    }

    pub fn is_valid_at(&self, unix_time: i64) -> bool {
        unix_time >= self.not_before && !self.is_expired_at(unix_time)
    }
}
