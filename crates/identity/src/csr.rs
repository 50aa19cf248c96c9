//! PKCS#10 certificate signing requests signed by a store-resident key.
//!
//! The request is assembled by hand because the private key cannot be
//! handed to a general-purpose CSR library. Every request is checked
//! before it is returned: the signature must verify against the key's own
//! public point, and the encoded `r`/`s` must decode back to the values the
//! store produced.

use tracing::debug;

use crate::der::{self, IntegerPadding};
use crate::error::{Result, TrustClientError};
use crate::keystore::HardwareKey;

/// ecdsa-with-SHA256 (1.2.840.10045.4.3.2)
pub const OID_ECDSA_WITH_SHA256: &[u64] = &[1, 2, 840, 10045, 4, 3, 2];

const OID_COMMON_NAME: &[u64] = &[2, 5, 4, 3];
const OID_COUNTRY: &[u64] = &[2, 5, 4, 6];
const OID_ORGANIZATION: &[u64] = &[2, 5, 4, 10];
const OID_ORGANIZATIONAL_UNIT: &[u64] = &[2, 5, 4, 11];

/// Subject of a certificate request. Attributes are emitted as one RDN
/// each, in the order C, O, OU, CN.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistinguishedName {
    pub country: Option<String>,
    pub organization: Option<String>,
    pub organizational_unit: Option<String>,
    pub common_name: Option<String>,
}

impl DistinguishedName {
    pub fn common_name(cn: impl Into<String>) -> Self {
        Self {
            common_name: Some(cn.into()),
            ..Self::default()
        }
    }

    pub fn with_organization(mut self, o: impl Into<String>) -> Self {
        self.organization = Some(o.into());
        self
    }

    pub fn with_organizational_unit(mut self, ou: impl Into<String>) -> Self {
        self.organizational_unit = Some(ou.into());
        self
    }

    pub fn with_country(mut self, c: impl Into<String>) -> Self {
        self.country = Some(c.into());
        self
    }

    /// DER `Name` (SEQUENCE OF RelativeDistinguishedName).
    pub fn to_der(&self) -> Result<Vec<u8>> {
        let mut rdns = Vec::new();
        if let Some(c) = &self.country {
            if c.len() != 2 || !c.bytes().all(|b| b.is_ascii_uppercase()) {
                return Err(TrustClientError::protocol(format!(
                    "country must be a two-letter code, got {c:?}"
                )));
            }
            rdns.push(rdn(OID_COUNTRY, &der::printable_string(c)));
        }
        if let Some(o) = &self.organization {
            rdns.push(rdn(OID_ORGANIZATION, &der::utf8_string(o)));
        }
        if let Some(ou) = &self.organizational_unit {
            rdns.push(rdn(OID_ORGANIZATIONAL_UNIT, &der::utf8_string(ou)));
        }
        if let Some(cn) = &self.common_name {
            rdns.push(rdn(OID_COMMON_NAME, &der::utf8_string(cn)));
        }
        let parts: Vec<&[u8]> = rdns.iter().map(Vec::as_slice).collect();
        Ok(der::sequence(&parts))
    }
}

fn rdn(oid: &[u64], value: &[u8]) -> Vec<u8> {
    der::set(&[&der::sequence(&[&der::oid(oid), value])])
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CsrOptions {
    /// Encoding of the signature's `r` and `s` INTEGERs
    pub padding: IntegerPadding,
}

/// Builds and self-checks PKCS#10 requests for one key.
#[derive(Debug, Clone)]
pub struct CsrBuilder<'a> {
    key: &'a HardwareKey,
    options: CsrOptions,
}

impl<'a> CsrBuilder<'a> {
    pub fn new(key: &'a HardwareKey) -> Self {
        Self {
            key,
            options: CsrOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CsrOptions) -> Self {
        self.options = options;
        self
    }

    /// DER `CertificationRequestInfo` with an empty attribute set.
    pub fn request_info(&self, subject: &DistinguishedName) -> Result<Vec<u8>> {
        let name = subject.to_der()?;
        let spki = self.key.public_key().spki_der();
        Ok(der::sequence(&[
            &der::small_integer(0),
            &name,
            &spki,
            &der::context_constructed(0, &[]),
        ]))
    }

    /// Sign, self-check and return the DER `CertificationRequest`.
    pub fn build(&self, subject: &DistinguishedName) -> Result<Vec<u8>> {
        let info = self.request_info(subject)?;
        let raw = self.key.sign_raw(&info)?;
        self.key.public_key().verify_sha256(&info, &raw).map_err(|_| {
            TrustClientError::protocol("CSR signature does not verify against the key")
        })?;

        let size = self.key.curve().coordinate_size();
        let (r, s) = raw.split_at(size);
        let signature_value = der::sequence(&[
            &der::unsigned_integer(r, self.options.padding),
            &der::unsigned_integer(s, self.options.padding),
        ]);
        check_signature_encoding(&signature_value, &raw, size)?;

        let algorithm = der::sequence(&[&der::oid(OID_ECDSA_WITH_SHA256)]);
        let csr = der::sequence(&[&info, &algorithm, &der::bit_string(&signature_value)]);
        debug!(tag = self.key.tag(), len = csr.len(), "Built certificate signing request");
        Ok(csr)
    }
}

/// Convenience wrapper over [`CsrBuilder`] with default options.
pub fn build_csr(subject: &DistinguishedName, key: &HardwareKey) -> Result<Vec<u8>> {
    CsrBuilder::new(key).build(subject)
}

/// Decode `SEQUENCE { INTEGER r, INTEGER s }` and compare with the raw
/// fixed-length signature it was built from.
fn check_signature_encoding(encoded: &[u8], raw: &[u8], size: usize) -> Result<()> {
    let mismatch = |detail: String| {
        TrustClientError::protocol(format!("CSR signature encoding check failed: {detail}"))
    };

    let (seq, rest) = der::read_universal(encoded, der::TAG_SEQUENCE).map_err(mismatch)?;
    if !rest.is_empty() {
        return Err(mismatch("trailing bytes after signature".to_string()));
    }
    let (r, rest) = der::read_unsigned_integer(seq.value).map_err(mismatch)?;
    let (s, rest) = der::read_unsigned_integer(rest).map_err(mismatch)?;
    if !rest.is_empty() {
        return Err(mismatch("trailing bytes inside signature".to_string()));
    }

    let mut decoded = left_pad(r, size).ok_or_else(|| mismatch("r too long".to_string()))?;
    decoded.extend(left_pad(s, size).ok_or_else(|| mismatch("s too long".to_string()))?);
    if decoded != raw {
        return Err(mismatch("decoded r/s differ from signature".to_string()));
    }
    Ok(())
}

fn left_pad(magnitude: &[u8], size: usize) -> Option<Vec<u8>> {
    if magnitude.len() > size {
        return None;
    }
    let mut out = vec![0u8; size - magnitude.len()];
    out.extend_from_slice(magnitude);
    Some(out)
}
