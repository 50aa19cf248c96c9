//! JWK, RFC 7638 thumbprints and ES256 compact JWS.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, TrustClientError};
use crate::keys::{EcCurve, PublicKey};
use crate::keystore::HardwareKey;

/// Header parameter carrying the platform attestation or assertion.
pub const ATTESTATION_HEADER: &str = "urn:telematik:attestation";

/// Content type of a registration request payload.
pub const REGISTRATION_CONTENT_TYPE: &str = "x-registration-apple+json";

/// Public EC key in JWK form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
}

/// Members hashed for an EC thumbprint, in lexicographic order.
#[derive(Serialize)]
struct ThumbprintInput<'a> {
    crv: &'a str,
    kty: &'a str,
    x: &'a str,
    y: &'a str,
}

impl Jwk {
    pub fn from_public_key(key: &PublicKey) -> Self {
        Self {
            kty: "EC".to_string(),
            crv: key.curve().jwk_name().to_string(),
            x: URL_SAFE_NO_PAD.encode(key.x()),
            y: URL_SAFE_NO_PAD.encode(key.y()),
            kid: None,
            key_use: None,
        }
    }

    pub fn to_public_key(&self) -> Result<PublicKey> {
        if self.kty != "EC" {
            return Err(TrustClientError::UnsupportedCurve(format!("kty {}", self.kty)));
        }
        let curve = EcCurve::from_jwk_name(&self.crv)?;
        let decode = |value: &str| {
            URL_SAFE_NO_PAD
                .decode(value)
                .map_err(|e| TrustClientError::protocol(format!("invalid JWK coordinate: {e}")))
        };
        PublicKey::from_coordinates(curve, &decode(&self.x)?, &decode(&self.y)?)
    }

    /// RFC 7638 thumbprint: SHA-256 over `{"crv","kty","x","y"}` serialized
    /// without whitespace, base64url-encoded without padding.
    pub fn thumbprint(&self) -> Result<String> {
        let input = serde_json::to_vec(&ThumbprintInput {
            crv: &self.crv,
            kty: &self.kty,
            x: &self.x,
            y: &self.y,
        })?;
        Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(input)))
    }
}

/// Platform evidence attached to a JWS header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttestationExtension {
    /// First contact: attestation of a freshly generated platform key
    Attestation(Vec<u8>),
    /// Follow-up calls: assertion from the already attested key
    Assertion(Vec<u8>),
}

#[derive(Serialize, Deserialize)]
struct AttestationExtensionRepr {
    fmt: String,
    data: String,
}

impl Serialize for AttestationExtension {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let (fmt, data) = match self {
            Self::Attestation(data) => ("attestation", data),
            Self::Assertion(data) => ("assertion", data),
        };
        AttestationExtensionRepr {
            fmt: fmt.to_string(),
            data: STANDARD.encode(data),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AttestationExtension {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        use serde::de::Error;

        let repr = AttestationExtensionRepr::deserialize(deserializer)?;
        let data = STANDARD.decode(&repr.data).map_err(D::Error::custom)?;
        match repr.fmt.as_str() {
            "attestation" => Ok(Self::Attestation(data)),
            "assertion" => Ok(Self::Assertion(data)),
            other => Err(D::Error::custom(format!("unknown attestation fmt {other}"))),
        }
    }
}

/// Protected header of a registration JWS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwsHeader {
    pub alg: String,
    pub nonce: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cty: Option<String>,
    pub jwk: Jwk,
    #[serde(rename = "urn:telematik:attestation")]
    pub attestation: AttestationExtension,
}

impl JwsHeader {
    pub fn es256(nonce: impl Into<String>, jwk: Jwk, attestation: AttestationExtension) -> Self {
        Self {
            alg: "ES256".to_string(),
            nonce: nonce.into(),
            cty: None,
            jwk,
            attestation,
        }
    }

    pub fn with_content_type(mut self, cty: impl Into<String>) -> Self {
        self.cty = Some(cty.into());
        self
    }
}

/// A compact-serialized JWS (`header.payload.signature`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactJws(String);

impl CompactJws {
    /// Wrap a received compact serialization after a shape check.
    pub fn parse(compact: impl Into<String>) -> Result<Self> {
        let compact = compact.into();
        if compact.split('.').count() != 3 {
            return Err(TrustClientError::protocol("JWS must have exactly three segments"));
        }
        Ok(Self(compact))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    fn segment(&self, index: usize) -> Result<Vec<u8>> {
        let part = self
            .0
            .split('.')
            .nth(index)
            .ok_or_else(|| TrustClientError::protocol("JWS has fewer than three segments"))?;
        URL_SAFE_NO_PAD
            .decode(part)
            .map_err(|e| TrustClientError::protocol(format!("invalid JWS segment: {e}")))
    }

    pub fn header(&self) -> Result<JwsHeader> {
        Ok(serde_json::from_slice(&self.segment(0)?)?)
    }

    pub fn payload(&self) -> Result<Vec<u8>> {
        self.segment(1)
    }

    /// Verify the ES256 signature against the JWK embedded in the header.
    pub fn verify_with_embedded_key(&self) -> Result<()> {
        let header = self.header()?;
        let key = header.jwk.to_public_key()?;
        let signing_input = self
            .0
            .rsplit_once('.')
            .map(|(input, _)| input)
            .ok_or_else(|| TrustClientError::protocol("JWS has no signature segment"))?;
        key.verify_sha256(signing_input.as_bytes(), &self.segment(2)?)
    }
}

impl std::fmt::Display for CompactJws {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sign `payload` under `header` with a P-256 store-resident key.
pub fn sign(header: &JwsHeader, payload: &[u8], key: &HardwareKey) -> Result<CompactJws> {
    if key.curve() != EcCurve::P256 {
        return Err(TrustClientError::UnsupportedCurve(format!(
            "ES256 requires P-256, key is {}",
            key.curve().jwk_name()
        )));
    }

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(header)?),
        URL_SAFE_NO_PAD.encode(payload)
    );
    let signature = key.sign_raw(signing_input.as_bytes())?;
    Ok(CompactJws(format!(
        "{signing_input}.{}",
        URL_SAFE_NO_PAD.encode(signature)
    )))
}
