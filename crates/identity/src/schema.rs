//! Wire types of the registration service.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Payload of the registration JWS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationInput {
    pub name: String,
    /// Base64 DER CSR for the mTLS key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub csr: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStatus {
    Pending,
    Error,
    Cancelled,
    Complete,
}

/// Client record the server created for this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredClient {
    pub id: String,
    /// Base64 DER certificate for the mTLS key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
}

/// Outstanding step the server expects from the user, such as a federated
/// login. Reported, never acted on, by this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationChallenge {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationOutput {
    pub id: String,
    pub status: RegistrationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<RegisteredClient>,
    #[serde(default)]
    pub challenges: Vec<RegistrationChallenge>,
}

/// Request and TLS session details reflected by the echo endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EchoOutput {
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
    pub host: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub method: String,
    pub proto: String,
    pub remote_addr: String,
    #[serde(rename = "requestURI")]
    pub request_uri: String,
    #[serde(default)]
    pub tls_cipher_suite: String,
    #[serde(default)]
    pub tls_client_certificates: Vec<TlsCertificate>,
    #[serde(default)]
    pub tls_hostname: String,
    #[serde(default)]
    pub tls_version: String,
}

/// Peer certificate summary as printed by the echo endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsCertificate {
    pub issuer: String,
    pub not_after: String,
    pub not_before: String,
    pub subject: String,
}
