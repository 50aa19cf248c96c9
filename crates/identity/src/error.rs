//! Error types for TrustClient identity and registration operations.
//!
//! Every failure aborts the current call and surfaces here. Nothing in this
//! crate retries; retry and backoff policy belongs to the caller.

use thiserror::Error;

/// Errors that can occur in identity, attestation and registration operations.
#[derive(Debug, Error)]
pub enum TrustClientError {
    /// Platform attestation is not available on this runtime
    #[error("Runtime unsupported: {0}")]
    RuntimeUnsupported(String),

    /// The platform failed to create or attest the attestation key
    #[error("Attestation failed: {0}")]
    AttestationFailed(String),

    /// An assertion was requested before any attestation key exists
    #[error("Attestation key has not been attested yet")]
    NotYetAttested,

    /// The platform failed to produce an assertion
    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    /// Key generation, lookup, deletion, signing or encoding failure
    #[error("Key store error: {0}")]
    KeyStore(String),

    /// Key or signature on a curve this crate does not handle
    #[error("Unsupported curve: {0}")]
    UnsupportedCurve(String),

    /// Malformed or missing response fields, CSR self-verification failure
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server answered with an unexpected status code
    #[error("Bad server response: HTTP {0}")]
    BadServerResponse(u16),

    /// No registration is pending for this client
    #[error("Client is not registered")]
    ClientNotRegistered,

    /// HTTP transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL errors
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Core errors
    #[error("Core error: {0}")]
    Core(#[from] trustclient_core::CoreError),
}

impl TrustClientError {
    pub(crate) fn key_store(details: impl Into<String>) -> Self {
        Self::KeyStore(details.into())
    }

    pub(crate) fn protocol(details: impl Into<String>) -> Self {
        Self::Protocol(details.into())
    }
}

/// Result type for TrustClient operations.
pub type Result<T> = std::result::Result<T, TrustClientError>;
