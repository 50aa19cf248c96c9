//! Registration protocol engine.
//!
//! Drives nonce retrieval, attested registration, registration polling and
//! mTLS certificate issuance against the registration service, and derives
//! the client state from the installed mTLS certificate.
//!
//! # State Transitions
//!
//! ```text
//! Unregistered
//!     ↓ (register: pending)
//! RegistrationPending
//!     ↓ (register / fetch_registration: complete)
//! Registered
//!     ↓ (certificate notAfter reached, evaluated on query)
//! RegistrationExpired
//! ```
//!
//! A successful response reporting `error` or `cancelled` moves the client
//! to `RegistrationError`. A failed call (transport error, unexpected
//! status, malformed body) leaves the state as it was.
//!
//! Every request carries a fresh server nonce. Nonces that were put on the
//! wire are remembered and never signed again.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use trustclient_core::{ClientConfig, Endpoints};
use url::Url;

use crate::attestation::{self, AttestationProvider};
use crate::certificate::Certificate;
use crate::csr::{CsrBuilder, CsrOptions, DistinguishedName};
use crate::error::{Result, TrustClientError};
use crate::identity::{ClientIdentity, IdentityManager, KeyTags};
use crate::jose::{self, AttestationExtension, Jwk, JwsHeader, REGISTRATION_CONTENT_TYPE};
use crate::keystore::{CertificateStore, HardwareKey, KeyStore};
use crate::schema::{EchoOutput, RegistrationInput, RegistrationOutput, RegistrationStatus};

/// Response header carrying the anti-replay token.
pub const REPLAY_NONCE_HEADER: &str = "Replay-Nonce";

pub const CONTENT_TYPE_JOSE: &str = "application/jose";
pub const CONTENT_TYPE_PKCS10: &str = "application/pkcs10";

/// Maximum number of state transitions to track in history.
const MAX_HISTORY_SIZE: usize = 100;

/// Maximum number of consumed nonces remembered.
const MAX_CONSUMED_NONCES: usize = 256;

/// Registration state of this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientState {
    /// No mTLS certificate installed
    Unregistered,
    /// Server accepted the registration and has not completed it yet
    RegistrationPending,
    /// Valid mTLS certificate or completed registration
    Registered,
    /// Installed mTLS certificate has reached its notAfter
    RegistrationExpired,
    /// Server reported the registration as failed or cancelled
    RegistrationError,
}

/// Recorded state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ClientState,
    pub to: ClientState,
    /// Unix timestamp
    pub at: i64,
    pub reason: String,
}

/// State implied by the installed mTLS certificate at `now`.
pub fn derive_state(certificate: Option<&Certificate>, now: i64) -> ClientState {
    match certificate {
        None => ClientState::Unregistered,
        Some(cert) if cert.is_expired_at(now) => ClientState::RegistrationExpired,
        Some(_) => ClientState::Registered,
    }
}

/// State reported by a registration response.
fn state_for_status(status: RegistrationStatus) -> ClientState {
    match status {
        RegistrationStatus::Pending => ClientState::RegistrationPending,
        RegistrationStatus::Complete => ClientState::Registered,
        RegistrationStatus::Error | RegistrationStatus::Cancelled => ClientState::RegistrationError,
    }
}

fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Protocol engine for one identity context.
pub struct RegistrationEngine {
    config: ClientConfig,
    endpoints: Endpoints,
    tags: KeyTags,
    identities: IdentityManager,
    attestation: Arc<dyn AttestationProvider>,
    http: reqwest::Client,
    mtls_http: Option<reqwest::Client>,
    csr_options: CsrOptions,
    state: ClientState,
    /// notAfter of the installed mTLS certificate
    certificate_not_after: Option<i64>,
    polling_url: Option<Url>,
    consumed_nonces: VecDeque<String>,
    history: VecDeque<StateTransition>,
}

impl std::fmt::Debug for RegistrationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationEngine")
            .field("base_url", &self.endpoints.base.as_str())
            .field("tags", &self.tags)
            .field("state", &self.state)
            .field("polling_url", &self.polling_url)
            .finish()
    }
}

impl RegistrationEngine {
    /// Engine over one store backing both keys and certificates.
    pub fn new<S>(
        config: ClientConfig,
        store: Arc<S>,
        attestation: Arc<dyn AttestationProvider>,
    ) -> Result<Self>
    where
        S: KeyStore + CertificateStore + 'static,
    {
        let key_store: Arc<dyn KeyStore> = store.clone();
        let cert_store: Arc<dyn CertificateStore> = store;
        Self::with_identities(config, IdentityManager::new(key_store, cert_store), attestation)
    }

    /// Validates `config`, makes sure both keys of the context exist and
    /// derives the initial state from the installed mTLS certificate. A stored
    /// certificate that does not parse counts as absent.
    pub fn with_identities(
        config: ClientConfig,
        identities: IdentityManager,
        attestation: Arc<dyn AttestationProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let endpoints = config.endpoints()?;
        let tags = KeyTags::new(&config.key_tag_prefix, &config.context);

        identities.ensure_key(&tags.device)?;
        identities.ensure_key(&tags.mtls)?;
        let certificate = match identities.certificate(&tags.mtls) {
            Ok(certificate) => certificate,
            // Unparseable certificates count as absent
            Err(TrustClientError::Protocol(reason)) => {
                warn!(tag = %tags.mtls, %reason, "Ignoring unreadable mTLS certificate");
                None
            }
            Err(e) => return Err(e),
        };
        let state = derive_state(certificate.as_ref(), current_timestamp());

        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.request_timeout())
            .build()?;

        info!(
            context = %config.context,
            base_url = %endpoints.base,
            ?state,
            "Registration engine initialized"
        );

        Ok(Self {
            config,
            endpoints,
            tags,
            identities,
            attestation,
            http,
            mtls_http: None,
            csr_options: CsrOptions::default(),
            state,
            certificate_not_after: certificate.map(|c| c.not_after),
            polling_url: None,
            consumed_nonces: VecDeque::new(),
            history: VecDeque::new(),
        })
    }

    /// HTTP client presenting the mTLS identity, used for [`echo`](Self::echo).
    pub fn with_mtls_http_client(mut self, client: reqwest::Client) -> Self {
        self.mtls_http = Some(client);
        self
    }

    pub fn with_csr_options(mut self, options: CsrOptions) -> Self {
        self.csr_options = options;
        self
    }

    /// Current state, with certificate expiry evaluated now.
    pub fn state(&self) -> ClientState {
        self.state_at(current_timestamp())
    }

    pub fn state_at(&self, now: i64) -> ClientState {
        match (self.state, self.certificate_not_after) {
            (ClientState::Registered, Some(not_after)) if not_after <= now => {
                ClientState::RegistrationExpired
            }
            (state, _) => state,
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &StateTransition> {
        self.history.iter()
    }

    pub fn tags(&self) -> &KeyTags {
        &self.tags
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn identities(&self) -> &IdentityManager {
        &self.identities
    }

    /// URL retained from the last registration's `Location` header.
    pub fn polling_url(&self) -> Option<&Url> {
        self.polling_url.as_ref()
    }

    pub fn device_key(&self) -> Result<HardwareKey> {
        self.identities.ensure_key(&self.tags.device)
    }

    pub fn mtls_identity(&self) -> Result<ClientIdentity> {
        self.identities.current_identity(&self.tags.mtls)
    }

    /// Fetch a fresh anti-replay nonce.
    pub async fn nonce(&self) -> Result<String> {
        let response = self.http.head(self.endpoints.nonce.clone()).send().await?;
        expect_status(&response, StatusCode::CREATED)?;

        let nonce = response
            .headers()
            .get(REPLAY_NONCE_HEADER)
            .ok_or_else(|| TrustClientError::protocol("Replay-Nonce header is not set"))?
            .to_str()
            .map_err(|_| TrustClientError::protocol("Replay-Nonce header is not ASCII"))?
            .to_string();
        debug!(%nonce, "Received nonce");
        Ok(nonce)
    }

    /// Register this device with an attestation bound to `nonce`.
    pub async fn register(&mut self, nonce: &str) -> Result<RegistrationOutput> {
        self.check_nonce_unused(nonce)?;

        let device_key = self.device_key()?;
        let jwk = Jwk::from_public_key(device_key.public_key());
        let challenge = attestation::challenge(&jwk.thumbprint()?, nonce)?;
        let evidence = self.attestation.attest(&challenge).await?;

        let csr = if self.config.include_csr_in_registration {
            Some(STANDARD.encode(self.mtls_csr()?))
        } else {
            None
        };
        let payload = serde_json::to_vec(&RegistrationInput {
            name: self.config.device_name.clone(),
            csr,
        })?;
        let header = JwsHeader::es256(nonce, jwk, AttestationExtension::Attestation(evidence))
            .with_content_type(REGISTRATION_CONTENT_TYPE);
        let jws = jose::sign(&header, &payload, &device_key)?;

        let url = self.endpoints.registrations.clone();
        let response = self.post_jose(url.clone(), nonce, jws.into_string()).await?;
        expect_status(&response, StatusCode::CREATED)?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(|value| url.join(value))
            .transpose()?;
        let output = decode_registration(&response.bytes().await?)?;

        self.apply_registration(&output, "registration submitted")?;
        if let Some(location) = location {
            debug!(%location, "Retained registration polling URL");
            self.polling_url = Some(location);
        }
        Ok(output)
    }

    /// Poll the pending registration with a fresh nonce and an assertion.
    ///
    /// Any `200` confirms the registration. A registration body in the
    /// response is applied like one from [`register`](Self::register); without
    /// one, `None` is returned and the state is kept.
    pub async fn fetch_registration(&mut self) -> Result<Option<RegistrationOutput>> {
        let url = self
            .polling_url
            .clone()
            .ok_or(TrustClientError::ClientNotRegistered)?;
        let nonce = self.nonce().await?;
        self.check_nonce_unused(&nonce)?;

        let device_key = self.device_key()?;
        let jwk = Jwk::from_public_key(device_key.public_key());
        let challenge = attestation::challenge(&jwk.thumbprint()?, &nonce)?;
        let assertion = self.attestation.assertion(&challenge).await?;

        let header = JwsHeader::es256(nonce.as_str(), jwk, AttestationExtension::Assertion(assertion));
        let jws = jose::sign(&header, &[], &device_key)?;

        let response = self.post_jose(url, &nonce, jws.into_string()).await?;
        expect_status(&response, StatusCode::OK)?;
        let body = response.bytes().await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            debug!("Registration confirmed without a body");
            return Ok(None);
        }
        let output = match decode_registration(&body) {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "Registration confirmed with an unrecognized body");
                return Ok(None);
            }
        };

        self.apply_registration(&output, "registration refreshed")?;
        Ok(Some(output))
    }

    /// Request a new mTLS certificate for the mTLS key and install it.
    pub async fn update_mtls_certificate(&mut self) -> Result<Certificate> {
        let csr = self.mtls_csr()?;
        let response = self
            .http
            .post(self.endpoints.issue_cert.clone())
            .header(CONTENT_TYPE, CONTENT_TYPE_PKCS10)
            .body(csr)
            .send()
            .await?;
        expect_status(&response, StatusCode::OK)?;

        let certificate = Certificate::from_pem_or_der(&response.bytes().await?)?;
        self.install_mtls_certificate(&certificate)?;

        if self.state != ClientState::RegistrationPending {
            let derived = derive_state(Some(&certificate), current_timestamp());
            self.transition(derived, "mTLS certificate issued");
        }
        Ok(certificate)
    }

    /// Debug echo of the request as the server saw it.
    pub async fn echo(&self) -> Result<EchoOutput> {
        let client = self.mtls_http.as_ref().unwrap_or(&self.http);
        if self.mtls_http.is_none() {
            warn!("No mTLS client configured; echo request is sent without a client certificate");
        }
        let response = client.get(self.endpoints.echo.clone()).send().await?;
        expect_status(&response, StatusCode::OK)?;
        Ok(serde_json::from_slice(&response.bytes().await?)?)
    }

    /// Replace the mTLS key, dropping its certificate.
    pub fn reset_mtls_identity(&mut self) -> Result<()> {
        self.identities.reset(&self.tags.mtls)?;
        self.certificate_not_after = None;
        self.polling_url = None;
        self.transition(ClientState::Unregistered, "mTLS identity reset");
        Ok(())
    }

    fn mtls_csr(&self) -> Result<Vec<u8>> {
        let key = self.identities.ensure_key(&self.tags.mtls)?;
        let subject = DistinguishedName::common_name(self.config.mtls_common_name.as_str());
        CsrBuilder::new(&key)
            .with_options(self.csr_options)
            .build(&subject)
    }

    fn install_mtls_certificate(&mut self, certificate: &Certificate) -> Result<()> {
        self.identities.install_certificate(&self.tags.mtls, certificate)?;
        self.certificate_not_after = Some(certificate.not_after);
        Ok(())
    }

    /// Installs the returned certificate and moves to the reported state. The
    /// certificate is decoded before anything is changed.
    fn apply_registration(&mut self, output: &RegistrationOutput, reason: &str) -> Result<()> {
        let certificate = output
            .client
            .as_ref()
            .and_then(|c| c.certificate.as_deref())
            .map(|encoded| {
                let der = STANDARD.decode(encoded).map_err(|e| {
                    TrustClientError::protocol(format!("invalid certificate encoding: {e}"))
                })?;
                Certificate::from_der(&der)
            })
            .transpose()?;
        if let Some(certificate) = &certificate {
            self.install_mtls_certificate(certificate)?;
        }
        for challenge in &output.challenges {
            info!(
                kind = %challenge.kind,
                url = %challenge.url,
                status = %challenge.status,
                "Registration challenge outstanding"
            );
        }
        self.transition(state_for_status(output.status), reason);
        Ok(())
    }

    async fn post_jose(&mut self, url: Url, nonce: &str, body: String) -> Result<reqwest::Response> {
        self.consume_nonce(nonce);
        debug!(%url, %nonce, "Posting signed request");
        Ok(self
            .http
            .post(url)
            .header(CONTENT_TYPE, CONTENT_TYPE_JOSE)
            .body(body)
            .send()
            .await?)
    }

    fn check_nonce_unused(&self, nonce: &str) -> Result<()> {
        if self.consumed_nonces.iter().any(|used| used == nonce) {
            return Err(TrustClientError::protocol(format!(
                "nonce {nonce} was already used"
            )));
        }
        Ok(())
    }

    fn consume_nonce(&mut self, nonce: &str) {
        self.consumed_nonces.push_back(nonce.to_string());
        if self.consumed_nonces.len() > MAX_CONSUMED_NONCES {
            self.consumed_nonces.pop_front();
        }
    }

    fn transition(&mut self, to: ClientState, reason: &str) {
        let now = current_timestamp();
        let from = self.state_at(now);
        self.state = to;
        if from == to {
            return;
        }
        info!(?from, ?to, reason, "Client state changed");
        self.history.push_back(StateTransition {
            from,
            to,
            at: now,
            reason: reason.to_string(),
        });
        if self.history.len() > MAX_HISTORY_SIZE {
            self.history.pop_front();
        }
    }
}

fn expect_status(response: &reqwest::Response, expected: StatusCode) -> Result<()> {
    let status = response.status();
    if status != expected {
        warn!(url = %response.url(), %status, %expected, "Unexpected server response");
        return Err(TrustClientError::BadServerResponse(status.as_u16()));
    }
    Ok(())
}

fn decode_registration(body: &[u8]) -> Result<RegistrationOutput> {
    serde_json::from_slice(body)
        .map_err(|e| TrustClientError::protocol(format!("unable to parse registration response: {e}")))
}
