//! Integration tests for the registration protocol engine.
//!
//! The registration service is a wiremock server; keys live in the software
//! key store and attestation is a stub returning fixed bytes.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use trustclient_identity::{
    AttestationExtension, AttestationProvider, CertificateStore, ClientConfig, ClientState,
    CompactJws, Jwk, RegistrationEngine, RegistrationStatus, SoftwareKeyStore, TrustClientError,
};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use x509_parser::prelude::FromDer;

const ATTESTATION_BYTES: [u8; 2] = [0xAA, 0xBB];
const ASSERTION_BYTES: [u8; 2] = [0xCC, 0xDD];

/// Returns fixed evidence and records every challenge it was asked about.
#[derive(Default)]
struct StubAttestation {
    challenges: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl AttestationProvider for StubAttestation {
    async fn is_ready(&self) -> bool {
        true
    }

    async fn attest(&self, challenge: &[u8]) -> trustclient_identity::Result<Vec<u8>> {
        self.challenges.lock().unwrap().push(challenge.to_vec());
        Ok(ATTESTATION_BYTES.to_vec())
    }

    async fn assertion(&self, challenge: &[u8]) -> trustclient_identity::Result<Vec<u8>> {
        self.challenges.lock().unwrap().push(challenge.to_vec());
        Ok(ASSERTION_BYTES.to_vec())
    }
}

struct Harness {
    server: MockServer,
    store: Arc<SoftwareKeyStore>,
    attestation: Arc<StubAttestation>,
}

impl Harness {
    async fn start() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("trustclient_identity=debug")
            .with_test_writer()
            .try_init();
        Self {
            server: MockServer::start().await,
            store: Arc::new(SoftwareKeyStore::new()),
            attestation: Arc::new(StubAttestation::default()),
        }
    }

    fn engine(&self) -> RegistrationEngine {
        let config = ClientConfig::new(self.server.uri());
        RegistrationEngine::new(config, self.store.clone(), self.attestation.clone()).unwrap()
    }

    async fn mount_nonce(&self, nonce: &str) {
        Mock::given(method("HEAD"))
            .and(path("/reg/nonce"))
            .respond_with(ResponseTemplate::new(201).insert_header("Replay-Nonce", nonce))
            .mount(&self.server)
            .await;
    }

    /// Bodies of every request received on `request_path`, as JWS.
    async fn jws_bodies(&self, request_path: &str) -> Vec<CompactJws> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|r| r.url.path() == request_path)
            .map(|r| CompactJws::parse(String::from_utf8(r.body).unwrap()).unwrap())
            .collect()
    }
}

fn test_certificate(not_after: (i32, u8, u8)) -> rcgen::Certificate {
    let mut params =
        rcgen::CertificateParams::new(vec!["trust-client.test".to_string()]).unwrap();
    params.not_before = rcgen::date_time_ymd(2024, 1, 1);
    params.not_after = rcgen::date_time_ymd(not_after.0, not_after.1, not_after.2);
    let key_pair = rcgen::KeyPair::generate().unwrap();
    params.self_signed(&key_pair).unwrap()
}

fn registration_body(status: &str, certificate: Option<&[u8]>) -> serde_json::Value {
    let mut client = serde_json::json!({ "id": "c1" });
    if let Some(der) = certificate {
        client["certificate"] = serde_json::Value::String(STANDARD.encode(der));
    }
    serde_json::json!({ "id": "r1", "status": status, "client": client })
}

#[tokio::test]
async fn nonce_is_read_from_replay_nonce_header() {
    let harness = Harness::start().await;
    harness.mount_nonce("abc123").await;

    let engine = harness.engine();
    assert_eq!(engine.nonce().await.unwrap(), "abc123");
}

#[tokio::test]
async fn nonce_requires_created_status_and_header() {
    let harness = Harness::start().await;
    Mock::given(method("HEAD"))
        .and(path("/reg/nonce"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&harness.server)
        .await;
    let engine = harness.engine();
    assert!(matches!(engine.nonce().await, Err(TrustClientError::Protocol(_))));

    let harness = Harness::start().await;
    Mock::given(method("HEAD"))
        .and(path("/reg/nonce"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&harness.server)
        .await;
    let engine = harness.engine();
    assert!(matches!(
        engine.nonce().await,
        Err(TrustClientError::BadServerResponse(503))
    ));
}

#[tokio::test]
async fn register_sends_attested_jws_and_installs_certificate() {
    let harness = Harness::start().await;
    let issued = test_certificate((2099, 1, 1));
    Mock::given(method("POST"))
        .and(path("/reg/registrations"))
        .and(header("content-type", "application/jose"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(registration_body("pending", Some(&issued.der()[..]))),
        )
        .expect(1)
        .mount(&harness.server)
        .await;

    let mut engine = harness.engine();
    assert_eq!(engine.state(), ClientState::Unregistered);

    let output = engine.register("abc123").await.unwrap();
    assert_eq!(output.status, RegistrationStatus::Pending);
    assert_eq!(engine.state(), ClientState::RegistrationPending);

    // The mTLS identity now holds the issued certificate
    let identity = engine.mtls_identity().unwrap();
    let installed = identity.certificate.unwrap();
    assert_eq!(installed.der, issued.der().to_vec());

    let bodies = harness.jws_bodies("/reg/registrations").await;
    assert_eq!(bodies.len(), 1);
    let jws = &bodies[0];
    jws.verify_with_embedded_key().unwrap();

    let header = jws.header().unwrap();
    assert_eq!(header.alg, "ES256");
    assert_eq!(header.nonce, "abc123");
    assert_eq!(header.cty.as_deref(), Some("x-registration-apple+json"));
    assert_eq!(
        header.attestation,
        AttestationExtension::Attestation(ATTESTATION_BYTES.to_vec())
    );
    let raw_header: serde_json::Value = serde_json::from_slice(
        &URL_SAFE_NO_PAD
            .decode(jws.as_str().split('.').next().unwrap())
            .unwrap(),
    )
    .unwrap();
    assert_eq!(
        raw_header["urn:telematik:attestation"],
        serde_json::json!({ "fmt": "attestation", "data": STANDARD.encode(ATTESTATION_BYTES) })
    );

    // The JWK is the device key, and the attestation is bound to it and the nonce
    let device_jwk = Jwk::from_public_key(engine.device_key().unwrap().public_key());
    assert_eq!(header.jwk, device_jwk);
    let mut expected_challenge = URL_SAFE_NO_PAD.decode(device_jwk.thumbprint().unwrap()).unwrap();
    expected_challenge.extend_from_slice(b"abc123");
    assert_eq!(
        harness.attestation.challenges.lock().unwrap().as_slice(),
        &[expected_challenge]
    );

    // The payload carries the device name and a CSR for the mTLS key
    let payload: serde_json::Value = serde_json::from_slice(&jws.payload().unwrap()).unwrap();
    assert_eq!(payload["name"], "trust-client");
    let csr = STANDARD.decode(payload["csr"].as_str().unwrap()).unwrap();
    assert_eq!(csr[0], 0x30);
}

#[tokio::test]
async fn complete_registration_without_csr() {
    let harness = Harness::start().await;
    Mock::given(method("POST"))
        .and(path("/reg/registrations"))
        .respond_with(ResponseTemplate::new(201).set_body_json(registration_body("complete", None)))
        .mount(&harness.server)
        .await;

    let mut config = ClientConfig::new(harness.server.uri());
    config.include_csr_in_registration = false;
    config.device_name = "kiosk-7".to_string();
    let mut engine =
        RegistrationEngine::new(config, harness.store.clone(), harness.attestation.clone()).unwrap();

    engine.register("n-1").await.unwrap();
    assert_eq!(engine.state(), ClientState::Registered);
    assert!(engine.mtls_identity().unwrap().certificate.is_none());

    let jws = &harness.jws_bodies("/reg/registrations").await[0];
    let payload: serde_json::Value = serde_json::from_slice(&jws.payload().unwrap()).unwrap();
    assert_eq!(payload, serde_json::json!({ "name": "kiosk-7" }));
}

#[tokio::test]
async fn server_reported_error_moves_to_registration_error() {
    let harness = Harness::start().await;
    Mock::given(method("POST"))
        .and(path("/reg/registrations"))
        .respond_with(ResponseTemplate::new(201).set_body_json(registration_body("cancelled", None)))
        .mount(&harness.server)
        .await;

    let mut engine = harness.engine();
    engine.register("n-1").await.unwrap();
    assert_eq!(engine.state(), ClientState::RegistrationError);

    let history: Vec<_> = engine.history().collect();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].from, ClientState::Unregistered);
    assert_eq!(history[0].to, ClientState::RegistrationError);
}

#[tokio::test]
async fn rejected_nonce_surfaces_as_bad_server_response() {
    let harness = Harness::start().await;
    Mock::given(method("POST"))
        .and(path("/reg/registrations"))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&harness.server)
        .await;

    let mut engine = harness.engine();
    let result = engine.register("replayed").await;
    assert!(matches!(result, Err(TrustClientError::BadServerResponse(400))));
    // Failures leave the state untouched
    assert_eq!(engine.state(), ClientState::Unregistered);
    assert_eq!(engine.history().count(), 0);
}

#[tokio::test]
async fn consumed_nonce_is_never_signed_again() {
    let harness = Harness::start().await;
    Mock::given(method("POST"))
        .and(path("/reg/registrations"))
        .respond_with(ResponseTemplate::new(201).set_body_json(registration_body("pending", None)))
        .expect(1)
        .mount(&harness.server)
        .await;

    let mut engine = harness.engine();
    engine.register("abc123").await.unwrap();
    assert!(matches!(
        engine.register("abc123").await,
        Err(TrustClientError::Protocol(_))
    ));
}

#[tokio::test]
async fn malformed_registration_body_is_a_protocol_error() {
    let harness = Harness::start().await;
    Mock::given(method("POST"))
        .and(path("/reg/registrations"))
        .respond_with(ResponseTemplate::new(201).set_body_string("{\"id\":"))
        .mount(&harness.server)
        .await;

    let mut engine = harness.engine();
    assert!(matches!(
        engine.register("n").await,
        Err(TrustClientError::Protocol(_))
    ));
    assert_eq!(engine.state(), ClientState::Unregistered);
}

#[tokio::test]
async fn fetch_registration_requires_polling_url() {
    let harness = Harness::start().await;
    let mut engine = harness.engine();
    assert!(matches!(
        engine.fetch_registration().await,
        Err(TrustClientError::ClientNotRegistered)
    ));
}

#[tokio::test]
async fn fetch_registration_sends_assertion_to_location() {
    let harness = Harness::start().await;
    harness.mount_nonce("n-2").await;
    Mock::given(method("POST"))
        .and(path("/reg/registrations"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("Location", "/reg/registrations/r1")
                .set_body_json(registration_body("pending", None)),
        )
        .mount(&harness.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/reg/registrations/r1"))
        .and(header("content-type", "application/jose"))
        .respond_with(ResponseTemplate::new(200).set_body_json(registration_body("complete", None)))
        .expect(1)
        .mount(&harness.server)
        .await;

    let mut engine = harness.engine();
    engine.register("n-1").await.unwrap();
    assert_eq!(
        engine.polling_url().map(|u| u.path()),
        Some("/reg/registrations/r1")
    );

    let output = engine.fetch_registration().await.unwrap().unwrap();
    assert_eq!(output.status, RegistrationStatus::Complete);
    assert_eq!(engine.state(), ClientState::Registered);

    let jws = &harness.jws_bodies("/reg/registrations/r1").await[0];
    jws.verify_with_embedded_key().unwrap();
    let header = jws.header().unwrap();
    assert_eq!(header.nonce, "n-2");
    assert!(header.cty.is_none());
    assert_eq!(
        header.attestation,
        AttestationExtension::Assertion(ASSERTION_BYTES.to_vec())
    );
    assert!(jws.payload().unwrap().is_empty());

    let transitions: Vec<_> = engine.history().map(|t| t.to).collect();
    assert_eq!(
        transitions,
        vec![ClientState::RegistrationPending, ClientState::Registered]
    );
}

#[tokio::test]
async fn bare_confirmation_keeps_pending_state() {
    let harness = Harness::start().await;
    harness.mount_nonce("n-2").await;
    Mock::given(method("POST"))
        .and(path("/reg/registrations"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("Location", "/reg/registrations/r1")
                .set_body_json(registration_body("pending", None)),
        )
        .mount(&harness.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/reg/registrations/r1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&harness.server)
        .await;

    let mut engine = harness.engine();
    engine.register("n-1").await.unwrap();

    assert!(engine.fetch_registration().await.unwrap().is_none());
    assert_eq!(engine.state(), ClientState::RegistrationPending);
    assert_eq!(engine.history().count(), 1);
}

#[tokio::test]
async fn undecodable_certificate_leaves_session_untouched() {
    let harness = Harness::start().await;
    Mock::given(method("POST"))
        .and(path("/reg/registrations"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("Location", "/reg/registrations/r9")
                .set_body_json(serde_json::json!({
                    "id": "r9",
                    "status": "complete",
                    "client": { "id": "c1", "certificate": "!!!notbase64" }
                })),
        )
        .mount(&harness.server)
        .await;

    let mut engine = harness.engine();
    assert!(matches!(
        engine.register("n-1").await,
        Err(TrustClientError::Protocol(_))
    ));
    assert!(engine.polling_url().is_none());
    assert_eq!(engine.state(), ClientState::Unregistered);
    assert_eq!(engine.history().count(), 0);
    assert!(engine.mtls_identity().unwrap().certificate.is_none());
}

#[tokio::test]
async fn update_mtls_certificate_installs_issued_pem() {
    let harness = Harness::start().await;
    let issued = test_certificate((2099, 6, 30));
    Mock::given(method("POST"))
        .and(path("/ca/issue-cert"))
        .and(header("content-type", "application/pkcs10"))
        .respond_with(ResponseTemplate::new(200).set_body_string(issued.pem()))
        .expect(1)
        .mount(&harness.server)
        .await;

    let mut engine = harness.engine();
    let certificate = engine.update_mtls_certificate().await.unwrap();

    // 2099-06-30T00:00:00Z
    assert_eq!(certificate.not_after, 4_086_460_800);
    let identity = engine.mtls_identity().unwrap();
    assert_eq!(identity.certificate.unwrap().not_after, certificate.not_after);
    assert_eq!(engine.state(), ClientState::Registered);

    // The CSR body is DER for the mTLS key
    let requests = harness.server.received_requests().await.unwrap();
    let csr = &requests[0].body;
    let (_, parsed) =
        x509_parser::certification_request::X509CertificationRequest::from_der(csr).unwrap();
    assert_eq!(
        parsed.certification_request_info.subject_pki.subject_public_key.data.as_ref(),
        identity.key.public_key().sec1_uncompressed()
    );
}

#[tokio::test]
async fn failed_issuance_keeps_previous_state() {
    let harness = Harness::start().await;
    Mock::given(method("POST"))
        .and(path("/ca/issue-cert"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&harness.server)
        .await;

    let mut engine = harness.engine();
    assert!(matches!(
        engine.update_mtls_certificate().await,
        Err(TrustClientError::BadServerResponse(500))
    ));
    assert_eq!(engine.state(), ClientState::Unregistered);
    assert!(engine.mtls_identity().unwrap().certificate.is_none());
}

#[tokio::test]
async fn initial_state_is_derived_from_installed_certificate() {
    let expired = Harness::start().await;
    expired
        .store
        .store_certificate("tcl:mtls:default", test_certificate((2020, 1, 1)).der())
        .unwrap();
    assert_eq!(expired.engine().state(), ClientState::RegistrationExpired);

    let valid = Harness::start().await;
    valid
        .store
        .store_certificate("tcl:mtls:default", test_certificate((2099, 1, 1)).der())
        .unwrap();
    assert_eq!(valid.engine().state(), ClientState::Registered);

    let empty = Harness::start().await;
    assert_eq!(empty.engine().state(), ClientState::Unregistered);
}

#[tokio::test]
async fn expiry_is_evaluated_when_state_is_queried() {
    let harness = Harness::start().await;
    harness
        .store
        .store_certificate("tcl:mtls:default", test_certificate((2099, 1, 1)).der())
        .unwrap();
    let engine = harness.engine();
    assert_eq!(engine.state(), ClientState::Registered);
    // 2100-01-01T00:00:00Z
    assert_eq!(engine.state_at(4_102_444_800), ClientState::RegistrationExpired);
}

#[tokio::test]
async fn reset_mtls_identity_rotates_key() {
    let harness = Harness::start().await;
    harness
        .store
        .store_certificate("tcl:mtls:default", test_certificate((2099, 1, 1)).der())
        .unwrap();
    let mut engine = harness.engine();
    let before = engine.mtls_identity().unwrap();

    engine.reset_mtls_identity().unwrap();
    let after = engine.mtls_identity().unwrap();
    assert_ne!(before.key.public_key(), after.key.public_key());
    assert!(after.certificate.is_none());
    assert_eq!(engine.state(), ClientState::Unregistered);
}

#[tokio::test]
async fn unreadable_stored_certificate_can_be_reset() {
    let harness = Harness::start().await;
    harness
        .store
        .store_certificate("tcl:mtls:default", b"not a certificate")
        .unwrap();

    let mut engine = harness.engine();
    assert_eq!(engine.state(), ClientState::Unregistered);

    engine.reset_mtls_identity().unwrap();
    assert!(harness.store.find_certificate("tcl:mtls:default").unwrap().is_none());
    assert!(engine.mtls_identity().unwrap().certificate.is_none());
}

#[tokio::test]
async fn echo_decodes_diagnostics() {
    let harness = Harness::start().await;
    Mock::given(method("GET"))
        .and(path("/echo"))
        .and(header("user-agent", "TrustClient/0.0.1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "headers": { "User-Agent": ["TrustClient/0.0.1"] },
            "host": "127.0.0.1",
            "metadata": {},
            "method": "GET",
            "proto": "HTTP/1.1",
            "remoteAddr": "127.0.0.1:40000",
            "requestURI": "/echo",
            "tlsCipherSuite": "",
            "tlsClientCertificates": [],
            "tlsHostname": "",
            "tlsVersion": ""
        })))
        .mount(&harness.server)
        .await;

    let engine = harness.engine();
    let echo = engine.echo().await.unwrap();
    assert_eq!(echo.method, "GET");
    assert_eq!(echo.request_uri, "/echo");
    assert!(echo.tls_client_certificates.is_empty());
}

#[tokio::test]
async fn invalid_configuration_is_rejected() {
    let store = Arc::new(SoftwareKeyStore::new());
    let config = ClientConfig::new("ftp://registration.test");
    let result = RegistrationEngine::new(config, store, Arc::new(StubAttestation::default()));
    assert!(matches!(result, Err(TrustClientError::Core(_))));
}
