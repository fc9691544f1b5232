//! TLS configuration for the control plane's two listeners (C5).
//!
//! Both listeners present the local device's self-signed identity
//! certificate. The pairing endpoint authenticates the server only; the
//! control endpoint additionally demands and validates a client
//! certificate whose fingerprint is a live member of the [`TrustStore`] —
//! there is no certificate authority anywhere in this system, so both
//! directions of verification are hand-rolled against the fingerprint set
//! rather than delegated to a root-of-trust chain validator.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, Error as TlsError, SignatureScheme};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::CribCallError;
use crate::identity::{fingerprint, Identity};
use crate::trust_store::TrustStore;

const SUPPORTED_SCHEMES: &[SignatureScheme] = &[
    SignatureScheme::ECDSA_NISTP256_SHA256,
    SignatureScheme::ECDSA_NISTP384_SHA384,
];

/// Verifies a peer certificate by checking its SHA-256 fingerprint
/// against the live trust store rather than a CA chain. Used on both the
/// client side (Listener validating the Monitor's server certificate
/// against its pinned expectation) and the server side (Monitor
/// validating an inbound client certificate on the control endpoint).
struct FingerprintVerifier {
    trust_store: Arc<TrustStore>,
}

impl fmt::Debug for FingerprintVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FingerprintVerifier").finish()
    }
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let fp = fingerprint(end_entity.as_ref());
        if self.trust_store.contains(&fp) {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(TlsError::General(format!(
                "server certificate fingerprint {fp} is not in the trust store"
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        SUPPORTED_SCHEMES.to_vec()
    }
}

/// Verifies a server certificate against a single fingerprint obtained
/// out-of-band (QR code or discovery-browse entry), rather than trust
/// store membership — used only for the pairing dial (spec.md §4.3 step
/// 1), since the Listener has nothing in its trust store yet. Records a
/// mismatch in `mismatched` so the caller can map a generic TLS handshake
/// failure back to [`CribCallError::ServerPinMismatch`] after the fact;
/// rustls's verifier trait has no richer error channel to carry a typed
/// cause through the handshake.
struct PinnedFingerprintVerifier {
    expected_fingerprint: String,
    mismatched: Arc<AtomicBool>,
}

impl fmt::Debug for PinnedFingerprintVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedFingerprintVerifier").finish()
    }
}

impl ServerCertVerifier for PinnedFingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let fp = fingerprint(end_entity.as_ref());
        if crate::identity::normalize_fingerprint(&fp)
            == crate::identity::normalize_fingerprint(&self.expected_fingerprint)
        {
            Ok(ServerCertVerified::assertion())
        } else {
            self.mismatched.store(true, Ordering::SeqCst);
            Err(TlsError::General(format!(
                "server certificate fingerprint {fp} does not match pinned {expected}",
                expected = self.expected_fingerprint
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        SUPPORTED_SCHEMES.to_vec()
    }
}

/// Client-certificate verifier for the control endpoint. Unlike
/// [`FingerprintVerifier`]'s server-side use, this side's admission
/// decision must be re-checked on every handshake since trust-store
/// membership can change (a peer can be unpaired) between connections.
struct TrustStoreClientVerifier {
    trust_store: Arc<TrustStore>,
}

impl fmt::Debug for TrustStoreClientVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustStoreClientVerifier").finish()
    }
}

impl ClientCertVerifier for TrustStoreClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, TlsError> {
        let fp = fingerprint(end_entity.as_ref());
        if self.trust_store.contains(&fp) {
            Ok(ClientCertVerified::assertion())
        } else {
            Err(TlsError::General(format!(
                "client certificate fingerprint {fp} is not trusted"
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        SUPPORTED_SCHEMES.to_vec()
    }
}

fn identity_cert_chain(identity: &Identity) -> Vec<CertificateDer<'static>> {
    vec![CertificateDer::from(identity.certificate_der.clone())]
}

fn identity_private_key(identity: &Identity) -> PrivateKeyDer<'static> {
    PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(identity.private_key_der().to_vec()))
}

/// Server config for the pairing endpoint: presents the local identity,
/// demands no client certificate (a would-be Listener has nothing to
/// present yet — that's the point of pairing).
pub fn pairing_server_config(identity: &Identity) -> Result<rustls::ServerConfig, CribCallError> {
    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(identity_cert_chain(identity), identity_private_key(identity))
        .map_err(|e| CribCallError::ProtocolError(format!("pairing TLS config: {e}")))
}

/// Server config for the control endpoint: mandatory mTLS, client
/// certificates validated live against `trust_store`.
pub fn control_server_config(
    identity: &Identity,
    trust_store: Arc<TrustStore>,
) -> Result<rustls::ServerConfig, CribCallError> {
    let verifier: Arc<dyn ClientCertVerifier> = Arc::new(TrustStoreClientVerifier { trust_store });
    rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(identity_cert_chain(identity), identity_private_key(identity))
        .map_err(|e| CribCallError::ProtocolError(format!("control TLS config: {e}")))
}

/// Client config used by a Listener dialing a Monitor's pairing endpoint
/// (server-authenticated TLS only, no client certificate — spec.md §4.3
/// step 1). Pins the server certificate to `expected_fingerprint`, the
/// value obtained out-of-band via QR or discovery-browse selection. The
/// returned flag is set if the handshake rejects the server's certificate
/// for a fingerprint mismatch, letting the caller raise
/// [`CribCallError::ServerPinMismatch`] instead of a generic TLS error.
pub fn pairing_client_config(expected_fingerprint: &str) -> (rustls::ClientConfig, Arc<AtomicBool>) {
    let mismatched = Arc::new(AtomicBool::new(false));
    let verifier: Arc<dyn ServerCertVerifier> = Arc::new(PinnedFingerprintVerifier {
        expected_fingerprint: expected_fingerprint.to_string(),
        mismatched: mismatched.clone(),
    });
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    (config, mismatched)
}

/// Client config used by a Listener dialing a Monitor's control endpoint.
/// Presents the Listener's own identity certificate and pins the server
/// certificate to `trust_store` membership instead of a CA chain.
pub fn control_client_config(
    identity: &Identity,
    trust_store: Arc<TrustStore>,
) -> Result<rustls::ClientConfig, CribCallError> {
    let verifier: Arc<dyn ServerCertVerifier> = Arc::new(FingerprintVerifier { trust_store });
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(identity_cert_chain(identity), identity_private_key(identity))
        .map_err(|e| CribCallError::ProtocolError(format!("control client TLS config: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::UnixTime;

    async fn generated_identity() -> Identity {
        struct NullStore;
        #[async_trait::async_trait]
        impl crate::identity::SecureIdentityStore for NullStore {
            async fn load(&self) -> Result<Option<Vec<u8>>, CribCallError> {
                Ok(None)
            }
            async fn save(&self, _bytes: &[u8]) -> Result<(), CribCallError> {
                Ok(())
            }
        }
        crate::identity::load_or_create(&NullStore).await.unwrap()
    }

    #[tokio::test]
    async fn pinned_verifier_accepts_matching_fingerprint() {
        let identity = generated_identity().await;
        let mismatched = Arc::new(AtomicBool::new(false));
        let verifier = PinnedFingerprintVerifier {
            expected_fingerprint: identity.fingerprint_hex.clone(),
            mismatched: mismatched.clone(),
        };
        let cert = CertificateDer::from(identity.certificate_der.clone());
        let result = verifier.verify_server_cert(
            &cert,
            &[],
            &ServerName::try_from("monitor.local").unwrap(),
            &[],
            UnixTime::now(),
        );
        assert!(result.is_ok());
        assert!(!mismatched.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn pinned_verifier_rejects_mismatched_fingerprint() {
        let identity = generated_identity().await;
        let mismatched = Arc::new(AtomicBool::new(false));
        let verifier = PinnedFingerprintVerifier {
            expected_fingerprint:
                "0000000000000000000000000000000000000000000000000000000000000000".to_string(),
            mismatched: mismatched.clone(),
        };
        let cert = CertificateDer::from(identity.certificate_der.clone());
        let result = verifier.verify_server_cert(
            &cert,
            &[],
            &ServerName::try_from("monitor.local").unwrap(),
            &[],
            UnixTime::now(),
        );
        assert!(result.is_err());
        assert!(mismatched.load(Ordering::SeqCst));
    }

    #[test]
    fn pairing_client_config_builds_without_error() {
        let (_config, mismatched) = pairing_client_config("abc123");
        assert!(!mismatched.load(Ordering::SeqCst));
    }
}
