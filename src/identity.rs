//! Device identity and certificate service (C1).
//!
//! Generates, persists, and fingerprints the long-lived self-signed P-256
//! certificate each device uses as its mTLS identity. The identity is
//! immutable after first creation — there is no key rotation path short of
//! a factory reset that deletes the persisted record outright.

use async_trait::async_trait;
use rcgen::{CertificateParams, DistinguishedName, DnType, Ia5String, KeyPair, SanType};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::CribCallError;

const VALIDITY: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 10); // 10 years

/// A device's long-lived identity: a P-256 keypair, its self-signed
/// certificate, and the certificate's canonical fingerprint.
pub struct Identity {
    pub device_id: Uuid,
    pub certificate_der: Vec<u8>,
    private_key_der: Zeroizing<Vec<u8>>,
    pub fingerprint_hex: String,
}

impl Identity {
    pub fn private_key_der(&self) -> &[u8] {
        &self.private_key_der
    }
}

/// On-disk representation of an `Identity`. Kept separate from `Identity`
/// so the zeroizing wrapper around the private key never round-trips
/// through a `Deserialize` impl that could leave a copy on the heap.
#[derive(Serialize, Deserialize)]
struct PersistedIdentity {
    device_id: Uuid,
    certificate_der: Vec<u8>,
    private_key_der: Vec<u8>,
}

/// Injected secure storage adapter for the identity record (spec.md §6).
/// Implementations are expected to use platform-backed secure storage
/// (keychain, encrypted file, TPM-backed store) for `private_key_der`;
/// this crate only specifies the contract.
#[async_trait]
pub trait SecureIdentityStore: Send + Sync {
    async fn load(&self) -> Result<Option<Vec<u8>>, CribCallError>;
    async fn save(&self, serialized: &[u8]) -> Result<(), CribCallError>;
}

/// Load the persisted identity, or generate and persist a new one if none
/// exists yet. Never returns successfully without a durably persisted
/// identity — a store that can't persist is a fatal startup error, per
/// spec.md §4.1 ("never silently continue with an ephemeral identity").
pub async fn load_or_create(store: &dyn SecureIdentityStore) -> Result<Identity, CribCallError> {
    if let Some(bytes) = store.load().await? {
        return decode_persisted(&bytes);
    }

    let device_id = Uuid::new_v4();
    let (certificate_der, private_key_der) = generate_self_signed(device_id)?;
    let fingerprint_hex = fingerprint(&certificate_der);

    let persisted = PersistedIdentity {
        device_id,
        certificate_der: certificate_der.clone(),
        private_key_der: private_key_der.clone(),
    };
    let serialized =
        serde_json::to_vec(&persisted).map_err(|_| CribCallError::IdentityStoreUnavailable)?;
    store.save(&serialized).await?;

    Ok(Identity {
        device_id,
        certificate_der,
        private_key_der: Zeroizing::new(private_key_der),
        fingerprint_hex,
    })
}

fn decode_persisted(bytes: &[u8]) -> Result<Identity, CribCallError> {
    let persisted: PersistedIdentity =
        serde_json::from_slice(bytes).map_err(|_| CribCallError::IdentityStoreUnavailable)?;
    let fingerprint_hex = fingerprint(&persisted.certificate_der);
    Ok(Identity {
        device_id: persisted.device_id,
        certificate_der: persisted.certificate_der,
        private_key_der: Zeroizing::new(persisted.private_key_der),
        fingerprint_hex,
    })
}

fn generate_self_signed(device_id: Uuid) -> Result<(Vec<u8>, Vec<u8>), CribCallError> {
    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|_| CribCallError::IdentityStoreUnavailable)?;

    let san_uri = format!("cribcall:{device_id}");
    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|_| CribCallError::IdentityStoreUnavailable)?;
    params.subject_alt_names = vec![SanType::URI(
        Ia5String::try_from(san_uri).map_err(|_| CribCallError::IdentityStoreUnavailable)?,
    )];

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "CribCall Device");
    params.distinguished_name = dn;

    let now = rcgen::date_time_ymd(2020, 1, 1);
    params.not_before = now;
    params.not_after = now + VALIDITY;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|_| CribCallError::IdentityStoreUnavailable)?;

    Ok((cert.der().to_vec(), key_pair.serialize_der()))
}

/// SHA-256 of the certificate DER, rendered as 64 lowercase hex chars.
/// This is the canonical device fingerprint used everywhere in the
/// control plane; callers MUST compare fingerprints case-insensitively
/// but always emit them in this lowercase form (spec.md §4.1).
pub fn fingerprint(certificate_der: &[u8]) -> String {
    let digest = Sha256::digest(certificate_der);
    hex::encode(digest)
}

/// Normalize a fingerprint for case-insensitive comparison.
pub fn normalize_fingerprint(fp: &str) -> String {
    fp.to_ascii_lowercase()
}

/// Parsed view over a certificate's DER bytes, sufficient for the
/// control plane's needs (it never inspects anything beyond the
/// fingerprint and SAN URI device id).
#[derive(Debug, Clone)]
pub struct ParsedCertificate {
    pub fingerprint_hex: String,
    pub der: Vec<u8>,
}

pub fn parse_certificate(der: &[u8]) -> ParsedCertificate {
    ParsedCertificate {
        fingerprint_hex: fingerprint(der),
        der: der.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct InMemoryIdentityStore(Mutex<Option<Vec<u8>>>);

    #[async_trait]
    impl SecureIdentityStore for InMemoryIdentityStore {
        async fn load(&self) -> Result<Option<Vec<u8>>, CribCallError> {
            Ok(self.0.lock().unwrap().clone())
        }

        async fn save(&self, serialized: &[u8]) -> Result<(), CribCallError> {
            *self.0.lock().unwrap() = Some(serialized.to_vec());
            Ok(())
        }
    }

    #[tokio::test]
    async fn fingerprint_matches_sha256_of_der() {
        let store = InMemoryIdentityStore::default();
        let identity = load_or_create(&store).await.unwrap();
        assert_eq!(identity.fingerprint_hex, fingerprint(&identity.certificate_der));
        assert_eq!(identity.fingerprint_hex.len(), 64);
        assert!(identity.fingerprint_hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[tokio::test]
    async fn second_load_reuses_persisted_identity() {
        let store = InMemoryIdentityStore::default();
        let first = load_or_create(&store).await.unwrap();
        let second = load_or_create(&store).await.unwrap();
        assert_eq!(first.device_id, second.device_id);
        assert_eq!(first.fingerprint_hex, second.fingerprint_hex);
    }

    #[tokio::test]
    async fn unavailable_store_fails_closed() {
        struct BrokenStore;
        #[async_trait]
        impl SecureIdentityStore for BrokenStore {
            async fn load(&self) -> Result<Option<Vec<u8>>, CribCallError> {
                Ok(None)
            }
            async fn save(&self, _serialized: &[u8]) -> Result<(), CribCallError> {
                Err(CribCallError::IdentityStoreUnavailable)
            }
        }
        let result = load_or_create(&BrokenStore).await;
        assert!(matches!(result, Err(CribCallError::IdentityStoreUnavailable)));
    }
}
