//! Pairing protocol (C3): the SAS-over-ECDH handshake that lets a Listener
//! and a Monitor end up trusting each other's certificate fingerprint.
//!
//! This module implements the Monitor (server) side of both `/pair/init`
//! and `/pair/confirm`, plus the shared derivation helpers a Listener
//! implementation reuses to compute the same comparison code and
//! transcript HMAC independently.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::ecdh::EphemeralSecret;
use p256::PublicKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use uuid::Uuid;

use crate::b64;
use crate::canonical_json::to_canonical_bytes;
use crate::clock::Clock;
use crate::error::CribCallError;
use crate::identity::Identity;
use crate::trust_store::{PeerRole, TrustStore, TrustedPeer};

const SESSION_TTL_MS: i64 = 60_000;
const MAX_ATTEMPTS: u8 = 3;
const QR_TOKEN_TTL_MS: i64 = 10 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingState {
    Initiated,
    Confirmed,
    Failed,
    Expired,
}

struct Session {
    listener_fingerprint: String,
    listener_name: String,
    pairing_key: [u8; 32],
    comparison_code: u32,
    expires_at_ms: i64,
    attempts_remaining: u8,
    state: PairingState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PairInitRequest {
    pub listener_name: String,
    pub listener_fingerprint: String,
    #[serde(with = "b64")]
    pub listener_ecdh_public_key: Vec<u8>,
    #[serde(default)]
    pub qr_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PairInitResponse {
    pub session_id: Uuid,
    pub monitor_name: String,
    #[serde(with = "b64")]
    pub monitor_ecdh_public_key: Vec<u8>,
    pub expires_in_sec: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PairConfirmRequest {
    pub session_id: Uuid,
    #[serde(with = "b64")]
    pub auth_tag: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PairConfirmResponse {
    pub remote_device_id: String,
    pub monitor_name: String,
    #[serde(with = "b64")]
    pub certificate_der: Vec<u8>,
}

/// Transcript both sides HMAC to produce/verify `auth_tag`.
#[derive(Serialize)]
struct Transcript<'a> {
    session_id: Uuid,
    listener_fingerprint: &'a str,
    monitor_fingerprint: &'a str,
}

/// HKDF-SHA256 derivation of the pairing key and 6-digit comparison code
/// from a raw ECDH shared secret, per spec.md §4.3 steps 3–4. Both the
/// Monitor and the Listener call this with their independently-derived
/// `shared_secret` and must arrive at identical output.
pub fn derive_pairing_material(shared_secret: &[u8]) -> ([u8; 32], u32) {
    let hk = Hkdf::<Sha256>::new(Some(b""), shared_secret);

    let mut code_bytes = [0u8; 3];
    hk.expand(b"cribcall-pair-code", &mut code_bytes)
        .expect("3-byte OKM is within HKDF-SHA256's output limit");
    let code_value = u32::from_be_bytes([0, code_bytes[0], code_bytes[1], code_bytes[2]]);
    let comparison_code = code_value % 1_000_000;

    let mut pairing_key = [0u8; 32];
    hk.expand(b"cribcall-pair-key", &mut pairing_key)
        .expect("32-byte OKM is within HKDF-SHA256's output limit");

    (pairing_key, comparison_code)
}

/// Render a comparison code as 6 zero-padded decimal digits, as shown to
/// the human on both screens.
pub fn format_comparison_code(code: u32) -> String {
    format!("{code:06}")
}

fn compute_auth_tag(
    pairing_key: &[u8; 32],
    session_id: Uuid,
    listener_fingerprint: &str,
    monitor_fingerprint: &str,
) -> Result<Vec<u8>, CribCallError> {
    let transcript = Transcript {
        session_id,
        listener_fingerprint,
        monitor_fingerprint,
    };
    let bytes = to_canonical_bytes(&transcript)
        .map_err(|e| CribCallError::ProtocolError(e.to_string()))?;
    let mut mac = Hmac::<Sha256>::new_from_slice(pairing_key)
        .expect("HMAC-SHA256 accepts a 32-byte key");
    mac.update(&bytes);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Listener-side helper: compute the `auth_tag` to send in `/pair/confirm`.
/// Exposed so a Listener implementation in this crate (or a test acting as
/// one) can derive it the same way the Monitor verifies it.
pub fn listener_compute_auth_tag(
    pairing_key: &[u8; 32],
    session_id: Uuid,
    listener_fingerprint: &str,
    monitor_fingerprint: &str,
) -> Result<Vec<u8>, CribCallError> {
    compute_auth_tag(pairing_key, session_id, listener_fingerprint, monitor_fingerprint)
}

struct QrToken {
    issued_at_ms: i64,
    used: bool,
}

/// Monitor-side pairing state machine (spec.md §4.3). Holds short-lived
/// pairing sessions and single-use QR tokens; confirmed sessions add a
/// `TrustedPeer` record to the trust store.
pub struct PairingManager {
    identity: Arc<Identity>,
    display_name: String,
    trust_store: Arc<TrustStore>,
    clock: Arc<dyn Clock>,
    sessions: Mutex<HashMap<Uuid, Session>>,
    qr_tokens: Mutex<HashMap<String, QrToken>>,
}

impl PairingManager {
    pub fn new(
        identity: Arc<Identity>,
        display_name: String,
        trust_store: Arc<TrustStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            identity,
            display_name,
            trust_store,
            clock,
            sessions: Mutex::new(HashMap::new()),
            qr_tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a single-use QR-embedded pairing token (spec.md §4.3 "QR-token
    /// fast path"), valid for 10 minutes or until first use.
    pub fn issue_qr_token(&self) -> String {
        let token = Uuid::new_v4().to_string();
        self.qr_tokens.lock().unwrap().insert(
            token.clone(),
            QrToken {
                issued_at_ms: self.clock.now_ms(),
                used: false,
            },
        );
        token
    }

    /// Mint a QR token and render it as an SVG image encoding a
    /// `cribcall:` pairing URI, for display during `/pair/init`'s
    /// fast path. `pairing_addr` is the `host:port` a Listener should
    /// dial to reach this Monitor's pairing endpoint.
    pub fn issue_qr_code_svg(&self, pairing_addr: &str) -> Result<String, CribCallError> {
        let token = self.issue_qr_token();
        let uri = format!(
            "cribcall:pair?device={}&name={}&addr={}&token={}",
            self.identity.device_id,
            urlencoding_display_name(&self.display_name),
            pairing_addr,
            token
        );
        let code = qrcode::QrCode::new(uri.as_bytes())
            .map_err(|e| CribCallError::ProtocolError(format!("qr code generation failed: {e}")))?;
        Ok(code.render::<qrcode::render::svg::Color>().build())
    }

    fn consume_qr_token(&self, token: &str) -> bool {
        let mut tokens = self.qr_tokens.lock().unwrap();
        let Some(entry) = tokens.get_mut(token) else {
            return false;
        };
        if entry.used || self.clock.now_ms() - entry.issued_at_ms > QR_TOKEN_TTL_MS {
            return false;
        }
        entry.used = true;
        true
    }

    /// Handle `POST /pair/init`.
    pub fn handle_init(&self, req: PairInitRequest) -> Result<PairInitResponse, CribCallError> {
        if let Some(token) = &req.qr_token {
            // The fast path only needs the token to be currently valid;
            // the human comparison step is what it substitutes for, not
            // the cryptographic handshake itself.
            let _ = self.consume_qr_token(token);
        }

        let listener_public = PublicKey::from_sec1_bytes(&req.listener_ecdh_public_key)
            .map_err(|_| CribCallError::BadRequest("invalid listener_ecdh_public_key".into()))?;

        let monitor_ephemeral = EphemeralSecret::random(&mut OsRng);
        let monitor_public_bytes = monitor_ephemeral
            .public_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec();

        let shared = monitor_ephemeral.diffie_hellman(&listener_public);
        let (pairing_key, comparison_code) = derive_pairing_material(shared.raw_secret_bytes());

        let session_id = Uuid::new_v4();
        let now = self.clock.now_ms();
        self.sessions.lock().unwrap().insert(
            session_id,
            Session {
                listener_fingerprint: req.listener_fingerprint.to_ascii_lowercase(),
                listener_name: req.listener_name,
                pairing_key,
                comparison_code,
                expires_at_ms: now + SESSION_TTL_MS,
                attempts_remaining: MAX_ATTEMPTS,
                state: PairingState::Initiated,
            },
        );

        tracing::info!(
            %session_id,
            comparison_code = format_comparison_code(comparison_code),
            "pairing session initiated, display code for human comparison"
        );

        Ok(PairInitResponse {
            session_id,
            monitor_name: self.display_name.clone(),
            monitor_ecdh_public_key: monitor_public_bytes,
            expires_in_sec: (SESSION_TTL_MS / 1000) as u64,
        })
    }

    /// Handle `POST /pair/confirm`. On success, adds the Listener as a
    /// trusted peer and transitions the session to `Confirmed`.
    pub async fn handle_confirm(
        &self,
        req: PairConfirmRequest,
    ) -> Result<PairConfirmResponse, CribCallError> {
        let now = self.clock.now_ms();

        // Work under the lock only long enough to read/mutate the
        // session bookkeeping; the trust-store write happens after the
        // lock is released.
        let outcome = {
            let mut sessions = self.sessions.lock().unwrap();
            let Some(session) = sessions.get_mut(&req.session_id) else {
                return Err(CribCallError::PairingExpired);
            };

            if matches!(session.state, PairingState::Failed | PairingState::Expired) {
                return Err(CribCallError::PairingAttemptsExhausted);
            }
            if now >= session.expires_at_ms {
                session.state = PairingState::Expired;
                return Err(CribCallError::PairingExpired);
            }

            let expected = compute_auth_tag(
                &session.pairing_key,
                req.session_id,
                &session.listener_fingerprint,
                &self.identity.fingerprint_hex,
            )?;

            use subtle::ConstantTimeEq;
            if expected.ct_eq(&req.auth_tag).into() {
                session.state = PairingState::Confirmed;
                Some((session.listener_fingerprint.clone(), session.listener_name.clone()))
            } else {
                session.attempts_remaining = session.attempts_remaining.saturating_sub(1);
                if session.attempts_remaining == 0 {
                    session.state = PairingState::Failed;
                }
                return Err(CribCallError::PairingAuthFailed);
            }
        };

        let (listener_fingerprint, listener_name) = outcome.expect("checked Some above");

        self.trust_store
            .add(TrustedPeer {
                remote_device_id: listener_fingerprint.clone(),
                display_name: listener_name,
                certificate_fingerprint: listener_fingerprint.clone(),
                certificate_der: None,
                last_known_address: None,
                out_of_band_delivery_token: None,
                added_at: chrono::Utc::now(),
                role: PeerRole::Listener,
                control_port: None,
                pairing_port: None,
                transport_tag: None,
            })
            .await?;

        Ok(PairConfirmResponse {
            remote_device_id: self.identity.device_id.to_string(),
            monitor_name: self.display_name.clone(),
            certificate_der: self.identity.certificate_der.clone(),
        })
    }
}

/// Percent-encode the handful of characters that would otherwise break
/// the `cribcall:` URI's `key=value&...` structure. Display names are
/// free-form user text, not a full URI component.
fn urlencoding_display_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
