//! Listener-side dialing code for both transports (C5, C3's client half).
//!
//! The Monitor side of the pairing and control endpoints lives in
//! [`crate::transport`]; this module is the Listener's counterpart —
//! dialing `/pair/init`/`/pair/confirm` with server-pin verification, then
//! opening the mTLS control connection and driving the same
//! [`ControlSession`] state machine the Monitor runs, with
//! exponential-backoff reconnection (spec.md §4.6 "Reconnection").

use p256::ecdh::EphemeralSecret;
use p256::PublicKey;
use rand::rngs::OsRng;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::clock::RandomSource;
use crate::error::CribCallError;
use crate::framing::{encode_frame, FrameDecoder};
use crate::identity::Identity;
use crate::message::ControlMessage;
use crate::pairing::{
    derive_pairing_material, format_comparison_code, listener_compute_auth_tag, PairConfirmRequest,
    PairConfirmResponse, PairInitRequest, PairInitResponse,
};
use crate::session::{reconnect_backoff, ControlSession, MediaSignalHandler, HEARTBEAT_INTERVAL};
use crate::transport::http::{read_response, Request};
use crate::transport::tls;

fn server_name_for(addr: &SocketAddr) -> rustls::pki_types::ServerName<'static> {
    rustls::pki_types::ServerName::IpAddress(addr.ip().into())
}

/// The Listener-side state produced by [`dial_pair_init`], carried forward
/// into [`dial_pair_confirm`] once the human has compared the
/// [`PairingChallenge::comparison_code`] on both screens.
pub struct PairingChallenge {
    session_id: uuid::Uuid,
    pairing_key: [u8; 32],
    comparison_code: u32,
    pub monitor_name: String,
    listener_fingerprint: String,
    monitor_fingerprint: String,
}

impl PairingChallenge {
    pub fn comparison_code(&self) -> String {
        format_comparison_code(self.comparison_code)
    }
}

/// `POST /pair/init` against `addr`, pinning the TLS server certificate to
/// `expected_monitor_fingerprint` (obtained out-of-band — QR or discovery
/// selection). Aborts with [`CribCallError::ServerPinMismatch`] before any
/// payload is sent if the presented certificate doesn't match (spec.md
/// §4.3 step 1).
pub async fn dial_pair_init(
    addr: SocketAddr,
    expected_monitor_fingerprint: &str,
    identity: &Identity,
    listener_name: String,
    qr_token: Option<String>,
) -> Result<PairingChallenge, CribCallError> {
    let (tls_config, mismatched) = tls::pairing_client_config(expected_monitor_fingerprint);
    let connector = TlsConnector::from(Arc::new(tls_config));

    let tcp = TcpStream::connect(addr)
        .await
        .map_err(|e| CribCallError::ProtocolError(format!("connect to pairing endpoint: {e}")))?;
    let mut stream = connector
        .connect(server_name_for(&addr), tcp)
        .await
        .map_err(|_| {
            if mismatched.load(Ordering::SeqCst) {
                CribCallError::ServerPinMismatch
            } else {
                CribCallError::HandshakeTimeout
            }
        })?;

    let listener_secret = EphemeralSecret::random(&mut OsRng);
    let listener_public_bytes = listener_secret.public_key().to_encoded_point(true).as_bytes().to_vec();

    let init_req = PairInitRequest {
        listener_name,
        listener_fingerprint: identity.fingerprint_hex.clone(),
        listener_ecdh_public_key: listener_public_bytes,
        qr_token,
    };
    let body = serde_json::to_vec(&init_req)
        .map_err(|e| CribCallError::ProtocolError(format!("encode pair/init request: {e}")))?;
    let request = Request::post_json("/pair/init", body);
    stream
        .write_all(&request.to_bytes())
        .await
        .map_err(|e| CribCallError::ProtocolError(e.to_string()))?;

    let response = read_response(&mut stream).await?;
    let init_resp: PairInitResponse = response.json()?;

    let monitor_public = PublicKey::from_sec1_bytes(&init_resp.monitor_ecdh_public_key)
        .map_err(|_| CribCallError::ProtocolError("invalid monitor_ecdh_public_key".into()))?;
    let shared = listener_secret.diffie_hellman(&monitor_public);
    let (pairing_key, comparison_code) = derive_pairing_material(shared.raw_secret_bytes());

    Ok(PairingChallenge {
        session_id: init_resp.session_id,
        pairing_key,
        comparison_code,
        monitor_name: init_resp.monitor_name,
        listener_fingerprint: identity.fingerprint_hex.clone(),
        monitor_fingerprint: expected_monitor_fingerprint.to_string(),
    })
}

/// `POST /pair/confirm` once the human has confirmed
/// [`PairingChallenge::comparison_code`] matches the Monitor's displayed
/// code. Dials a fresh pinned TLS connection, same as `dial_pair_init`.
pub async fn dial_pair_confirm(
    addr: SocketAddr,
    challenge: PairingChallenge,
) -> Result<PairConfirmResponse, CribCallError> {
    let (tls_config, mismatched) = tls::pairing_client_config(&challenge.monitor_fingerprint);
    let connector = TlsConnector::from(Arc::new(tls_config));

    let tcp = TcpStream::connect(addr)
        .await
        .map_err(|e| CribCallError::ProtocolError(format!("connect to pairing endpoint: {e}")))?;
    let mut stream = connector
        .connect(server_name_for(&addr), tcp)
        .await
        .map_err(|_| {
            if mismatched.load(Ordering::SeqCst) {
                CribCallError::ServerPinMismatch
            } else {
                CribCallError::HandshakeTimeout
            }
        })?;

    let auth_tag = listener_compute_auth_tag(
        &challenge.pairing_key,
        challenge.session_id,
        &challenge.listener_fingerprint,
        &challenge.monitor_fingerprint,
    )?;

    let body = serde_json::to_vec(&PairConfirmRequest {
        session_id: challenge.session_id,
        auth_tag,
    })
    .map_err(|e| CribCallError::ProtocolError(format!("encode pair/confirm request: {e}")))?;
    let request = Request::post_json("/pair/confirm", body);
    stream
        .write_all(&request.to_bytes())
        .await
        .map_err(|e| CribCallError::ProtocolError(e.to_string()))?;

    let response = read_response(&mut stream).await?;
    response.json()
}

/// Drive a single mTLS connection to the Monitor's control endpoint:
/// dial, upgrade `/control/ws`, then loop reading/writing framed messages
/// against a fresh [`ControlSession`] until the peer closes or a protocol
/// error occurs. Returns when the connection ends; the caller decides
/// whether to reconnect.
pub async fn run_control_client_once(
    addr: SocketAddr,
    identity: &Identity,
    trust_store: Arc<crate::trust_store::TrustStore>,
    peer_fingerprint: String,
    peer_device_id: String,
    media_handler: Option<Arc<dyn MediaSignalHandler>>,
    mut on_message: impl FnMut(ControlMessage),
) -> Result<(), CribCallError> {
    let tls_config = tls::control_client_config(identity, trust_store)?;
    let connector = TlsConnector::from(Arc::new(tls_config));

    let tcp = TcpStream::connect(addr)
        .await
        .map_err(|e| CribCallError::ProtocolError(format!("connect to control endpoint: {e}")))?;
    let mut stream = connector
        .connect(server_name_for(&addr), tcp)
        .await
        .map_err(|e| CribCallError::ProtocolError(format!("control TLS handshake: {e}")))?;

    let upgrade = Request::get("/control/ws", true);
    stream
        .write_all(&upgrade.to_bytes())
        .await
        .map_err(|e| CribCallError::ProtocolError(e.to_string()))?;
    let response = read_response(&mut stream).await?;
    if !response.is_upgrade() {
        return Err(CribCallError::ProtocolError(format!(
            "control endpoint refused upgrade: status {}",
            response.status
        )));
    }

    let session = Arc::new(ControlSession::new(peer_fingerprint, peer_device_id, media_handler));
    session.mark_open().await;

    let mut decoder = FrameDecoder::new();
    let mut read_buf = [0u8; 4096];
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    let result: Result<(), CribCallError> = 'conn: loop {
        tokio::select! {
            read_result = stream.read(&mut read_buf) => {
                let n = match read_result {
                    Ok(n) => n,
                    Err(e) => break 'conn Err(CribCallError::ProtocolError(e.to_string())),
                };
                if n == 0 {
                    break 'conn Ok(());
                }
                decoder.push(&read_buf[..n]);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(payload)) => {
                            let message = match ControlMessage::from_frame(&payload) {
                                Ok(m) => m,
                                Err(e) => break 'conn Err(e),
                            };
                            match session.handle_inbound(message).await {
                                Ok(Some(app_message)) => on_message(app_message),
                                Ok(None) => {}
                                Err(e) => break 'conn Err(e),
                            }
                        }
                        Ok(None) => break,
                        Err(e) => break 'conn Err(e),
                    }
                }
            }
            outbound = session.next_outbound() => {
                match outbound {
                    Some(message) => {
                        let bytes = match serde_json::to_vec(&message) {
                            Ok(b) => b,
                            Err(e) => break 'conn Err(CribCallError::ProtocolError(e.to_string())),
                        };
                        let frame = match encode_frame(&bytes) {
                            Ok(f) => f,
                            Err(e) => break 'conn Err(e),
                        };
                        if let Err(e) = stream.write_all(&frame).await {
                            break 'conn Err(CribCallError::ProtocolError(e.to_string()));
                        }
                    }
                    None => break 'conn Ok(()),
                }
            }
            _ = heartbeat.tick() => {
                if session.record_missed_pong() {
                    session.begin_drain().await;
                    break 'conn Err(CribCallError::IdleTimeout);
                }
                if let Err(e) = session.send_ping().await {
                    break 'conn Err(e);
                }
            }
        }
    };

    session.close().await;
    result
}

/// Reconnect loop: calls [`run_control_client_once`] repeatedly with
/// exponential backoff (spec.md §4.6) until `should_continue` returns
/// `false`. Each attempt re-dials and re-validates the pinned fingerprint
/// from scratch via `control_client_config`'s trust-store check.
pub async fn run_control_client_with_reconnect(
    addr: SocketAddr,
    identity: Arc<Identity>,
    trust_store: Arc<crate::trust_store::TrustStore>,
    peer_fingerprint: String,
    peer_device_id: String,
    media_handler: Option<Arc<dyn MediaSignalHandler>>,
    random: Arc<dyn RandomSource>,
    mut on_message: impl FnMut(ControlMessage),
    mut should_continue: impl FnMut() -> bool,
) {
    let mut attempt = 0u32;
    while should_continue() {
        let outcome = run_control_client_once(
            addr,
            &identity,
            trust_store.clone(),
            peer_fingerprint.clone(),
            peer_device_id.clone(),
            media_handler.clone(),
            &mut on_message,
        )
        .await;

        match outcome {
            Ok(()) => attempt = 0,
            Err(e) => {
                tracing::warn!(error = %e, attempt, "control client connection ended, will reconnect");
                attempt += 1;
            }
        }

        if !should_continue() {
            break;
        }
        let mut jitter_bytes = [0u8; 1];
        random.fill_bytes(&mut jitter_bytes);
        let jitter_unit = jitter_bytes[0] as f64 / 255.0;
        tokio::time::sleep(reconnect_backoff(attempt, jitter_unit)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge(comparison_code: u32) -> PairingChallenge {
        PairingChallenge {
            session_id: uuid::Uuid::new_v4(),
            pairing_key: [0u8; 32],
            comparison_code,
            monitor_name: "Nursery Monitor".to_string(),
            listener_fingerprint: "aa".repeat(32),
            monitor_fingerprint: "bb".repeat(32),
        }
    }

    #[test]
    fn comparison_code_pads_to_six_digits() {
        assert_eq!(challenge(42).comparison_code(), "000042");
    }

    #[test]
    fn comparison_code_passes_through_six_digit_values() {
        assert_eq!(challenge(913_042).comparison_code(), "913042");
    }

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
    async fn dial_pair_init_surfaces_connection_failure_without_reaching_tls() {
        // Port 0 never accepts a connection; this exercises the TCP-connect
        // error path without depending on any live listener.
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let identity = generated_identity().await;
        let result = dial_pair_init(addr, &"ff".repeat(32), &identity, "Listener".to_string(), None).await;
        assert!(matches!(result, Err(CribCallError::ProtocolError(_))));
    }
}
