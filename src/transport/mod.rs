//! Control transport (C5): two TLS listeners — pairing (server-auth
//! only) and control (mandatory mTLS) — speaking the fixed five-route
//! HTTP surface of spec.md §6, plus the `/control/ws` upgrade into the
//! length-prefixed framed stream that [`crate::session::ControlSession`]
//! runs on.

pub mod client;
pub mod http;
pub mod tls;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio_rustls::TlsAcceptor;

use crate::error::CribCallError;
use crate::fanout::{FanoutEngine, LiveSessionSink};
use crate::framing::{encode_frame, FrameDecoder};
use crate::identity::{fingerprint, Identity};
use crate::message::ControlMessage;
use crate::noise_event::NoiseEvent;
use crate::pairing::{PairConfirmRequest, PairInitRequest, PairingManager};
use crate::session::{ControlSession, MediaSignalHandler, SessionState, DRAIN_GRACE, HEARTBEAT_INTERVAL};
use crate::subscription::{SubscribeRequest, SubscriptionRegistry, UnsubscribeRequest};
use crate::trust_store::TrustStore;
use http::{read_request, Request, Response};

/// Every currently-open control session, keyed by peer fingerprint.
/// Shared between the transport accept loop (which registers/evicts
/// sessions as connections open and close) and [`FanoutEngine`], which
/// uses it as a [`LiveSessionSink`] so a noise event can reach an
/// already-open session without either layer owning the other
/// (spec.md §9, "a single owning structure ... avoid duplicated state").
pub struct LiveSessionRegistry {
    sessions: AsyncMutex<HashMap<String, Arc<ControlSession>>>,
}

impl LiveSessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: AsyncMutex::new(HashMap::new()),
        }
    }

    async fn register(&self, fingerprint: &str, session: Arc<ControlSession>) {
        self.sessions.lock().await.insert(fingerprint.to_string(), session);
    }

    async fn unregister(&self, fingerprint: &str) {
        self.sessions.lock().await.remove(fingerprint);
    }

    async fn get(&self, fingerprint: &str) -> Option<Arc<ControlSession>> {
        self.sessions.lock().await.get(fingerprint).cloned()
    }

    /// Evict the live control session for `fingerprint`, if any, by
    /// moving it straight to draining and then closed.
    pub async fn evict(&self, fingerprint: &str) {
        if let Some(session) = self.get(fingerprint).await {
            session.begin_drain().await;
            session.close().await;
        }
    }
}

impl Default for LiveSessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LiveSessionSink for LiveSessionRegistry {
    /// Enqueue the event on the peer's open session, if any. `NOISE_EVENT`
    /// is a priority message (see [`ControlMessage::is_priority`]) so this
    /// only fails to enqueue when the session itself is already closed,
    /// in which case the caller falls back to the subscriber's stored
    /// delivery path.
    async fn send_noise_event(&self, peer_fingerprint: &str, event: &NoiseEvent) -> Result<bool, CribCallError> {
        let Some(session) = self.get(peer_fingerprint).await else {
            return Ok(false);
        };
        if session.state().await != SessionState::Open {
            return Ok(false);
        }
        let message = ControlMessage::NoiseEvent { payload: event.clone() };
        match session.enqueue(message).await {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}

/// Everything a route handler needs, bundled so [`serve_control`] and
/// [`serve_pairing`] can be free functions rather than methods on a god
/// object. `sessions` is the same [`LiveSessionRegistry`] handed to the
/// [`FanoutEngine`], so `/unpair` can evict the live connection in the
/// same request that removes trust (spec.md §4.7).
pub struct ControlPlane {
    pub identity: Arc<Identity>,
    pub trust_store: Arc<TrustStore>,
    pub pairing: Arc<PairingManager>,
    pub subscriptions: Arc<SubscriptionRegistry>,
    pub fanout: Arc<FanoutEngine>,
    pub media_handler: Option<Arc<dyn MediaSignalHandler>>,
    sessions: Arc<LiveSessionRegistry>,
}

impl ControlPlane {
    pub fn new(
        identity: Arc<Identity>,
        trust_store: Arc<TrustStore>,
        pairing: Arc<PairingManager>,
        subscriptions: Arc<SubscriptionRegistry>,
        fanout: Arc<FanoutEngine>,
        sessions: Arc<LiveSessionRegistry>,
        media_handler: Option<Arc<dyn MediaSignalHandler>>,
    ) -> Self {
        Self {
            identity,
            trust_store,
            pairing,
            subscriptions,
            fanout,
            media_handler,
            sessions,
        }
    }

    async fn register_session(&self, fingerprint: &str, session: Arc<ControlSession>) {
        self.sessions.register(fingerprint, session).await;
    }

    async fn unregister_session(&self, fingerprint: &str) {
        self.sessions.unregister(fingerprint).await;
    }

    async fn evict_session(&self, fingerprint: &str) {
        self.sessions.evict(fingerprint).await;
    }
}

/// Accept loop for the pairing endpoint: server-authenticated TLS only,
/// routes `POST /pair/init` and `POST /pair/confirm`.
pub async fn serve_pairing(
    addr: SocketAddr,
    plane: Arc<ControlPlane>,
) -> Result<(), CribCallError> {
    let tls_config = tls::pairing_server_config(&plane.identity)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| CribCallError::ProtocolError(format!("bind pairing listener: {e}")))?;

    loop {
        let (tcp, _peer_addr) = listener
            .accept()
            .await
            .map_err(|e| CribCallError::ProtocolError(format!("accept: {e}")))?;
        let acceptor = acceptor.clone();
        let plane = plane.clone();
        tokio::spawn(async move {
            match acceptor.accept(tcp).await {
                Ok(stream) => {
                    if let Err(e) = handle_pairing_connection(stream, plane).await {
                        tracing::warn!(error = %e, "pairing connection ended with an error");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "pairing TLS handshake failed"),
            }
        });
    }
}

async fn handle_pairing_connection<S>(
    mut stream: tokio_rustls::server::TlsStream<S>,
    plane: Arc<ControlPlane>,
) -> Result<(), CribCallError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let request = read_request(&mut stream).await?;
    let response = route_pairing(&plane, &request).await;
    stream
        .write_all(&response.to_bytes())
        .await
        .map_err(|e| CribCallError::ProtocolError(e.to_string()))?;
    Ok(())
}

async fn route_pairing(plane: &Arc<ControlPlane>, request: &Request) -> Response {
    let result = match (request.method.as_str(), request.path.as_str()) {
        ("POST", "/pair/init") => parse_body::<PairInitRequest>(request)
            .and_then(|req| plane.pairing.handle_init(req))
            .and_then(|resp| to_json(&resp)),
        ("POST", "/pair/confirm") => match parse_body::<PairConfirmRequest>(request) {
            Ok(req) => match plane.pairing.handle_confirm(req).await {
                Ok(resp) => to_json(&resp),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        },
        _ => Err(CribCallError::NotFound),
    };

    match result {
        Ok(resp) => resp,
        Err(e) => Response::error(&e),
    }
}

/// Accept loop for the control endpoint: mandatory mTLS. Routes
/// `/noise/subscribe`, `/noise/unsubscribe`, `/unpair`, and upgrades
/// `GET /control/ws` into a framed [`ControlSession`].
pub async fn serve_control(addr: SocketAddr, plane: Arc<ControlPlane>) -> Result<(), CribCallError> {
    let tls_config = tls::control_server_config(&plane.identity, plane.trust_store.clone())?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| CribCallError::ProtocolError(format!("bind control listener: {e}")))?;

    loop {
        let (tcp, _peer_addr) = listener
            .accept()
            .await
            .map_err(|e| CribCallError::ProtocolError(format!("accept: {e}")))?;
        let acceptor = acceptor.clone();
        let plane = plane.clone();
        tokio::spawn(async move {
            match acceptor.accept(tcp).await {
                Ok(stream) => {
                    if let Err(e) = handle_control_connection(stream, plane).await {
                        tracing::warn!(error = %e, "control connection ended with an error");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "control TLS handshake failed"),
            }
        });
    }
}

fn peer_fingerprint<S>(stream: &tokio_rustls::server::TlsStream<S>) -> Result<String, CribCallError> {
    let (_, session) = stream.get_ref();
    let certs = session
        .peer_certificates()
        .ok_or(CribCallError::ClientCertificateRequired)?;
    let end_entity = certs.first().ok_or(CribCallError::ClientCertificateRequired)?;
    Ok(fingerprint(end_entity.as_ref()))
}

async fn handle_control_connection<S>(
    mut stream: tokio_rustls::server::TlsStream<S>,
    plane: Arc<ControlPlane>,
) -> Result<(), CribCallError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let peer_fp = peer_fingerprint(&stream)?;
    if !plane.trust_store.contains(&peer_fp) {
        let response = Response::error(&CribCallError::ClientCertificateUntrusted);
        stream
            .write_all(&response.to_bytes())
            .await
            .map_err(|e| CribCallError::ProtocolError(e.to_string()))?;
        return Ok(());
    }

    let peer = plane
        .trust_store
        .get(&peer_fp)
        .ok_or(CribCallError::ClientCertificateUntrusted)?;

    let request = read_request(&mut stream).await?;

    if request.method == "GET" && request.path == "/control/ws" && request.is_upgrade() {
        let upgrade = Response::upgrade();
        stream
            .write_all(&upgrade.to_bytes())
            .await
            .map_err(|e| CribCallError::ProtocolError(e.to_string()))?;
        return run_control_session(stream, peer_fp, peer.remote_device_id, plane).await;
    }

    let response = route_control(&plane, &peer_fp, &peer.remote_device_id, &request).await;
    stream
        .write_all(&response.to_bytes())
        .await
        .map_err(|e| CribCallError::ProtocolError(e.to_string()))?;
    Ok(())
}

async fn route_control(
    plane: &Arc<ControlPlane>,
    peer_fp: &str,
    peer_device_id: &str,
    request: &Request,
) -> Response {
    let result = match (request.method.as_str(), request.path.as_str()) {
        ("POST", "/noise/subscribe") => match parse_body::<SubscribeRequest>(request) {
            Ok(req) => match plane
                .subscriptions
                .subscribe(peer_device_id, peer_fp, req, plane_now_ms())
                .await
            {
                Ok(resp) => to_json(&resp),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        },
        ("POST", "/noise/unsubscribe") => match parse_body::<UnsubscribeRequest>(request) {
            Ok(req) => match plane.subscriptions.unsubscribe(peer_device_id, req).await {
                Ok(resp) => to_json(&resp),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        },
        ("POST", "/unpair") => match plane.trust_store.remove(peer_fp).await {
            Ok(_) => {
                let _ = plane.subscriptions.remove_all_for(peer_fp).await;
                plane.evict_session(peer_fp).await;
                Ok(Response::json(200, b"{\"unpaired\":true}"))
            }
            Err(e) => Err(e),
        },
        ("GET", "/health") => Ok(Response::json(200, b"{\"status\":\"ok\"}")),
        _ => Err(CribCallError::NotFound),
    };

    match result {
        Ok(resp) => resp,
        Err(e) => Response::error(&e),
    }
}

fn plane_now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as i64
}

/// Drive an upgraded `/control/ws` connection: a reader task decodes
/// frames into [`ControlMessage`]s and feeds [`ControlSession`], while
/// the writer loop drains the session's outbound queue back onto the
/// wire. Either half ending closes the session.
async fn run_control_session<S>(
    mut stream: tokio_rustls::server::TlsStream<S>,
    peer_fingerprint: String,
    peer_device_id: String,
    plane: Arc<ControlPlane>,
) -> Result<(), CribCallError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let session = Arc::new(ControlSession::new(
        peer_fingerprint.clone(),
        peer_device_id,
        plane.media_handler.clone(),
    ));
    session.mark_open().await;
    plane.register_session(&peer_fingerprint, session.clone()).await;

    let mut decoder = FrameDecoder::new();
    let mut read_buf = [0u8; 4096];
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // first tick fires immediately; consume it.

    let result = run_control_session_loop(
        &mut stream,
        &mut decoder,
        &mut read_buf,
        &mut heartbeat,
        &session,
        &plane,
    )
    .await;

    session.close().await;
    plane.unregister_session(&peer_fingerprint).await;
    result
}

async fn run_control_session_loop<S>(
    stream: &mut tokio_rustls::server::TlsStream<S>,
    decoder: &mut FrameDecoder,
    read_buf: &mut [u8; 4096],
    heartbeat: &mut tokio::time::Interval,
    session: &Arc<ControlSession>,
    plane: &Arc<ControlPlane>,
) -> Result<(), CribCallError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            read_result = stream.read(read_buf) => {
                let n = read_result.map_err(|e| CribCallError::ProtocolError(e.to_string()))?;
                if n == 0 {
                    break;
                }
                decoder.push(&read_buf[..n]);
                while let Some(payload) = decoder.next_frame()? {
                    let message = ControlMessage::from_frame(&payload)?;
                    if let Some(to_app) = session.handle_inbound(message).await? {
                        handle_application_message(plane, session, to_app).await?;
                    }
                }
            }
            outbound = session.next_outbound() => {
                match outbound {
                    Some(message) => {
                        let bytes = serde_json::to_vec(&message)
                            .map_err(|e| CribCallError::ProtocolError(e.to_string()))?;
                        let frame = encode_frame(&bytes)?;
                        stream.write_all(&frame).await
                            .map_err(|e| CribCallError::ProtocolError(e.to_string()))?;
                    }
                    None => break,
                }
            }
            _ = heartbeat.tick() => {
                if session.record_missed_pong() {
                    session.begin_drain().await;
                    tokio::time::sleep(DRAIN_GRACE).await;
                    break;
                }
                session.send_ping().await?;
            }
        }
    }
    Ok(())
}

/// Application-level messages that are neither heartbeat nor opaque
/// media signaling land here. The control plane itself only needs to
/// react to `FCM_TOKEN_UPDATE`; everything else is forwarded to the
/// session's media handler path by the caller before reaching here.
async fn handle_application_message(
    _plane: &Arc<ControlPlane>,
    _session: &Arc<ControlSession>,
    message: ControlMessage,
) -> Result<(), CribCallError> {
    match message {
        ControlMessage::FcmTokenUpdate { .. } => Ok(()),
        _ => Ok(()),
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(request: &Request) -> Result<T, CribCallError> {
    serde_json::from_slice(&request.body)
        .map_err(|e| CribCallError::BadRequest(format!("invalid request body: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Response, CribCallError> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| CribCallError::ProtocolError(e.to_string()))?;
    Ok(Response::json(200, &bytes))
}
