//! Control session manager (C6): the per-connection state machine that
//! sits on top of a framed TLS stream once `/control/ws` has upgraded
//! (spec.md §5).

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Duration;

use crate::error::CribCallError;
use crate::message::ControlMessage;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const MISSED_PONG_LIMIT: u32 = 3;
pub const DRAIN_GRACE: Duration = Duration::from_secs(2);
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

pub const RECONNECT_MIN_BACKOFF: Duration = Duration::from_secs(1);
pub const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(30);
const RECONNECT_JITTER_FRACTION: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Draining,
    Closed,
}

/// Opaque relay sink for out-of-band media signaling (WebRTC SDP/ICE).
/// The session forwards [`ControlMessage::WebrtcOffer`]/`Answer`/`Ice`
/// frames through here without ever inspecting their payload.
#[async_trait]
pub trait MediaSignalHandler: Send + Sync {
    async fn handle_signal(&self, message: &ControlMessage) -> Result<(), CribCallError>;
}

struct QueueSlot {
    message: ControlMessage,
}

/// Bounded outbound queue with priority displacement: when full, a
/// priority message (see [`ControlMessage::is_priority`]) evicts the
/// oldest non-priority entry instead of being rejected outright
/// (spec.md §5.4). A non-priority send into a full queue fails with
/// [`CribCallError::Backpressure`].
struct OutboundQueue {
    slots: Mutex<std::collections::VecDeque<QueueSlot>>,
    capacity: usize,
    notify: Notify,
}

impl OutboundQueue {
    fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(std::collections::VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    async fn push(&self, message: ControlMessage) -> Result<(), CribCallError> {
        let mut slots = self.slots.lock().await;
        if slots.len() >= self.capacity {
            if message.is_priority() {
                if let Some(pos) = slots.iter().position(|s| !s.message.is_priority()) {
                    slots.remove(pos);
                } else {
                    slots.pop_front();
                }
            } else {
                return Err(CribCallError::Backpressure);
            }
        }
        slots.push_back(QueueSlot { message });
        drop(slots);
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self) -> Option<ControlMessage> {
        loop {
            {
                let mut slots = self.slots.lock().await;
                if let Some(slot) = slots.pop_front() {
                    return Some(slot.message);
                }
            }
            self.notify.notified().await;
        }
    }

    async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }
}

/// A single open control connection. Framing and TLS I/O live outside
/// this type (see [`crate::transport`]); `ControlSession` owns only
/// protocol state — the heartbeat clock, the outbound queue, and the
/// connecting→open→draining→closed lifecycle.
pub struct ControlSession {
    pub peer_fingerprint: String,
    pub peer_device_id: String,
    state: Mutex<SessionState>,
    outbound: OutboundQueue,
    missed_pongs: AtomicU64,
    ping_nonce: AtomicU64,
    media_handler: Option<Arc<dyn MediaSignalHandler>>,
}

impl ControlSession {
    pub fn new(
        peer_fingerprint: String,
        peer_device_id: String,
        media_handler: Option<Arc<dyn MediaSignalHandler>>,
    ) -> Self {
        Self {
            peer_fingerprint,
            peer_device_id,
            state: Mutex::new(SessionState::Connecting),
            outbound: OutboundQueue::new(DEFAULT_QUEUE_CAPACITY),
            missed_pongs: AtomicU64::new(0),
            ping_nonce: AtomicU64::new(0),
            media_handler,
        }
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    pub async fn mark_open(&self) {
        *self.state.lock().await = SessionState::Open;
    }

    /// Begin graceful shutdown: no further application messages are
    /// accepted, but [`ControlSession::enqueue`] still allows priority
    /// frames (e.g. a final `END_STREAM`) during the drain grace period.
    pub async fn begin_drain(&self) {
        let mut state = self.state.lock().await;
        if *state == SessionState::Open {
            *state = SessionState::Draining;
        }
    }

    pub async fn close(&self) {
        *self.state.lock().await = SessionState::Closed;
    }

    /// Queue an outbound message for the writer task to pick up.
    pub async fn enqueue(&self, message: ControlMessage) -> Result<(), CribCallError> {
        let state = self.state().await;
        if state == SessionState::Closed {
            return Err(CribCallError::ProtocolError("session closed".into()));
        }
        if state == SessionState::Draining && !message.is_priority() {
            return Err(CribCallError::ProtocolError("session draining".into()));
        }
        self.outbound.push(message).await
    }

    /// Called by the writer task loop; blocks until a message is queued.
    pub async fn next_outbound(&self) -> Option<ControlMessage> {
        if self.state().await == SessionState::Closed {
            return None;
        }
        self.outbound.pop().await
    }

    pub async fn queue_depth(&self) -> usize {
        self.outbound.len().await
    }

    /// Issue a heartbeat ping, returning the nonce the matching PONG must
    /// echo.
    pub async fn send_ping(&self) -> Result<u64, CribCallError> {
        let nonce = self.ping_nonce.fetch_add(1, Ordering::SeqCst);
        self.outbound.push(ControlMessage::Ping { nonce }).await?;
        Ok(nonce)
    }

    /// Record a received PONG, resetting the missed-heartbeat counter.
    pub fn record_pong(&self, _nonce: u64) {
        self.missed_pongs.store(0, Ordering::SeqCst);
    }

    /// Called when a heartbeat interval elapses with no matching PONG.
    /// Returns `true` once [`MISSED_PONG_LIMIT`] is reached, at which
    /// point the caller must transition the session to draining.
    pub fn record_missed_pong(&self) -> bool {
        let missed = self.missed_pongs.fetch_add(1, Ordering::SeqCst) + 1;
        missed >= MISSED_PONG_LIMIT as u64
    }

    /// Dispatch an inbound message: heartbeat replies are handled here,
    /// opaque WebRTC signaling is relayed to the injected handler, and
    /// everything else is returned to the caller for application-level
    /// handling.
    pub async fn handle_inbound(&self, message: ControlMessage) -> Result<Option<ControlMessage>, CribCallError> {
        match &message {
            ControlMessage::Ping { nonce } => {
                self.outbound.push(ControlMessage::Pong { nonce: *nonce }).await?;
                Ok(None)
            }
            ControlMessage::Pong { nonce } => {
                self.record_pong(*nonce);
                Ok(None)
            }
            ControlMessage::WebrtcOffer { .. }
            | ControlMessage::WebrtcAnswer { .. }
            | ControlMessage::WebrtcIce { .. } => {
                if let Some(handler) = &self.media_handler {
                    handler.handle_signal(&message).await?;
                }
                Ok(None)
            }
            _ => Ok(Some(message)),
        }
    }
}

/// Computes the exponential backoff delay a Listener uses between
/// reconnection attempts (spec.md §5.7): doubling from
/// [`RECONNECT_MIN_BACKOFF`] to [`RECONNECT_MAX_BACKOFF`], with up to
/// ±20% jitter supplied by the caller's [`crate::clock::RandomSource`].
pub fn reconnect_backoff(attempt: u32, jitter_unit: f64) -> Duration {
    let base = RECONNECT_MIN_BACKOFF.as_secs_f64() * 2f64.powi(attempt as i32);
    let base = base.min(RECONNECT_MAX_BACKOFF.as_secs_f64());
    let jitter = base * RECONNECT_JITTER_FRACTION * (2.0 * jitter_unit - 1.0);
    Duration::from_secs_f64((base + jitter).max(0.0))
}

/// Tagged outbound relay channel handed to transport code so it can push
/// frames without taking a lock on [`ControlSession`] directly.
pub fn outbound_channel(capacity: usize) -> (mpsc::Sender<Value>, mpsc::Receiver<Value>) {
    mpsc::channel(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise_event::NoiseEvent;

    fn sample_noise() -> ControlMessage {
        ControlMessage::NoiseEvent {
            payload: NoiseEvent {
                source_device_id: "device-1".into(),
                monitor_display_name: "Nursery".into(),
                peak_level: 80,
                timestamp_ms: 0,
            },
        }
    }

    #[tokio::test]
    async fn new_session_starts_connecting() {
        let session = ControlSession::new("fp".into(), "device-1".into(), None);
        assert_eq!(session.state().await, SessionState::Connecting);
    }

    #[tokio::test]
    async fn ping_pong_resets_missed_counter() {
        let session = ControlSession::new("fp".into(), "device-1".into(), None);
        session.record_missed_pong();
        session.record_missed_pong();
        session.record_pong(0);
        assert!(!session.record_missed_pong());
    }

    #[tokio::test]
    async fn three_missed_pongs_trips_drain_threshold() {
        let session = ControlSession::new("fp".into(), "device-1".into(), None);
        assert!(!session.record_missed_pong());
        assert!(!session.record_missed_pong());
        assert!(session.record_missed_pong());
    }

    #[tokio::test]
    async fn draining_session_rejects_non_priority_but_allows_priority() {
        let session = ControlSession::new("fp".into(), "device-1".into(), None);
        session.mark_open().await;
        session.begin_drain().await;
        let rejected = session
            .enqueue(ControlMessage::PinStream { stream_type: "audio".into() })
            .await;
        assert!(rejected.is_err());
        assert!(session.enqueue(sample_noise()).await.is_ok());
    }

    #[tokio::test]
    async fn closed_session_rejects_everything() {
        let session = ControlSession::new("fp".into(), "device-1".into(), None);
        session.close().await;
        assert!(session.enqueue(sample_noise()).await.is_err());
        assert!(session.next_outbound().await.is_none());
    }

    #[tokio::test]
    async fn full_queue_displaces_oldest_non_priority_for_priority_message() {
        let session = ControlSession::new("fp".into(), "device-1".into(), None);
        session.mark_open().await;
        for i in 0..DEFAULT_QUEUE_CAPACITY {
            session
                .enqueue(ControlMessage::PinStream { stream_type: format!("audio-{i}") })
                .await
                .unwrap();
        }
        assert_eq!(session.queue_depth().await, DEFAULT_QUEUE_CAPACITY);
        assert!(session.enqueue(sample_noise()).await.is_ok());
        assert_eq!(session.queue_depth().await, DEFAULT_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn full_queue_rejects_non_priority_with_backpressure() {
        let session = ControlSession::new("fp".into(), "device-1".into(), None);
        session.mark_open().await;
        for i in 0..DEFAULT_QUEUE_CAPACITY {
            session
                .enqueue(ControlMessage::PinStream { stream_type: format!("audio-{i}") })
                .await
                .unwrap();
        }
        let result = session
            .enqueue(ControlMessage::PinStream { stream_type: "overflow".into() })
            .await;
        assert!(matches!(result, Err(CribCallError::Backpressure)));
    }

    #[test]
    fn reconnect_backoff_caps_at_max() {
        let delay = reconnect_backoff(20, 0.5);
        assert!(delay <= RECONNECT_MAX_BACKOFF + RECONNECT_MAX_BACKOFF.mul_f64(RECONNECT_JITTER_FRACTION));
    }

    #[test]
    fn reconnect_backoff_grows_with_attempt() {
        let first = reconnect_backoff(0, 0.5);
        let second = reconnect_backoff(1, 0.5);
        assert!(second > first);
    }
}
