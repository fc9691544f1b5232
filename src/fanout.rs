//! Noise fan-out engine (C8): turns a detected [`NoiseEvent`] into
//! deliveries — to live control sessions immediately, and to stored
//! subscriptions (push gateway or webhook) subject to threshold and
//! cooldown filtering.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;

use crate::error::CribCallError;
use crate::noise_event::NoiseEvent;
use crate::subscription::{DeliveryKind, NoiseSubscription, SubscriptionRegistry};

pub const DEFAULT_THRESHOLD: u8 = 40;
pub const DEFAULT_COOLDOWN_SECS: u64 = 60;
const WORKER_POOL_SIZE: usize = 4;
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of attempting to deliver one [`NoiseEvent`] to one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Skipped,
    TransientFailure,
    PermanentFailure,
}

/// Abstraction over whatever sends a push notification to a stored
/// delivery token (FCM/APNs in production, a recording fake in tests).
#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn push(
        &self,
        platform_tag: &str,
        delivery_token: &str,
        event: &NoiseEvent,
    ) -> Result<(), CribCallError>;
}

/// Holds the live control sessions that should receive noise events
/// immediately, keyed by the fingerprint of the peer owning the session.
#[async_trait]
pub trait LiveSessionSink: Send + Sync {
    async fn send_noise_event(
        &self,
        peer_fingerprint: &str,
        event: &NoiseEvent,
    ) -> Result<bool, CribCallError>;
}

struct CooldownTracker {
    last_sent_ms: Mutex<HashMap<String, i64>>,
}

impl CooldownTracker {
    fn new() -> Self {
        Self {
            last_sent_ms: Mutex::new(HashMap::new()),
        }
    }

    async fn allow(&self, subscription_id: &str, now_ms: i64, cooldown_secs: u64) -> bool {
        let mut guard = self.last_sent_ms.lock().await;
        match guard.get(subscription_id) {
            Some(last) if now_ms - last < (cooldown_secs as i64 * 1000) => false,
            _ => {
                guard.insert(subscription_id.to_string(), now_ms);
                true
            }
        }
    }
}

pub struct FanoutEngine {
    subscriptions: Arc<SubscriptionRegistry>,
    gateway: Arc<dyn PushGateway>,
    live: Arc<dyn LiveSessionSink>,
    http_client: reqwest::Client,
    cooldowns: CooldownTracker,
}

impl FanoutEngine {
    pub fn new(
        subscriptions: Arc<SubscriptionRegistry>,
        gateway: Arc<dyn PushGateway>,
        live: Arc<dyn LiveSessionSink>,
    ) -> Self {
        Self {
            subscriptions,
            gateway,
            live,
            http_client: reqwest::Client::builder()
                .timeout(WEBHOOK_TIMEOUT)
                .build()
                .expect("static reqwest client config is always valid"),
            cooldowns: CooldownTracker::new(),
        }
    }

    /// Apply the per-subscription (or default) threshold filter.
    fn passes_threshold(event: &NoiseEvent, sub: &NoiseSubscription) -> bool {
        event.peak_level >= sub.threshold_override.unwrap_or(DEFAULT_THRESHOLD)
    }

    /// Entry point: this Monitor has one event source (itself), so every
    /// active subscription is a candidate — there is no per-source filter
    /// (spec.md §4.8). Apply the per-subscriber threshold and cooldown
    /// filter (steps 1–2) and only then pick a delivery path — a live
    /// control session takes priority over the stored path, and both are
    /// gated by the same filter so a peer who happens to be connected gets
    /// no special exemption from its own override. Stored deliveries run
    /// on a bounded worker pool so a slow webhook can't hold up sibling
    /// deliveries or the caller.
    pub async fn dispatch(&self, event: NoiseEvent, now_ms: i64) -> Result<Vec<DeliveryOutcome>, CribCallError> {
        let candidates = self.subscriptions.active_snapshot(now_ms).await;
        let candidates: Vec<NoiseSubscription> = candidates
            .into_iter()
            .filter(|s| Self::passes_threshold(&event, s))
            .collect();

        let semaphore = Arc::new(tokio::sync::Semaphore::new(WORKER_POOL_SIZE));
        let mut tasks = tokio::task::JoinSet::new();

        for sub in candidates {
            let cooldown_secs = sub.cooldown_seconds_override.unwrap_or(DEFAULT_COOLDOWN_SECS);
            if !self.cooldowns.allow(&sub.subscription_id, now_ms, cooldown_secs).await {
                tasks.spawn(async move { (sub.subscription_id, DeliveryOutcome::Skipped) });
                continue;
            }

            let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
            let live = self.live.clone();
            let gateway = self.gateway.clone();
            let http_client = self.http_client.clone();
            let event = event.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let outcome = deliver(&live, &gateway, &http_client, &sub, &event).await;
                (sub.subscription_id, outcome)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(result) = tasks.join_next().await {
            let (subscription_id, outcome) = result.map_err(|e| {
                CribCallError::ProtocolError(format!("delivery task panicked: {e}"))
            })?;
            if outcome == DeliveryOutcome::Delivered {
                let _ = self.subscriptions.mark_delivered(&subscription_id, now_ms).await;
            }
            if outcome == DeliveryOutcome::PermanentFailure {
                let _ = self.subscriptions.remove(&subscription_id).await;
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

/// Try the live session first; fall back to the subscription's stored
/// delivery path only if no live session accepted the event.
async fn deliver(
    live: &Arc<dyn LiveSessionSink>,
    gateway: &Arc<dyn PushGateway>,
    http_client: &reqwest::Client,
    sub: &NoiseSubscription,
    event: &NoiseEvent,
) -> DeliveryOutcome {
    match live.send_noise_event(&sub.certificate_fingerprint, event).await {
        Ok(true) => DeliveryOutcome::Delivered,
        Ok(false) => deliver_stored(gateway, http_client, sub, event).await,
        Err(_) => DeliveryOutcome::TransientFailure,
    }
}

async fn deliver_stored(
    gateway: &Arc<dyn PushGateway>,
    http_client: &reqwest::Client,
    sub: &NoiseSubscription,
    event: &NoiseEvent,
) -> DeliveryOutcome {
    match sub.delivery_kind {
        DeliveryKind::LiveOnly => DeliveryOutcome::Skipped,
        DeliveryKind::GatewayPush => {
            match gateway.push(&sub.platform_tag, &sub.delivery_token, event).await {
                Ok(()) => DeliveryOutcome::Delivered,
                Err(CribCallError::DeliveryFailedPermanent(_)) => DeliveryOutcome::PermanentFailure,
                Err(_) => DeliveryOutcome::TransientFailure,
            }
        }
        DeliveryKind::Webhook => deliver_webhook(http_client, sub, event).await,
    }
}

async fn deliver_webhook(
    http_client: &reqwest::Client,
    sub: &NoiseSubscription,
    event: &NoiseEvent,
) -> DeliveryOutcome {
    let Some(url) = &sub.webhook_url else {
        return DeliveryOutcome::PermanentFailure;
    };
    match http_client.post(url).json(event).send().await {
        Ok(resp) if resp.status().is_success() => DeliveryOutcome::Delivered,
        Ok(resp) if resp.status().as_u16() == 410 || resp.status().as_u16() == 404 => {
            DeliveryOutcome::PermanentFailure
        }
        Ok(_) => DeliveryOutcome::TransientFailure,
        Err(_) => DeliveryOutcome::TransientFailure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::{SubscribeRequest, SubscriptionRepository};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct InMemorySubRepo(StdMutex<HashMap<String, NoiseSubscription>>);

    #[async_trait]
    impl SubscriptionRepository for InMemorySubRepo {
        async fn load_all(&self) -> Result<Vec<NoiseSubscription>, CribCallError> {
            Ok(self.0.lock().unwrap().values().cloned().collect())
        }
        async fn put(&self, sub: &NoiseSubscription) -> Result<(), CribCallError> {
            self.0.lock().unwrap().insert(sub.subscription_id.clone(), sub.clone());
            Ok(())
        }
        async fn delete(&self, subscription_id: &str) -> Result<(), CribCallError> {
            self.0.lock().unwrap().remove(subscription_id);
            Ok(())
        }
    }

    struct CountingGateway(AtomicUsize);
    #[async_trait]
    impl PushGateway for CountingGateway {
        async fn push(&self, _platform: &str, _token: &str, _event: &NoiseEvent) -> Result<(), CribCallError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct NoopLiveSink;
    #[async_trait]
    impl LiveSessionSink for NoopLiveSink {
        async fn send_noise_event(&self, _fp: &str, _event: &NoiseEvent) -> Result<bool, CribCallError> {
            Ok(false)
        }
    }

    fn event(level: u8) -> NoiseEvent {
        NoiseEvent {
            source_device_id: "device-1".into(),
            monitor_display_name: "Nursery".into(),
            peak_level: level,
            timestamp_ms: 0,
        }
    }

    async fn registry_with_one_sub(lease_seconds: u64) -> Arc<SubscriptionRegistry> {
        let registry = Arc::new(SubscriptionRegistry::load(Arc::new(InMemorySubRepo::default())).await.unwrap());
        registry
            .subscribe(
                "device-1",
                "fp-a",
                SubscribeRequest {
                    delivery_token: "T1".into(),
                    platform_tag: "ios".into(),
                    delivery_kind: Some(DeliveryKind::GatewayPush),
                    webhook_url: None,
                    threshold: None,
                    cooldown_seconds: None,
                    auto_stream_type: None,
                    auto_stream_duration: None,
                    lease_seconds: Some(lease_seconds),
                },
                0,
            )
            .await
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn below_threshold_event_is_not_delivered() {
        let registry = registry_with_one_sub(3600).await;
        let gateway = Arc::new(CountingGateway(AtomicUsize::new(0)));
        let engine = FanoutEngine::new(registry, gateway.clone(), Arc::new(NoopLiveSink));
        let outcomes = engine.dispatch(event(DEFAULT_THRESHOLD - 1), 0).await.unwrap();
        assert!(outcomes.is_empty());
        assert_eq!(gateway.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn above_threshold_event_is_delivered_once() {
        let registry = registry_with_one_sub(3600).await;
        let gateway = Arc::new(CountingGateway(AtomicUsize::new(0)));
        let engine = FanoutEngine::new(registry, gateway.clone(), Arc::new(NoopLiveSink));
        let outcomes = engine.dispatch(event(DEFAULT_THRESHOLD), 0).await.unwrap();
        assert_eq!(outcomes, vec![DeliveryOutcome::Delivered]);
        assert_eq!(gateway.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cooldown_suppresses_second_event() {
        let registry = registry_with_one_sub(3600).await;
        let gateway = Arc::new(CountingGateway(AtomicUsize::new(0)));
        let engine = FanoutEngine::new(registry, gateway.clone(), Arc::new(NoopLiveSink));
        engine.dispatch(event(90), 0).await.unwrap();
        let second = engine.dispatch(event(90), 1_000).await.unwrap();
        assert_eq!(second, vec![DeliveryOutcome::Skipped]);
        assert_eq!(gateway.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cooldown_expires_after_window() {
        let registry = registry_with_one_sub(3600).await;
        let gateway = Arc::new(CountingGateway(AtomicUsize::new(0)));
        let engine = FanoutEngine::new(registry, gateway.clone(), Arc::new(NoopLiveSink));
        engine.dispatch(event(90), 0).await.unwrap();
        let second = engine
            .dispatch(event(90), (DEFAULT_COOLDOWN_SECS as i64 + 1) * 1000)
            .await
            .unwrap();
        assert_eq!(second, vec![DeliveryOutcome::Delivered]);
        assert_eq!(gateway.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expired_subscription_receives_nothing() {
        let registry = registry_with_one_sub(1).await;
        let gateway = Arc::new(CountingGateway(AtomicUsize::new(0)));
        let engine = FanoutEngine::new(registry, gateway.clone(), Arc::new(NoopLiveSink));
        let outcomes = engine.dispatch(event(90), 5_000).await.unwrap();
        assert!(outcomes.is_empty());
        assert_eq!(gateway.0.load(Ordering::SeqCst), 0);
    }
}
