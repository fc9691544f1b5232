//! Integration coverage for the noise fan-out engine: threshold,
//! cooldown, and lease-expiry behavior driven entirely through the
//! public subscription/fanout API.

use async_trait::async_trait;
use cribcall_core::error::CribCallError;
use cribcall_core::fanout::{DeliveryOutcome, FanoutEngine, LiveSessionSink, PushGateway};
use cribcall_core::noise_event::NoiseEvent;
use cribcall_core::subscription::{
    DeliveryKind, NoiseSubscription, SubscribeRequest, SubscriptionRegistry, SubscriptionRepository,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct InMemorySubRepo(Mutex<HashMap<String, NoiseSubscription>>);

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

struct CountingGateway {
    count: AtomicUsize,
}

#[async_trait]
impl PushGateway for CountingGateway {
    async fn push(&self, _platform: &str, _token: &str, _event: &NoiseEvent) -> Result<(), CribCallError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct NoopLiveSink;

#[async_trait]
impl LiveSessionSink for NoopLiveSink {
    async fn send_noise_event(&self, _peer_fingerprint: &str, _event: &NoiseEvent) -> Result<bool, CribCallError> {
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

fn event_at(level: u8, timestamp_ms: i64) -> NoiseEvent {
    NoiseEvent {
        source_device_id: "device-1".into(),
        monitor_display_name: "Nursery".into(),
        peak_level: level,
        timestamp_ms,
    }
}

struct AlwaysLiveSink(AtomicUsize);

#[async_trait]
impl LiveSessionSink for AlwaysLiveSink {
    async fn send_noise_event(&self, _peer_fingerprint: &str, _event: &NoiseEvent) -> Result<bool, CribCallError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

/// Mirrors spec.md §8 scenario 3: a connected peer's own threshold/cooldown
/// override still gates delivery on the live path exactly as it would on
/// the stored path — being connected is not an exemption.
#[tokio::test]
async fn live_session_delivery_is_still_gated_by_threshold_and_cooldown() {
    let registry = Arc::new(SubscriptionRegistry::load(Arc::new(InMemorySubRepo::default())).await.unwrap());
    registry
        .subscribe(
            "device-1",
            "fp-b",
            SubscribeRequest {
                delivery_token: "token-1".into(),
                platform_tag: "ios".into(),
                delivery_kind: Some(DeliveryKind::LiveOnly),
                webhook_url: None,
                threshold: Some(70),
                cooldown_seconds: Some(5),
                auto_stream_type: None,
                auto_stream_duration: None,
                lease_seconds: Some(3600),
            },
            0,
        )
        .await
        .unwrap();

    let live = Arc::new(AlwaysLiveSink(AtomicUsize::new(0)));
    let gateway = Arc::new(CountingGateway { count: AtomicUsize::new(0) });
    let engine = FanoutEngine::new(registry, gateway, live.clone());

    let outcomes = engine.dispatch(event_at(65, 1000), 1000).await.unwrap();
    assert!(outcomes.is_empty(), "below override threshold must not reach the live sink");
    assert_eq!(live.0.load(Ordering::SeqCst), 0);

    let outcomes = engine.dispatch(event_at(80, 2000), 2000).await.unwrap();
    assert_eq!(outcomes, vec![DeliveryOutcome::Delivered]);
    assert_eq!(live.0.load(Ordering::SeqCst), 1);

    let outcomes = engine.dispatch(event_at(90, 4000), 4000).await.unwrap();
    assert_eq!(outcomes, vec![DeliveryOutcome::Skipped], "within the 5s cooldown window");
    assert_eq!(live.0.load(Ordering::SeqCst), 1);

    let outcomes = engine.dispatch(event_at(75, 7500), 7500).await.unwrap();
    assert_eq!(outcomes, vec![DeliveryOutcome::Delivered], "cooldown has elapsed");
    assert_eq!(live.0.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn subscribe_then_receive_above_threshold_event() {
    let registry = Arc::new(SubscriptionRegistry::load(Arc::new(InMemorySubRepo::default())).await.unwrap());
    registry
        .subscribe(
            "device-1",
            "fp-a",
            SubscribeRequest {
                delivery_token: "token-1".into(),
                platform_tag: "android".into(),
                delivery_kind: Some(DeliveryKind::GatewayPush),
                webhook_url: None,
                threshold: Some(50),
                cooldown_seconds: Some(30),
                auto_stream_type: None,
                auto_stream_duration: None,
                lease_seconds: Some(3600),
            },
            0,
        )
        .await
        .unwrap();

    let gateway = Arc::new(CountingGateway { count: AtomicUsize::new(0) });
    let engine = FanoutEngine::new(registry, gateway.clone(), Arc::new(NoopLiveSink));

    let outcomes = engine.dispatch(event(60), 0).await.unwrap();
    assert_eq!(outcomes, vec![DeliveryOutcome::Delivered]);
    assert_eq!(gateway.count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unsubscribing_stops_further_deliveries() {
    let registry = Arc::new(SubscriptionRegistry::load(Arc::new(InMemorySubRepo::default())).await.unwrap());
    registry
        .subscribe(
            "device-1",
            "fp-a",
            SubscribeRequest {
                delivery_token: "token-1".into(),
                platform_tag: "android".into(),
                delivery_kind: Some(DeliveryKind::GatewayPush),
                webhook_url: None,
                threshold: None,
                cooldown_seconds: None,
                auto_stream_type: None,
                auto_stream_duration: None,
                lease_seconds: Some(3600),
            },
            0,
        )
        .await
        .unwrap();

    registry
        .unsubscribe(
            "device-1",
            cribcall_core::subscription::UnsubscribeRequest {
                delivery_token: Some("token-1".into()),
                subscription_id: None,
            },
        )
        .await
        .unwrap();

    let gateway = Arc::new(CountingGateway { count: AtomicUsize::new(0) });
    let engine = FanoutEngine::new(registry, gateway.clone(), Arc::new(NoopLiveSink));
    let outcomes = engine.dispatch(event(90), 0).await.unwrap();
    assert!(outcomes.is_empty());
    assert_eq!(gateway.count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unpair_style_bulk_removal_stops_deliveries_for_that_fingerprint() {
    let registry = Arc::new(SubscriptionRegistry::load(Arc::new(InMemorySubRepo::default())).await.unwrap());
    registry
        .subscribe(
            "device-1",
            "fp-a",
            SubscribeRequest {
                delivery_token: "token-1".into(),
                platform_tag: "android".into(),
                delivery_kind: Some(DeliveryKind::GatewayPush),
                webhook_url: None,
                threshold: None,
                cooldown_seconds: None,
                auto_stream_type: None,
                auto_stream_duration: None,
                lease_seconds: Some(3600),
            },
            0,
        )
        .await
        .unwrap();

    registry.remove_all_for("fp-a").await.unwrap();

    let gateway = Arc::new(CountingGateway { count: AtomicUsize::new(0) });
    let engine = FanoutEngine::new(registry, gateway.clone(), Arc::new(NoopLiveSink));
    let outcomes = engine.dispatch(event(90), 0).await.unwrap();
    assert!(outcomes.is_empty());
}
