//! Noise subscription registry (C7): stored out-of-band delivery
//! subscriptions with leases and per-subscriber overrides, served through
//! the `/noise/subscribe` and `/noise/unsubscribe` control endpoints.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::CribCallError;

pub const DEFAULT_LEASE_SECS: u64 = 24 * 60 * 60;
pub const MAX_LEASE_SECS: u64 = 7 * 24 * 60 * 60;
const MIN_LEASE_SECS: u64 = 1;
const SWEEP_INTERVAL_SECS: u64 = 5 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryKind {
    GatewayPush,
    Webhook,
    LiveOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoiseSubscription {
    pub subscription_id: String,
    pub device_id: String,
    pub certificate_fingerprint: String,
    pub delivery_token: String,
    pub platform_tag: String,
    pub delivery_kind: DeliveryKind,
    pub webhook_url: Option<String>,
    pub expires_at_ms: i64,
    pub threshold_override: Option<u8>,
    pub cooldown_seconds_override: Option<u64>,
    pub auto_stream_type_override: Option<String>,
    pub auto_stream_duration_override: Option<u64>,
    pub last_delivered_at_ms: Option<i64>,
}

impl NoiseSubscription {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// Deterministic subscription id: a stable hash of `device_id|token` so
/// re-subscribing with the same token always maps to the same record
/// (spec.md §3 invariant).
pub fn subscription_id(device_id: &str, token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(device_id.as_bytes());
    hasher.update(b"|");
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn load_all(&self) -> Result<Vec<NoiseSubscription>, CribCallError>;
    async fn put(&self, sub: &NoiseSubscription) -> Result<(), CribCallError>;
    async fn delete(&self, subscription_id: &str) -> Result<(), CribCallError>;
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub delivery_token: String,
    pub platform_tag: String,
    #[serde(default)]
    pub delivery_kind: Option<DeliveryKind>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub threshold: Option<u8>,
    #[serde(default)]
    pub cooldown_seconds: Option<u64>,
    #[serde(default)]
    pub auto_stream_type: Option<String>,
    #[serde(default)]
    pub auto_stream_duration: Option<u64>,
    #[serde(default)]
    pub lease_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct SubscribeResponse {
    pub subscription_id: String,
    pub device_id: String,
    pub expires_at: i64,
    pub accepted_lease_seconds: u64,
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribeRequest {
    #[serde(default)]
    pub delivery_token: Option<String>,
    #[serde(default)]
    pub subscription_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UnsubscribeResponse {
    pub device_id: String,
    pub subscription_id: Option<String>,
    pub expires_at: Option<i64>,
    pub unsubscribed: bool,
}

pub struct SubscriptionRegistry {
    repo: Arc<dyn SubscriptionRepository>,
    subs: RwLock<HashMap<String, NoiseSubscription>>,
}

fn clamp_lease_seconds(requested: Option<u64>) -> u64 {
    requested
        .unwrap_or(DEFAULT_LEASE_SECS)
        .clamp(MIN_LEASE_SECS, MAX_LEASE_SECS)
}

impl SubscriptionRegistry {
    pub async fn load(repo: Arc<dyn SubscriptionRepository>) -> Result<Self, CribCallError> {
        let loaded = repo.load_all().await?;
        let mut subs = HashMap::new();
        for s in loaded {
            subs.insert(s.subscription_id.clone(), s);
        }
        Ok(Self {
            repo,
            subs: RwLock::new(subs),
        })
    }

    /// Handle `POST /noise/subscribe`. The authenticated peer fingerprint
    /// is the sole authority over `device_id`/`certificate_fingerprint` —
    /// nothing in the request body can override it (spec.md §4.7).
    pub async fn subscribe(
        &self,
        peer_device_id: &str,
        peer_fingerprint: &str,
        req: SubscribeRequest,
        now_ms: i64,
    ) -> Result<SubscribeResponse, CribCallError> {
        let delivery_kind = req.delivery_kind.unwrap_or(DeliveryKind::LiveOnly);
        if delivery_kind == DeliveryKind::Webhook {
            match &req.webhook_url {
                Some(url) if url.starts_with("https://") => {}
                _ => {
                    return Err(CribCallError::SubscriptionRejected(
                        "webhook delivery requires an https:// webhook_url".into(),
                    ))
                }
            }
        }

        let lease_seconds = clamp_lease_seconds(req.lease_seconds);
        let id = subscription_id(peer_device_id, &req.delivery_token);
        let expires_at_ms = now_ms + (lease_seconds as i64 * 1000);

        let subscription = NoiseSubscription {
            subscription_id: id.clone(),
            device_id: peer_device_id.to_string(),
            certificate_fingerprint: peer_fingerprint.to_ascii_lowercase(),
            delivery_token: req.delivery_token,
            platform_tag: req.platform_tag,
            delivery_kind,
            webhook_url: req.webhook_url,
            expires_at_ms,
            threshold_override: req.threshold,
            cooldown_seconds_override: req.cooldown_seconds,
            auto_stream_type_override: req.auto_stream_type,
            auto_stream_duration_override: req.auto_stream_duration,
            last_delivered_at_ms: None,
        };

        self.repo.put(&subscription).await?;
        self.subs.write().await.insert(id.clone(), subscription);

        Ok(SubscribeResponse {
            subscription_id: id,
            device_id: peer_device_id.to_string(),
            expires_at: expires_at_ms,
            accepted_lease_seconds: lease_seconds,
        })
    }

    /// Handle `POST /noise/unsubscribe`. Idempotent: absence is success.
    pub async fn unsubscribe(
        &self,
        peer_device_id: &str,
        req: UnsubscribeRequest,
    ) -> Result<UnsubscribeResponse, CribCallError> {
        let id = match (&req.subscription_id, &req.delivery_token) {
            (Some(id), _) => id.clone(),
            (None, Some(token)) => subscription_id(peer_device_id, token),
            (None, None) => {
                return Err(CribCallError::BadRequest(
                    "either delivery_token or subscription_id is required".into(),
                ))
            }
        };

        let removed = {
            let mut subs = self.subs.write().await;
            subs.remove(&id)
        };
        if removed.is_some() {
            self.repo.delete(&id).await?;
        }

        Ok(UnsubscribeResponse {
            device_id: peer_device_id.to_string(),
            subscription_id: Some(id),
            expires_at: removed.as_ref().map(|s| s.expires_at_ms),
            unsubscribed: true,
        })
    }

    /// Remove all subscriptions belonging to `fingerprint` (spec.md §4.7
    /// `/unpair`).
    pub async fn remove_all_for(&self, fingerprint: &str) -> Result<(), CribCallError> {
        let fingerprint = fingerprint.to_ascii_lowercase();
        let ids: Vec<String> = {
            let subs = self.subs.read().await;
            subs.values()
                .filter(|s| s.certificate_fingerprint == fingerprint)
                .map(|s| s.subscription_id.clone())
                .collect()
        };
        for id in ids {
            self.subs.write().await.remove(&id);
            self.repo.delete(&id).await?;
        }
        Ok(())
    }

    /// Non-expired snapshot for fan-out (C8). Lazily filters; physical
    /// removal happens on the next mutation or the periodic sweep.
    pub async fn active_snapshot(&self, now_ms: i64) -> Vec<NoiseSubscription> {
        self.subs
            .read()
            .await
            .values()
            .filter(|s| !s.is_expired(now_ms))
            .cloned()
            .collect()
    }

    pub async fn mark_delivered(&self, subscription_id: &str, at_ms: i64) -> Result<(), CribCallError> {
        let updated = {
            let mut subs = self.subs.write().await;
            match subs.get_mut(subscription_id) {
                Some(s) => {
                    s.last_delivered_at_ms = Some(at_ms);
                    Some(s.clone())
                }
                None => None,
            }
        };
        if let Some(s) = updated {
            self.repo.put(&s).await?;
        }
        Ok(())
    }

    pub async fn remove(&self, subscription_id: &str) -> Result<(), CribCallError> {
        self.subs.write().await.remove(subscription_id);
        self.repo.delete(subscription_id).await
    }

    /// Periodic sweep (every [`SWEEP_INTERVAL_SECS`]) that physically
    /// deletes subscriptions past their lease.
    pub async fn sweep_expired(&self, now_ms: i64) -> Result<usize, CribCallError> {
        let expired_ids: Vec<String> = {
            let subs = self.subs.read().await;
            subs.values()
                .filter(|s| s.is_expired(now_ms))
                .map(|s| s.subscription_id.clone())
                .collect()
        };
        let count = expired_ids.len();
        for id in &expired_ids {
            self.remove(id).await?;
        }
        Ok(count)
    }

    pub fn sweep_interval() -> std::time::Duration {
        std::time::Duration::from_secs(SWEEP_INTERVAL_SECS)
    }
}
