//! Trust store: the authoritative in-memory set of fingerprints a device
//! will admit as mTLS peers (C4).
//!
//! Mutations are serialized behind a single writer lock; reads take a
//! cheap snapshot clone so every request-path read (transport handshake
//! validation, session fingerprint re-checks) is contention-free, per
//! spec.md §5's "read-biased lock or copy-on-write snapshot" guidance.
//! Membership changes are published on a broadcast channel so C5 and C6
//! can react without polling — the explicit-bounded-channel shape spec.md
//! §9 calls for in place of the source's ad hoc event bus.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use crate::error::CribCallError;
use crate::identity::normalize_fingerprint;

/// Which side of a pairing relationship a trusted peer record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    Monitor,
    Listener,
}

/// A device the local peer has paired with and will admit over mTLS.
/// Carries both Monitor-side connectivity hints and Listener-side
/// descriptor fields on one shared struct rather than two parallel types
/// (spec.md §9, "avoid duplicated state").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedPeer {
    pub remote_device_id: String,
    pub display_name: String,
    pub certificate_fingerprint: String,
    pub certificate_der: Option<Vec<u8>>,
    pub last_known_address: Option<String>,
    pub out_of_band_delivery_token: Option<String>,
    pub added_at: DateTime<Utc>,
    pub role: PeerRole,
    pub control_port: Option<u16>,
    pub pairing_port: Option<u16>,
    pub transport_tag: Option<String>,
}

/// Direction of a trust-store membership change, delivered to observers.
#[derive(Debug, Clone)]
pub enum TrustChange {
    Added(TrustedPeer),
    Replaced(TrustedPeer),
    Removed { fingerprint: String },
}

/// Injected persistence for trusted-peer records (spec.md §6).
#[async_trait]
pub trait PeerRepository: Send + Sync {
    async fn load_all(&self) -> Result<Vec<TrustedPeer>, CribCallError>;
    async fn put(&self, peer: &TrustedPeer) -> Result<(), CribCallError>;
    async fn delete(&self, fingerprint: &str) -> Result<(), CribCallError>;
}

pub struct TrustStore {
    repo: Arc<dyn PeerRepository>,
    peers: RwLock<HashMap<String, TrustedPeer>>,
    changes: broadcast::Sender<TrustChange>,
}

impl TrustStore {
    /// Build a trust store and reload its membership from the injected
    /// repository, which spec.md §4.4 requires to be the source of truth
    /// at startup (the in-memory view is authoritative only at runtime).
    pub async fn load(repo: Arc<dyn PeerRepository>) -> Result<Self, CribCallError> {
        let loaded = repo.load_all().await?;
        let mut peers = HashMap::new();
        for peer in loaded {
            peers.insert(normalize_fingerprint(&peer.certificate_fingerprint), peer);
        }
        let (changes, _) = broadcast::channel(256);
        Ok(Self {
            repo,
            peers: RwLock::new(peers),
            changes,
        })
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.peers
            .read()
            .unwrap()
            .contains_key(&normalize_fingerprint(fingerprint))
    }

    pub fn get(&self, fingerprint: &str) -> Option<TrustedPeer> {
        self.peers
            .read()
            .unwrap()
            .get(&normalize_fingerprint(fingerprint))
            .cloned()
    }

    /// Idempotent add/replace keyed by fingerprint. A peer presenting the
    /// same fingerprint again merges into the existing record, keeping
    /// the newer `added_at` (spec.md §4.3 "Tie-breaks").
    pub async fn add(&self, peer: TrustedPeer) -> Result<(), CribCallError> {
        let key = normalize_fingerprint(&peer.certificate_fingerprint);
        self.repo.put(&peer).await?;
        let replaced = {
            let mut peers = self.peers.write().unwrap();
            let existed = peers.contains_key(&key);
            let merged = match peers.remove(&key) {
                Some(existing) if existing.added_at > peer.added_at => existing,
                _ => peer.clone(),
            };
            peers.insert(key, merged);
            existed
        };
        let change = if replaced {
            TrustChange::Replaced(peer)
        } else {
            TrustChange::Added(peer)
        };
        let _ = self.changes.send(change);
        Ok(())
    }

    /// Remove a peer by fingerprint. Returns `true` if a record existed.
    /// Observers are notified so C5 can revalidate live connections and
    /// C6 can evict the matching control session (spec.md §4.4, §4.5).
    pub async fn remove(&self, fingerprint: &str) -> Result<bool, CribCallError> {
        let key = normalize_fingerprint(fingerprint);
        self.repo.delete(&key).await?;
        let existed = self.peers.write().unwrap().remove(&key).is_some();
        if existed {
            let _ = self.changes.send(TrustChange::Removed {
                fingerprint: key,
            });
        }
        Ok(existed)
    }

    pub fn snapshot(&self) -> Vec<TrustedPeer> {
        self.peers.read().unwrap().values().cloned().collect()
    }

    /// Subscribe to membership changes. Each subscriber gets its own
    /// receiver and must drop it (or the subscription lags and is
    /// dropped by the channel) when no longer interested.
    pub fn observe(&self) -> broadcast::Receiver<TrustChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct InMemoryPeerRepo(Mutex<HashMap<String, TrustedPeer>>);

    #[async_trait]
    impl PeerRepository for InMemoryPeerRepo {
        async fn load_all(&self) -> Result<Vec<TrustedPeer>, CribCallError> {
            Ok(self.0.lock().unwrap().values().cloned().collect())
        }
        async fn put(&self, peer: &TrustedPeer) -> Result<(), CribCallError> {
            self.0
                .lock()
                .unwrap()
                .insert(normalize_fingerprint(&peer.certificate_fingerprint), peer.clone());
            Ok(())
        }
        async fn delete(&self, fingerprint: &str) -> Result<(), CribCallError> {
            self.0.lock().unwrap().remove(&normalize_fingerprint(fingerprint));
            Ok(())
        }
    }

    fn peer(fp: &str) -> TrustedPeer {
        TrustedPeer {
            remote_device_id: "dev-1".into(),
            display_name: "Nursery Listener".into(),
            certificate_fingerprint: fp.into(),
            certificate_der: None,
            last_known_address: None,
            out_of_band_delivery_token: None,
            added_at: Utc::now(),
            role: PeerRole::Listener,
            control_port: None,
            pairing_port: None,
            transport_tag: None,
        }
    }

    #[tokio::test]
    async fn add_then_contains_case_insensitive() {
        let store = TrustStore::load(Arc::new(InMemoryPeerRepo::default())).await.unwrap();
        store.add(peer("ABCDEF")).await.unwrap();
        assert!(store.contains("abcdef"));
        assert!(store.contains("ABCDEF"));
    }

    #[tokio::test]
    async fn remove_notifies_observers() {
        let store = TrustStore::load(Arc::new(InMemoryPeerRepo::default())).await.unwrap();
        store.add(peer("abc123")).await.unwrap();
        let mut rx = store.observe();
        assert!(store.remove("abc123").await.unwrap());
        match rx.recv().await.unwrap() {
            TrustChange::Removed { fingerprint } => assert_eq!(fingerprint, "abc123"),
            other => panic!("unexpected change: {other:?}"),
        }
        assert!(!store.contains("abc123"));
    }

    #[tokio::test]
    async fn remove_missing_returns_false() {
        let store = TrustStore::load(Arc::new(InMemoryPeerRepo::default())).await.unwrap();
        assert!(!store.remove("nope").await.unwrap());
    }

    #[tokio::test]
    async fn reload_from_repository_restores_membership() {
        let repo = Arc::new(InMemoryPeerRepo::default());
        let store = TrustStore::load(repo.clone()).await.unwrap();
        store.add(peer("deadbeef")).await.unwrap();
        let reloaded = TrustStore::load(repo).await.unwrap();
        assert!(reloaded.contains("deadbeef"));
    }
}
