//! Discovery consumer (C9): a thin adapter over an injected local-network
//! browse/advertise oracle. The core attaches no trust to anything this
//! trait returns — it only supplies candidate addresses and fingerprints
//! for a human to eyeball before pairing.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::CribCallError;
use crate::service_descriptor::ServiceDescriptor;

/// Presence state of a discovered service, as reported by the oracle.
#[derive(Debug, Clone)]
pub enum Presence {
    Present(ServiceDescriptor),
    Absent { remote_device_id: String },
}

/// Opaque handle returned by [`DiscoveryOracle::advertise`]; dropping it
/// (or calling an implementation-defined stop method on the concrete
/// type) withdraws the advertisement.
pub trait AdvertiseHandle: Send + Sync {}

#[async_trait]
pub trait DiscoveryOracle: Send + Sync {
    async fn advertise(
        &self,
        descriptor: ServiceDescriptor,
    ) -> Result<Box<dyn AdvertiseHandle>, CribCallError>;

    /// Begin browsing; events are delivered on the returned channel for as
    /// long as the receiver is held.
    async fn browse(&self) -> Result<mpsc::Receiver<Presence>, CribCallError>;
}
