//! # cribcall-core
//!
//! LAN-only secure peer-to-peer control plane for baby-monitor devices:
//! device identity and certificates, canonical JSON and length-prefixed
//! framing, a SAS-over-ECDH pairing handshake, a live trust store, mTLS
//! control transport, a control session state machine, a noise
//! subscription registry, and a noise fan-out engine. Discovery is
//! consumed through an injected oracle; this crate attaches no trust to
//! anything it returns.
//!
//! Every external or non-deterministic collaborator — identity storage,
//! peer/subscription persistence, the system clock, randomness, discovery,
//! push delivery, media signaling — is a trait, so the full control plane
//! can run against in-memory fakes in tests without any real I/O or
//! wall-clock sleeps.

pub mod b64;
pub mod canonical_json;
pub mod clock;
pub mod config;
pub mod discovery;
pub mod error;
pub mod fanout;
pub mod framing;
pub mod identity;
pub mod message;
pub mod noise_event;
pub mod pairing;
pub mod repository;
pub mod service_descriptor;
pub mod session;
pub mod subscription;
pub mod transport;
pub mod trust_store;

pub use error::CribCallError;
