//! Runtime configuration (ambient stack). Loaded from a TOML file via
//! `serde`/`toml`, the same pairing the teacher crate uses for its own
//! engine configuration structs.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::error::CribCallError;
use crate::fanout::{DEFAULT_COOLDOWN_SECS, DEFAULT_THRESHOLD};
use crate::session::DEFAULT_QUEUE_CAPACITY;
use crate::subscription::DEFAULT_LEASE_SECS;
use crate::transport::http::MAX_BODY_LEN;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub display_name: String,
    pub pairing_listen_addr: SocketAddr,
    pub control_listen_addr: SocketAddr,
    pub max_request_body_bytes: usize,
    pub heartbeat_interval_secs: u64,
    pub outbound_queue_capacity: usize,
    pub default_noise_threshold: u8,
    pub default_cooldown_secs: u64,
    pub default_lease_secs: u64,
    pub webhook_timeout_secs: u64,
    pub identity_path: String,
    pub trust_store_path: String,
    pub subscriptions_path: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            display_name: "CribCall Device".to_string(),
            pairing_listen_addr: "0.0.0.0:7443".parse().expect("valid hardcoded default addr"),
            control_listen_addr: "0.0.0.0:7444".parse().expect("valid hardcoded default addr"),
            max_request_body_bytes: MAX_BODY_LEN,
            heartbeat_interval_secs: 10,
            outbound_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            default_noise_threshold: DEFAULT_THRESHOLD,
            default_cooldown_secs: DEFAULT_COOLDOWN_SECS,
            default_lease_secs: DEFAULT_LEASE_SECS,
            webhook_timeout_secs: 10,
            identity_path: "identity.json".to_string(),
            trust_store_path: "trust_store.json".to_string(),
            subscriptions_path: "subscriptions.json".to_string(),
        }
    }
}

impl Settings {
    pub async fn load(path: &Path) -> Result<Self, CribCallError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CribCallError::BadRequest(format!("reading config file: {e}")))?;
        toml::from_str(&contents)
            .map_err(|e| CribCallError::BadRequest(format!("parsing config file: {e}")))
    }

    pub fn load_or_default_sync(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "config file invalid, falling back to defaults");
                Settings::default()
            }),
            Err(_) => Settings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_use_documented_ports() {
        let settings = Settings::default();
        assert_eq!(settings.pairing_listen_addr.port(), 7443);
        assert_eq!(settings.control_listen_addr.port(), 7444);
    }

    #[test]
    fn toml_roundtrip_preserves_overrides() {
        let toml_text = r#"
            display_name = "Nursery Monitor"
            default_noise_threshold = 55
        "#;
        let settings: Settings = toml::from_str(toml_text).unwrap();
        assert_eq!(settings.display_name, "Nursery Monitor");
        assert_eq!(settings.default_noise_threshold, 55);
        assert_eq!(settings.heartbeat_interval_secs, 10);
    }
}
