//! Discovery-plane record advertising a Monitor's connectivity details
//! (spec.md §3 "Service Descriptor", §6). Purely informational — trust is
//! never derived from it, only from a fingerprint obtained and pinned
//! out-of-band.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub remote_device_id: String,
    /// Wire name is `monitor_name` (spec.md §6); the field is named
    /// `display_name` to match the data model in spec.md §3, which
    /// reuses this same name on `TrustedPeer`.
    #[serde(rename = "monitor_name")]
    pub display_name: String,
    pub certificate_fingerprint: String,
    pub control_port: u16,
    pub pairing_port: u16,
    pub version: String,
    pub transport_tag: String,
    #[serde(default)]
    pub addresses: Vec<String>,
}
