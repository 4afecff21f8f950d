use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Data key holding the serialised state in the shared object.
pub const STATE_DATA_KEY: &str = "allocation-state";
pub const DEFAULT_CONFIGMAP_NAME: &str = "byom-ip-pool-state";

pub fn state_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "cloud-api-adaptor".to_string()),
        ("app.kubernetes.io/component".to_string(), "byom-ip-pool-state".to_string()),
    ])
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct IpAllocation {
    #[serde(rename = "allocationID")]
    pub allocation_id: String,
    pub ip: String,
    #[serde(rename = "nodeName")]
    pub node_name: String,
    #[serde(rename = "podName")]
    pub pod_name: String,
    #[serde(rename = "allocatedAt")]
    pub allocated_at: DateTime<Utc>,
}

/// Whole-pool state, stored as one JSON document.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct IpAllocationState {
    #[serde(rename = "allocatedIPs", default)]
    pub allocated_ips: BTreeMap<String, IpAllocation>,
    #[serde(rename = "availableIPs", default)]
    pub available_ips: Vec<String>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime<Utc>,
    pub version: i64,
}

impl IpAllocationState {
    /// Fresh state: every pool IP available, version 1.
    pub fn initial(pool_ips: &[String]) -> Self {
        Self {
            allocated_ips: BTreeMap::new(),
            available_ips: pool_ips.to_vec(),
            last_updated: Utc::now(),
            version: 1,
        }
    }

    /// Stamp a modification.
    pub fn bump(&mut self) {
        self.last_updated = Utc::now();
        self.version += 1;
    }

    pub fn allocated_ip_set(&self) -> HashSet<&str> {
        self.allocated_ips.values().map(|a| a.ip.as_str()).collect()
    }

    pub fn allocation_for_ip(&self, ip: &str) -> Option<&IpAllocation> {
        self.allocated_ips.values().find(|a| a.ip == ip)
    }

    pub fn status(&self) -> PoolStatus {
        let available = self.available_ips.len();
        let in_use = self.allocated_ips.len();
        PoolStatus {
            total: available + in_use,
            available,
            in_use,
        }
    }

    pub fn to_pretty_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
}
