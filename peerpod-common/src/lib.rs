use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

pub mod cloudinit;
pub mod config;
pub mod error;
pub mod instance_type;
pub mod naming;
pub mod wait;

pub use error::ProviderError;

// --- Instances ---

/// Handle returned to the runtime for a pod VM.
///
/// `ips[0]` is the address the runtime dials.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub ips: Vec<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_metadata: Option<PoolMetadata>,
}

/// Present only on instances handed out from a pool.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PoolMetadata {
    pub allocation_id: String,
    pub pool_type: String,
}

impl Instance {
    pub fn new(id: impl Into<String>, name: impl Into<String>, ips: Vec<IpAddr>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ips,
            pool_metadata: None,
        }
    }
}

// --- Shapes ---

/// Shape request coming from the runtime.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct InstanceTypeSpec {
    #[serde(default)]
    pub instance_type: String,
    #[serde(default)]
    pub vcpus: i64,
    /// MiB
    #[serde(default)]
    pub memory: i64,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub gpus: i64,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub multi_nic: bool,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// A shape a provider knows about, materialised at startup by querying the cloud.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct InstanceTypeRecord {
    pub name: String,
    pub vcpus: i64,
    /// MiB
    pub memory: i64,
    pub gpus: i64,
}

impl InstanceTypeRecord {
    pub fn new(name: impl Into<String>, vcpus: i64, memory: i64, gpus: i64) -> Self {
        Self {
            name: name.into(),
            vcpus,
            memory,
            gpus,
        }
    }
}
