use std::time::Duration;
use thiserror::Error;

/// Failure kinds surfaced by the VM lifecycle core.
///
/// Providers return `anyhow::Error`; when one of these is the root cause it can be
/// recovered with `err.downcast_ref::<ProviderError>()`.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("no available IPs in the pool")]
    PoolExhausted,

    #[error("conflict updating shared state: {0}")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} is not ready")]
    NotReady(String),

    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },

    #[error("invalid IP address {ip}: {reason}")]
    InvalidIp { ip: String, reason: String },

    #[error("failed to detect node name: {0}")]
    NodeNameDetection(String),

    #[error("failed to retrieve pool state: {0}")]
    RetrievingPoolState(String),

    #[error("failed to update pool state: {0}")]
    UpdatingPoolState(String),

    #[error("unsupported instance type {0:?}")]
    UnsupportedInstanceType(String),

    #[error("no instance type fits vcpus={vcpus} memory={memory}MiB gpus={gpus}")]
    NoInstanceTypeFits { vcpus: i64, memory: i64, gpus: i64 },

    #[error("unknown provider {name:?}, registered providers: {}", registered.join(", "))]
    UnknownProvider {
        name: String,
        registered: Vec<String>,
    },

    #[error("ssh: {0}")]
    Ssh(String),

    #[error("host key allowlist: {0}")]
    HostKeyAllowlist(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{context}: {message}")]
    Api { context: String, message: String },
}

impl ProviderError {
    pub fn api(context: impl Into<String>, message: impl std::fmt::Display) -> Self {
        ProviderError::Api {
            context: context.into(),
            message: message.to_string(),
        }
    }

    pub fn invalid_ip(ip: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        ProviderError::InvalidIp {
            ip: ip.into(),
            reason: reason.to_string(),
        }
    }

    /// Short machine-friendly name of the kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::ConfigInvalid(_) => "configuration-invalid",
            ProviderError::PoolExhausted => "pool-exhausted",
            ProviderError::Conflict(_) => "conflict",
            ProviderError::NotFound(_) => "not-found",
            ProviderError::NotReady(_) => "not-ready",
            ProviderError::Timeout { .. } => "timeout",
            ProviderError::InvalidIp { .. } => "invalid-ip",
            ProviderError::NodeNameDetection(_) => "node-name-detection-failed",
            ProviderError::RetrievingPoolState(_) => "retrieving-pool-state",
            ProviderError::UpdatingPoolState(_) => "updating-pool-state",
            ProviderError::UnsupportedInstanceType(_) => "unsupported-instance-type",
            ProviderError::NoInstanceTypeFits { .. } => "no-instance-type-fits",
            ProviderError::UnknownProvider { .. } => "unknown-provider",
            ProviderError::Ssh(_) => "ssh",
            ProviderError::HostKeyAllowlist(_) => "host-key-allowlist",
            ProviderError::Cancelled => "cancelled",
            ProviderError::Api { .. } => "provider-api-error",
        }
    }
}

/// Walks an `anyhow` chain looking for a typed kind.
pub fn kind_of(err: &anyhow::Error) -> Option<&ProviderError> {
    err.chain().find_map(|e| e.downcast_ref::<ProviderError>())
}
