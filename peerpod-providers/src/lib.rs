use anyhow::Result;
use async_trait::async_trait;
use peerpod_common::cloudinit::CloudConfigGenerator;
use peerpod_common::{Instance, InstanceTypeSpec};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub mod registry;
pub mod ssh;

pub use registry::{ProviderFactory, ProviderRegistry};

/// Uniform VM lifecycle contract implemented by every back-end.
///
/// Every async operation takes the caller's cancellation token; wait loops abort their
/// next sleep when it fires. Create paths still roll back partial resources after a
/// cancellation before returning.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provision (or draw from a pool) the VM backing one pod sandbox.
    ///
    /// Any billable resource created before a failure is released before the error is
    /// returned. Only pool-backed providers are idempotent on `(pod_name, sandbox_id)`.
    async fn create_instance(
        &self,
        ctx: &CancellationToken,
        pod_name: &str,
        sandbox_id: &str,
        cloud_config: &dyn CloudConfigGenerator,
        spec: &InstanceTypeSpec,
    ) -> Result<Instance>;

    /// Release the VM. An instance that is already gone counts as deleted.
    async fn delete_instance(&self, ctx: &CancellationToken, instance_id: &str) -> Result<()>;

    /// Called once at process exit.
    async fn teardown(&self) -> Result<()>;

    /// Validate mandatory configuration before any create is accepted.
    fn config_verifier(&self) -> Result<()>;

    fn name(&self) -> &'static str;
}

pub type SharedProvider = Arc<dyn Provider>;

#[cfg(feature = "alibaba")]
pub mod alibaba;

#[cfg(feature = "byom")]
pub mod byom;

#[cfg(feature = "docker")]
pub mod docker;

#[cfg(feature = "openstack")]
pub mod openstack;

#[cfg(feature = "powervs")]
pub mod powervs;

pub(crate) mod http;
