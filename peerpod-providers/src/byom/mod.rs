//! Bring-your-own-machine provider: hands out pre-created VMs from a shared IP pool.

use crate::registry::{parse_config, ProviderFactory};
use crate::ssh::{HostKeyPolicy, SshClient, SshKeyPair, REBOOT_PATH, REBOOT_PAYLOAD, USER_DATA_PATH};
use crate::{Provider, SharedProvider};
use anyhow::{Context, Result};
use async_trait::async_trait;
use peerpod_common::cloudinit::CloudConfigGenerator;
use peerpod_common::{Instance, InstanceTypeSpec, PoolMetadata, ProviderError};
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod config;
pub mod node;
pub mod pool;
pub mod recovery;
pub mod state;
pub mod store;

pub use config::{ByomConfig, PoolStoreKind};
pub use pool::{IpPool, PoolConfig};
pub use state::{IpAllocation, IpAllocationState, PoolStatus};
pub use store::{ConfigMapStore, MemoryStore, StateStore, StoredObject};

pub const PROVIDER_NAME: &str = "byom";
pub const POOL_TYPE: &str = "byom";

pub struct ByomProvider {
    config: ByomConfig,
    pool: Arc<IpPool>,
    ssh: SshClient,
}

impl ByomProvider {
    pub fn new(config: ByomConfig, pool: Arc<IpPool>, ssh: SshClient) -> Self {
        Self { config, pool, ssh }
    }

    pub fn pool(&self) -> &IpPool {
        &self.pool
    }

    // Runs on its own token so a cancelled create still returns the IP.
    async fn release(&self, allocation_id: &str) {
        if let Err(e) = self
            .pool
            .deallocate_ip(&CancellationToken::new(), allocation_id)
            .await
        {
            error!("rollback: failed to release allocation {}: {}", allocation_id, e);
        }
    }
}

#[async_trait]
impl Provider for ByomProvider {
    async fn create_instance(
        &self,
        ctx: &CancellationToken,
        pod_name: &str,
        sandbox_id: &str,
        cloud_config: &dyn CloudConfigGenerator,
        _spec: &InstanceTypeSpec,
    ) -> Result<Instance> {
        let allocation_id = format!("{}-{}", pod_name, sandbox_id);
        let ip = self
            .pool
            .allocate_ip(ctx, &allocation_id, pod_name)
            .await
            .with_context(|| format!("allocating IP for {}", allocation_id))?;

        let user_data = match cloud_config.generate() {
            Ok(u) => u,
            Err(e) => {
                self.release(&allocation_id).await;
                return Err(e.context("generating user data"));
            }
        };

        if let Err(e) = self
            .ssh
            .send_file(ctx, ip, USER_DATA_PATH, user_data.as_bytes())
            .await
        {
            self.release(&allocation_id).await;
            return Err(e.context(format!("sending user data to {}", ip)));
        }

        info!("pod {} assigned pool VM {}", pod_name, ip);
        Ok(Instance {
            id: ip.to_string(),
            name: format!("byom-{}", ip),
            ips: vec![ip],
            pool_metadata: Some(PoolMetadata {
                allocation_id,
                pool_type: POOL_TYPE.to_string(),
            }),
        })
    }

    async fn delete_instance(&self, ctx: &CancellationToken, instance_id: &str) -> Result<()> {
        if instance_id.trim().is_empty() {
            info!("instance id is empty, nothing to delete");
            return Ok(());
        }
        let ip: IpAddr = instance_id
            .trim()
            .parse()
            .map_err(|e| ProviderError::invalid_ip(instance_id, e))?;

        if let Err(e) = self.ssh.send_file(ctx, ip, REBOOT_PATH, REBOOT_PAYLOAD).await {
            warn!("failed to send reboot trigger to {}: {:#}", ip, e);
        }

        let allocation_id = self
            .pool
            .get_allocation_id_from_ip(ctx, ip)
            .await
            .with_context(|| format!("looking up allocation for {}", ip))?;
        let Some(allocation_id) = allocation_id else {
            info!("IP {} is not allocated, nothing to release", ip);
            return Ok(());
        };

        self.pool
            .deallocate_ip(ctx, &allocation_id)
            .await
            .with_context(|| format!("releasing {} ({})", ip, allocation_id))?;
        info!("returned VM {} to the pool", ip);
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        Ok(())
    }

    fn config_verifier(&self) -> Result<()> {
        self.config.verify()?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }
}

pub struct ByomFactory;

#[async_trait]
impl ProviderFactory for ByomFactory {
    async fn build(&self, ctx: &CancellationToken, args: &[String]) -> Result<SharedProvider> {
        let config: ByomConfig = parse_config(PROVIDER_NAME, args)?;
        config.verify()?;
        info!("byom config: {:?}", config);

        let store: Arc<dyn StateStore> = match config.pool_store {
            PoolStoreKind::Configmap => {
                let client = kube::Client::try_default()
                    .await
                    .context("creating kubernetes client")?;
                let namespace = match config.pool_namespace.trim() {
                    "" => node::current_namespace(),
                    ns => ns.to_string(),
                };
                Arc::new(ConfigMapStore::new(client, &namespace, &config.pool_configmap_name))
            }
            PoolStoreKind::Memory => {
                warn!("using in-memory pool state; allocations are not shared between adaptors");
                Arc::new(MemoryStore::new())
            }
        };
        info!("pool state kept in {}", store.describe());

        let mut pool_config = PoolConfig::new(config.pool_ips()?);
        pool_config.operation_timeout = config.operation_timeout();
        pool_config.check_vm_readiness = !config.skip_vm_readiness;
        let pool = Arc::new(IpPool::new(store, pool_config)?);

        let keys = SshKeyPair::load(&config.ssh_priv_key_path, &config.ssh_pub_key_path)?;
        let policy = HostKeyPolicy::from_dir(config.ssh_host_key_allowlist_dir.as_deref())?;
        let ssh = SshClient::new(config.ssh_username.clone(), keys, policy, config.ssh_timeout())?;

        pool.recover_state(ctx)
            .await
            .context("recovering BYOM pool state")?;

        Ok(Arc::new(ByomProvider::new(config, pool, ssh)))
    }
}
