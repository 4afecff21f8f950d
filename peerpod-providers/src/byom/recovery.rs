use super::pool::{decode_state, retry_on_conflict, IpPool};
use super::state::IpAllocationState;
use peerpod_common::ProviderError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

impl IpPool {
    /// Converge the stored state with the configured pool at start-up.
    ///
    /// Allocations are never evicted, including ones owned by other nodes or by pods
    /// that no longer exist; an external controller releases those. `available` is
    /// rebuilt as the configured IPs minus every allocated IP, in configured order.
    pub async fn recover_state(&self, ctx: &CancellationToken) -> Result<(), ProviderError> {
        self.bounded(ctx, "recovering pool state", async {
            let _guard = self.write_lock.lock().await;
            let node_name = self.node_name()?;
            let node = node_name.as_str();
            info!("recovering VM pool state on node {}", node);
            retry_on_conflict("recover", move || self.try_recover(node)).await
        })
        .await
    }

    async fn try_recover(&self, node_name: &str) -> Result<(), ProviderError> {
        let stored = self.store.get().await?;
        let version = stored.as_ref().map(|o| o.resource_version.clone());
        let current = match stored.and_then(|o| o.data) {
            Some(data) => match decode_state(&data) {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!("stored pool state is unreadable, reinitialising: {}", e);
                    None
                }
            },
            None => None,
        };

        let next = match current {
            Some(state) => {
                let mine = state
                    .allocated_ips
                    .values()
                    .filter(|a| a.node_name == node_name)
                    .inspect(|a| info!("allocation on this node: IP={} pod={}", a.ip, a.pod_name))
                    .count();
                info!(
                    "state recovered: {} allocated ({} on this node), {} available, version {}",
                    state.allocated_ips.len(),
                    mine,
                    state.available_ips.len(),
                    state.version
                );
                repair(&state, &self.config.pool_ips)
            }
            None => {
                info!("no pool state stored, initialising");
                IpAllocationState::initial(&self.config.pool_ips)
            }
        };

        self.write_state(&next, version.as_deref()).await?;
        info!(
            "pool state written: {} allocated, {} available, version {}",
            next.allocated_ips.len(),
            next.available_ips.len(),
            next.version
        );
        Ok(())
    }
}

/// Keep every allocation; available becomes the configured IPs not currently allocated.
pub fn repair(state: &IpAllocationState, pool_ips: &[String]) -> IpAllocationState {
    let allocated = state.allocated_ip_set();
    let mut next = IpAllocationState {
        allocated_ips: state.allocated_ips.clone(),
        available_ips: pool_ips
            .iter()
            .filter(|ip| !allocated.contains(ip.as_str()))
            .cloned()
            .collect(),
        last_updated: state.last_updated,
        version: state.version,
    };
    next.bump();
    next
}
