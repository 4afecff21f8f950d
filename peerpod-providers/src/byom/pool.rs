//! Distributed IP allocator for the BYOM pool.
//!
//! Every adaptor process shares one stored `IpAllocationState`. Within a process the
//! get-modify-write sequence runs under `write_lock`; across processes the store's
//! resource version arbitrates, and a lost race re-reads and re-applies the change.

use super::node;
use super::state::{IpAllocation, IpAllocationState, PoolStatus};
use super::store::StateStore;
use backoff::backoff::Backoff;
use chrono::Utc;
use md5::{Digest, Md5};
use peerpod_common::ProviderError;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const CONFLICT_ATTEMPTS: u32 = 5;
const CONFLICT_BASE_DELAY: Duration = Duration::from_millis(10);

const READINESS_PORT: u16 = 22;
const READINESS_DIAL_TIMEOUT: Duration = Duration::from_secs(2);
const READINESS_ATTEMPTS: u32 = 4;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub pool_ips: Vec<String>,
    pub operation_timeout: Duration,
    /// Probe `<ip>:22` before handing an IP out.
    pub check_vm_readiness: bool,
    /// Fixed node name; detected from the environment when `None`.
    pub node_name: Option<String>,
    pub readiness_port: u16,
}

impl PoolConfig {
    pub fn new(pool_ips: Vec<String>) -> Self {
        Self {
            pool_ips,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            check_vm_readiness: true,
            node_name: None,
            readiness_port: READINESS_PORT,
        }
    }
}

pub struct IpPool {
    pub(super) store: Arc<dyn StateStore>,
    pub(super) config: PoolConfig,
    pub(super) write_lock: Mutex<()>,
}

impl IpPool {
    pub fn new(store: Arc<dyn StateStore>, config: PoolConfig) -> Result<Self, ProviderError> {
        if config.pool_ips.is_empty() {
            return Err(ProviderError::ConfigInvalid("pool IPs cannot be empty".to_string()));
        }
        if config.operation_timeout.is_zero() {
            return Err(ProviderError::ConfigInvalid(
                "pool operation timeout must be greater than zero".to_string(),
            ));
        }
        for ip in &config.pool_ips {
            parse_ip(ip)?;
        }
        Ok(Self {
            store,
            config,
            write_lock: Mutex::new(()),
        })
    }

    pub fn pool_ips(&self) -> &[String] {
        &self.config.pool_ips
    }

    /// Hand out an IP for `allocation_id`. Repeated calls with the same id return the same IP.
    pub async fn allocate_ip(
        &self,
        ctx: &CancellationToken,
        allocation_id: &str,
        pod_name: &str,
    ) -> Result<IpAddr, ProviderError> {
        self.bounded(ctx, "allocating IP", async {
            let _guard = self.write_lock.lock().await;
            let node_name = self.node_name()?;
            let node = node_name.as_str();
            retry_on_conflict("allocate", move || self.try_allocate(allocation_id, pod_name, node)).await
        })
        .await
    }

    async fn try_allocate(
        &self,
        allocation_id: &str,
        pod_name: &str,
        node_name: &str,
    ) -> Result<IpAddr, ProviderError> {
        let (mut state, version) = self.read_state().await?;

        if let Some(existing) = state.allocated_ips.get(allocation_id) {
            info!("IP {} already allocated to {}", existing.ip, allocation_id);
            return parse_ip(&existing.ip);
        }
        if state.available_ips.is_empty() {
            return Err(ProviderError::PoolExhausted);
        }

        let index = select_ip_index(&state.available_ips, allocation_id);
        let ip_str = state.available_ips[index].clone();
        let ip = parse_ip(&ip_str)?;
        debug!(
            "selected IP {} (index {} of {}) for {}",
            ip_str,
            index,
            state.available_ips.len(),
            allocation_id
        );

        if self.config.check_vm_readiness {
            self.check_vm_readiness(ip).await?;
        } else {
            debug!("skipping readiness check for {}", ip_str);
        }

        state.available_ips.remove(index);
        state.allocated_ips.insert(
            allocation_id.to_string(),
            IpAllocation {
                allocation_id: allocation_id.to_string(),
                ip: ip_str,
                node_name: node_name.to_string(),
                pod_name: pod_name.to_string(),
                allocated_at: Utc::now(),
            },
        );
        state.bump();
        self.write_state(&state, version.as_deref()).await?;

        info!(
            "allocated IP {} to {} on node {} (version {})",
            ip, allocation_id, node_name, state.version
        );
        Ok(ip)
    }

    /// Return the IP held by `allocation_id` to the pool. Unknown ids succeed.
    pub async fn deallocate_ip(&self, ctx: &CancellationToken, allocation_id: &str) -> Result<(), ProviderError> {
        self.bounded(ctx, "deallocating IP", async {
            let _guard = self.write_lock.lock().await;
            retry_on_conflict("deallocate", move || self.try_deallocate(allocation_id)).await
        })
        .await
    }

    async fn try_deallocate(&self, allocation_id: &str) -> Result<(), ProviderError> {
        let (mut state, version) = self.read_state().await?;
        let allocation = match state.allocated_ips.remove(allocation_id) {
            Some(a) => a,
            None => {
                info!("allocation {} not found, nothing to release", allocation_id);
                return Ok(());
            }
        };
        if !state.available_ips.contains(&allocation.ip) {
            state.available_ips.push(allocation.ip.clone());
        }
        state.bump();
        self.write_state(&state, version.as_deref()).await?;
        info!(
            "deallocated IP {} from {} (version {})",
            allocation.ip, allocation_id, state.version
        );
        Ok(())
    }

    pub async fn get_ip_from_allocation_id(
        &self,
        ctx: &CancellationToken,
        allocation_id: &str,
    ) -> Result<Option<IpAddr>, ProviderError> {
        self.bounded(ctx, "looking up allocation", async {
            let (state, _) = self.read_state().await?;
            state
                .allocated_ips
                .get(allocation_id)
                .map(|a| parse_ip(&a.ip))
                .transpose()
        })
        .await
    }

    pub async fn get_allocation_id_from_ip(
        &self,
        ctx: &CancellationToken,
        ip: IpAddr,
    ) -> Result<Option<String>, ProviderError> {
        self.bounded(ctx, "looking up allocation by IP", async {
            let (state, _) = self.read_state().await?;
            let wanted = ip.to_string();
            Ok(state.allocation_for_ip(&wanted).map(|a| a.allocation_id.clone()))
        })
        .await
    }

    pub async fn get_pool_status(&self, ctx: &CancellationToken) -> Result<PoolStatus, ProviderError> {
        self.bounded(ctx, "reading pool status", async {
            Ok(self.read_state().await?.0.status())
        })
        .await
    }

    /// Snapshot of every allocation, keyed by allocation id.
    pub async fn list_allocated_ips(
        &self,
        ctx: &CancellationToken,
    ) -> Result<BTreeMap<String, IpAllocation>, ProviderError> {
        self.bounded(ctx, "listing allocations", async {
            Ok(self.read_state().await?.0.allocated_ips)
        })
        .await
    }

    // --- plumbing shared with recovery ---

    pub(super) fn node_name(&self) -> Result<String, ProviderError> {
        match &self.config.node_name {
            Some(name) if !name.trim().is_empty() => Ok(name.trim().to_string()),
            _ => node::current_node_name(),
        }
    }

    /// Current state and its version token. An absent object or empty payload yields
    /// the initial state, which is only persisted by the next write.
    pub(super) async fn read_state(&self) -> Result<(IpAllocationState, Option<String>), ProviderError> {
        match self.store.get().await? {
            None => Ok((IpAllocationState::initial(&self.config.pool_ips), None)),
            Some(obj) => {
                let state = match obj.data {
                    Some(data) => decode_state(&data)?,
                    None => IpAllocationState::initial(&self.config.pool_ips),
                };
                Ok((state, Some(obj.resource_version)))
            }
        }
    }

    /// Create the object when `version` is `None`, otherwise compare-and-set against it.
    pub(super) async fn write_state(
        &self,
        state: &IpAllocationState,
        version: Option<&str>,
    ) -> Result<(), ProviderError> {
        let data = state
            .to_pretty_json()
            .map_err(|e| ProviderError::UpdatingPoolState(format!("encoding state: {}", e)))?;
        match version {
            None => self.store.create(&data).await,
            Some(v) => self.store.update(&data, v).await,
        }
    }

    pub(super) async fn bounded<T, F>(&self, ctx: &CancellationToken, what: &str, op: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        let timeout = self.config.operation_timeout;
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(ProviderError::Cancelled),
            res = tokio::time::timeout(timeout, op) => match res {
                Ok(inner) => inner,
                Err(_) => Err(ProviderError::Timeout { what: what.to_string(), timeout }),
            },
        }
    }

    async fn check_vm_readiness(&self, ip: IpAddr) -> Result<(), ProviderError> {
        let addr = SocketAddr::new(ip, self.config.readiness_port);
        let mut backoff = backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(10))
            .with_multiplier(5.0)
            .with_randomization_factor(0.1)
            .with_max_elapsed_time(None)
            .build();

        let mut last_error = String::new();
        for attempt in 1..=READINESS_ATTEMPTS {
            match tokio::time::timeout(READINESS_DIAL_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(_)) => {
                    info!("VM {} is ready", ip);
                    return Ok(());
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("no answer within {:?}", READINESS_DIAL_TIMEOUT),
            }
            debug!("VM {} not ready (attempt {}): {}", ip, attempt, last_error);
            if attempt < READINESS_ATTEMPTS {
                if let Some(delay) = backoff.next_backoff() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
        warn!("VM {} failed readiness check, not allocating it", ip);
        Err(ProviderError::invalid_ip(
            ip.to_string(),
            format!("VM not ready on port {}: {}", self.config.readiness_port, last_error),
        ))
    }
}

pub(super) fn decode_state(data: &str) -> Result<IpAllocationState, ProviderError> {
    serde_json::from_str(data)
        .map_err(|e| ProviderError::RetrievingPoolState(format!("decoding state: {}", e)))
}

pub(super) fn parse_ip(ip: &str) -> Result<IpAddr, ProviderError> {
    ip.parse::<IpAddr>().map_err(|e| ProviderError::invalid_ip(ip, e))
}

/// Slot for `allocation_id`: first four MD5 bytes, big-endian, modulo the slice length.
///
/// Spreads concurrent pickers over different slots; determinism is all that matters.
pub fn select_ip_index(available: &[String], allocation_id: &str) -> usize {
    if available.len() <= 1 {
        return 0;
    }
    let hash = Md5::digest(allocation_id.as_bytes());
    let seed = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]);
    seed as usize % available.len()
}

/// Run a get-modify-write step, re-running it from a fresh read when the store reports a conflict.
pub(super) async fn retry_on_conflict<T, F, Fut>(what: &str, mut step: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut backoff = backoff::ExponentialBackoffBuilder::new()
        .with_initial_interval(CONFLICT_BASE_DELAY)
        .with_max_elapsed_time(None)
        .build();

    let mut attempt = 1;
    loop {
        match step().await {
            Err(ProviderError::Conflict(msg)) if attempt < CONFLICT_ATTEMPTS => {
                let delay = backoff.next_backoff().unwrap_or(CONFLICT_BASE_DELAY);
                debug!("{}: write conflict ({}), retrying in {:?}", what, msg, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(ProviderError::Conflict(msg)) => {
                warn!("{}: giving up after {} conflicting writes", what, attempt);
                return Err(ProviderError::Conflict(msg));
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byom::store::MemoryStore;
    use std::net::{Ipv4Addr, TcpListener};

    fn ips(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn pool(store: Arc<MemoryStore>, list: &[&str]) -> IpPool {
        let mut cfg = PoolConfig::new(ips(list));
        cfg.check_vm_readiness = false;
        cfg.node_name = Some("test-node".to_string());
        IpPool::new(store, cfg).unwrap()
    }

    #[test]
    fn slot_is_md5_prefix_modulo_len() {
        let three = ips(&["a", "b", "c"]);
        assert_eq!(select_ip_index(&three, "a1"), 2);
        assert_eq!(select_ip_index(&three, "x"), 1);
        assert_eq!(select_ip_index(&three[..2], "a1"), 1);
        assert_eq!(select_ip_index(&three[..1], "a1"), 0);
        assert_eq!(select_ip_index(&[], "a1"), 0);
    }

    #[test]
    fn rejects_bad_pool_config() {
        let store = Arc::new(MemoryStore::new());
        assert!(IpPool::new(store.clone(), PoolConfig::new(vec![])).is_err());
        assert_eq!(
            IpPool::new(store.clone(), PoolConfig::new(ips(&["10.0.0.300"])))
                .err()
                .unwrap()
                .kind(),
            "invalid-ip"
        );
        let mut cfg = PoolConfig::new(ips(&["10.0.0.1"]));
        cfg.operation_timeout = Duration::ZERO;
        assert_eq!(IpPool::new(store, cfg).err().unwrap().kind(), "configuration-invalid");
    }

    #[tokio::test]
    async fn first_write_creates_the_object() {
        let store = Arc::new(MemoryStore::new());
        let p = pool(store.clone(), &["192.168.1.10", "192.168.1.11"]);
        let ctx = CancellationToken::new();

        let ip = p.allocate_ip(&ctx, "a1", "p1").await.unwrap();
        assert_eq!(ip.to_string(), "192.168.1.11");

        let state = decode_state(&store.data().unwrap()).unwrap();
        assert_eq!(state.version, 2);
        assert_eq!(state.allocated_ips["a1"].node_name, "test-node");
        assert_eq!(state.allocated_ips["a1"].pod_name, "p1");
        assert_eq!(state.available_ips, vec!["192.168.1.10"]);
    }

    #[tokio::test]
    async fn conflicts_reapply_on_fresh_state() {
        let store = Arc::new(MemoryStore::new());
        let p = pool(store.clone(), &["192.168.1.10", "192.168.1.11"]);
        let ctx = CancellationToken::new();
        p.allocate_ip(&ctx, "a1", "p1").await.unwrap();

        store.inject_conflicts(CONFLICT_ATTEMPTS - 1);
        p.allocate_ip(&ctx, "b2", "p2").await.unwrap();
        assert_eq!(p.get_pool_status(&ctx).await.unwrap().in_use, 2);

        store.inject_conflicts(CONFLICT_ATTEMPTS);
        let err = p.deallocate_ip(&ctx, "a1").await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
        assert_eq!(p.get_pool_status(&ctx).await.unwrap().in_use, 2);
    }

    #[tokio::test]
    async fn deallocate_unknown_is_ok_and_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let p = pool(store.clone(), &["192.168.1.10"]);
        p.deallocate_ip(&CancellationToken::new(), "ghost").await.unwrap();
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn lookups_by_id_and_ip() {
        let store = Arc::new(MemoryStore::new());
        let p = pool(store, &["192.168.1.10"]);
        let ctx = CancellationToken::new();
        let ip = p.allocate_ip(&ctx, "pod-sb", "pod").await.unwrap();

        assert_eq!(p.get_ip_from_allocation_id(&ctx, "pod-sb").await.unwrap(), Some(ip));
        assert_eq!(p.get_ip_from_allocation_id(&ctx, "other").await.unwrap(), None);
        assert_eq!(
            p.get_allocation_id_from_ip(&ctx, ip).await.unwrap().as_deref(),
            Some("pod-sb")
        );
        let other: IpAddr = "192.168.1.99".parse().unwrap();
        assert_eq!(p.get_allocation_id_from_ip(&ctx, other).await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_state_fails_reads() {
        let store = Arc::new(MemoryStore::with_data("{not json"));
        let p = pool(store, &["192.168.1.10"]);
        let err = p.get_pool_status(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), "retrieving-pool-state");
    }

    #[tokio::test]
    async fn readiness_probe_gates_allocation() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let open_port = listener.local_addr().unwrap().port();

        let ctx = CancellationToken::new();
        let mut cfg = PoolConfig::new(ips(&["127.0.0.1"]));
        cfg.node_name = Some("test-node".to_string());
        cfg.readiness_port = open_port;
        let p = IpPool::new(Arc::new(MemoryStore::new()), cfg.clone()).unwrap();
        assert_eq!(p.allocate_ip(&ctx, "a", "p").await.unwrap().to_string(), "127.0.0.1");

        drop(listener);
        let store = Arc::new(MemoryStore::new());
        let p = IpPool::new(store.clone(), cfg).unwrap();
        let err = p.allocate_ip(&ctx, "a", "p").await.unwrap_err();
        assert_eq!(err.kind(), "invalid-ip");
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn cancelled_context_stops_the_call() {
        let p = pool(Arc::new(MemoryStore::new()), &["192.168.1.10"]);
        let ctx = CancellationToken::new();
        ctx.cancel();
        let err = p.allocate_ip(&ctx, "a", "p").await.unwrap_err();
        assert_eq!(err.kind(), "cancelled");
    }
}
