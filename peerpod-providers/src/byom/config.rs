use super::state::DEFAULT_CONFIGMAP_NAME;
use clap::{Parser, ValueEnum};
use peerpod_common::config::require;
use peerpod_common::ProviderError;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_MAX_RANGE_IPS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PoolStoreKind {
    /// Shared ConfigMap in the cluster.
    Configmap,
    /// Process-local; single-node development only.
    Memory,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "byom", about = "Bring-your-own-machine VM pool")]
pub struct ByomConfig {
    /// Comma-separated IPs or `start-end` ranges of the pre-created VMs
    #[arg(long = "vm-pool-ips", env = "VM_POOL_IPS", default_value = "")]
    pub vm_pool_ips: String,

    #[arg(long = "max-range-ips", env = "MAX_RANGE_IPS", default_value_t = DEFAULT_MAX_RANGE_IPS)]
    pub max_range_ips: usize,

    #[arg(long = "ssh-username", env = "SSH_USERNAME", default_value = "peerpod")]
    pub ssh_username: String,

    #[arg(long = "ssh-pub-key", env = "SSH_PUB_KEY_PATH", default_value = "/root/.ssh/id_rsa.pub")]
    pub ssh_pub_key_path: PathBuf,

    #[arg(long = "ssh-priv-key", env = "SSH_PRIV_KEY_PATH", default_value = "/root/.ssh/id_rsa")]
    pub ssh_priv_key_path: PathBuf,

    /// Seconds
    #[arg(long = "ssh-timeout", env = "SSH_TIMEOUT", default_value_t = 30)]
    pub ssh_timeout: u64,

    /// Enables allowlist host key checking when set
    #[arg(long = "ssh-host-key-allowlist-dir", env = "SSH_HOST_KEY_ALLOWLIST_DIR")]
    pub ssh_host_key_allowlist_dir: Option<PathBuf>,

    /// Defaults to the namespace this pod runs in
    #[arg(long = "pool-namespace", env = "POOL_NAMESPACE", default_value = "")]
    pub pool_namespace: String,

    #[arg(long = "pool-configmap-name", env = "POOL_CONFIGMAP_NAME", default_value = DEFAULT_CONFIGMAP_NAME)]
    pub pool_configmap_name: String,

    #[arg(long = "pool-store", env = "POOL_STORE", value_enum, default_value_t = PoolStoreKind::Configmap)]
    pub pool_store: PoolStoreKind,

    /// Seconds
    #[arg(long = "operation-timeout", env = "POOL_OPERATION_TIMEOUT", default_value_t = 30)]
    pub operation_timeout: u64,

    #[arg(long = "skip-vm-readiness", env = "SKIP_VM_READINESS")]
    pub skip_vm_readiness: bool,
}

impl ByomConfig {
    pub fn pool_ips(&self) -> Result<Vec<String>, ProviderError> {
        parse_vm_pool_ips(&self.vm_pool_ips, self.max_range_ips)
    }

    pub fn ssh_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_timeout)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout)
    }

    pub fn verify(&self) -> Result<(), ProviderError> {
        if self.pool_ips()?.is_empty() {
            return Err(ProviderError::ConfigInvalid(
                "vm-pool-ips must list at least one IP".to_string(),
            ));
        }
        require(&self.ssh_username, "ssh-username")?;
        require(&self.ssh_pub_key_path.to_string_lossy(), "ssh-pub-key")?;
        if self.ssh_timeout == 0 {
            return Err(ProviderError::ConfigInvalid("ssh-timeout must be greater than zero".to_string()));
        }
        if self.operation_timeout == 0 {
            return Err(ProviderError::ConfigInvalid(
                "operation-timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Expand `10.0.0.1, 10.0.0.5-10.0.0.9` into a deduplicated list, keeping first-seen order.
///
/// A range needs start < end and yields at most `max_range_ips` addresses.
pub fn parse_vm_pool_ips(raw: &str, max_range_ips: usize) -> Result<Vec<String>, ProviderError> {
    let mut all = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        match entry.split_once('-') {
            Some((start, end)) => all.extend(expand_range(entry, start.trim(), end.trim(), max_range_ips)?),
            None => {
                let ip: IpAddr = entry
                    .parse()
                    .map_err(|e| ProviderError::ConfigInvalid(format!("invalid IP address {:?}: {}", entry, e)))?;
                all.push(ip.to_string());
            }
        }
    }

    let mut seen = HashSet::new();
    all.retain(|ip| seen.insert(ip.clone()));
    Ok(all)
}

fn expand_range(entry: &str, start: &str, end: &str, max: usize) -> Result<Vec<String>, ProviderError> {
    let invalid = |why: String| ProviderError::ConfigInvalid(format!("invalid IP range {:?}: {}", entry, why));
    let start: IpAddr = start.parse().map_err(|e| invalid(format!("{}", e)))?;
    let end: IpAddr = end.parse().map_err(|e| invalid(format!("{}", e)))?;

    let (first, last, v4) = match (start, end) {
        (IpAddr::V4(s), IpAddr::V4(e)) => (u32::from(s) as u128, u32::from(e) as u128, true),
        (IpAddr::V6(s), IpAddr::V6(e)) => (u128::from(s), u128::from(e), false),
        _ => return Err(invalid("mixed address families".to_string())),
    };
    if first >= last {
        return Err(invalid("start must be lower than end".to_string()));
    }

    let span = last - first + 1;
    if span > max as u128 {
        warn!(
            "IP range {} exceeds the maximum of {} addresses, using only the first {}",
            entry, max, max
        );
    }
    let count = span.min(max as u128);
    Ok((0..count)
        .map(|offset| {
            let n = first + offset;
            if v4 {
                Ipv4Addr::from(n as u32).to_string()
            } else {
                Ipv6Addr::from(n).to_string()
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::parse_config;

    #[test]
    fn single_ips_and_ranges() {
        let ips = parse_vm_pool_ips("192.168.1.10, 192.168.1.20-192.168.1.22,", 100).unwrap();
        assert_eq!(
            ips,
            vec!["192.168.1.10", "192.168.1.20", "192.168.1.21", "192.168.1.22"]
        );
    }

    #[test]
    fn range_crosses_octets() {
        let ips = parse_vm_pool_ips("10.0.0.254-10.0.1.1", 100).unwrap();
        assert_eq!(ips, vec!["10.0.0.254", "10.0.0.255", "10.0.1.0", "10.0.1.1"]);
    }

    #[test]
    fn range_is_capped() {
        let ips = parse_vm_pool_ips("10.0.0.1-10.0.0.200", 5).unwrap();
        assert_eq!(ips.len(), 5);
        assert_eq!(ips.last().map(String::as_str), Some("10.0.0.5"));
    }

    #[test]
    fn duplicates_removed_in_order() {
        let ips = parse_vm_pool_ips("10.0.0.3,10.0.0.1-10.0.0.3,10.0.0.1", 100).unwrap();
        assert_eq!(ips, vec!["10.0.0.3", "10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn bad_entries_rejected() {
        for raw in ["10.0.0.300", "10.0.0.5-10.0.0.1", "10.0.0.1-10.0.0.1", "10.0.0.1-::2", "x-y"] {
            let err = parse_vm_pool_ips(raw, 100).unwrap_err();
            assert_eq!(err.kind(), "configuration-invalid", "{}", raw);
        }
        assert!(parse_vm_pool_ips("", 100).unwrap().is_empty());
    }

    #[test]
    fn ipv6_range() {
        let ips = parse_vm_pool_ips("fd00::1-fd00::3", 100).unwrap();
        assert_eq!(ips, vec!["fd00::1", "fd00::2", "fd00::3"]);
    }

    #[test]
    fn flags_and_verification() {
        let cfg: ByomConfig = parse_config(
            "byom",
            &[
                "--vm-pool-ips".to_string(),
                "192.168.1.10,192.168.1.11".to_string(),
                "--pool-store".to_string(),
                "memory".to_string(),
                "--skip-vm-readiness".to_string(),
            ],
        )
        .unwrap();
        assert_eq!(cfg.pool_store, PoolStoreKind::Memory);
        assert!(cfg.skip_vm_readiness);
        assert_eq!(cfg.ssh_username, "peerpod");
        assert_eq!(cfg.pool_configmap_name, "byom-ip-pool-state");
        cfg.verify().unwrap();

        let zero = ByomConfig { ssh_timeout: 0, ..cfg.clone() };
        assert_eq!(zero.verify().unwrap_err().kind(), "configuration-invalid");
        let empty = ByomConfig { vm_pool_ips: String::new(), ..cfg };
        assert_eq!(empty.verify().unwrap_err().kind(), "configuration-invalid");
    }
}
