use clap::Parser;
use peerpod_common::config::{require, resolve_secret};
use peerpod_common::ProviderError;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_IAM_ENDPOINT: &str = "https://iam.cloud.ibm.com";
pub const DEFAULT_PUD_PORT: u16 = 8006;
const API_KEY_ENV: &str = "IBMCLOUD_API_KEY";

#[derive(Parser, Debug, Clone)]
#[command(name = "ibmcloud-powervs", about = "IBM Power Virtual Server pod VMs")]
pub struct PowerVsConfig {
    /// Falls back to the file named by IBMCLOUD_API_KEY_FILE
    #[arg(long = "api-key", env = API_KEY_ENV, default_value = "", hide_env_values = true)]
    pub api_key: String,

    #[arg(long, env = "POWERVS_ZONE", default_value = "")]
    pub zone: String,

    #[arg(long = "service-instance-id", env = "POWERVS_SERVICE_INSTANCE_ID", default_value = "")]
    pub service_instance_id: String,

    #[arg(long = "network-id", env = "POWERVS_NETWORK_ID", default_value = "")]
    pub network_id: String,

    #[arg(long = "image-id", env = "POWERVS_IMAGE_ID", default_value = "")]
    pub image_id: String,

    /// Name of an SSH key registered with the workspace
    #[arg(long = "ssh-key", env = "POWERVS_SSH_KEY_NAME", default_value = "")]
    pub ssh_key: String,

    /// GB
    #[arg(long, env = "POWERVS_MEMORY", default_value_t = 2.0)]
    pub memory: f64,

    #[arg(long = "cpu", env = "POWERVS_PROCESSORS", default_value_t = 0.5)]
    pub processors: f64,

    #[arg(long = "proc-type", env = "POWERVS_PROCESSOR_TYPE", default_value = "shared")]
    pub processor_type: String,

    #[arg(long = "sys-type", env = "POWERVS_SYSTEM_TYPE", default_value = "s922")]
    pub system_type: String,

    /// Dial the external address of the fixed network instead of the internal one
    #[arg(long = "use-public-ip", env = "USE_PUBLIC_IP")]
    pub use_public_ip: bool,

    /// Boot with only an SSH user and push the real user data over SFTP
    #[arg(long = "enable-sftp", env = "ENABLE_SFTP")]
    pub enable_sftp: bool,

    #[arg(long = "cloud-user-name", env = "CLOUD_USER_NAME", default_value = "")]
    pub cloud_user_name: String,

    /// SFTP key pair; a fresh RSA key is generated when these are missing
    #[arg(long = "ssh-pub-key", env = "SSH_PUB_KEY_PATH", default_value = "/root/.ssh/id_rsa.pub")]
    pub ssh_pub_key_path: PathBuf,

    #[arg(long = "ssh-priv-key", env = "SSH_PRIV_KEY_PATH", default_value = "/root/.ssh/id_rsa")]
    pub ssh_priv_key_path: PathBuf,

    /// Idle VMs kept ready; 0 disables the pool
    #[arg(long = "pool-size", env = "POWERVS_POOL_SIZE", default_value_t = 0)]
    pub pool_size: usize,

    /// Port of the user-data daemon on pooled VMs
    #[arg(long = "pud-port", env = "POWERVS_PUD_PORT", default_value_t = DEFAULT_PUD_PORT)]
    pub pud_port: u16,

    /// Seconds between pool health sweeps
    #[arg(long = "pool-sweep-interval", env = "POWERVS_POOL_SWEEP_INTERVAL", default_value_t = 900)]
    pub pool_sweep_interval: u64,

    /// Overrides https://<region>.power-iaas.cloud.ibm.com
    #[arg(long = "powervs-endpoint", env = "POWERVS_ENDPOINT", default_value = "")]
    pub endpoint: String,

    #[arg(long = "iam-endpoint", env = "IBMCLOUD_IAM_ENDPOINT", default_value = DEFAULT_IAM_ENDPOINT)]
    pub iam_endpoint: String,
}

impl PowerVsConfig {
    pub fn api_key(&self) -> Option<String> {
        resolve_secret(&self.api_key, API_KEY_ENV)
    }

    pub fn pool_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.pool_sweep_interval)
    }

    pub fn endpoint(&self) -> String {
        match self.endpoint.trim() {
            "" => format!("https://{}.power-iaas.cloud.ibm.com", region_of_zone(&self.zone)),
            explicit => explicit.trim_end_matches('/').to_string(),
        }
    }

    /// Copy safe to log.
    pub fn redacted(&self) -> Self {
        let mut out = self.clone();
        if !out.api_key.is_empty() {
            out.api_key = "***".to_string();
        }
        out
    }

    pub fn verify(&self) -> Result<(), ProviderError> {
        require(&self.image_id, "image-id")?;
        if self.api_key().is_none() {
            return Err(ProviderError::ConfigInvalid("api-key is empty".to_string()));
        }
        require(&self.zone, "zone")?;
        require(&self.service_instance_id, "service-instance-id")?;
        require(&self.network_id, "network-id")?;
        if self.enable_sftp {
            require(&self.cloud_user_name, "cloud-user-name")?;
        }
        if self.memory <= 0.0 || self.processors <= 0.0 {
            return Err(ProviderError::ConfigInvalid(
                "memory and cpu must be greater than zero".to_string(),
            ));
        }
        if self.pool_size > 0 && self.pool_sweep_interval == 0 {
            return Err(ProviderError::ConfigInvalid(
                "pool-sweep-interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Regional API host for a workspace zone (`dal12` -> `us-south`, `lon06` -> `lon`).
pub fn region_of_zone(zone: &str) -> String {
    let zone = zone.trim().to_lowercase();
    if zone.starts_with("dal") || zone == "us-south" {
        return "us-south".to_string();
    }
    if zone.starts_with("wdc") || zone == "us-east" {
        return "us-east".to_string();
    }
    if zone.starts_with("eu-de") {
        return "eu-de".to_string();
    }
    zone.trim_end_matches(|c: char| c.is_ascii_digit()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::parse_config;

    fn valid() -> PowerVsConfig {
        let args: Vec<String> = [
            "--api-key",
            "ibm-secret",
            "--zone",
            "lon06",
            "--service-instance-id",
            "svc-1",
            "--network-id",
            "net-1",
            "--image-id",
            "img-1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        parse_config("ibmcloud-powervs", &args).unwrap()
    }

    #[test]
    fn defaults() {
        let cfg = valid();
        assert_eq!(cfg.memory, 2.0);
        assert_eq!(cfg.processors, 0.5);
        assert_eq!(cfg.processor_type, "shared");
        assert_eq!(cfg.system_type, "s922");
        assert_eq!(cfg.pud_port, 8006);
        assert_eq!(cfg.pool_sweep_interval(), Duration::from_secs(15 * 60));
        assert_eq!(cfg.endpoint(), "https://lon.power-iaas.cloud.ibm.com");
        cfg.verify().unwrap();
    }

    #[test]
    fn zones_map_to_regions() {
        assert_eq!(region_of_zone("dal12"), "us-south");
        assert_eq!(region_of_zone("wdc06"), "us-east");
        assert_eq!(region_of_zone("eu-de-1"), "eu-de");
        assert_eq!(region_of_zone("syd04"), "syd");
    }

    #[test]
    fn sftp_needs_a_cloud_user() {
        let cfg = PowerVsConfig {
            enable_sftp: true,
            ..valid()
        };
        assert_eq!(
            cfg.verify().unwrap_err().to_string(),
            "invalid configuration: cloud-user-name is empty"
        );
    }

    #[test]
    fn image_checked_first() {
        let cfg = PowerVsConfig {
            image_id: String::new(),
            zone: String::new(),
            ..valid()
        };
        assert_eq!(
            cfg.verify().unwrap_err().to_string(),
            "invalid configuration: image-id is empty"
        );
    }

    #[test]
    fn api_key_is_redacted() {
        let shown = format!("{:?}", valid().redacted());
        assert!(!shown.contains("ibm-secret"));
        assert!(shown.contains("svc-1"));
    }
}
