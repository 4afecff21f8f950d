use clap::Parser;
use peerpod_common::config::{parse_comma_list, parse_key_value_list, require, resolve_secret};
use peerpod_common::ProviderError;
use std::collections::BTreeMap;

pub const DEFAULT_REGION: &str = "cn-beijing";
pub const DEFAULT_INSTANCE_TYPE: &str = "ecs.g8i.xlarge";
const SECRET_ENV: &str = "ALIBABACLOUD_ACCESS_KEY_SECRET";

#[derive(Parser, Debug, Clone)]
#[command(name = "alibabacloud", about = "Alibaba Cloud ECS pod VMs")]
pub struct AlibabaConfig {
    #[arg(long = "alibabacloud-access-key-id", env = "ALIBABACLOUD_ACCESS_KEY_ID", default_value = "")]
    pub access_key_id: String,

    /// Falls back to the file named by ALIBABACLOUD_ACCESS_KEY_SECRET_FILE
    #[arg(
        long = "alibabacloud-secret-access-key",
        env = SECRET_ENV,
        default_value = "",
        hide_env_values = true
    )]
    pub secret_key: String,

    #[arg(long, env = "REGION", default_value = DEFAULT_REGION)]
    pub region: String,

    #[arg(long = "imageid", env = "IMAGEID", default_value = "")]
    pub image_id: String,

    #[arg(long = "instance-type", env = "PODVM_INSTANCE_TYPE", default_value = DEFAULT_INSTANCE_TYPE)]
    pub instance_type: String,

    /// Comma-separated shortlist of instance types pods may ask for
    #[arg(long = "instance-types", env = "PODVM_INSTANCE_TYPES", default_value = "")]
    pub instance_types: String,

    #[arg(long = "security-group-ids", env = "SECURITY_GROUP_IDS", default_value = "")]
    pub security_group_ids: String,

    #[arg(long = "keyname", env = "KEYNAME", default_value = "")]
    pub key_name: String,

    #[arg(long = "vswitch-id", env = "VSWITCH_ID", default_value = "")]
    pub vswitch_id: String,

    /// key=value pairs, comma separated
    #[arg(long, env = "TAGS", default_value = "")]
    pub tags: String,

    #[arg(long = "use-public-ip", env = "USE_PUBLIC_IP")]
    pub use_public_ip: bool,

    /// GiB; 0 keeps the image default
    #[arg(long = "system-disk-size", env = "SYSTEM_DISK_SIZE", default_value_t = 40)]
    pub system_disk_size: u32,

    #[arg(long = "disable-cvm", env = "DISABLE_CVM")]
    pub disable_cvm: bool,

    /// Overrides https://ecs.<region>.aliyuncs.com
    #[arg(long = "ecs-endpoint", env = "ALIBABACLOUD_ECS_ENDPOINT", default_value = "")]
    pub ecs_endpoint: String,

    /// Overrides https://vpc.<region>.aliyuncs.com
    #[arg(long = "vpc-endpoint", env = "ALIBABACLOUD_VPC_ENDPOINT", default_value = "")]
    pub vpc_endpoint: String,
}

impl AlibabaConfig {
    pub fn access_key_secret(&self) -> Option<String> {
        resolve_secret(&self.secret_key, SECRET_ENV)
    }

    pub fn instance_types(&self) -> Vec<String> {
        parse_comma_list(&self.instance_types)
    }

    pub fn security_group_ids(&self) -> Vec<String> {
        parse_comma_list(&self.security_group_ids)
    }

    pub fn tags(&self) -> Result<BTreeMap<String, String>, ProviderError> {
        parse_key_value_list(&self.tags)
    }

    pub fn ecs_endpoint(&self) -> String {
        endpoint_or(&self.ecs_endpoint, "ecs", &self.region)
    }

    pub fn vpc_endpoint(&self) -> String {
        endpoint_or(&self.vpc_endpoint, "vpc", &self.region)
    }

    /// Copy safe to log.
    pub fn redacted(&self) -> Self {
        let mut out = self.clone();
        if !out.secret_key.is_empty() {
            out.secret_key = "***".to_string();
        }
        out
    }

    pub fn verify(&self) -> Result<(), ProviderError> {
        require(&self.image_id, "imageid")?;
        require(&self.access_key_id, "alibabacloud-access-key-id")?;
        if self.access_key_secret().is_none() {
            return Err(ProviderError::ConfigInvalid(
                "alibabacloud-secret-access-key is empty".to_string(),
            ));
        }
        require(&self.region, "region")?;
        require(&self.vswitch_id, "vswitch-id")?;
        if self.security_group_ids().is_empty() {
            return Err(ProviderError::ConfigInvalid(
                "security-group-ids must list at least one group".to_string(),
            ));
        }
        self.tags()?;
        Ok(())
    }
}

fn endpoint_or(configured: &str, product: &str, region: &str) -> String {
    match configured.trim() {
        "" => format!("https://{}.{}.aliyuncs.com", product, region),
        explicit => explicit.to_string(),
    }
}
