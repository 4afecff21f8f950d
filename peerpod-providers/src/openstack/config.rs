use clap::Parser;
use peerpod_common::config::{parse_comma_list, require, resolve_secret};
use peerpod_common::ProviderError;

const PASSWORD_ENV: &str = "OPENSTACK_PASSWORD";
const REDACTED: &str = "***";

#[derive(Parser, Debug, Clone)]
#[command(name = "openstack", about = "OpenStack Nova pod VMs")]
pub struct OpenStackConfig {
    /// Keystone URL, with or without the /v3 suffix
    #[arg(long = "openstack-identity-endpoint", env = "OPENSTACK_IDENTITY_ENDPOINT", default_value = "")]
    pub identity_endpoint: String,

    #[arg(long = "openstack-username", env = "OPENSTACK_USERNAME", default_value = "")]
    pub username: String,

    /// Falls back to the file named by OPENSTACK_PASSWORD_FILE
    #[arg(long = "openstack-password", env = PASSWORD_ENV, default_value = "", hide_env_values = true)]
    pub password: String,

    #[arg(long = "openstack-tenant-name", env = "OPENSTACK_TENANT_NAME", default_value = "")]
    pub tenant_name: String,

    #[arg(long = "openstack-domain-name", env = "OPENSTACK_DOMAIN_NAME", default_value = "Default")]
    pub domain_name: String,

    /// Empty picks the first public endpoint of each service
    #[arg(long = "openstack-region", env = "OPENSTACK_REGION", default_value = "")]
    pub region: String,

    #[arg(long = "imageID", env = "OPENSTACK_IMAGE_ID", default_value = "")]
    pub image_id: String,

    #[arg(long = "flavorID", env = "OPENSTACK_FLAVOR_ID", default_value = "")]
    pub flavor_id: String,

    /// Comma-separated flavors pods may ask for besides the default
    #[arg(long = "flavorIDs", env = "OPENSTACK_FLAVOR_IDS", default_value = "")]
    pub flavor_ids: String,

    /// Comma-separated network UUIDs; empty lets Nova pick ("auto")
    #[arg(long = "networkID", env = "OPENSTACK_NETWORK_ID", default_value = "")]
    pub network_ids: String,

    #[arg(long = "security-group", env = "OPENSTACK_SECURITY_GROUP", default_value = "")]
    pub security_groups: String,

    /// External network to allocate floating IPs from; empty disables them
    #[arg(long = "floating-ip-networkID", env = "OPENSTACK_FLOATING_IP_NETWORK_ID", default_value = "")]
    pub floating_ip_network_id: String,
}

impl OpenStackConfig {
    pub fn password(&self) -> Option<String> {
        resolve_secret(&self.password, PASSWORD_ENV)
    }

    pub fn network_ids(&self) -> Vec<String> {
        parse_comma_list(&self.network_ids)
    }

    pub fn security_groups(&self) -> Vec<String> {
        parse_comma_list(&self.security_groups)
    }

    pub fn flavor_ids(&self) -> Vec<String> {
        parse_comma_list(&self.flavor_ids)
    }

    /// Copy safe to log: user, password and tenant are masked.
    pub fn redacted(&self) -> Self {
        let mask = |v: &str| if v.is_empty() { String::new() } else { REDACTED.to_string() };
        Self {
            username: mask(&self.username),
            password: mask(&self.password),
            tenant_name: mask(&self.tenant_name),
            ..self.clone()
        }
    }

    pub fn verify(&self) -> Result<(), ProviderError> {
        require(&self.image_id, "imageID")?;
        require(&self.flavor_id, "flavorID")?;
        require(&self.identity_endpoint, "openstack-identity-endpoint")?;
        require(&self.username, "openstack-username")?;
        if self.password().is_none() {
            return Err(ProviderError::ConfigInvalid("openstack-password is empty".to_string()));
        }
        Ok(())
    }
}
