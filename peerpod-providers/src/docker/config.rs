use clap::Parser;
use peerpod_common::config::require;
use peerpod_common::ProviderError;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_DATA_DIR: &str = "/var/lib/docker/peerpods";
pub const DEFAULT_PODVM_IMAGE: &str = "quay.io/confidential-containers/podvm-docker-image";
pub const DEFAULT_NETWORK: &str = "bridge";

#[derive(Parser, Debug, Clone)]
#[command(name = "docker", about = "Privileged containers standing in for pod VMs")]
pub struct DockerConfig {
    /// Passed to the CLI as DOCKER_HOST; empty keeps the CLI default
    #[arg(long = "docker-host", env = "DOCKER_HOST", default_value = "")]
    pub docker_host: String,

    #[arg(long = "data-dir", env = "DOCKER_DATA_DIR", default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,

    #[arg(long = "podvm-docker-image", env = "PODVM_DOCKER_IMAGE", default_value = DEFAULT_PODVM_IMAGE)]
    pub podvm_image: String,

    #[arg(long = "docker-network-name", env = "DOCKER_NETWORK_NAME", default_value = DEFAULT_NETWORK)]
    pub network_name: String,

    /// docker CLI to run
    #[arg(long = "docker-binary", env = "DOCKER_BINARY", default_value = "docker")]
    pub docker_binary: PathBuf,

    /// Seconds one docker CLI call may take
    #[arg(long = "docker-command-timeout", env = "DOCKER_COMMAND_TIMEOUT", default_value_t = 60)]
    pub command_timeout_secs: u64,
}

impl DockerConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// `<data-dir>/<instance>-userdata`
    pub fn user_data_path(&self, instance_name: &str) -> PathBuf {
        self.data_dir.join(format!("{}-userdata", instance_name))
    }

    /// Host paths mounted into every pod container besides the user data.
    pub fn shared_binds(&self) -> Vec<String> {
        let data = self.data_dir.as_path();
        vec![
            bind(&data.join("kata-containers"), "/run/kata-containers"),
            "/lib/modules:/lib/modules".to_string(),
            "/run/xtables.lock:/run/xtables.lock".to_string(),
            bind(&data.join("image"), "/image"),
        ]
    }

    pub fn verify(&self) -> Result<(), ProviderError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ProviderError::ConfigInvalid("data-dir is empty".to_string()));
        }
        require(&self.podvm_image, "podvm-docker-image")?;
        require(&self.network_name, "docker-network-name")?;
        if self.command_timeout_secs == 0 {
            return Err(ProviderError::ConfigInvalid(
                "docker-command-timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn bind(host: &Path, guest: &str) -> String {
    format!("{}:{}", host.display(), guest)
}
