//! Docker provider: each pod "VM" is a privileged podvm container on the local daemon.

use crate::registry::{parse_config, ProviderFactory};
use crate::{Provider, SharedProvider};
use anyhow::{Context, Result};
use async_trait::async_trait;
use peerpod_common::cloudinit::CloudConfigGenerator;
use peerpod_common::naming::generate_instance_name;
use peerpod_common::{Instance, InstanceTypeSpec, ProviderError};
use std::net::IpAddr;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod config;

pub use config::DockerConfig;

pub const PROVIDER_NAME: &str = "docker";

const MAX_INSTANCE_NAME_LEN: usize = 63;
const AGENT_PORT: &str = "15150/tcp";
const GUEST_USER_DATA: &str = "/media/cidata/user-data";

pub struct DockerProvider {
    config: DockerConfig,
}

impl DockerProvider {
    /// Creates the data directory up front so bind sources exist.
    pub async fn new(config: DockerConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
        Ok(Self { config })
    }

    /// Run one docker CLI call and return its trimmed stdout.
    async fn docker(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(&self.config.docker_binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !self.config.docker_host.is_empty() {
            cmd.env("DOCKER_HOST", &self.config.docker_host);
        }

        let verb = args.first().copied().unwrap_or_default();
        debug!("docker {}", args.join(" "));
        let child = cmd.spawn().with_context(|| {
            format!(
                "failed to spawn '{}'; is the docker CLI installed?",
                self.config.docker_binary.display()
            )
        })?;

        // kill_on_drop reaps the child when the timeout drops the future
        let output = tokio::time::timeout(self.config.command_timeout(), child.wait_with_output())
            .await
            .map_err(|_| ProviderError::Timeout {
                what: format!("docker {}", verb),
                timeout: self.config.command_timeout(),
            })?
            .with_context(|| format!("docker {} failed", verb))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such container") {
                return Err(ProviderError::NotFound(format!("container for docker {}", verb)).into());
            }
            return Err(ProviderError::api(
                format!("docker {}", verb),
                format!("{}: {}", output.status, stderr.trim()),
            )
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run_container(&self, name: &str, image: &str, user_data_file: &Path) -> Result<String> {
        let mut binds = vec![config::bind(user_data_file, GUEST_USER_DATA)];
        binds.extend(self.config.shared_binds());

        let mut args = vec![
            "run",
            "--detach",
            "--privileged",
            "--name",
            name,
            "--network",
            self.config.network_name.as_str(),
            "--expose",
            AGENT_PORT,
        ];
        for b in &binds {
            args.push("--volume");
            args.push(b.as_str());
        }
        args.push(image);

        let id = self.docker(&args).await?;
        if id.is_empty() {
            return Err(ProviderError::api("docker run", "no container id on stdout").into());
        }
        Ok(id)
    }

    async fn container_ip(&self, container_id: &str) -> Result<IpAddr> {
        let format = format!(
            "{{{{(index .NetworkSettings.Networks \"{}\").IPAddress}}}}",
            self.config.network_name
        );
        let raw = self
            .docker(&["inspect", "--format", &format, container_id])
            .await?;
        if raw.is_empty() || raw == "<no value>" {
            return Err(ProviderError::api(
                format!("container {}", container_id),
                format!("no IP on network {}", self.config.network_name),
            )
            .into());
        }
        let ip = raw
            .parse::<IpAddr>()
            .map_err(|e| ProviderError::invalid_ip(raw.as_str(), e))?;
        Ok(ip)
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.docker(&["rm", "--force", "--volumes", id]).await.map(|_| ())
    }

    async fn remove_user_data(&self, name: &str) {
        let path = self.config.user_data_path(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!("removed {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove {}: {}", path.display(), e),
        }
    }
}

#[async_trait]
impl Provider for DockerProvider {
    async fn create_instance(
        &self,
        _ctx: &CancellationToken,
        pod_name: &str,
        sandbox_id: &str,
        cloud_config: &dyn CloudConfigGenerator,
        spec: &InstanceTypeSpec,
    ) -> Result<Instance> {
        let name = generate_instance_name(pod_name, sandbox_id, MAX_INSTANCE_NAME_LEN)?;
        let user_data = cloud_config.generate().context("generating user data")?;

        let user_data_file = self.config.user_data_path(&name);
        tokio::fs::write(&user_data_file, user_data.as_bytes())
            .await
            .with_context(|| format!("writing {}", user_data_file.display()))?;

        let image = if spec.image.is_empty() {
            self.config.podvm_image.as_str()
        } else {
            spec.image.as_str()
        };

        info!("starting container {} from {}", name, image);
        let id = match self.run_container(&name, image, &user_data_file).await {
            Ok(id) => id,
            Err(e) => {
                // a failed run may still leave a created container behind
                if let Err(rollback) = self.remove_container(&name).await {
                    if !crate::http::is_not_found(&rollback) {
                        error!("rollback: failed to remove container {}: {:#}", name, rollback);
                    }
                }
                self.remove_user_data(&name).await;
                return Err(e.context(format!("starting container {}", name)));
            }
        };

        match self.container_ip(&id).await {
            Ok(ip) => {
                info!("container {} ({}) running at {}", name, id, ip);
                Ok(Instance::new(id, name, vec![ip]))
            }
            Err(e) => {
                if let Err(rollback) = self.remove_container(&id).await {
                    error!("rollback: failed to remove container {}: {:#}", id, rollback);
                }
                self.remove_user_data(&name).await;
                Err(e.context(format!("inspecting container {}", name)))
            }
        }
    }

    async fn delete_instance(&self, _ctx: &CancellationToken, instance_id: &str) -> Result<()> {
        // look the name up first so its user-data file can go too
        let name = match self.docker(&["inspect", "--format", "{{.Name}}", instance_id]).await {
            Ok(name) => Some(name.trim_start_matches('/').to_string()),
            Err(e) if crate::http::is_not_found(&e) => None,
            Err(e) => {
                warn!("could not inspect container {}: {:#}", instance_id, e);
                None
            }
        };

        match self.remove_container(instance_id).await {
            Ok(()) => info!("removed container {}", instance_id),
            Err(e) if crate::http::is_not_found(&e) => info!("container {} already gone", instance_id),
            Err(e) => return Err(e.context(format!("removing container {}", instance_id))),
        }

        if let Some(name) = name.filter(|n| !n.is_empty()) {
            self.remove_user_data(&name).await;
        }
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

pub struct DockerFactory;

#[async_trait]
impl ProviderFactory for DockerFactory {
    async fn build(&self, _ctx: &CancellationToken, args: &[String]) -> Result<SharedProvider> {
        let config: DockerConfig = parse_config(PROVIDER_NAME, args)?;
        config.verify()?;
        info!("docker config: {:?}", config);
        Ok(Arc::new(DockerProvider::new(config).await?))
    }
}
