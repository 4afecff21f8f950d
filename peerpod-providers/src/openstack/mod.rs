//! OpenStack provider: Nova servers with optional Neutron floating IPs.

use crate::registry::{parse_config, ProviderFactory};
use crate::{Provider, SharedProvider};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use peerpod_common::cloudinit::CloudConfigGenerator;
use peerpod_common::instance_type::verify_cloud_instance_type;
use peerpod_common::naming::generate_instance_name;
use peerpod_common::wait::wait_for;
use peerpod_common::{Instance, InstanceTypeSpec, ProviderError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod client;
pub mod config;

pub use client::{Credentials, OpenStackClient};
pub use config::OpenStackConfig;

pub const PROVIDER_NAME: &str = "openstack";

const MAX_INSTANCE_NAME_LEN: usize = 63;
const ACTIVE_WAIT: Duration = Duration::from_secs(180);
const ACTIVE_POLL_INTERVAL: Duration = Duration::from_secs(3);

pub struct OpenStackProvider {
    config: OpenStackConfig,
    client: OpenStackClient,
    // server id -> floating IP id
    floating_ips: Mutex<HashMap<String, String>>,
    poll_interval: Duration,
}

impl OpenStackProvider {
    pub fn new(config: OpenStackConfig, client: OpenStackClient) -> Self {
        Self {
            config,
            client,
            floating_ips: Mutex::new(HashMap::new()),
            poll_interval: ACTIVE_POLL_INTERVAL,
        }
    }

    /// Log in once so bad credentials fail at start-up.
    pub async fn connect(config: OpenStackConfig) -> Result<Self> {
        let password = config
            .password()
            .ok_or_else(|| ProviderError::ConfigInvalid("openstack-password is empty".to_string()))?;
        let credentials = Credentials {
            identity_endpoint: config.identity_endpoint.clone(),
            username: config.username.clone(),
            password,
            project_name: config.tenant_name.clone(),
            domain_name: config.domain_name.clone(),
            region: config.region.clone(),
        };
        let client = OpenStackClient::new(crate::http::client()?, credentials);
        client.authenticate().await?;
        Ok(Self::new(config, client))
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn server_request(&self, name: &str, image: &str, flavor: &str, user_data: &str) -> Value {
        let networks = match self.config.network_ids() {
            ids if ids.is_empty() => json!("auto"),
            ids => Value::Array(ids.into_iter().map(|id| json!({ "uuid": id })).collect()),
        };
        let mut server = json!({
            "name": name,
            "imageRef": image,
            "flavorRef": flavor,
            "user_data": BASE64.encode(user_data),
            "networks": networks,
        });
        let groups = self.config.security_groups();
        if !groups.is_empty() {
            server["security_groups"] =
                Value::Array(groups.into_iter().map(|g| json!({ "name": g })).collect());
        }
        server
    }

    /// Wait for ACTIVE and at least one fixed IP; ERROR is terminal.
    async fn wait_fixed_ips(&self, ctx: &CancellationToken, server_id: &str) -> Result<Vec<IpAddr>> {
        wait_for(
            ctx,
            &format!("server {} to become ACTIVE", server_id),
            ACTIVE_WAIT,
            self.poll_interval,
            move || async move {
                let server = self.client.get_server(server_id).await?;
                match server.get("status").and_then(Value::as_str).unwrap_or_default() {
                    "ACTIVE" => {
                        let ips = fixed_ips(&server)?;
                        Ok((!ips.is_empty()).then_some(ips))
                    }
                    "ERROR" => {
                        let reason = server
                            .pointer("/fault/message")
                            .and_then(Value::as_str)
                            .unwrap_or("no fault reported");
                        Err(ProviderError::api(
                            format!("server {}", server_id),
                            format!("entered ERROR state: {}", reason),
                        )
                        .into())
                    }
                    _ => Ok(None),
                }
            },
        )
        .await
    }

    async fn port_of(&self, server_id: &str, ip: &IpAddr) -> Result<Option<String>> {
        let wanted = ip.to_string();
        let interfaces = self.client.server_interfaces(server_id).await?;
        let port = interfaces
            .into_iter()
            .find(|i| i.fixed_ips.iter().any(|f| f.ip_address == wanted))
            .map(|i| i.port_id);
        if port.is_none() {
            warn!("no interface of server {} carries fixed IP {}", server_id, wanted);
        }
        Ok(port)
    }

    async fn bring_up(&self, ctx: &CancellationToken, server_id: &str) -> Result<Vec<IpAddr>> {
        let mut ips = self.wait_fixed_ips(ctx, server_id).await?;
        if self.config.floating_ip_network_id.is_empty() {
            return Ok(ips);
        }

        let Some(port_id) = self.port_of(server_id, &ips[0]).await? else {
            return Ok(ips);
        };
        let fip = self
            .client
            .create_floating_ip(&self.config.floating_ip_network_id, &port_id)
            .await
            .context("assigning floating IP")?;
        self.floating_ips
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(server_id.to_string(), fip.id.clone());
        let address: IpAddr = fip
            .floating_ip_address
            .parse()
            .map_err(|e| ProviderError::invalid_ip(fip.floating_ip_address.as_str(), e))?;
        info!("floating IP {} assigned to server {}", address, server_id);
        ips.insert(0, address);
        Ok(ips)
    }

    async fn release_floating_ip(&self, server_id: &str) {
        let fip = self
            .floating_ips
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(server_id);
        match fip {
            Some(id) => {
                if let Err(e) = self.client.delete_floating_ip(&id).await {
                    warn!("failed to delete floating IP {}: {:#}", id, e);
                }
            }
            None => info!("no floating IP assigned to server {}", server_id),
        }
    }
}

#[async_trait]
impl Provider for OpenStackProvider {
    async fn create_instance(
        &self,
        ctx: &CancellationToken,
        pod_name: &str,
        sandbox_id: &str,
        cloud_config: &dyn CloudConfigGenerator,
        spec: &InstanceTypeSpec,
    ) -> Result<Instance> {
        let name = generate_instance_name(pod_name, sandbox_id, MAX_INSTANCE_NAME_LEN)?;
        let user_data = cloud_config.generate().context("generating user data")?;
        let flavor = verify_cloud_instance_type(
            &spec.instance_type,
            &self.config.flavor_ids(),
            &self.config.flavor_id,
        )?;
        let image = if spec.image.is_empty() {
            self.config.image_id.as_str()
        } else {
            spec.image.as_str()
        };

        info!("creating server {} (flavor {}, image {})", name, flavor, image);
        let server_id = self
            .client
            .create_server(self.server_request(&name, image, &flavor, &user_data))
            .await
            .with_context(|| format!("creating server {}", name))?;

        match self.bring_up(ctx, &server_id).await {
            Ok(ips) => {
                info!("server {} ready with IPs {:?}", server_id, ips);
                Ok(Instance::new(server_id, name, ips))
            }
            Err(e) => {
                if let Err(rollback) = self.delete_instance(&CancellationToken::new(), &server_id).await {
                    error!("rollback: failed to delete server {}: {:#}", server_id, rollback);
                }
                Err(e.context(format!("bringing up server {}", server_id)))
            }
        }
    }

    async fn delete_instance(&self, _ctx: &CancellationToken, instance_id: &str) -> Result<()> {
        info!("deleting server {}", instance_id);
        self.release_floating_ip(instance_id).await;

        match self.client.delete_server(instance_id).await {
            Ok(()) => {
                info!("delete request sent for server {}", instance_id);
                Ok(())
            }
            Err(e) if crate::http::is_not_found(&e) => {
                info!("server {} already deleted", instance_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
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

/// Fixed addresses across all networks, IPv4 before IPv6.
fn fixed_ips(server: &Value) -> Result<Vec<IpAddr>, ProviderError> {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    let Some(networks) = server.get("addresses").and_then(Value::as_object) else {
        return Ok(v4);
    };
    for entries in networks.values() {
        for entry in entries.as_array().into_iter().flatten() {
            if entry.get("OS-EXT-IPS:type").and_then(Value::as_str) == Some("floating") {
                continue;
            }
            let raw = entry.get("addr").and_then(Value::as_str).ok_or_else(|| {
                ProviderError::api("server addresses", format!("entry without addr: {}", entry))
            })?;
            let ip: IpAddr = raw.parse().map_err(|e| ProviderError::invalid_ip(raw, e))?;
            if ip.is_ipv4() {
                v4.push(ip);
            } else {
                v6.push(ip);
            }
        }
    }
    v4.extend(v6);
    Ok(v4)
}

pub struct OpenStackFactory;

#[async_trait]
impl ProviderFactory for OpenStackFactory {
    async fn build(&self, _ctx: &CancellationToken, args: &[String]) -> Result<SharedProvider> {
        let config: OpenStackConfig = parse_config(PROVIDER_NAME, args)?;
        config.verify()?;
        info!("openstack config: {:?}", config.redacted());
        Ok(Arc::new(OpenStackProvider::connect(config).await?))
    }
}
