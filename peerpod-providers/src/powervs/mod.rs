//! IBM Power Virtual Server provider, with an optional pool of pre-warmed VMs.

use crate::registry::{parse_config, ProviderFactory};
use crate::ssh::{HostKeyPolicy, SshClient, SshKeyPair, USER_DATA_PATH};
use crate::{Provider, SharedProvider};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use peerpod_common::cloudinit::{CloudConfig, CloudConfigGenerator, CLOUD_CONFIG_HEADER};
use peerpod_common::naming::generate_instance_name;
use peerpod_common::wait::wait_for;
use peerpod_common::{Instance, InstanceTypeSpec, ProviderError};
use serde_json::json;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod client;
pub mod config;
pub mod pool;

pub use client::{PowerVsClient, PvmInstance};
pub use config::PowerVsConfig;
pub use pool::WarmPool;

pub const PROVIDER_NAME: &str = "ibmcloud-powervs";

const MAX_INSTANCE_NAME_LEN: usize = 47;
const ACTIVE_WAIT: Duration = Duration::from_secs(150);
const DHCP_WAIT: Duration = Duration::from_secs(750);
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const SSH_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_NAME_PREFIX: &str = "pool";

/// Processor and memory request for one VM.
#[derive(Debug, Clone, PartialEq)]
pub struct Shape {
    pub system_type: String,
    pub processors: f64,
    /// GB
    pub memory: f64,
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}x{}", self.system_type, self.processors, self.memory)
    }
}

/// Pick the shape: requested vCPU and memory first, then an `<sys>-<cpu>x<mem>` instance
/// type, then the configured defaults.
pub fn select_shape(config: &PowerVsConfig, spec: &InstanceTypeSpec) -> Result<Shape, ProviderError> {
    if spec.vcpus != 0 && spec.memory != 0 {
        return Ok(Shape {
            system_type: config.system_type.clone(),
            processors: spec.vcpus as f64,
            memory: (spec.memory / 1024) as f64,
        });
    }
    if !spec.instance_type.is_empty() {
        let bad = || ProviderError::UnsupportedInstanceType(spec.instance_type.clone());
        let (system_type, size) = spec.instance_type.split_once('-').ok_or_else(bad)?;
        let (cpu, mem) = size.split_once('x').ok_or_else(bad)?;
        let processors: u32 = cpu.parse().map_err(|_| bad())?;
        let memory: u32 = mem.parse().map_err(|_| bad())?;
        if system_type.is_empty() {
            return Err(bad());
        }
        return Ok(Shape {
            system_type: system_type.to_string(),
            processors: processors as f64,
            memory: memory as f64,
        });
    }
    Ok(Shape {
        system_type: config.system_type.clone(),
        processors: config.processors,
        memory: config.memory,
    })
}

pub struct PowerVsProvider {
    config: PowerVsConfig,
    client: PowerVsClient,
    ssh: Option<SshClient>,
    pool: WarmPool,
    shutdown: CancellationToken,
    poll_interval: Duration,
}

impl PowerVsProvider {
    pub fn new(config: PowerVsConfig, client: PowerVsClient, ssh: Option<SshClient>) -> Self {
        let pool = WarmPool::new(config.pool_size);
        Self {
            config,
            client,
            ssh,
            pool,
            shutdown: CancellationToken::new(),
            poll_interval: POLL_INTERVAL,
        }
    }

    pub async fn connect(config: PowerVsConfig) -> Result<Self> {
        let api_key = config
            .api_key()
            .ok_or_else(|| ProviderError::ConfigInvalid("api-key is empty".to_string()))?;
        let client = PowerVsClient::connect(
            crate::http::client()?,
            &config.iam_endpoint,
            &config.endpoint(),
            api_key,
            &config.zone,
            &config.service_instance_id,
        )
        .await?;

        let ssh = if config.enable_sftp {
            let keys = SshKeyPair::load_or_generate(&config.ssh_priv_key_path, &config.ssh_pub_key_path, true)
                .context("preparing SSH key pair for SFTP")?;
            let ssh = SshClient::new(config.cloud_user_name.clone(), keys, HostKeyPolicy::StatelessTofu, SSH_TIMEOUT)?
                .without_chroot();
            Some(ssh)
        } else {
            None
        };
        Ok(Self::new(config, client, ssh))
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn pool(&self) -> &WarmPool {
        &self.pool
    }

    /// User data the VM boots with. With SFTP on, only the login user is injected.
    fn boot_user_data(&self, user_data: &str) -> String {
        match &self.ssh {
            Some(ssh) => format!(
                "{}\nusers:\n  - name: {}\n    ssh-authorized-keys:\n      - {}\n",
                CLOUD_CONFIG_HEADER,
                self.config.cloud_user_name,
                ssh.public_key().trim()
            ),
            None => user_data.to_string(),
        }
    }

    fn instance_request(&self, name: &str, image: &str, shape: &Shape, boot_user_data: &str) -> serde_json::Value {
        let mut body = json!({
            "serverName": name,
            "imageID": image,
            "networks": [{ "networkID": self.config.network_id }],
            "memory": shape.memory,
            "processors": shape.processors,
            "procType": self.config.processor_type,
            "sysType": shape.system_type,
            "userData": BASE64.encode(boot_user_data),
        });
        if !self.config.ssh_key.is_empty() {
            body["keyPairName"] = json!(self.config.ssh_key);
        }
        body
    }

    /// Create a VM, wait for ACTIVE and collect its IPs. The VM is deleted on failure.
    async fn provision(
        &self,
        ctx: &CancellationToken,
        name: &str,
        image: &str,
        shape: &Shape,
        boot_user_data: &str,
    ) -> Result<Instance> {
        info!("creating PVM instance {} ({}, image {})", name, shape, image);
        let id = self
            .client
            .create_instance(&self.instance_request(name, image, shape, boot_user_data))
            .await
            .with_context(|| format!("creating PVM instance {}", name))?;

        match self.bring_up(ctx, &id).await {
            Ok(ips) => {
                info!("PVM instance {} ready with IPs {:?}", id, ips);
                Ok(Instance::new(id, name, ips))
            }
            Err(e) => {
                self.rollback(&id).await;
                Err(e.context(format!("bringing up PVM instance {}", id)))
            }
        }
    }

    async fn rollback(&self, id: &str) {
        if let Err(e) = self.delete_instance(&CancellationToken::new(), id).await {
            error!("rollback: failed to delete PVM instance {}: {:#}", id, e);
        }
    }

    async fn bring_up(&self, ctx: &CancellationToken, id: &str) -> Result<Vec<IpAddr>> {
        let instance = wait_for(
            ctx,
            &format!("PVM instance {} to become ACTIVE", id),
            ACTIVE_WAIT,
            self.poll_interval,
            move || async move {
                let instance = self.client.get_instance(id).await?;
                match instance.status.as_str() {
                    "ACTIVE" => Ok(Some(instance)),
                    "ERROR" => Err(ProviderError::api(format!("PVM instance {}", id), "instance is in ERROR state").into()),
                    _ => Ok(None),
                }
            },
        )
        .await?;

        let ips = self.fixed_ips(&instance)?;
        if !ips.is_empty() {
            return Ok(ips);
        }
        info!("PVM instance {} reports no fixed IP, asking the DHCP server", id);
        let ip = self.ip_from_dhcp(ctx, &instance).await?;
        Ok(vec![ip])
    }

    fn fixed_ips(&self, instance: &PvmInstance) -> Result<Vec<IpAddr>, ProviderError> {
        let mut ips = Vec::new();
        for network in instance.networks.iter().filter(|n| n.kind == "fixed") {
            let raw = if self.config.use_public_ip {
                network.external_ip.as_str()
            } else {
                network.ip_address.as_str()
            };
            if raw.is_empty() {
                continue;
            }
            ips.push(raw.parse::<IpAddr>().map_err(|e| ProviderError::invalid_ip(raw, e))?);
        }
        Ok(ips)
    }

    /// Match the instance's MAC on the configured network against the DHCP leases.
    async fn ip_from_dhcp(&self, ctx: &CancellationToken, instance: &PvmInstance) -> Result<IpAddr> {
        let network_id = self.config.network_id.as_str();
        let mac = instance
            .networks
            .iter()
            .find(|n| n.network_id == network_id)
            .map(|n| n.mac_address.clone())
            .ok_or_else(|| {
                ProviderError::api(
                    format!("PVM instance {}", instance.id),
                    format!("not attached to network {}", network_id),
                )
            })?;
        let mac = mac.as_str();

        wait_for(
            ctx,
            &format!("a DHCP lease for {}", mac),
            DHCP_WAIT,
            self.poll_interval,
            move || async move {
                let servers = self.client.dhcp_servers().await?;
                let Some(server) = servers
                    .into_iter()
                    .find(|s| s.network.as_ref().map_or(false, |n| n.id == network_id))
                else {
                    warn!("no DHCP server serves network {}", network_id);
                    return Ok(None);
                };
                let lease = self
                    .client
                    .dhcp_leases(&server.id)
                    .await?
                    .into_iter()
                    .find(|l| l.instance_mac_address.eq_ignore_ascii_case(mac));
                match lease {
                    Some(lease) => {
                        let ip = lease
                            .instance_ip
                            .parse::<IpAddr>()
                            .map_err(|e| ProviderError::invalid_ip(lease.instance_ip.as_str(), e))?;
                        Ok(Some(ip))
                    }
                    None => Ok(None),
                }
            },
        )
        .await
    }

    async fn create_pooled(&self, ctx: &CancellationToken) -> Result<Instance> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = generate_instance_name(POOL_NAME_PREFIX, &suffix, MAX_INSTANCE_NAME_LEN)?;
        let shape = select_shape(&self.config, &InstanceTypeSpec::default())?;
        let boot = self.boot_user_data(&CloudConfig::default().render()?);
        self.provision(ctx, &name, &self.config.image_id, &shape, &boot).await
    }

    /// Create VMs until the pool is at its target size. Stops at the first failure.
    pub async fn fill_pool(&self, ctx: &CancellationToken) -> Result<()> {
        let deficit = self.pool.deficit().await;
        if deficit > 0 {
            info!("pre-warming {} PVM instance(s)", deficit);
        }
        for _ in 0..deficit {
            let instance = self.create_pooled(ctx).await?;
            if ctx.is_cancelled() {
                self.rollback(&instance.id).await;
                return Err(ProviderError::Cancelled.into());
            }
            info!("PVM instance {} added to the warm pool", instance.id);
            self.pool.push(instance).await;
        }
        Ok(())
    }

    /// Drop pooled VMs that are gone or in ERROR, then top the pool back up.
    pub async fn sweep_pool(&self, ctx: &CancellationToken) -> Result<()> {
        let mut dead = Vec::new();
        for id in self.pool.ids().await {
            match self.client.get_instance(&id).await {
                Ok(instance) if instance.status == "ERROR" => dead.push(id),
                Ok(_) => {}
                Err(e) if crate::http::is_not_found(&e) => dead.push(id),
                Err(e) => warn!("pool sweep: could not query PVM instance {}: {:#}", id, e),
            }
        }
        for instance in self.pool.evict(&dead).await {
            warn!("pool sweep: dropping PVM instance {}", instance.id);
            if let Err(e) = self.delete_instance(ctx, &instance.id).await {
                warn!("pool sweep: failed to delete PVM instance {}: {:#}", instance.id, e);
            }
        }
        self.fill_pool(ctx).await
    }

    /// Run [`Self::sweep_pool`] every sweep interval until teardown.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let provider = Arc::clone(self);
        tokio::spawn(async move {
            let period = provider.config.pool_sweep_interval();
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = provider.shutdown.cancelled() => break,
                }
                if let Err(e) = provider.sweep_pool(&provider.shutdown).await {
                    warn!("pool sweep failed: {:#}", e);
                }
            }
            info!("pool sweeper stopped");
        })
    }

    async fn hand_out(&self, ctx: &CancellationToken, instance: Instance, user_data: &str) -> Result<Instance> {
        let ip = *instance
            .ips
            .first()
            .ok_or_else(|| anyhow!("pooled PVM instance {} has no IP", instance.id))?;
        info!("handing out pooled PVM instance {} ({})", instance.id, ip);
        match pool::deliver_user_data(ctx, ip, self.config.pud_port, user_data.as_bytes()).await {
            Ok(()) => Ok(instance),
            Err(e) => {
                self.rollback(&instance.id).await;
                Err(e.context(format!("sending user data to pooled PVM instance {}", instance.id)))
            }
        }
    }
}

#[async_trait]
impl Provider for PowerVsProvider {
    async fn create_instance(
        &self,
        ctx: &CancellationToken,
        pod_name: &str,
        sandbox_id: &str,
        cloud_config: &dyn CloudConfigGenerator,
        spec: &InstanceTypeSpec,
    ) -> Result<Instance> {
        let user_data = cloud_config.generate().context("generating user data")?;

        if let Some(pooled) = self.pool.take().await {
            return self.hand_out(ctx, pooled, &user_data).await;
        }

        let name = generate_instance_name(pod_name, sandbox_id, MAX_INSTANCE_NAME_LEN)?;
        let image = if spec.image.is_empty() {
            self.config.image_id.as_str()
        } else {
            info!("using image {} from the pod spec", spec.image);
            spec.image.as_str()
        };
        let shape = select_shape(&self.config, spec)?;
        let instance = self
            .provision(ctx, &name, image, &shape, &self.boot_user_data(&user_data))
            .await?;

        if let Some(ssh) = &self.ssh {
            if let Err(e) = ssh
                .send_file(ctx, instance.ips[0], USER_DATA_PATH, user_data.as_bytes())
                .await
            {
                self.rollback(&instance.id).await;
                return Err(e.context("sending user data over SFTP"));
            }
            info!("user data sent to {} over SFTP", instance.ips[0]);
        }
        Ok(instance)
    }

    async fn delete_instance(&self, _ctx: &CancellationToken, instance_id: &str) -> Result<()> {
        match self.client.delete_instance(instance_id).await {
            Ok(()) => {
                info!("deleted PVM instance {}", instance_id);
                Ok(())
            }
            Err(e) if crate::http::is_not_found(&e) => {
                info!("PVM instance {} already deleted", instance_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn teardown(&self) -> Result<()> {
        self.shutdown.cancel();
        let mut failures = Vec::new();
        for instance in self.pool.drain().await {
            if let Err(e) = self.delete_instance(&CancellationToken::new(), &instance.id).await {
                failures.push(format!("{}: {:#}", instance.id, e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("failed to delete pooled PVM instances: {}", failures.join("; ")))
        }
    }

    fn config_verifier(&self) -> Result<()> {
        self.config.verify()?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }
}

pub struct PowerVsFactory;

#[async_trait]
impl ProviderFactory for PowerVsFactory {
    async fn build(&self, ctx: &CancellationToken, args: &[String]) -> Result<SharedProvider> {
        let config: PowerVsConfig = parse_config(PROVIDER_NAME, args)?;
        config.verify()?;
        info!("ibmcloud-powervs config: {:?}", config.redacted());

        let provider = Arc::new(PowerVsProvider::connect(config).await?);
        if provider.pool.target() > 0 {
            if let Err(e) = provider.fill_pool(ctx).await {
                // the sweeper keeps trying to reach the target
                warn!("warm pool not filled at start-up: {:#}", e);
            }
            provider.spawn_sweeper();
        }
        Ok(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Form, Json, Router};
    use peerpod_common::cloudinit::WriteFile;
    use peerpod_common::error::kind_of;
    use peerpod_common::wait::wait_until;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Cloud {
        created: Vec<(HeaderMap, Value)>,
        next_id: usize,
        // id -> status
        statuses: HashMap<String, String>,
        polls_before_active: usize,
        fail_next: bool,
        no_fixed_ip: bool,
        fail_delete: bool,
        deleted: Vec<String>,
        token_requests: Vec<HashMap<String, String>>,
    }

    type Shared = Arc<Mutex<Cloud>>;

    const SVC: &str = "svc-1";

    async fn token(State(c): State<Shared>, Form(form): Form<HashMap<String, String>>) -> Json<Value> {
        c.lock().unwrap().token_requests.push(form);
        Json(json!({ "access_token": "iam-tok", "expiration": 32503680000i64 }))
    }

    async fn apikey_details(headers: HeaderMap) -> Response {
        if headers.get("iam-apikey").map(|v| v.as_bytes()) != Some(b"ibm-key".as_slice()) {
            return (StatusCode::UNAUTHORIZED, "bad key").into_response();
        }
        Json(json!({ "account_id": "acc-9" })).into_response()
    }

    async fn create(State(c): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
        let mut c = c.lock().unwrap();
        if c.fail_next {
            c.fail_next = false;
            return (StatusCode::BAD_REQUEST, "image not found").into_response();
        }
        c.next_id += 1;
        let id = format!("pvm-{}", c.next_id);
        c.statuses.insert(id.clone(), "BUILD".to_string());
        c.created.push((headers, body));
        (StatusCode::CREATED, Json(json!([{ "pvmInstanceID": id }]))).into_response()
    }

    async fn get_instance(State(c): State<Shared>, Path((_, id)): Path<(String, String)>) -> Response {
        let mut c = c.lock().unwrap();
        let Some(status) = c.statuses.get(&id).cloned() else {
            return (StatusCode::NOT_FOUND, "pvm-instance does not exist").into_response();
        };
        let status = if status == "BUILD" && c.polls_before_active == 0 {
            c.statuses.insert(id.clone(), "ACTIVE".to_string());
            "ACTIVE".to_string()
        } else {
            c.polls_before_active = c.polls_before_active.saturating_sub(1);
            status
        };
        let n: usize = id.trim_start_matches("pvm-").parse().unwrap_or(0);
        let ip = if c.no_fixed_ip { String::new() } else { format!("192.168.10.{}", n) };
        Json(json!({
            "pvmInstanceID": id,
            "status": status,
            "networks": [{
                "type": "fixed",
                "networkID": "net-1",
                "ipAddress": ip,
                "externalIP": format!("150.238.0.{}", n),
                "macAddress": format!("FA:16:3E:00:00:0{}", n)
            }]
        }))
        .into_response()
    }

    async fn delete_instance(State(c): State<Shared>, Path((_, id)): Path<(String, String)>) -> StatusCode {
        let mut c = c.lock().unwrap();
        if c.fail_delete {
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
        if c.statuses.remove(&id).is_none() {
            return StatusCode::NOT_FOUND;
        }
        c.deleted.push(id);
        StatusCode::OK
    }

    async fn dhcp_servers() -> Json<Value> {
        Json(json!([
            { "id": "dhcp-other", "network": { "id": "net-2" } },
            { "id": "dhcp-1", "network": { "id": "net-1" } }
        ]))
    }

    async fn dhcp_server(Path((_, id)): Path<(String, String)>) -> Json<Value> {
        assert_eq!(id, "dhcp-1");
        Json(json!({ "leases": [
            { "instanceIP": "192.168.10.200", "instanceMacAddress": "fa:16:3e:00:00:01" }
        ]}))
    }

    async fn serve(cloud: Cloud) -> (String, Shared) {
        let cloud = Arc::new(Mutex::new(cloud));
        let app = Router::new()
            .route("/identity/token", post(token))
            .route("/v1/apikeys/details", get(apikey_details))
            .route("/pcloud/v1/cloud-instances/:svc/pvm-instances", post(create))
            .route(
                "/pcloud/v1/cloud-instances/:svc/pvm-instances/:id",
                get(get_instance).delete(delete_instance),
            )
            .route("/pcloud/v1/cloud-instances/:svc/services/dhcp", get(dhcp_servers))
            .route("/pcloud/v1/cloud-instances/:svc/services/dhcp/:id", get(dhcp_server))
            .with_state(cloud.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (base, cloud)
    }

    fn config(base: &str, extra: &[&str]) -> PowerVsConfig {
        let mut args: Vec<String> = [
            "--api-key",
            "ibm-key",
            "--zone",
            "dal12",
            "--service-instance-id",
            SVC,
            "--network-id",
            "net-1",
            "--image-id",
            "img-1",
            "--ssh-key",
            "my-key",
            "--powervs-endpoint",
            base,
            "--iam-endpoint",
            base,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.extend(extra.iter().map(|s| s.to_string()));
        parse_config(PROVIDER_NAME, &args).unwrap()
    }

    async fn provider_with(cloud: Cloud, extra: &[&str]) -> (PowerVsProvider, Shared) {
        let (base, cloud) = serve(cloud).await;
        let provider = PowerVsProvider::connect(config(&base, extra))
            .await
            .unwrap()
            .with_poll_interval(Duration::from_millis(10));
        (provider, cloud)
    }

    fn user_data() -> CloudConfig {
        CloudConfig {
            write_files: vec![WriteFile::new("/run/peerpod/daemon.json", "{}")],
        }
    }

    #[test]
    fn shape_precedence() {
        let cfg: PowerVsConfig = parse_config(PROVIDER_NAME, &[]).unwrap();
        let by_resources = InstanceTypeSpec {
            vcpus: 4,
            memory: 8192,
            instance_type: "e980-1x2".to_string(),
            ..Default::default()
        };
        assert_eq!(
            select_shape(&cfg, &by_resources).unwrap(),
            Shape { system_type: "s922".to_string(), processors: 4.0, memory: 8.0 }
        );

        let by_type = InstanceTypeSpec {
            instance_type: "e980-2x16".to_string(),
            ..Default::default()
        };
        assert_eq!(select_shape(&cfg, &by_type).unwrap().to_string(), "e980-2x16");

        let fallback = select_shape(&cfg, &InstanceTypeSpec::default()).unwrap();
        assert_eq!(fallback.to_string(), "s922-0.5x2");

        let bad = InstanceTypeSpec {
            instance_type: "e980-big".to_string(),
            ..Default::default()
        };
        assert_eq!(select_shape(&cfg, &bad).unwrap_err().kind(), "unsupported-instance-type");
    }

    #[tokio::test]
    async fn cold_create_sends_crn_and_user_data() {
        let cloud = Cloud {
            polls_before_active: 2,
            ..Default::default()
        };
        let (p, cloud) = provider_with(cloud, &[]).await;
        let spec = InstanceTypeSpec {
            instance_type: "e980-2x16".to_string(),
            ..Default::default()
        };
        let instance = p
            .create_instance(&CancellationToken::new(), "web", "0123456789", &user_data(), &spec)
            .await
            .unwrap();

        assert_eq!(instance.id, "pvm-1");
        assert_eq!(instance.name, "podvm-web-01234567");
        assert_eq!(instance.ips, vec!["192.168.10.1".parse::<IpAddr>().unwrap()]);

        let c = cloud.lock().unwrap();
        assert_eq!(c.token_requests[0]["apikey"], "ibm-key");
        assert_eq!(c.token_requests[0]["grant_type"], "urn:ibm:params:oauth:grant-type:apikey");
        let (headers, body) = &c.created[0];
        assert_eq!(headers["crn"], "crn:v1:bluemix:public:power-iaas:dal12:a/acc-9:svc-1::");
        assert_eq!(headers["authorization"], "Bearer iam-tok");
        assert_eq!(body["sysType"], "e980");
        assert_eq!(body["processors"], 2.0);
        assert_eq!(body["memory"], 16.0);
        assert_eq!(body["procType"], "shared");
        assert_eq!(body["keyPairName"], "my-key");
        assert_eq!(body["networks"][0]["networkID"], "net-1");
        let decoded = BASE64.decode(body["userData"].as_str().unwrap()).unwrap();
        assert!(String::from_utf8(decoded).unwrap().contains("/run/peerpod/daemon.json"));
    }

    #[tokio::test]
    async fn public_ip_uses_the_external_address() {
        let (p, _) = provider_with(Cloud::default(), &["--use-public-ip"]).await;
        let instance = p
            .create_instance(&CancellationToken::new(), "web", "sbx", &user_data(), &InstanceTypeSpec::default())
            .await
            .unwrap();
        assert_eq!(instance.ips[0].to_string(), "150.238.0.1");
    }

    #[tokio::test]
    async fn dhcp_lease_fills_in_a_missing_ip() {
        let cloud = Cloud {
            no_fixed_ip: true,
            ..Default::default()
        };
        let (p, _) = provider_with(cloud, &[]).await;
        let instance = p
            .create_instance(&CancellationToken::new(), "web", "sbx", &user_data(), &InstanceTypeSpec::default())
            .await
            .unwrap();
        assert_eq!(instance.ips[0].to_string(), "192.168.10.200");
    }

    #[tokio::test]
    async fn error_state_rolls_back() {
        let (p, cloud) = provider_with(Cloud::default(), &[]).await;
        cloud.lock().unwrap().polls_before_active = 1000;
        let ctx = CancellationToken::new();
        let ud = user_data();
        let spec = InstanceTypeSpec::default();
        let create = p.create_instance(&ctx, "web", "sbx", &ud, &spec);
        let shared = &cloud;
        let flip = async {
            wait_until(&ctx, "instance to exist", Duration::from_secs(5), Duration::from_millis(5), move || async move {
                let mut c = shared.lock().unwrap();
                Ok(match c.statuses.get_mut("pvm-1") {
                    Some(status) => {
                        *status = "ERROR".to_string();
                        true
                    }
                    None => false,
                })
            })
            .await
        };
        let (res, flipped) = tokio::join!(create, flip);
        flipped.unwrap();
        let err = res.unwrap_err();
        assert_eq!(kind_of(&err).map(|k| k.kind()), Some("provider-api-error"));
        assert_eq!(cloud.lock().unwrap().deleted, vec!["pvm-1"]);
    }

    #[tokio::test]
    async fn api_failure_surfaces_without_rollback() {
        let cloud = Cloud {
            fail_next: true,
            ..Default::default()
        };
        let (p, cloud) = provider_with(cloud, &[]).await;
        let err = p
            .create_instance(&CancellationToken::new(), "web", "sbx", &user_data(), &InstanceTypeSpec::default())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("image not found"));
        assert!(cloud.lock().unwrap().deleted.is_empty());
    }

    #[tokio::test]
    async fn delete_of_missing_instance_succeeds() {
        let (p, _) = provider_with(Cloud::default(), &[]).await;
        p.delete_instance(&CancellationToken::new(), "pvm-404").await.unwrap();
    }

    #[tokio::test]
    async fn sftp_mode_boots_with_only_the_ssh_user() {
        let dir = tempfile::tempdir().unwrap();
        let pub_key = dir.path().join("id_rsa.pub").display().to_string();
        let priv_key = dir.path().join("id_rsa").display().to_string();
        let (p, cloud) = provider_with(
            Cloud::default(),
            &[
                "--enable-sftp",
                "--cloud-user-name",
                "cloud-user",
                "--ssh-pub-key",
                &pub_key,
                "--ssh-priv-key",
                &priv_key,
            ],
        )
        .await;
        let boot = p.boot_user_data("#cloud-config\nwrite_files: []\n");
        assert!(boot.starts_with("#cloud-config\nusers:\n  - name: cloud-user\n"));
        assert!(boot.contains("      - ssh-rsa "));
        assert!(!boot.contains("write_files"));
        assert!(cloud.lock().unwrap().created.is_empty());
    }

    #[tokio::test]
    async fn fill_pool_creates_named_pool_members() {
        let (p, cloud) = provider_with(Cloud::default(), &["--pool-size", "2"]).await;
        p.fill_pool(&CancellationToken::new()).await.unwrap();
        assert_eq!(p.pool().ids().await, vec!["pvm-1", "pvm-2"]);
        let c = cloud.lock().unwrap();
        for (_, body) in &c.created {
            assert!(body["serverName"].as_str().unwrap().starts_with("podvm-pool-"));
            assert_eq!(body["sysType"], "s922");
        }
    }

    #[tokio::test]
    async fn pooled_instance_is_handed_out_with_user_data() {
        // stand in for the user-data daemon of a pooled VM
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        let daemon = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut got = String::new();
            sock.read_to_string(&mut got).await.unwrap();
            got
        });

        let (p, cloud) = provider_with(Cloud::default(), &["--pool-size", "1", "--pud-port", &port]).await;
        let warm = Instance::new("pvm-warm", "podvm-pool-abc", vec!["127.0.0.1".parse().unwrap()]);
        p.pool().push(warm.clone()).await;

        let instance = p
            .create_instance(&CancellationToken::new(), "web", "sbx", &user_data(), &InstanceTypeSpec::default())
            .await
            .unwrap();
        assert_eq!(instance, warm);
        assert!(p.pool().is_empty().await);
        assert!(daemon.await.unwrap().contains("/run/peerpod/daemon.json"));
        assert!(cloud.lock().unwrap().created.is_empty());
    }

    #[tokio::test]
    async fn sweep_replaces_dead_members_and_teardown_empties_the_pool() {
        let (p, cloud) = provider_with(Cloud::default(), &["--pool-size", "2"]).await;
        let ctx = CancellationToken::new();
        p.fill_pool(&ctx).await.unwrap();

        {
            let mut c = cloud.lock().unwrap();
            c.statuses.insert("pvm-1".to_string(), "ERROR".to_string());
            c.statuses.remove("pvm-2");
        }
        p.sweep_pool(&ctx).await.unwrap();
        let mut ids = p.pool().ids().await;
        ids.sort();
        assert_eq!(ids, vec!["pvm-3", "pvm-4"]);
        assert_eq!(cloud.lock().unwrap().deleted, vec!["pvm-1"]);

        p.teardown().await.unwrap();
        assert!(p.pool().is_empty().await);
        let c = cloud.lock().unwrap();
        assert!(c.deleted.contains(&"pvm-3".to_string()));
        assert!(c.deleted.contains(&"pvm-4".to_string()));
    }

    #[tokio::test]
    async fn factory_prewarms_and_sweeper_refills() {
        let (base, cloud) = serve(Cloud::default()).await;
        let args: Vec<String> = [
            "--api-key", "ibm-key", "--zone", "dal12", "--service-instance-id", SVC,
            "--network-id", "net-1", "--image-id", "img-1",
            "--powervs-endpoint", base.as_str(), "--iam-endpoint", base.as_str(),
            "--pool-size", "1", "--pool-sweep-interval", "1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let provider = PowerVsFactory.build(&CancellationToken::new(), &args).await.unwrap();
        assert_eq!(cloud.lock().unwrap().created.len(), 1);

        cloud.lock().unwrap().statuses.remove("pvm-1");
        let shared = &cloud;
        wait_until(&CancellationToken::new(), "sweeper refill", Duration::from_secs(10), Duration::from_millis(50), move || async move {
            Ok(shared.lock().unwrap().created.len() == 2)
        })
        .await
        .unwrap();

        provider.teardown().await.unwrap();
        // either teardown or the cancelled refill removes the replacement
        wait_until(&CancellationToken::new(), "replacement deleted", Duration::from_secs(5), Duration::from_millis(20), move || async move {
            Ok(shared.lock().unwrap().deleted.contains(&"pvm-2".to_string()))
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn teardown_joins_delete_failures() {
        let (p, cloud) = provider_with(Cloud::default(), &[]).await;
        p.pool().push(Instance::new("pvm-a", "a", vec![])).await;
        p.pool().push(Instance::new("pvm-b", "b", vec![])).await;
        cloud.lock().unwrap().fail_delete = true;

        let err = p.teardown().await.unwrap_err().to_string();
        assert!(err.contains("pvm-a"));
        assert!(err.contains("pvm-b"));
        assert!(p.pool().is_empty().await);
    }
}
