//! Alibaba Cloud ECS provider.

use crate::registry::{parse_config, ProviderFactory};
use crate::{Provider, SharedProvider};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use peerpod_common::cloudinit::CloudConfigGenerator;
use peerpod_common::instance_type::{select_instance_type_to_use, sort_instance_types};
use peerpod_common::naming::generate_instance_name;
use peerpod_common::wait::{wait_for, wait_until, DEFAULT_POLL_INTERVAL};
use peerpod_common::{Instance, InstanceTypeRecord, InstanceTypeSpec, ProviderError};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod client;
pub mod config;

pub use client::{ApiError, RpcClient};
pub use config::AlibabaConfig;

use client::{params, Params, ECS_API_VERSION, VPC_API_VERSION};

pub const PROVIDER_NAME: &str = "alibabacloud";

const MAX_INSTANCE_NAME_LEN: usize = 63;
const INSTANCE_WAIT: Duration = Duration::from_secs(60);
const PRIVATE_IP_WAIT: Duration = Duration::from_secs(15);
const PUBLIC_IP_WAIT: Duration = Duration::from_secs(20);
const NIC_WAIT: Duration = Duration::from_secs(60);
const EIP_WAIT: Duration = Duration::from_secs(60);
const DELETE_WAIT: Duration = Duration::from_secs(30);
const EIP_RELEASE_WAIT: Duration = Duration::from_secs(30);
const NIC_CREATE_ATTEMPTS: usize = 5;
const EIP_DESCRIPTION: &str = "Peerpod External Network EIP";

pub struct AlibabaProvider {
    config: AlibabaConfig,
    ecs: RpcClient,
    vpc: RpcClient,
    instance_types: Vec<InstanceTypeRecord>,
    tags: BTreeMap<String, String>,
    vpc_id: String,
    // instance id -> EIP allocation id
    eips: Mutex<HashMap<String, String>>,
    poll_interval: Duration,
}

impl AlibabaProvider {
    /// Build the API clients and resolve the shape list and VPC of the vswitch.
    pub async fn connect(config: AlibabaConfig) -> Result<Self> {
        let secret = config.access_key_secret().ok_or_else(|| {
            ProviderError::ConfigInvalid("alibabacloud-secret-access-key is empty".to_string())
        })?;
        let http = crate::http::client()?;
        let ecs = RpcClient::new(
            http.clone(),
            config.ecs_endpoint(),
            ECS_API_VERSION,
            config.access_key_id.clone(),
            secret.clone(),
        );
        let vpc = RpcClient::new(
            http,
            config.vpc_endpoint(),
            VPC_API_VERSION,
            config.access_key_id.clone(),
            secret,
        );
        let tags = config.tags()?;

        let mut provider = Self {
            config,
            ecs,
            vpc,
            instance_types: Vec::new(),
            tags,
            vpc_id: String::new(),
            eips: Mutex::new(HashMap::new()),
            poll_interval: DEFAULT_POLL_INTERVAL,
        };
        provider.instance_types = provider.load_instance_types().await?;
        provider.vpc_id = provider.lookup_vpc_id().await?;
        Ok(provider)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn instance_types(&self) -> &[InstanceTypeRecord] {
        &self.instance_types
    }

    pub fn vpc_id(&self) -> &str {
        &self.vpc_id
    }

    fn region(&self) -> &str {
        &self.config.region
    }

    async fn load_instance_types(&self) -> Result<Vec<InstanceTypeRecord>> {
        let mut names = self.config.instance_types();
        if names.is_empty() {
            names.push(self.config.instance_type.clone());
        }

        let mut records = Vec::with_capacity(names.len());
        for name in names {
            let resp = self
                .ecs
                .call(
                    "DescribeInstanceTypes",
                    params(&[("InstanceTypes.1", name.as_str())]),
                )
                .await
                .with_context(|| format!("describing instance type {}", name))?;
            let info = resp.pointer("/InstanceTypes/InstanceType/0").ok_or_else(|| {
                ProviderError::ConfigInvalid(format!(
                    "instance type {} not found in region {}",
                    name,
                    self.region()
                ))
            })?;
            let vcpus = info.get("CpuCoreCount").and_then(Value::as_i64).unwrap_or(0);
            let memory_gib = info.get("MemorySize").and_then(Value::as_f64).unwrap_or(0.0);
            let gpus = info.get("GPUAmount").and_then(Value::as_i64).unwrap_or(0);
            records.push(InstanceTypeRecord::new(
                name,
                vcpus,
                (memory_gib * 1024.0) as i64,
                gpus,
            ));
        }

        let sorted = sort_instance_types(records);
        info!("instance type shapes: {:?}", sorted);
        Ok(sorted)
    }

    async fn lookup_vpc_id(&self) -> Result<String> {
        let resp = self
            .vpc
            .call(
                "DescribeVSwitchAttributes",
                params(&[
                    ("VSwitchId", self.config.vswitch_id.as_str()),
                    ("RegionId", self.region()),
                ]),
            )
            .await
            .context("describing the vswitch")?;
        let vpc_id = resp
            .get("VpcId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        info!("vswitch {} belongs to VPC {}", self.config.vswitch_id, vpc_id);
        Ok(vpc_id)
    }

    fn run_instances_request(
        &self,
        name: &str,
        instance_type: &str,
        image_id: &str,
        user_data: &str,
    ) -> Params {
        let mut request = params(&[
            ("RegionId", self.region()),
            ("MinAmount", "1"),
            ("Amount", "1"),
            ("ImageId", image_id),
            ("InstanceType", instance_type),
            ("VSwitchId", self.config.vswitch_id.as_str()),
            ("UserData", user_data),
            ("InstanceName", name),
        ]);
        for (i, group) in self.config.security_group_ids().into_iter().enumerate() {
            request.insert(format!("SecurityGroupIds.{}", i + 1), group);
        }
        for (i, (key, value)) in self.tags.iter().enumerate() {
            request.insert(format!("Tag.{}.Key", i + 1), key.clone());
            request.insert(format!("Tag.{}.Value", i + 1), value.clone());
        }
        if !self.config.key_name.is_empty() {
            request.insert("KeyPairName".to_string(), self.config.key_name.clone());
        }
        if self.config.use_public_ip {
            request.insert("InternetChargeType".to_string(), "PayByTraffic".to_string());
            request.insert("InternetMaxBandwidthOut".to_string(), "100".to_string());
        }
        if !self.config.disable_cvm {
            request.insert(
                "SecurityOptions.ConfidentialComputingMode".to_string(),
                "TDX".to_string(),
            );
        }
        if self.config.system_disk_size > 0 {
            request.insert(
                "SystemDisk.Size".to_string(),
                self.config.system_disk_size.to_string(),
            );
            request.insert("SystemDisk.Category".to_string(), "cloud_essd".to_string());
        }
        request
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<Value> {
        self.ecs
            .call(
                "DescribeInstanceAttribute",
                params(&[("InstanceId", instance_id)]),
            )
            .await
    }

    /// Everything after RunInstances; any error here leaves an instance to roll back.
    async fn bring_up(
        &self,
        ctx: &CancellationToken,
        instance_id: &str,
        spec: &InstanceTypeSpec,
    ) -> Result<Vec<IpAddr>> {
        wait_until(
            ctx,
            &format!("instance {} to exist", instance_id),
            INSTANCE_WAIT,
            self.poll_interval,
            move || async move {
                match self.describe_instance(instance_id).await {
                    Ok(_) => Ok(true),
                    Err(e) if transient(&e) => Ok(false),
                    Err(e) => Err(e.context(format!("describing instance {}", instance_id))),
                }
            },
        )
        .await?;

        let private = wait_for(
            ctx,
            &format!("private IPs of {}", instance_id),
            PRIVATE_IP_WAIT,
            self.poll_interval,
            move || async move {
                match self.describe_instance(instance_id).await {
                    Ok(body) => {
                        let ips = string_list(&body, "/VpcAttributes/PrivateIpAddress/IpAddress");
                        Ok((!ips.is_empty()).then_some(ips))
                    }
                    Err(e) if transient(&e) => Ok(None),
                    Err(e) => Err(e.context(format!("describing instance {}", instance_id))),
                }
            },
        )
        .await?;
        let mut ips = parse_ips(&private)?;
        for (i, ip) in ips.iter().enumerate() {
            info!("podNodeIP[{}]={}", i, ip);
        }

        if self.config.use_public_ip {
            let public = wait_for(
                ctx,
                &format!("public IP of {}", instance_id),
                PUBLIC_IP_WAIT,
                self.poll_interval,
                move || async move {
                    match self.describe_instance(instance_id).await {
                        Ok(body) => Ok(string_list(&body, "/PublicIpAddress/IpAddress")
                            .into_iter()
                            .next()),
                        Err(e) => {
                            warn!("describing instance {}: {:#}", instance_id, e);
                            Ok(None)
                        }
                    }
                },
            )
            .await?;
            ips.insert(0, parse_ips(&[public])?.remove(0));
        }

        if spec.multi_nic {
            info!("external network connectivity requested, adding a NIC with internet access");
            let nic_id = self.add_secondary_nic(ctx, instance_id).await?;
            if self.config.use_public_ip {
                self.bind_new_eip(ctx, instance_id, &nic_id).await?;
            }
        }

        Ok(ips)
    }

    async fn add_secondary_nic(&self, ctx: &CancellationToken, instance_id: &str) -> Result<String> {
        let nic_name = format!("peerpod-nic-{}", instance_id);
        let group = self
            .config
            .security_group_ids()
            .into_iter()
            .next()
            .ok_or_else(|| {
                ProviderError::ConfigInvalid("security-group-ids must list at least one group".to_string())
            })?;
        let request = params(&[
            ("RegionId", self.region()),
            ("VSwitchId", self.config.vswitch_id.as_str()),
            ("SecurityGroupId", group.as_str()),
            ("NetworkInterfaceName", nic_name.as_str()),
        ]);

        let mut nic_id = None;
        for attempt in 1..=NIC_CREATE_ATTEMPTS {
            let resp = self
                .ecs
                .call("CreateNetworkInterface", request.clone())
                .await
                .context("creating network interface")?;
            // The API may answer without an id; asking again is the documented remedy.
            match resp.get("NetworkInterfaceId").and_then(Value::as_str) {
                Some(id) if !id.is_empty() => {
                    nic_id = Some(id.to_string());
                    break;
                }
                _ => warn!(
                    "CreateNetworkInterface returned no id (attempt {}/{})",
                    attempt, NIC_CREATE_ATTEMPTS
                ),
            }
        }
        let nic_id = nic_id.ok_or_else(|| {
            ProviderError::api(
                "CreateNetworkInterface",
                format!("no network interface id after {} attempts", NIC_CREATE_ATTEMPTS),
            )
        })?;

        if let Err(e) = self.plug_nic(ctx, instance_id, &nic_id).await {
            self.discard_nic(instance_id, &nic_id).await;
            return Err(e);
        }
        info!("network interface {} attached to instance {}", nic_id, instance_id);
        Ok(nic_id)
    }

    async fn plug_nic(&self, ctx: &CancellationToken, instance_id: &str, nic_id: &str) -> Result<()> {
        wait_until(
            ctx,
            &format!("instance {} to be running", instance_id),
            NIC_WAIT,
            self.poll_interval,
            move || async move {
                let body = self
                    .describe_instance(instance_id)
                    .await
                    .context("getting instance status")?;
                Ok(body.get("Status").and_then(Value::as_str) == Some("Running"))
            },
        )
        .await?;

        self.ecs
            .call(
                "AttachNetworkInterface",
                params(&[
                    ("InstanceId", instance_id),
                    ("NetworkInterfaceId", nic_id),
                    ("RegionId", self.region()),
                ]),
            )
            .await
            .context("attaching network interface")?;

        wait_until(
            ctx,
            &format!("network interface {} to be in use", nic_id),
            NIC_WAIT,
            self.poll_interval,
            move || async move { Ok(self.nic_status(nic_id).await? == "InUse") },
        )
        .await?;

        self.ecs
            .call(
                "ModifyNetworkInterfaceAttribute",
                params(&[
                    ("RegionId", self.region()),
                    ("NetworkInterfaceId", nic_id),
                    ("DeleteOnRelease", "true"),
                ]),
            )
            .await
            .context("marking network interface delete-on-release")?;
        Ok(())
    }

    async fn nic_status(&self, nic_id: &str) -> Result<String> {
        let body = self
            .ecs
            .call(
                "DescribeNetworkInterfaceAttribute",
                params(&[("RegionId", self.region()), ("NetworkInterfaceId", nic_id)]),
            )
            .await
            .context("getting network interface status")?;
        Ok(body
            .get("Status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    async fn discard_nic(&self, instance_id: &str, nic_id: &str) {
        let ctx = CancellationToken::new();
        let result: Result<()> = async {
            if self.nic_status(nic_id).await? == "InUse" {
                self.ecs
                    .call(
                        "DetachNetworkInterface",
                        params(&[
                            ("RegionId", self.region()),
                            ("InstanceId", instance_id),
                            ("NetworkInterfaceId", nic_id),
                        ]),
                    )
                    .await?;
                wait_until(
                    &ctx,
                    &format!("network interface {} to detach", nic_id),
                    NIC_WAIT,
                    self.poll_interval,
                    move || async move { Ok(self.nic_status(nic_id).await? == "Available") },
                )
                .await?;
            }
            self.ecs
                .call(
                    "DeleteNetworkInterface",
                    params(&[("RegionId", self.region()), ("NetworkInterfaceId", nic_id)]),
                )
                .await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            error!("rollback: failed to delete network interface {}: {:#}", nic_id, e);
        }
    }

    async fn eip_status(&self, allocation_id: &str) -> Result<Option<String>> {
        let body = self
            .vpc
            .call(
                "DescribeEipAddresses",
                params(&[("RegionId", self.region()), ("AllocationId", allocation_id)]),
            )
            .await
            .context("getting EIP status")?;
        Ok(body
            .pointer("/EipAddresses/EipAddress/0/Status")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn wait_eip_status(
        &self,
        ctx: &CancellationToken,
        allocation_id: &str,
        wanted: &'static str,
        budget: Duration,
    ) -> Result<()> {
        wait_until(
            ctx,
            &format!("EIP {} to be {}", allocation_id, wanted),
            budget,
            self.poll_interval,
            move || async move { Ok(self.eip_status(allocation_id).await?.as_deref() == Some(wanted)) },
        )
        .await
    }

    async fn bind_new_eip(&self, ctx: &CancellationToken, instance_id: &str, nic_id: &str) -> Result<()> {
        let resp = self
            .vpc
            .call(
                "AllocateEipAddress",
                params(&[("RegionId", self.region()), ("Description", EIP_DESCRIPTION)]),
            )
            .await
            .context("allocating EIP")?;
        let allocation_id = resp
            .get("AllocationId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ProviderError::api("AllocateEipAddress", "response carries no allocation id"))?
            .to_string();
        let address = resp.get("EipAddress").and_then(Value::as_str).unwrap_or_default();

        // Tracked before any wait so that deleting the instance releases it.
        self.eips
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(instance_id.to_string(), allocation_id.clone());

        self.wait_eip_status(ctx, &allocation_id, "Available", EIP_WAIT).await?;
        info!("EIP {} ({}) allocated", allocation_id, address);

        self.vpc
            .call(
                "AssociateEipAddress",
                params(&[
                    ("RegionId", self.region()),
                    ("AllocationId", allocation_id.as_str()),
                    ("InstanceId", nic_id),
                    ("InstanceType", "NetworkInterface"),
                ]),
            )
            .await
            .with_context(|| format!("binding EIP {} to NIC {}", allocation_id, nic_id))?;
        self.wait_eip_status(ctx, &allocation_id, "InUse", EIP_WAIT).await?;
        info!("bound EIP {} to NIC {}", allocation_id, nic_id);
        Ok(())
    }

    async fn release_eip(&self, ctx: &CancellationToken, allocation_id: &str) -> Result<()> {
        if self.eip_status(allocation_id).await?.as_deref() == Some("InUse") {
            info!("unbinding EIP {}", allocation_id);
            self.vpc
                .call(
                    "UnassociateEipAddress",
                    params(&[("RegionId", self.region()), ("AllocationId", allocation_id)]),
                )
                .await
                .context("unbinding EIP")?;
            self.wait_eip_status(ctx, allocation_id, "Available", EIP_RELEASE_WAIT)
                .await?;
        }

        info!("releasing EIP {}", allocation_id);
        self.vpc
            .call(
                "ReleaseEipAddress",
                params(&[("RegionId", self.region()), ("AllocationId", allocation_id)]),
            )
            .await
            .context("releasing EIP")?;
        wait_until(
            ctx,
            &format!("EIP {} to be released", allocation_id),
            EIP_RELEASE_WAIT,
            self.poll_interval,
            move || async move { Ok(self.eip_status(allocation_id).await?.is_none()) },
        )
        .await?;
        info!("EIP {} released", allocation_id);
        Ok(())
    }

    async fn rollback(&self, instance_id: &str) {
        if let Err(e) = self
            .delete_instance(&CancellationToken::new(), instance_id)
            .await
        {
            error!("rollback: failed to delete instance {}: {:#}", instance_id, e);
        }
    }
}

#[async_trait]
impl Provider for AlibabaProvider {
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
        let instance_type = select_instance_type_to_use(
            spec,
            &self.instance_types,
            &self.config.instance_types(),
            &self.config.instance_type,
        )?;
        let image_id = if spec.image.is_empty() {
            self.config.image_id.as_str()
        } else {
            info!("using image {} from annotation", spec.image);
            spec.image.as_str()
        };

        info!("creating instance {} ({}, image {})", name, instance_type, image_id);
        let request =
            self.run_instances_request(&name, &instance_type, image_id, &BASE64.encode(user_data));
        let resp = self
            .ecs
            .call("RunInstances", request)
            .await
            .with_context(|| format!("creating instance {}", name))?;
        let instance_id = resp
            .pointer("/InstanceIdSets/InstanceIdSet/0")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::api("RunInstances", "response carries no instance id"))?
            .to_string();
        info!("created instance {} for sandbox {}", instance_id, sandbox_id);

        match self.bring_up(ctx, &instance_id, spec).await {
            Ok(ips) => Ok(Instance::new(instance_id, name, ips)),
            Err(e) => {
                self.rollback(&instance_id).await;
                Err(e.context(format!("bringing up instance {}", instance_id)))
            }
        }
    }

    async fn delete_instance(&self, ctx: &CancellationToken, instance_id: &str) -> Result<()> {
        info!("deleting instance {}", instance_id);
        wait_until(
            ctx,
            &format!("instance {} to be deleted", instance_id),
            DELETE_WAIT,
            self.poll_interval,
            move || async move {
                let request = params(&[("InstanceId", instance_id), ("Force", "true")]);
                match self.ecs.call("DeleteInstance", request).await {
                    Ok(_) => Ok(true),
                    Err(e) => match ApiError::find(&e).map(|api| api.code.clone()).as_deref() {
                        Some("IncorrectInstanceStatus") => {
                            info!("instance {} cannot be deleted in its current state, retrying", instance_id);
                            Ok(false)
                        }
                        Some("InvalidInstanceId.NotFound") => {
                            info!("instance {} is already gone", instance_id);
                            Ok(true)
                        }
                        _ => Err(e.context(format!("deleting instance {}", instance_id))),
                    },
                }
            },
        )
        .await?;
        info!("deleted instance {}", instance_id);

        let eip = self
            .eips
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(instance_id);
        if let Some(allocation_id) = eip {
            if let Err(e) = self.release_eip(ctx, &allocation_id).await {
                warn!("releasing EIP {} failed: {:#}", allocation_id, e);
            }
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

fn transient(err: &anyhow::Error) -> bool {
    ApiError::find(err).map_or(false, |api| api.is_not_found() || api.is_not_ready())
}

fn string_list(body: &Value, pointer: &str) -> Vec<String> {
    body.pointer(pointer)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_ips(raw: &[String]) -> Result<Vec<IpAddr>, ProviderError> {
    raw.iter()
        .map(|s| s.trim().parse().map_err(|e| ProviderError::invalid_ip(s.as_str(), e)))
        .collect()
}

pub struct AlibabaFactory;

#[async_trait]
impl ProviderFactory for AlibabaFactory {
    async fn build(&self, _ctx: &CancellationToken, args: &[String]) -> Result<SharedProvider> {
        let config: AlibabaConfig = parse_config(PROVIDER_NAME, args)?;
        config.verify()?;
        info!("alibabacloud config: {:?}", config.redacted());
        Ok(Arc::new(AlibabaProvider::connect(config).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Query, State};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use peerpod_common::cloudinit::{CloudConfig, WriteFile};
    use peerpod_common::error::kind_of;
    use serde_json::json;

    type Shared = Arc<Mutex<Fake>>;

    /// In-process stand-in for the ECS and VPC gateways.
    struct Fake {
        calls: Vec<(String, HashMap<String, String>)>,
        describe_misses: usize,
        busy_deletes: usize,
        gone: bool,
        fail_attach: bool,
        nic_status: &'static str,
        eip_status: Option<&'static str>,
    }

    impl Default for Fake {
        fn default() -> Self {
            Self {
                calls: Vec::new(),
                describe_misses: 0,
                busy_deletes: 0,
                gone: false,
                fail_attach: false,
                nic_status: "Available",
                eip_status: None,
            }
        }
    }

    impl Fake {
        fn params_of(&self, action: &str) -> Option<HashMap<String, String>> {
            self.calls
                .iter()
                .find(|(a, _)| a == action)
                .map(|(_, p)| p.clone())
        }

        fn called(&self, action: &str) -> bool {
            self.calls.iter().any(|(a, _)| a == action)
        }
    }

    fn api_error(status: StatusCode, code: &str, message: &str) -> (StatusCode, Json<Value>) {
        (status, Json(json!({ "RequestId": "r-1", "Code": code, "Message": message })))
    }

    async fn handle(
        State(fake): State<Shared>,
        Query(q): Query<HashMap<String, String>>,
    ) -> (StatusCode, Json<Value>) {
        let action = q.get("Action").cloned().unwrap_or_default();
        assert!(q.contains_key("Signature"), "unsigned request");
        let mut f = fake.lock().unwrap();
        f.calls.push((action.clone(), q.clone()));
        let ok = |v: Value| (StatusCode::OK, Json(v));
        match action.as_str() {
            "DescribeInstanceTypes" => ok(json!({
                "InstanceTypes": { "InstanceType": [{
                    "InstanceTypeId": q.get("InstanceTypes.1"),
                    "CpuCoreCount": 4,
                    "MemorySize": 16.0,
                    "GPUAmount": 0
                }]}
            })),
            "DescribeVSwitchAttributes" => ok(json!({ "VpcId": "vpc-1" })),
            "RunInstances" => ok(json!({ "InstanceIdSets": { "InstanceIdSet": ["i-1"] } })),
            "DescribeInstanceAttribute" => {
                if f.describe_misses > 0 {
                    f.describe_misses -= 1;
                    return api_error(StatusCode::NOT_FOUND, "InvalidInstanceId.NotFound", "not found");
                }
                ok(json!({
                    "InstanceId": "i-1",
                    "Status": "Running",
                    "VpcAttributes": { "PrivateIpAddress": { "IpAddress": ["10.0.0.5"] } },
                    "PublicIpAddress": { "IpAddress": ["47.1.2.3"] }
                }))
            }
            "DeleteInstance" => {
                if f.gone {
                    return api_error(StatusCode::NOT_FOUND, "InvalidInstanceId.NotFound", "gone");
                }
                if f.busy_deletes > 0 {
                    f.busy_deletes -= 1;
                    return api_error(StatusCode::FORBIDDEN, "IncorrectInstanceStatus", "busy");
                }
                ok(json!({}))
            }
            "CreateNetworkInterface" => ok(json!({ "NetworkInterfaceId": "eni-1" })),
            "AttachNetworkInterface" => {
                if f.fail_attach {
                    return api_error(StatusCode::BAD_REQUEST, "InvalidOperation", "cannot attach");
                }
                f.nic_status = "InUse";
                ok(json!({}))
            }
            "DetachNetworkInterface" => {
                f.nic_status = "Available";
                ok(json!({}))
            }
            "DescribeNetworkInterfaceAttribute" => ok(json!({ "Status": f.nic_status })),
            "AllocateEipAddress" => {
                f.eip_status = Some("Available");
                ok(json!({ "AllocationId": "eip-1", "EipAddress": "47.9.9.9" }))
            }
            "AssociateEipAddress" => {
                f.eip_status = Some("InUse");
                ok(json!({}))
            }
            "UnassociateEipAddress" => {
                f.eip_status = Some("Available");
                ok(json!({}))
            }
            "ReleaseEipAddress" => {
                f.eip_status = None;
                ok(json!({}))
            }
            "DescribeEipAddresses" => {
                let list: Vec<Value> = f
                    .eip_status
                    .iter()
                    .map(|s| json!({ "AllocationId": "eip-1", "Status": s }))
                    .collect();
                ok(json!({ "EipAddresses": { "EipAddress": list } }))
            }
            _ => ok(json!({})),
        }
    }

    async fn serve(fake: Shared) -> String {
        let app = Router::new().route("/", get(handle)).with_state(fake);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn provider_with(fake: Fake, extra: &[&str]) -> (AlibabaProvider, Shared) {
        let fake = Arc::new(Mutex::new(fake));
        let url = serve(fake.clone()).await;
        let mut args: Vec<String> = [
            "--alibabacloud-access-key-id",
            "id",
            "--alibabacloud-secret-access-key",
            "secret",
            "--imageid",
            "m-default",
            "--vswitch-id",
            "vsw-1",
            "--security-group-ids",
            "sg-1,sg-2",
            "--tags",
            "team=core",
            "--ecs-endpoint",
            url.as_str(),
            "--vpc-endpoint",
            url.as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.extend(extra.iter().map(|s| s.to_string()));
        let config: AlibabaConfig = parse_config(PROVIDER_NAME, &args).unwrap();
        let provider = AlibabaProvider::connect(config)
            .await
            .unwrap()
            .with_poll_interval(Duration::from_millis(10));
        (provider, fake)
    }

    fn user_data() -> CloudConfig {
        CloudConfig {
            write_files: vec![WriteFile::new("/run/peerpod/daemon.json", "{}")],
        }
    }

    #[tokio::test]
    async fn startup_resolves_shapes_and_vpc() {
        let (p, _) = provider_with(Fake::default(), &[]).await;
        assert_eq!(
            p.instance_types(),
            &[InstanceTypeRecord::new("ecs.g8i.xlarge", 4, 16384, 0)]
        );
        assert_eq!(p.vpc_id(), "vpc-1");
    }

    #[tokio::test]
    async fn create_with_public_ip() {
        let fake = Fake {
            describe_misses: 2,
            ..Default::default()
        };
        let (p, fake) = provider_with(fake, &["--use-public-ip"]).await;
        let instance = p
            .create_instance(
                &CancellationToken::new(),
                "My_Pod",
                "abcdef0123456789",
                &user_data(),
                &InstanceTypeSpec::default(),
            )
            .await
            .unwrap();

        assert_eq!(instance.id, "i-1");
        assert_eq!(instance.name, "podvm-my-pod-abcdef01");
        let ips: Vec<String> = instance.ips.iter().map(|ip| ip.to_string()).collect();
        assert_eq!(ips, vec!["47.1.2.3", "10.0.0.5"]);

        let run = fake.lock().unwrap().params_of("RunInstances").unwrap();
        assert_eq!(run["ImageId"], "m-default");
        assert_eq!(run["InstanceType"], "ecs.g8i.xlarge");
        assert_eq!(run["SecurityGroupIds.1"], "sg-1");
        assert_eq!(run["SecurityGroupIds.2"], "sg-2");
        assert_eq!(run["Tag.1.Key"], "team");
        assert_eq!(run["Tag.1.Value"], "core");
        assert_eq!(run["SecurityOptions.ConfidentialComputingMode"], "TDX");
        assert_eq!(run["SystemDisk.Size"], "40");
        assert_eq!(run["SystemDisk.Category"], "cloud_essd");
        assert_eq!(run["InternetChargeType"], "PayByTraffic");
        assert_eq!(run["InternetMaxBandwidthOut"], "100");
        let decoded = BASE64.decode(&run["UserData"]).unwrap();
        assert!(String::from_utf8(decoded).unwrap().starts_with("#cloud-config"));
    }

    #[tokio::test]
    async fn annotation_image_and_plain_vm() {
        let (p, fake) = provider_with(Fake::default(), &["--disable-cvm", "--system-disk-size", "0"]).await;
        let spec = InstanceTypeSpec {
            image: "m-override".to_string(),
            ..Default::default()
        };
        let instance = p
            .create_instance(&CancellationToken::new(), "pod", "sbx", &user_data(), &spec)
            .await
            .unwrap();
        assert_eq!(instance.ips.len(), 1);

        let run = fake.lock().unwrap().params_of("RunInstances").unwrap();
        assert_eq!(run["ImageId"], "m-override");
        assert!(!run.contains_key("SecurityOptions.ConfidentialComputingMode"));
        assert!(!run.contains_key("SystemDisk.Size"));
        assert!(!run.contains_key("InternetChargeType"));
    }

    #[tokio::test]
    async fn unsupported_type_creates_nothing() {
        let (p, fake) = provider_with(Fake::default(), &[]).await;
        let spec = InstanceTypeSpec {
            instance_type: "ecs.huge".to_string(),
            ..Default::default()
        };
        let err = p
            .create_instance(&CancellationToken::new(), "pod", "sbx", &user_data(), &spec)
            .await
            .unwrap_err();
        assert_eq!(kind_of(&err).map(|k| k.kind()), Some("unsupported-instance-type"));
        assert!(!fake.lock().unwrap().called("RunInstances"));
    }

    #[tokio::test]
    async fn multi_nic_eip_is_released_on_delete() {
        let fake = Fake {
            busy_deletes: 1,
            ..Default::default()
        };
        let (p, fake) = provider_with(fake, &["--use-public-ip"]).await;
        let spec = InstanceTypeSpec {
            multi_nic: true,
            ..Default::default()
        };
        let ctx = CancellationToken::new();
        p.create_instance(&ctx, "pod", "sbx", &user_data(), &spec)
            .await
            .unwrap();
        {
            let f = fake.lock().unwrap();
            let nic = f.params_of("CreateNetworkInterface").unwrap();
            assert_eq!(nic["NetworkInterfaceName"], "peerpod-nic-i-1");
            assert_eq!(nic["SecurityGroupId"], "sg-1");
            assert_eq!(f.params_of("ModifyNetworkInterfaceAttribute").unwrap()["DeleteOnRelease"], "true");
            let assoc = f.params_of("AssociateEipAddress").unwrap();
            assert_eq!(assoc["InstanceId"], "eni-1");
            assert_eq!(assoc["InstanceType"], "NetworkInterface");
            assert_eq!(f.eip_status, Some("InUse"));
        }

        p.delete_instance(&ctx, "i-1").await.unwrap();
        let f = fake.lock().unwrap();
        let deletes = f.calls.iter().filter(|(a, _)| a == "DeleteInstance").count();
        assert_eq!(deletes, 2);
        assert!(f.called("UnassociateEipAddress"));
        assert!(f.called("ReleaseEipAddress"));
        assert_eq!(f.eip_status, None);
        assert!(p.eips.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_attach_rolls_back_nic_and_instance() {
        let fake = Fake {
            fail_attach: true,
            ..Default::default()
        };
        let (p, fake) = provider_with(fake, &[]).await;
        let spec = InstanceTypeSpec {
            multi_nic: true,
            ..Default::default()
        };
        let err = p
            .create_instance(&CancellationToken::new(), "pod", "sbx", &user_data(), &spec)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("cannot attach"));
        let f = fake.lock().unwrap();
        assert!(f.called("DeleteNetworkInterface"));
        assert!(f.called("DeleteInstance"));
    }

    #[tokio::test]
    async fn delete_of_missing_instance_succeeds() {
        let fake = Fake {
            gone: true,
            ..Default::default()
        };
        let (p, _) = provider_with(fake, &[]).await;
        p.delete_instance(&CancellationToken::new(), "i-404").await.unwrap();
    }
}
