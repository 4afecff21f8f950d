//! IBM Cloud IAM token exchange plus the slice of the Power Cloud API the provider uses.

use crate::http::check;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use peerpod_common::ProviderError;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

const APIKEY_GRANT: &str = "urn:ibm:params:oauth:grant-type:apikey";

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    fn fresh(&self) -> bool {
        self.expires_at
            .map_or(true, |at| at - ChronoDuration::seconds(60) > Utc::now())
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Unix seconds
    #[serde(default)]
    expiration: Option<i64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PvmInstance {
    #[serde(rename = "pvmInstanceID", default)]
    pub id: String,
    #[serde(rename = "serverName", default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub networks: Vec<PvmNetwork>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PvmNetwork {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(rename = "networkID", default)]
    pub network_id: String,
    #[serde(rename = "ipAddress", default)]
    pub ip_address: String,
    #[serde(rename = "externalIP", default)]
    pub external_ip: String,
    #[serde(rename = "macAddress", default)]
    pub mac_address: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DhcpServer {
    pub id: String,
    #[serde(default)]
    pub network: Option<DhcpNetwork>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DhcpNetwork {
    pub id: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DhcpLease {
    #[serde(rename = "instanceIP")]
    pub instance_ip: String,
    #[serde(rename = "instanceMacAddress")]
    pub instance_mac_address: String,
}

#[derive(Debug, Deserialize, Default)]
struct DhcpServerDetail {
    #[serde(default)]
    leases: Vec<DhcpLease>,
}

pub struct PowerVsClient {
    http: Client,
    iam_endpoint: String,
    endpoint: String,
    api_key: String,
    service_instance_id: String,
    crn: String,
    token: Mutex<Option<AccessToken>>,
}

impl PowerVsClient {
    /// Exchange the API key, resolve its account and build the workspace CRN.
    pub async fn connect(
        http: Client,
        iam_endpoint: &str,
        endpoint: &str,
        api_key: String,
        zone: &str,
        service_instance_id: &str,
    ) -> Result<Self> {
        let mut client = Self {
            http,
            iam_endpoint: iam_endpoint.trim_end_matches('/').to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            service_instance_id: service_instance_id.to_string(),
            crn: String::new(),
            token: Mutex::new(None),
        };
        let account = client.account_id().await?;
        client.crn = workspace_crn(zone, &account, service_instance_id);
        info!("authenticated with IBM Cloud IAM, workspace {}", client.crn);
        Ok(client)
    }

    async fn token(&self) -> Result<String> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref().filter(|t| t.fresh()) {
            return Ok(token.value.clone());
        }
        let body = format!(
            "grant_type={}&apikey={}",
            urlencoding::encode(APIKEY_GRANT),
            urlencoding::encode(&self.api_key)
        );
        let resp = self
            .http
            .post(format!("{}/identity/token", self.iam_endpoint))
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("Accept", "application/json")
            .body(body)
            .send()
            .await
            .context("requesting IAM token")?;
        let parsed: TokenResponse = check(resp, "IAM token").await?.json().await?;
        let token = AccessToken {
            value: parsed.access_token,
            expires_at: parsed
                .expiration
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        };
        debug!("IAM token refreshed, expires {:?}", token.expires_at);
        let value = token.value.clone();
        *guard = Some(token);
        Ok(value)
    }

    async fn account_id(&self) -> Result<String> {
        let token = self.token().await?;
        let resp = self
            .http
            .get(format!("{}/v1/apikeys/details", self.iam_endpoint))
            .bearer_auth(&token)
            .header("IAM-ApiKey", &self.api_key)
            .send()
            .await
            .context("looking up API key details")?;
        let body: Value = check(resp, "API key details").await?.json().await?;
        body.get("account_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ProviderError::api("API key details", "response carries no account_id").into())
    }

    async fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder> {
        let token = self.token().await?;
        Ok(builder.bearer_auth(token).header("CRN", &self.crn))
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/pcloud/v1/cloud-instances/{}/{}",
            self.endpoint, self.service_instance_id, path
        )
    }

    /// POST pvm-instances; returns the id of the first instance created.
    pub async fn create_instance(&self, body: &Value) -> Result<String> {
        let req = self.authorized(self.http.post(self.url("pvm-instances"))).await?;
        let resp = req.json(body).send().await.context("creating PVM instance")?;
        let created: Vec<PvmInstance> = check(resp, "create PVM instance").await?.json().await?;
        created
            .into_iter()
            .map(|i| i.id)
            .find(|id| !id.is_empty())
            .ok_or_else(|| ProviderError::api("create PVM instance", "no instances created").into())
    }

    pub async fn get_instance(&self, id: &str) -> Result<PvmInstance> {
        let req = self
            .authorized(self.http.get(self.url(&format!("pvm-instances/{}", id))))
            .await?;
        let resp = req
            .send()
            .await
            .with_context(|| format!("getting PVM instance {}", id))?;
        Ok(check(resp, &format!("PVM instance {}", id)).await?.json().await?)
    }

    pub async fn delete_instance(&self, id: &str) -> Result<()> {
        let req = self
            .authorized(self.http.delete(self.url(&format!("pvm-instances/{}", id))))
            .await?;
        let resp = req
            .send()
            .await
            .with_context(|| format!("deleting PVM instance {}", id))?;
        check(resp, &format!("PVM instance {}", id)).await?;
        Ok(())
    }

    pub async fn dhcp_servers(&self) -> Result<Vec<DhcpServer>> {
        let req = self.authorized(self.http.get(self.url("services/dhcp"))).await?;
        let resp = req.send().await.context("listing DHCP servers")?;
        Ok(check(resp, "DHCP servers").await?.json().await?)
    }

    pub async fn dhcp_leases(&self, server_id: &str) -> Result<Vec<DhcpLease>> {
        let req = self
            .authorized(self.http.get(self.url(&format!("services/dhcp/{}", server_id))))
            .await?;
        let resp = req
            .send()
            .await
            .with_context(|| format!("getting DHCP server {}", server_id))?;
        let detail: DhcpServerDetail = check(resp, &format!("DHCP server {}", server_id))
            .await?
            .json()
            .await?;
        Ok(detail.leases)
    }
}

fn workspace_crn(zone: &str, account_id: &str, service_instance_id: &str) -> String {
    format!(
        "crn:v1:bluemix:public:power-iaas:{}:a/{}:{}::",
        zone, account_id, service_instance_id
    )
}
