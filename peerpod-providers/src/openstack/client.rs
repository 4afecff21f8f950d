//! Minimal Keystone v3 / Nova / Neutron REST client.

use crate::http::check;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use peerpod_common::ProviderError;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Lets `networks` be the string "auto".
pub const NOVA_MICROVERSION: &str = "2.37";

const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";
const MICROVERSION_HEADER: &str = "X-OpenStack-Nova-API-Version";

#[derive(Debug, Clone)]
pub struct Credentials {
    pub identity_endpoint: String,
    pub username: String,
    pub password: String,
    pub project_name: String,
    pub domain_name: String,
    pub region: String,
}

#[derive(Debug, Clone)]
struct Session {
    token: String,
    expires_at: Option<DateTime<Utc>>,
    compute: String,
    network: String,
}

impl Session {
    fn fresh(&self) -> bool {
        match self.expires_at {
            Some(at) => at - ChronoDuration::seconds(60) > Utc::now(),
            None => true,
        }
    }
}

#[derive(Deserialize)]
struct TokenBody {
    token: Token,
}

#[derive(Deserialize)]
struct Token {
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    endpoints: Vec<Endpoint>,
}

#[derive(Deserialize)]
struct Endpoint {
    interface: String,
    #[serde(default)]
    region: String,
    #[serde(default)]
    region_id: String,
    url: String,
}

/// One entry of `os-interface`.
#[derive(Debug, Deserialize, Clone)]
pub struct InterfaceAttachment {
    pub port_id: String,
    #[serde(default)]
    pub fixed_ips: Vec<FixedIp>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FixedIp {
    pub ip_address: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FloatingIp {
    pub id: String,
    pub floating_ip_address: String,
}

pub struct OpenStackClient {
    http: Client,
    credentials: Credentials,
    session: Mutex<Option<Session>>,
}

impl OpenStackClient {
    pub fn new(http: Client, credentials: Credentials) -> Self {
        Self {
            http,
            credentials,
            session: Mutex::new(None),
        }
    }

    /// Current token and endpoints, logging in again when the token is about to expire.
    async fn session(&self) -> Result<Session> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref().filter(|s| s.fresh()) {
            return Ok(session.clone());
        }
        let session = self.login().await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    pub async fn authenticate(&self) -> Result<()> {
        self.session().await.map(|_| ())
    }

    async fn login(&self) -> Result<Session> {
        let c = &self.credentials;
        let url = format!("{}/auth/tokens", identity_v3(&c.identity_endpoint));
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": c.username,
                            "domain": { "name": c.domain_name },
                            "password": c.password
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": c.project_name,
                        "domain": { "name": c.domain_name }
                    }
                }
            }
        });

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("authenticating with keystone")?;
        let resp = check(resp, "keystone token").await?;
        let token = resp
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::api("keystone token", "response carries no X-Subject-Token"))?;
        let parsed: TokenBody = resp.json().await.context("decoding keystone token")?;

        let compute = find_endpoint(&parsed.token.catalog, "compute", &c.region)?;
        let network = versioned(&find_endpoint(&parsed.token.catalog, "network", &c.region)?, "v2.0");
        info!(
            "authenticated with keystone as {}, compute={} network={}",
            c.username, compute, network
        );
        Ok(Session {
            token,
            expires_at: parsed.token.expires_at,
            compute,
            network,
        })
    }

    fn compute_request(&self, builder: RequestBuilder, session: &Session) -> RequestBuilder {
        builder
            .header(AUTH_TOKEN_HEADER, &session.token)
            .header(MICROVERSION_HEADER, NOVA_MICROVERSION)
    }

    /// POST /servers; returns the new server id.
    pub async fn create_server(&self, server: Value) -> Result<String> {
        let session = self.session().await?;
        let url = format!("{}/servers", session.compute);
        let resp = self
            .compute_request(self.http.post(&url), &session)
            .json(&json!({ "server": server }))
            .send()
            .await
            .context("creating server")?;
        let body: Value = check(resp, "create server").await?.json().await?;
        body.pointer("/server/id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ProviderError::api("create server", "response carries no server id").into())
    }

    /// GET /servers/{id}; returns the `server` object.
    pub async fn get_server(&self, id: &str) -> Result<Value> {
        let session = self.session().await?;
        let url = format!("{}/servers/{}", session.compute, id);
        let resp = self
            .compute_request(self.http.get(&url), &session)
            .send()
            .await
            .with_context(|| format!("getting server {}", id))?;
        let mut body: Value = check(resp, &format!("server {}", id)).await?.json().await?;
        Ok(body.get_mut("server").map(Value::take).unwrap_or(Value::Null))
    }

    pub async fn server_interfaces(&self, id: &str) -> Result<Vec<InterfaceAttachment>> {
        #[derive(Deserialize)]
        struct Interfaces {
            #[serde(rename = "interfaceAttachments", default)]
            attachments: Vec<InterfaceAttachment>,
        }

        let session = self.session().await?;
        let url = format!("{}/servers/{}/os-interface", session.compute, id);
        let resp = self
            .compute_request(self.http.get(&url), &session)
            .send()
            .await
            .with_context(|| format!("listing interfaces of server {}", id))?;
        let body: Interfaces = check(resp, &format!("interfaces of server {}", id))
            .await?
            .json()
            .await?;
        Ok(body.attachments)
    }

    pub async fn delete_server(&self, id: &str) -> Result<()> {
        let session = self.session().await?;
        let url = format!("{}/servers/{}", session.compute, id);
        let resp = self
            .compute_request(self.http.delete(&url), &session)
            .send()
            .await
            .with_context(|| format!("deleting server {}", id))?;
        check(resp, &format!("server {}", id)).await?;
        Ok(())
    }

    pub async fn create_floating_ip(&self, floating_network_id: &str, port_id: &str) -> Result<FloatingIp> {
        #[derive(Deserialize)]
        struct Created {
            floatingip: FloatingIp,
        }

        let session = self.session().await?;
        let url = format!("{}/floatingips", session.network);
        let resp = self
            .http
            .post(&url)
            .header(AUTH_TOKEN_HEADER, &session.token)
            .json(&json!({
                "floatingip": {
                    "floating_network_id": floating_network_id,
                    "port_id": port_id
                }
            }))
            .send()
            .await
            .context("creating floating IP")?;
        let created: Created = check(resp, "create floating IP").await?.json().await?;
        debug!("floating IP {} created on port {}", created.floatingip.id, port_id);
        Ok(created.floatingip)
    }

    pub async fn delete_floating_ip(&self, id: &str) -> Result<()> {
        let session = self.session().await?;
        let url = format!("{}/floatingips/{}", session.network, id);
        let resp = self
            .http
            .delete(&url)
            .header(AUTH_TOKEN_HEADER, &session.token)
            .send()
            .await
            .with_context(|| format!("deleting floating IP {}", id))?;
        check(resp, &format!("floating IP {}", id)).await?;
        Ok(())
    }
}

fn identity_v3(endpoint: &str) -> String {
    versioned(endpoint, "v3")
}

fn versioned(endpoint: &str, version: &str) -> String {
    let base = endpoint.trim().trim_end_matches('/');
    if base.ends_with(&format!("/{}", version)) {
        base.to_string()
    } else {
        format!("{}/{}", base, version)
    }
}

fn find_endpoint(catalog: &[CatalogEntry], kind: &str, region: &str) -> Result<String> {
    catalog
        .iter()
        .filter(|entry| entry.kind == kind)
        .flat_map(|entry| entry.endpoints.iter())
        .find(|ep| {
            ep.interface == "public" && (region.is_empty() || ep.region == region || ep.region_id == region)
        })
        .map(|ep| ep.url.trim_end_matches('/').to_string())
        .ok_or_else(|| {
            ProviderError::ConfigInvalid(format!(
                "no public {} endpoint in the service catalog for region {:?}",
                kind, region
            ))
            .into()
        })
}
