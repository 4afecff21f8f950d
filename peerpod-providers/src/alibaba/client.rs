//! Signed RPC client for the ECS and VPC OpenAPI (signature version 1.0).

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use peerpod_common::ProviderError;
use reqwest::Client;
use serde_json::Value;
use sha1::Sha1;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

pub const ECS_API_VERSION: &str = "2014-05-26";
pub const VPC_API_VERSION: &str = "2016-04-28";

const SIGNATURE_METHOD: &str = "HMAC-SHA1";
const SIGNATURE_VERSION: &str = "1.0";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub type Params = BTreeMap<String, String>;

/// Build request parameters from literal pairs.
pub fn params<K: AsRef<str>, V: AsRef<str>>(pairs: &[(K, V)]) -> Params {
    pairs
        .iter()
        .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
        .collect()
}

/// Error body returned by the OpenAPI gateway.
#[derive(Debug, Error)]
#[error("{action} failed (HTTP {status}): {code}: {message}")]
pub struct ApiError {
    pub action: String,
    pub status: u16,
    pub code: String,
    pub message: String,
}

impl ApiError {
    /// Finds the gateway error in an `anyhow` chain.
    pub fn find(err: &anyhow::Error) -> Option<&ApiError> {
        err.chain().find_map(|e| e.downcast_ref::<ApiError>())
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404 || self.code.ends_with(".NotFound")
    }

    pub fn is_not_ready(&self) -> bool {
        self.message.trim_end_matches('.').ends_with("is not ready")
    }
}

pub struct RpcClient {
    http: Client,
    endpoint: String,
    version: &'static str,
    access_key_id: String,
    access_key_secret: String,
}

impl RpcClient {
    pub fn new(
        http: Client,
        endpoint: impl Into<String>,
        version: &'static str,
        access_key_id: impl Into<String>,
        access_key_secret: impl Into<String>,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            version,
            access_key_id: access_key_id.into(),
            access_key_secret: access_key_secret.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Invoke `action` and return the decoded JSON body.
    ///
    /// A non-2xx answer becomes an [`ApiError`] wrapped in `anyhow`.
    pub async fn call(&self, action: &str, mut request: Params) -> Result<Value> {
        request.insert("Action".to_string(), action.to_string());
        request.insert("Format".to_string(), "JSON".to_string());
        request.insert("Version".to_string(), self.version.to_string());
        request.insert("AccessKeyId".to_string(), self.access_key_id.clone());
        request.insert("SignatureMethod".to_string(), SIGNATURE_METHOD.to_string());
        request.insert("SignatureVersion".to_string(), SIGNATURE_VERSION.to_string());
        request.insert(
            "Timestamp".to_string(),
            chrono::Utc::now().format(TIMESTAMP_FORMAT).to_string(),
        );
        request.insert(
            "SignatureNonce".to_string(),
            uuid::Uuid::new_v4().to_string(),
        );

        let url = format!(
            "{}/?{}",
            self.endpoint,
            signed_query(&request, &self.access_key_secret)?
        );
        debug!("alibabacloud {} -> {}", action, self.endpoint);

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("calling {}", action))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let parsed: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
            let field = |k: &str| parsed.get(k).and_then(Value::as_str).map(str::to_string);
            return Err(ApiError {
                action: action.to_string(),
                status: status.as_u16(),
                code: field("Code").unwrap_or_else(|| "Unknown".to_string()),
                message: field("Message").unwrap_or_else(|| body.trim().to_string()),
            }
            .into());
        }
        serde_json::from_str(&body)
            .map_err(|e| ProviderError::api(action, format!("undecodable response: {}", e)).into())
    }
}

/// Canonical query string with the signature appended.
pub fn signed_query(request: &Params, secret: &str) -> Result<String> {
    let canonical = canonicalize(request);
    let signature = sign(&canonical, secret)?;
    Ok(format!("{}&Signature={}", canonical, urlencoding::encode(&signature)))
}

/// Parameters sorted by key, both sides percent-encoded (RFC 3986), joined with `&`.
pub fn canonicalize(request: &Params) -> String {
    request
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Base64 HMAC-SHA1 over `GET&%2F&<encoded canonical query>`, keyed with `<secret>&`.
pub fn sign(canonical: &str, secret: &str) -> Result<String> {
    let string_to_sign = format!("GET&%2F&{}", urlencoding::encode(canonical));
    let mut mac = Hmac::<Sha1>::new_from_slice(format!("{}&", secret).as_bytes())
        .map_err(|e| anyhow::anyhow!("initialising request signer: {}", e))?;
    mac.update(string_to_sign.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_reference_vector() {
        let request = params(&[
            ("AccessKeyId", "testid"),
            ("Action", "DescribeRegions"),
            ("Format", "XML"),
            ("SignatureMethod", "HMAC-SHA1"),
            ("SignatureNonce", "3ee8c1b8-83d3-44af-a94f-4e0ad82fd6cf"),
            ("SignatureVersion", "1.0"),
            ("Timestamp", "2016-02-23T12:46:24Z"),
            ("Version", "2014-05-26"),
        ]);
        let canonical = canonicalize(&request);
        assert!(canonical.contains("Timestamp=2016-02-23T12%3A46%3A24Z"));
        assert_eq!(sign(&canonical, "testsecret").unwrap(), "OLeaidS1JvxuMvnyHOwuJ+uX5qY=");
        assert!(signed_query(&request, "testsecret")
            .unwrap()
            .ends_with("&Signature=OLeaidS1JvxuMvnyHOwuJ%2BuX5qY%3D"));
    }

    #[test]
    fn canonical_form_is_sorted_and_encoded() {
        let request = params(&[("b", "x y"), ("a", "1*2~")]);
        assert_eq!(canonicalize(&request), "a=1%2A2~&b=x%20y");
    }

    #[test]
    fn error_classification() {
        let err = ApiError {
            action: "DescribeInstanceAttribute".to_string(),
            status: 404,
            code: "InvalidInstanceId.NotFound".to_string(),
            message: "The specified InstanceId does not exist.".to_string(),
        };
        assert!(err.is_not_found());
        let wrapped = anyhow::Error::from(err).context("waiting");
        assert_eq!(
            ApiError::find(&wrapped).map(|e| e.code.as_str()),
            Some("InvalidInstanceId.NotFound")
        );

        let busy = ApiError {
            action: "DescribeInstanceAttribute".to_string(),
            status: 403,
            code: "IncorrectInstanceStatus".to_string(),
            message: "The instance is not ready".to_string(),
        };
        assert!(busy.is_not_ready());
        assert!(!busy.is_not_found());
    }
}
