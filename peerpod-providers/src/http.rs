use anyhow::{Context, Result};
use peerpod_common::ProviderError;
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;

/// Cloud API client with bounded connect and request times.
pub(crate) fn client() -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(20))
        .build()
        .context("building HTTP client")
}

/// Map a non-2xx response onto the error taxonomy: 404 is `NotFound`, anything else
/// is a provider API error carrying the upstream body.
pub(crate) async fn check(resp: Response, context: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    if status == StatusCode::NOT_FOUND {
        return Err(ProviderError::NotFound(context.to_string()).into());
    }
    Err(ProviderError::api(context, format!("HTTP {}: {}", status.as_u16(), body.trim())).into())
}

/// True when the error chain holds a `NotFound`.
pub(crate) fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(
        peerpod_common::error::kind_of(err),
        Some(ProviderError::NotFound(_))
    )
}
