use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use clap::Parser;
use peerpod_common::cloudinit::{CloudConfig, WriteFile};
use peerpod_common::error::kind_of;
use peerpod_common::{Instance, InstanceTypeSpec, ProviderError};
use peerpod_providers::SharedProvider;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug, Clone)]
#[command(name = "peerpod-adaptor", about = "Pod VM lifecycle adaptor", version)]
pub struct Cli {
    /// Back-end to load, e.g. byom or alibabacloud
    #[arg(long, env = "CLOUD_PROVIDER", default_value = "")]
    pub provider: String,

    #[arg(long, env = "ADAPTOR_LISTEN", default_value = "127.0.0.1:15151")]
    pub listen: SocketAddr,

    /// Print the compiled-in back-ends and exit
    #[arg(long)]
    pub list_providers: bool,

    /// Flags for the back-end, after `--`
    #[arg(last = true)]
    pub provider_args: Vec<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub provider: SharedProvider,
    /// Parent of every request's cancellation token; fired on shutdown.
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/instances", post(create_instance))
        .route("/instances/:id", delete(delete_instance))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    pub pod_name: String,
    pub sandbox_id: String,
    #[serde(default)]
    pub spec: InstanceTypeSpec,
    /// Rendered into the VM's cloud-config `write_files`.
    #[serde(default)]
    pub files: Vec<WriteFile>,
}

async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "provider": state.provider.name() }))
}

async fn create_instance(
    State(state): State<AppState>,
    Json(req): Json<CreateInstanceRequest>,
) -> Result<(StatusCode, Json<Instance>), ApiError> {
    let ctx = state.shutdown.child_token();
    let cloud_config = CloudConfig {
        write_files: req.files,
    };
    info!("create instance for pod {} sandbox {}", req.pod_name, req.sandbox_id);
    let instance = state
        .provider
        .create_instance(&ctx, &req.pod_name, &req.sandbox_id, &cloud_config, &req.spec)
        .await?;
    info!("instance {} created for pod {}", instance.id, req.pod_name);
    Ok((StatusCode::CREATED, Json(instance)))
}

async fn delete_instance(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    let ctx = state.shutdown.child_token();
    state.provider.delete_instance(&ctx, &id).await?;
    info!("instance {} deleted", id);
    Ok(StatusCode::NO_CONTENT)
}

/// Provider failure rendered as JSON with a status derived from its kind.
pub struct ApiError(anyhow::Error);

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError(err)
    }
}

pub fn status_for(err: &anyhow::Error) -> StatusCode {
    match kind_of(err) {
        Some(ProviderError::PoolExhausted) => StatusCode::CONFLICT,
        Some(ProviderError::UnsupportedInstanceType(_)) | Some(ProviderError::NoInstanceTypeFits { .. }) => {
            StatusCode::BAD_REQUEST
        }
        Some(ProviderError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let kind = kind_of(&self.0).map(|k| k.kind()).unwrap_or("internal");
        if status.is_server_error() {
            error!("request failed: {:#}", self.0);
        }
        (
            status,
            Json(json!({ "error": format!("{:#}", self.0), "kind": kind })),
        )
            .into_response()
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use peerpod_common::cloudinit::CloudConfigGenerator;
    use peerpod_providers::Provider;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tower::ServiceExt;

    #[derive(Default)]
    struct Recorder {
        user_data: Mutex<Vec<String>>,
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Provider for Recorder {
        async fn create_instance(
            &self,
            _ctx: &CancellationToken,
            pod_name: &str,
            sandbox_id: &str,
            cloud_config: &dyn CloudConfigGenerator,
            spec: &InstanceTypeSpec,
        ) -> anyhow::Result<Instance> {
            match pod_name {
                "exhausted" => return Err(ProviderError::PoolExhausted.into()),
                "slow" => {
                    return Err(ProviderError::Timeout {
                        what: "vm".to_string(),
                        timeout: Duration::from_secs(1),
                    }
                    .into())
                }
                "broken" => return Err(anyhow::anyhow!("cloud said no")),
                _ => {}
            }
            if spec.instance_type == "huge" {
                return Err(ProviderError::UnsupportedInstanceType(spec.instance_type.clone()).into());
            }
            self.user_data.lock().unwrap().push(cloud_config.generate()?);
            Ok(Instance::new(
                format!("vm-{}", sandbox_id),
                format!("podvm-{}", pod_name),
                vec!["10.0.0.9".parse().unwrap()],
            ))
        }

        async fn delete_instance(&self, _ctx: &CancellationToken, instance_id: &str) -> anyhow::Result<()> {
            self.deleted.lock().unwrap().push(instance_id.to_string());
            Ok(())
        }

        async fn teardown(&self) -> anyhow::Result<()> {
            Ok(())
        }

        fn config_verifier(&self) -> anyhow::Result<()> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recorder"
        }
    }

    fn app() -> (Router, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let state = AppState {
            provider: recorder.clone(),
            shutdown: CancellationToken::new(),
        };
        (router(state), recorder)
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn create(body: serde_json::Value) -> Request<Body> {
        Request::post("/instances")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn healthz_names_the_provider() {
        let (app, _) = app();
        let resp = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, json!({ "status": "ok", "provider": "recorder" }));
    }

    #[tokio::test]
    async fn create_renders_files_into_user_data() {
        let (app, recorder) = app();
        let resp = app
            .oneshot(create(json!({
                "pod_name": "web",
                "sandbox_id": "abc",
                "files": [{ "path": "/run/peerpod/daemon.json", "content": "{}" }]
            })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = body_json(resp).await;
        assert_eq!(body["id"], "vm-abc");
        assert_eq!(body["ips"], json!(["10.0.0.9"]));
        assert!(body.get("pool_metadata").is_none());
        assert!(recorder.user_data.lock().unwrap()[0].contains("/run/peerpod/daemon.json"));
    }

    #[tokio::test]
    async fn error_kinds_map_to_statuses() {
        let cases = [
            (json!({ "pod_name": "exhausted", "sandbox_id": "s" }), StatusCode::CONFLICT, "pool-exhausted"),
            (json!({ "pod_name": "slow", "sandbox_id": "s" }), StatusCode::GATEWAY_TIMEOUT, "timeout"),
            (json!({ "pod_name": "broken", "sandbox_id": "s" }), StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            (
                json!({ "pod_name": "web", "sandbox_id": "s", "spec": { "instance_type": "huge" } }),
                StatusCode::BAD_REQUEST,
                "unsupported-instance-type",
            ),
        ];
        for (body, status, kind) in cases {
            let (app, _) = app();
            let resp = app.oneshot(create(body)).await.unwrap();
            assert_eq!(resp.status(), status);
            assert_eq!(body_json(resp).await["kind"], kind);
        }
    }

    #[tokio::test]
    async fn delete_returns_no_content() {
        let (app, recorder) = app();
        let resp = app
            .oneshot(Request::delete("/instances/vm-abc").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(*recorder.deleted.lock().unwrap(), vec!["vm-abc"]);
    }

    #[test]
    fn cli_forwards_trailing_args() {
        let cli = Cli::try_parse_from([
            "peerpod-adaptor",
            "--provider",
            "byom",
            "--",
            "--vm-pool-ips",
            "10.0.0.1-10.0.0.3",
        ])
        .unwrap();
        assert_eq!(cli.provider, "byom");
        assert_eq!(cli.provider_args, vec!["--vm-pool-ips", "10.0.0.1-10.0.0.3"]);
    }
}
