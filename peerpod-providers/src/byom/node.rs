use peerpod_common::ProviderError;
use std::env;
use std::fs;
use std::path::Path;
use tracing::info;

pub const NODE_NAME_ENV: &str = "NODE_NAME";
pub const NODE_NAME_FILE: &str = "/etc/podinfo/nodename";
pub const HOSTNAME_FILE: &str = "/etc/hostname";

pub const SERVICE_ACCOUNT_NAMESPACE_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";
pub const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";
pub const DEFAULT_NAMESPACE: &str = "confidential-containers-system";

/// Node this adaptor runs on: `NODE_NAME`, then the downward-API file, then the hostname.
pub fn current_node_name() -> Result<String, ProviderError> {
    node_name_from(
        env::var(NODE_NAME_ENV).ok(),
        &[Path::new(NODE_NAME_FILE), Path::new(HOSTNAME_FILE)],
    )
}

pub(crate) fn node_name_from(env_value: Option<String>, files: &[&Path]) -> Result<String, ProviderError> {
    if let Some(name) = non_empty(env_value) {
        info!("node name detected from environment: {}", name);
        return Ok(name);
    }
    for file in files {
        if let Some(name) = non_empty(fs::read_to_string(file).ok()) {
            info!("node name detected from {}: {}", file.display(), name);
            return Ok(name);
        }
    }
    Err(ProviderError::NodeNameDetection(format!(
        "tried env var {} and files {}",
        NODE_NAME_ENV,
        files
            .iter()
            .map(|f| f.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    )))
}

/// Namespace holding the pool state: service-account file, then `POD_NAMESPACE`, then the default.
pub fn current_namespace() -> String {
    namespace_from(Path::new(SERVICE_ACCOUNT_NAMESPACE_FILE), env::var(POD_NAMESPACE_ENV).ok())
}

pub(crate) fn namespace_from(file: &Path, env_value: Option<String>) -> String {
    let detected = non_empty(fs::read_to_string(file).ok()).or_else(|| non_empty(env_value));
    match detected {
        Some(ns) => {
            info!("detected current namespace: {}", ns);
            ns
        }
        None => {
            info!("using default namespace: {}", DEFAULT_NAMESPACE);
            DEFAULT_NAMESPACE.to_string()
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_name_cascade() {
        let dir = tempfile::tempdir().unwrap();
        let podinfo = dir.path().join("nodename");
        let hostname = dir.path().join("hostname");
        fs::write(&hostname, "host-1\n").unwrap();

        let files = [podinfo.as_path(), hostname.as_path()];
        assert_eq!(node_name_from(Some(" env-node ".into()), &files).unwrap(), "env-node");
        assert_eq!(node_name_from(Some("".into()), &files).unwrap(), "host-1");

        fs::write(&podinfo, "worker-7").unwrap();
        assert_eq!(node_name_from(None, &files).unwrap(), "worker-7");
    }

    #[test]
    fn node_name_fails_when_nothing_found() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let blank = dir.path().join("blank");
        fs::write(&blank, "  \n").unwrap();
        let err = node_name_from(None, &[missing.as_path(), blank.as_path()]).unwrap_err();
        assert_eq!(err.kind(), "node-name-detection-failed");
    }

    #[test]
    fn namespace_cascade() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("namespace");
        assert_eq!(namespace_from(&file, None), DEFAULT_NAMESPACE);
        assert_eq!(namespace_from(&file, Some("from-env".into())), "from-env");
        fs::write(&file, "peer-pods\n").unwrap();
        assert_eq!(namespace_from(&file, Some("from-env".into())), "peer-pods");
    }
}
