use crate::error::ProviderError;
use std::collections::BTreeMap;
use std::env;
use std::fs;

/// Parse `k=v,k2=v2` into a map. Whitespace around keys and values is trimmed.
pub fn parse_key_value_list(raw: &str) -> Result<BTreeMap<String, String>, ProviderError> {
    let mut out = BTreeMap::new();
    for pair in raw.split(',') {
        if pair.trim().is_empty() {
            continue;
        }
        let (k, v) = pair.split_once('=').ok_or_else(|| {
            ProviderError::ConfigInvalid(format!("invalid key-value pair: {}", pair))
        })?;
        let k = k.trim();
        if k.is_empty() {
            return Err(ProviderError::ConfigInvalid(format!(
                "invalid key-value pair: {}",
                pair
            )));
        }
        out.insert(k.to_string(), v.trim().to_string());
    }
    Ok(out)
}

/// Split a comma list, dropping empty entries.
pub fn parse_comma_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Resolve a secret: the given value when set, else the file named by `<env_name>_FILE`.
pub fn resolve_secret(value: &str, env_name: &str) -> Option<String> {
    let value = value.trim();
    if !value.is_empty() {
        return Some(value.to_string());
    }
    // Prefer *_FILE for secrets (Docker/K8s friendly)
    let path = env::var(format!("{}_FILE", env_name)).ok()?;
    fs::read_to_string(path.trim())
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Require a non-empty config value.
pub fn require(value: &str, what: &str) -> Result<(), ProviderError> {
    if value.trim().is_empty() {
        return Err(ProviderError::ConfigInvalid(format!("{} is empty", what)));
    }
    Ok(())
}
