use crate::error::ProviderError;

pub const PODVM_NAME_PREFIX: &str = "podvm";

// "-" + up to 8 sandbox chars + "-"
const SUFFIX_RESERVE: usize = 10;

/// Lower-case and replace every char outside `[a-z0-9-]` with `-`.
pub fn sanitize(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' => c,
            _ => '-',
        })
        .collect()
}

/// Derive the guest-visible name `podvm-<pod>-<first 8 of sandbox>`.
///
/// Pattern rules:
/// - both segments are sanitised first
/// - when the name would exceed `max_len`, the pod segment is cut so the total fits
/// - `max_len == 0` disables the limit
/// - a `max_len` too small for the prefix and the sandbox suffix is an error
pub fn generate_instance_name(
    pod_name: &str,
    sandbox_id: &str,
    max_len: usize,
) -> Result<String, ProviderError> {
    let pod = sanitize(pod_name);
    let sandbox = sanitize(sandbox_id);

    let mut pod_len = pod.len();
    if max_len > 0 && PODVM_NAME_PREFIX.len() + pod_len + SUFFIX_RESERVE > max_len {
        pod_len = max_len
            .checked_sub(PODVM_NAME_PREFIX.len() + SUFFIX_RESERVE)
            .ok_or_else(|| {
                ProviderError::ConfigInvalid(format!(
                    "instance name limit {} is too small for prefix and sandbox suffix",
                    max_len
                ))
            })?;
    }

    let sandbox_len = sandbox.len().min(8);
    Ok(format!(
        "{}-{}-{}",
        PODVM_NAME_PREFIX,
        &pod[..pod_len],
        &sandbox[..sandbox_len]
    ))
}
