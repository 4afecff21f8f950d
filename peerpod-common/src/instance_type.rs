use crate::error::ProviderError;
use crate::{InstanceTypeRecord, InstanceTypeSpec};
use tracing::info;

/// Sort shapes ascending on (vCPU, memory, GPU count), ties broken by name.
pub fn sort_instance_types(mut records: Vec<InstanceTypeRecord>) -> Vec<InstanceTypeRecord> {
    records.sort_by(|a, b| {
        (a.vcpus, a.memory, a.gpus, a.name.as_str()).cmp(&(b.vcpus, b.memory, b.gpus, b.name.as_str()))
    });
    records
}

/// Pick the instance type for a pod VM.
///
/// - An explicit `spec.instance_type` must be in `supported` (an empty shortlist
///   only admits the default).
/// - Otherwise, when both vCPU and memory are requested, the first shape of the
///   sorted list covering vCPU, memory and GPU wins.
/// - Otherwise the default.
pub fn select_instance_type_to_use(
    spec: &InstanceTypeSpec,
    sorted: &[InstanceTypeRecord],
    supported: &[String],
    default_type: &str,
) -> Result<String, ProviderError> {
    if !spec.instance_type.is_empty() {
        let allowed = if supported.is_empty() {
            spec.instance_type == default_type
        } else {
            supported.iter().any(|t| t == &spec.instance_type)
        };
        if !allowed {
            return Err(ProviderError::UnsupportedInstanceType(
                spec.instance_type.clone(),
            ));
        }
        info!(
            "instance type selected from annotation: {}",
            spec.instance_type
        );
        return Ok(spec.instance_type.clone());
    }

    if spec.vcpus > 0 && spec.memory > 0 {
        let fit = sorted
            .iter()
            .find(|r| r.vcpus >= spec.vcpus && r.memory >= spec.memory && r.gpus >= spec.gpus)
            .ok_or(ProviderError::NoInstanceTypeFits {
                vcpus: spec.vcpus,
                memory: spec.memory,
                gpus: spec.gpus,
            })?;
        info!(
            "instance type selected from vcpu/memory/gpu request: {} ({}x{}MiB, {} gpu)",
            fit.name, fit.vcpus, fit.memory, fit.gpus
        );
        return Ok(fit.name.clone());
    }

    info!("using default instance type {}", default_type);
    Ok(default_type.to_string())
}

/// Validate a type name for providers that carry no shape list.
///
/// Empty means default; a non-default type needs a non-empty shortlist that contains it.
pub fn verify_cloud_instance_type(
    instance_type: &str,
    supported: &[String],
    default_type: &str,
) -> Result<String, ProviderError> {
    if instance_type.is_empty() {
        return Ok(default_type.to_string());
    }
    if supported.is_empty() && instance_type != default_type {
        return Err(ProviderError::UnsupportedInstanceType(format!(
            "{} (not the default {} and no supported list configured)",
            instance_type, default_type
        )));
    }
    if !supported.is_empty() && !supported.iter().any(|t| t == instance_type) {
        return Err(ProviderError::UnsupportedInstanceType(
            instance_type.to_string(),
        ));
    }
    Ok(instance_type.to_string())
}
