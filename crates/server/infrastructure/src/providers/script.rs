//! Cluster script rendering and deployer image resolution.

use std::collections::BTreeMap;

use capi_server_domain::{ClusterConfig, LifecycleError};

/// Key of the rendered script inside the script secret.
pub const SCRIPT_KEY: &str = "script.sh";

const FULL_TEMPLATE: &str = include_str!("templates/kubevirt-create.sh");
/// Hosted control plane variant, used when the config has no control plane pool.
const KAMAJI_TEMPLATE: &str = include_str!("templates/kubevirt-kamaji-create.sh");

/// Piece of a template: literal text or a `{{placeholder}}` name.
#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Text(&'a str),
    Placeholder(&'a str),
}

/// Split `template` into literal text and placeholder markers, left to right.
/// An unterminated `{{` is kept as text.
fn segments(template: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                if start > 0 {
                    out.push(Segment::Text(&rest[..start]));
                }
                out.push(Segment::Placeholder(after[..end].trim()));
                rest = &after[end + 2..];
            }
            None => break,
        }
    }
    if !rest.is_empty() {
        out.push(Segment::Text(rest));
    }
    out
}

/// Fill every placeholder in one pass; inserted values are never rescanned.
fn fill(template: &str, values: &BTreeMap<&'static str, String>) -> Result<String, LifecycleError> {
    let mut script = String::with_capacity(template.len());
    for segment in segments(template) {
        match segment {
            Segment::Text(text) => script.push_str(text),
            Segment::Placeholder(name) => {
                let value = values.get(name).ok_or_else(|| {
                    LifecycleError::Script(format!("no value for placeholder '{}'", name))
                })?;
                script.push_str(value);
            }
        }
    }
    Ok(script)
}

fn script_values(config: &ClusterConfig, namespace: &str) -> Result<BTreeMap<&'static str, String>, LifecycleError> {
    let workers = config
        .primary_worker_pool()
        .ok_or_else(|| LifecycleError::Script("cluster config has no worker pool".to_string()))?;

    let mut values = BTreeMap::from([
        ("cluster_name", config.cluster_name.clone()),
        ("cluster_namespace", namespace.to_string()),
        ("capk_guest_k8s_version", config.kubernetes_version.clone()),
        ("worker_machine_count", workers.machine_count.to_string()),
        ("worker_machine_cpu", workers.cpu.to_string()),
        ("worker_machine_memory", workers.memory.to_string()),
        ("admin_cluster_kubeconfig_string", config.credential.kubeconfig.clone()),
    ]);
    if let Some(cp) = &config.control_plane {
        values.insert("controlplane_machine_count", cp.machine_count.to_string());
        values.insert("controlplane_machine_cpu", cp.cpu.to_string());
        values.insert("controlplane_machine_memory", cp.memory.to_string());
    }
    Ok(values)
}

/// Render the runner script for `config`, to run against `namespace`.
pub fn render_script(config: &ClusterConfig, namespace: &str) -> Result<String, LifecycleError> {
    let template = if config.control_plane.is_some() {
        FULL_TEMPLATE
    } else {
        KAMAJI_TEMPLATE
    };
    let values = script_values(config, namespace)?;
    fill(template, &values)
}

/// `major.minor` of a Kubernetes version such as `v1.31.2`.
pub fn version_key(kubernetes_version: &str) -> Result<String, LifecycleError> {
    let raw = kubernetes_version.trim().trim_start_matches('v');
    let version = semver::Version::parse(raw).map_err(|e| {
        LifecycleError::Image(format!(
            "invalid kubernetes version '{}': {}",
            kubernetes_version, e
        ))
    })?;
    Ok(format!("{}.{}", version.major, version.minor))
}

/// Deployer image for a Kubernetes version, falling back to `default_image`.
pub fn resolve_deployer_image(
    kubernetes_version: &str,
    images: &BTreeMap<String, String>,
    default_image: &str,
) -> Result<String, LifecycleError> {
    let key = version_key(kubernetes_version)?;
    match images.get(&key) {
        Some(image) => Ok(image.clone()),
        None if !default_image.is_empty() => Ok(default_image.to_string()),
        None => Err(LifecycleError::Image(format!(
            "no deployer image configured for kubernetes {}",
            key
        ))),
    }
}
