//! Attributes handed to the bootstrapper through install container arguments
//!
//! Container attributes describe each user container (name and image) as a
//! JSON object. Pod attributes are `key=value` pairs; pod name, uid and node
//! are resolved at runtime through env vars set on the install container.

use std::collections::BTreeMap;

use dynatrace_common::{Error, Result};
use k8s_openapi::api::core::v1::Container;
use serde::Serialize;

use crate::args::{self, Arg};
use crate::config::InjectionConfig;
use crate::oneagent::env::is_injected;

/// Env var holding the pod name in the install container
pub const K8S_POD_NAME_ENV: &str = "K8S_PODNAME";
/// Env var holding the pod uid in the install container
pub const K8S_POD_UID_ENV: &str = "K8S_PODUID";
/// Env var holding the node name in the install container
pub const K8S_NODE_NAME_ENV: &str = "K8S_NODE_NAME";

/// Attribute key for the workload kind
pub const WORKLOAD_KIND_KEY: &str = "k8s.workload.kind";
/// Attribute key for the workload name
pub const WORKLOAD_NAME_KEY: &str = "k8s.workload.name";

/// Parts of an image reference
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageInfo {
    /// Registry host, empty when the reference has none
    pub registry: String,
    /// Repository path
    pub repository: String,
    /// Tag, empty when absent
    pub tag: String,
    /// Digest, empty when absent
    pub digest: String,
}

impl ImageInfo {
    /// Split `registry/repository:tag@digest`
    ///
    /// The first path component is a registry only if it looks like a host
    /// (contains `.` or `:`, or is `localhost`).
    pub fn parse(image: &str) -> Self {
        let (rest, digest) = match image.split_once('@') {
            Some((rest, digest)) => (rest, digest.to_string()),
            None => (image, String::new()),
        };

        let last_slash = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match rest[last_slash..].rfind(':') {
            Some(i) => (
                &rest[..last_slash + i],
                rest[last_slash + i + 1..].to_string(),
            ),
            None => (rest, String::new()),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, path))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), path.to_string())
            }
            _ => (String::new(), name.to_string()),
        };

        Self {
            registry,
            repository,
            tag,
            digest,
        }
    }
}

/// Attributes of one user container
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ContainerAttributes {
    /// Container name
    #[serde(rename = "k8s.container.name")]
    pub container_name: String,
    /// Image registry
    #[serde(rename = "container_image.registry", skip_serializing_if = "String::is_empty")]
    pub registry: String,
    /// Image repository
    #[serde(rename = "container_image.repository", skip_serializing_if = "String::is_empty")]
    pub repository: String,
    /// Image tag
    #[serde(rename = "container_image.tags", skip_serializing_if = "String::is_empty")]
    pub tag: String,
    /// Image digest
    #[serde(rename = "container_image.digest", skip_serializing_if = "String::is_empty")]
    pub digest: String,
}

impl ContainerAttributes {
    /// Attributes describing `container`
    pub fn from_container(container: &Container) -> Self {
        let image = ImageInfo::parse(container.image.as_deref().unwrap_or_default());
        Self {
            container_name: container.name.clone(),
            registry: image.registry,
            repository: image.repository,
            tag: image.tag,
            digest: image.digest,
        }
    }

    fn to_arg(&self) -> Result<Arg> {
        let json = serde_json::to_string(self).map_err(|e| {
            Error::serialization_for_kind("ContainerAttributes", e.to_string())
        })?;
        Ok(Arg::new(args::ATTRIBUTE_CONTAINER, json))
    }
}

/// Add one `--attribute-container` per user container not injected yet
///
/// Returns how many containers were described.
pub fn add_container_attributes(
    install: &mut Container,
    containers: &[Container],
) -> Result<usize> {
    let new_args = containers
        .iter()
        .filter(|c| !is_injected(c))
        .map(|c| ContainerAttributes::from_container(c).to_arg())
        .collect::<Result<Vec<_>>>()?;

    let count = new_args.len();
    if count > 0 {
        args::append(&mut install.args, new_args);
    }
    Ok(count)
}

/// `--attribute=key=value` for every pair with a non-empty value
pub fn attribute_args<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Vec<Arg> {
    pairs
        .into_iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| Arg::new(args::ATTRIBUTE, format!("{}={}", key, value)))
        .collect()
}

/// Pod and cluster identity
pub fn add_pod_attributes(install: &mut Container, namespace: &str, config: &InjectionConfig) {
    let pod_name = env_ref(K8S_POD_NAME_ENV);
    let pod_uid = env_ref(K8S_POD_UID_ENV);
    let node_name = env_ref(K8S_NODE_NAME_ENV);

    let pairs = [
        ("k8s.pod.name", pod_name.as_str()),
        ("k8s.pod.uid", pod_uid.as_str()),
        ("k8s.node.name", node_name.as_str()),
        ("k8s.namespace.name", namespace),
        ("k8s.cluster.uid", config.cluster.uid.as_str()),
        ("k8s.cluster.name", config.cluster.name.as_str()),
        ("dt.entity.kubernetes_cluster", config.cluster.entity_id.as_str()),
    ];
    args::append(&mut install.args, attribute_args(pairs));
}

/// Workload identity and user-defined attributes
pub fn add_workload_attributes(
    install: &mut Container,
    kind: &str,
    name: &str,
    user_defined: &BTreeMap<String, String>,
) {
    let pairs = [(WORKLOAD_KIND_KEY, kind), (WORKLOAD_NAME_KEY, name)]
        .into_iter()
        .chain(user_defined.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    args::append(&mut install.args, attribute_args(pairs));
}

fn env_ref(name: &str) -> String {
    format!("$({})", name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{container, install_container, request};
    use k8s_openapi::api::core::v1::EnvVar;

    #[test]
    fn image_reference_parts() {
        assert_eq!(
            ImageInfo::parse("registry.example.com:5000/shop/web:1.2@sha256:abc"),
            ImageInfo {
                registry: "registry.example.com:5000".to_string(),
                repository: "shop/web".to_string(),
                tag: "1.2".to_string(),
                digest: "sha256:abc".to_string(),
            }
        );
        assert_eq!(
            ImageInfo::parse("nginx"),
            ImageInfo {
                repository: "nginx".to_string(),
                ..Default::default()
            }
        );
        assert_eq!(
            ImageInfo::parse("library/redis:7"),
            ImageInfo {
                repository: "library/redis".to_string(),
                tag: "7".to_string(),
                ..Default::default()
            }
        );
        assert_eq!(
            ImageInfo::parse("localhost/app@sha256:def"),
            ImageInfo {
                registry: "localhost".to_string(),
                repository: "app".to_string(),
                digest: "sha256:def".to_string(),
                ..Default::default()
            }
        );
    }

    #[test]
    fn container_attributes_skip_injected_containers() {
        let mut install = install_container();
        let mut injected = container("sidecar", "envoy:1.30");
        injected.env = Some(vec![EnvVar {
            name: "DT_CM_INJECTED".to_string(),
            value: Some("true".to_string()),
            ..Default::default()
        }]);
        let containers = vec![container("app", "registry.example.com/shop/web:1.2"), injected];

        let count = add_container_attributes(&mut install, &containers).expect("attributes");
        assert_eq!(count, 1);

        let args = install.args.expect("args");
        let attr = args
            .iter()
            .find_map(|a| a.strip_prefix("--attribute-container="))
            .expect("container attribute");
        let json: serde_json::Value = serde_json::from_str(attr).expect("json");
        assert_eq!(json["k8s.container.name"], "app");
        assert_eq!(json["container_image.registry"], "registry.example.com");
        assert_eq!(json["container_image.repository"], "shop/web");
        assert_eq!(json["container_image.tags"], "1.2");
        assert!(json.get("container_image.digest").is_none());
    }

    #[test]
    fn nothing_new_leaves_args_untouched() {
        let mut install = install_container();
        let before = install.args.clone();
        assert_eq!(add_container_attributes(&mut install, &[]).expect("attributes"), 0);
        assert_eq!(install.args, before);
    }

    #[test]
    fn pod_attributes_use_env_refs_and_skip_empty_values() {
        let mut req = request();
        req.config.cluster.name = String::new();
        let mut install = install_container();
        add_pod_attributes(&mut install, "shop", &req.config);

        let args = install.args.expect("args");
        assert!(args.contains(&"--attribute=k8s.pod.name=$(K8S_PODNAME)".to_string()));
        assert!(args.contains(&"--attribute=k8s.pod.uid=$(K8S_PODUID)".to_string()));
        assert!(args.contains(&"--attribute=k8s.node.name=$(K8S_NODE_NAME)".to_string()));
        assert!(args.contains(&"--attribute=k8s.namespace.name=shop".to_string()));
        assert!(args.contains(&"--attribute=k8s.cluster.uid=kube-system-uid".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--attribute=k8s.cluster.name")));
    }

    #[test]
    fn workload_attributes_include_user_defined() {
        let mut install = install_container();
        let user_defined = BTreeMap::from([("cost-center".to_string(), "42".to_string())]);
        add_workload_attributes(&mut install, "deployment", "web", &user_defined);

        let args = install.args.expect("args");
        assert!(args.contains(&"--attribute=k8s.workload.kind=deployment".to_string()));
        assert!(args.contains(&"--attribute=k8s.workload.name=web".to_string()));
        assert!(args.contains(&"--attribute=cost-center=42".to_string()));
    }
}
