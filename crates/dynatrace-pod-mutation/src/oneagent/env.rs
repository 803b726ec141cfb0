//! Env vars added to user containers

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, EnvVar, EnvVarSource, Namespace, ObjectFieldSelector};

use crate::config::InjectionConfig;

/// Marks a container as injected; never added twice
pub const INJECTED_ENV: &str = "DT_CM_INJECTED";
/// Deployment metadata reported by the agent
pub const DEPLOYMENT_METADATA_ENV: &str = "DT_DEPLOYMENT_METADATA";
/// Loads the agent into every process
pub const PRELOAD_ENV: &str = "LD_PRELOAD";
/// Network zone the agent connects through
pub const NETWORK_ZONE_ENV: &str = "DT_NETWORK_ZONE";

/// Release version of the workload
pub const RELEASE_VERSION_ENV: &str = "DT_RELEASE_VERSION";
/// Product the workload belongs to
pub const RELEASE_PRODUCT_ENV: &str = "DT_RELEASE_PRODUCT";
/// Release stage of the workload
pub const RELEASE_STAGE_ENV: &str = "DT_RELEASE_STAGE";
/// Build version of the workload
pub const RELEASE_BUILD_VERSION_ENV: &str = "DT_RELEASE_BUILD_VERSION";

/// Namespace annotation overriding the field path of [`RELEASE_VERSION_ENV`]
pub const MAPPING_VERSION: &str = "mapping.release.dynatrace.com/version";
/// Namespace annotation overriding the field path of [`RELEASE_PRODUCT_ENV`]
pub const MAPPING_PRODUCT: &str = "mapping.release.dynatrace.com/product";
/// Namespace annotation overriding the field path of [`RELEASE_STAGE_ENV`]
pub const MAPPING_STAGE: &str = "mapping.release.dynatrace.com/stage";
/// Namespace annotation overriding the field path of [`RELEASE_BUILD_VERSION_ENV`]
pub const MAPPING_BUILD_VERSION: &str = "mapping.release.dynatrace.com/build-version";

const DEFAULT_VERSION_FIELD: &str = "metadata.labels['app.kubernetes.io/version']";
const DEFAULT_PRODUCT_FIELD: &str = "metadata.labels['app.kubernetes.io/part-of']";

/// The container was already injected
pub fn is_injected(container: &Container) -> bool {
    has_env(container, INJECTED_ENV)
}

fn has_env(container: &Container, name: &str) -> bool {
    container
        .env
        .as_ref()
        .is_some_and(|env| env.iter().any(|e| e.name == name))
}

fn push_env(container: &mut Container, env: EnvVar) {
    container.env.get_or_insert_with(Vec::new).push(env);
}

fn value_env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Env var sourced from a pod field through the downward API
pub fn field_ref_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// `DT_DEPLOYMENT_METADATA`
pub fn add_deployment_metadata_env(container: &mut Container, config: &InjectionConfig) {
    let value = format!(
        "orchestration_tech={};script_version={};orchestrator_id={}",
        config.orchestration_tech(),
        config.operator_version,
        config.cluster.uid
    );
    push_env(container, value_env(DEPLOYMENT_METADATA_ENV, value));
}

/// `LD_PRELOAD` pointing at the process agent below `install_path`
pub fn add_preload_env(container: &mut Container, install_path: &str) {
    let library = format!(
        "{}/agent/lib64/liboneagentproc.so",
        install_path.trim_end_matches('/')
    );
    push_env(container, value_env(PRELOAD_ENV, library));
}

/// `DT_NETWORK_ZONE`
pub fn add_network_zone_env(container: &mut Container, zone: &str) {
    push_env(container, value_env(NETWORK_ZONE_ENV, zone));
}

/// Release env vars read from pod labels
///
/// Version and product map to the recommended `app.kubernetes.io` labels
/// unless the namespace names other field paths. Stage and build version are
/// only added when the namespace maps them. Env vars the container already
/// defines win.
pub fn add_version_detection_envs(container: &mut Container, namespace: &Namespace) {
    for (name, field_path) in version_field_mapping(namespace) {
        if has_env(container, name) {
            continue;
        }
        push_env(container, field_ref_env(name, &field_path));
    }
}

fn version_field_mapping(namespace: &Namespace) -> BTreeMap<&'static str, String> {
    let mut mapping = BTreeMap::from([
        (RELEASE_VERSION_ENV, DEFAULT_VERSION_FIELD.to_string()),
        (RELEASE_PRODUCT_ENV, DEFAULT_PRODUCT_FIELD.to_string()),
    ]);

    if let Some(annotations) = namespace.metadata.annotations.as_ref() {
        for (env, annotation) in [
            (RELEASE_VERSION_ENV, MAPPING_VERSION),
            (RELEASE_PRODUCT_ENV, MAPPING_PRODUCT),
            (RELEASE_STAGE_ENV, MAPPING_STAGE),
            (RELEASE_BUILD_VERSION_ENV, MAPPING_BUILD_VERSION),
        ] {
            if let Some(field_path) = annotations.get(annotation).filter(|p| !p.is_empty()) {
                mapping.insert(env, field_path.clone());
            }
        }
    }

    mapping
}

/// `DT_CM_INJECTED=true`, always the last env var added
pub fn set_injected_env(container: &mut Container) {
    push_env(container, value_env(INJECTED_ENV, "true"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{container, namespace, request};

    fn env_value<'a>(container: &'a Container, name: &str) -> Option<&'a EnvVar> {
        container
            .env
            .as_ref()
            .and_then(|env| env.iter().find(|e| e.name == name))
    }

    fn field_path(env: &EnvVar) -> Option<&str> {
        env.value_from
            .as_ref()
            .and_then(|v| v.field_ref.as_ref())
            .map(|f| f.field_path.as_str())
    }

    #[test]
    fn deployment_metadata_names_mode_version_and_cluster() {
        let req = request();
        let mut c = container("app", "web:1");
        add_deployment_metadata_env(&mut c, &req.config);
        assert_eq!(
            env_value(&c, DEPLOYMENT_METADATA_ENV).and_then(|e| e.value.as_deref()),
            Some(
                "orchestration_tech=Operator-application_monitoring;script_version=1.5.0;orchestrator_id=kube-system-uid"
            )
        );
    }

    #[test]
    fn preload_path_below_install_path() {
        let mut c = container("app", "web:1");
        add_preload_env(&mut c, "/opt/dynatrace/oneagent-paas/");
        assert_eq!(
            env_value(&c, PRELOAD_ENV).and_then(|e| e.value.as_deref()),
            Some("/opt/dynatrace/oneagent-paas/agent/lib64/liboneagentproc.so")
        );
    }

    #[test]
    fn version_detection_defaults() {
        let mut c = container("app", "web:1");
        add_version_detection_envs(&mut c, &namespace());

        assert_eq!(
            env_value(&c, RELEASE_VERSION_ENV).and_then(field_path),
            Some(DEFAULT_VERSION_FIELD)
        );
        assert_eq!(
            env_value(&c, RELEASE_PRODUCT_ENV).and_then(field_path),
            Some(DEFAULT_PRODUCT_FIELD)
        );
        assert!(env_value(&c, RELEASE_STAGE_ENV).is_none());
        assert!(env_value(&c, RELEASE_BUILD_VERSION_ENV).is_none());
    }

    #[test]
    fn namespace_mapping_overrides_and_extends() {
        let mut ns = namespace();
        ns.metadata.annotations = Some(BTreeMap::from([
            (
                MAPPING_VERSION.to_string(),
                "metadata.labels['version']".to_string(),
            ),
            (
                MAPPING_STAGE.to_string(),
                "metadata.labels['stage']".to_string(),
            ),
        ]));
        let mut c = container("app", "web:1");
        add_version_detection_envs(&mut c, &ns);

        assert_eq!(
            env_value(&c, RELEASE_VERSION_ENV).and_then(field_path),
            Some("metadata.labels['version']")
        );
        assert_eq!(
            env_value(&c, RELEASE_STAGE_ENV).and_then(field_path),
            Some("metadata.labels['stage']")
        );
    }

    #[test]
    fn existing_env_vars_are_not_overridden() {
        let mut c = container("app", "web:1");
        c.env = Some(vec![value_env(RELEASE_VERSION_ENV, "2.0.0")]);
        add_version_detection_envs(&mut c, &namespace());

        let versions: Vec<_> = c
            .env
            .as_ref()
            .expect("env")
            .iter()
            .filter(|e| e.name == RELEASE_VERSION_ENV)
            .collect();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].value.as_deref(), Some("2.0.0"));
    }

    #[test]
    fn injected_marker() {
        let mut c = container("app", "web:1");
        assert!(!is_injected(&c));
        set_injected_env(&mut c);
        assert!(is_injected(&c));
    }
}
