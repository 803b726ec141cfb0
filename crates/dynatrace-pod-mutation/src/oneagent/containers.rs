//! User container pass, shared by first admission and reinvocation

use k8s_openapi::api::core::v1::{Container, Namespace};
use tracing::info;

use crate::config::InjectionConfig;
use crate::oneagent::env;
use crate::oneagent::volumes;

/// Inject every container that is not injected yet; returns how many were
pub fn mutate_user_containers(
    containers: &mut [Container],
    namespace: &Namespace,
    config: &InjectionConfig,
    install_path: &str,
) -> usize {
    let mut mutated = 0;
    for container in containers.iter_mut().filter(|c| !env::is_injected(c)) {
        add_oneagent_to_container(container, namespace, config, install_path);
        mutated += 1;
    }
    mutated
}

fn add_oneagent_to_container(
    container: &mut Container,
    namespace: &Namespace,
    config: &InjectionConfig,
    install_path: &str,
) {
    info!(container = %container.name, "adding OneAgent to container");

    volumes::add_container_volume_mounts(container, install_path);
    env::add_deployment_metadata_env(container, config);
    env::add_preload_env(container, install_path);

    if let Some(zone) = config.network_zone.as_deref() {
        env::add_network_zone_env(container, zone);
    }

    if config.label_version_detection {
        env::add_version_detection_envs(container, namespace);
    }

    env::set_injected_env(container);
}
