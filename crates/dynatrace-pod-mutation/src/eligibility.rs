//! Whether a pod is handled by this webhook at all
//!
//! All predicates are pure functions of the request; nothing is cached.

use std::collections::BTreeMap;

use dynatrace_common::crd::selector_matches;
use k8s_openapi::api::core::v1::Namespace;

use crate::annotations::{PodOverrides, VolumeType};
use crate::config::InjectionConfig;
use crate::request::MutationRequest;

/// The node-image-pull pipeline handles this pod
///
/// Requires the node-image-pull flag, an enabled agent and an ephemeral
/// code-modules volume.
pub fn is_enabled(request: &MutationRequest) -> bool {
    request.config.node_image_pull
        && is_agent_enabled(&request.annotations.overrides, &request.config, &request.namespace)
        && effective_volume_type(&request.annotations.overrides, &request.config)
            == VolumeType::Ephemeral
}

/// Code modules should be injected into this pod
///
/// The pod opts in (defaults to automatic injection), the namespace matches
/// the selector and the DynaKube configures an injection mode.
pub fn is_agent_enabled(
    overrides: &PodOverrides,
    config: &InjectionConfig,
    namespace: &Namespace,
) -> bool {
    let enabled_on_pod = overrides.inject.unwrap_or(config.automatic_injection);
    enabled_on_pod
        && config.app_injection_enabled
        && selector_matches(config.namespace_selector.as_ref(), namespace_labels(namespace))
}

/// Workload metadata should be attached to this pod
pub fn is_metadata_enabled(
    overrides: &PodOverrides,
    config: &InjectionConfig,
    namespace: &Namespace,
) -> bool {
    let enabled_on_pod = overrides
        .metadata_inject
        .unwrap_or(config.automatic_injection);
    enabled_on_pod
        && config.metadata_enrichment_enabled
        && selector_matches(
            config.metadata_namespace_selector.as_ref(),
            namespace_labels(namespace),
        )
}

/// Volume type from the pod, else CSI when the driver is installed, else ephemeral
pub fn effective_volume_type(overrides: &PodOverrides, config: &InjectionConfig) -> VolumeType {
    match &overrides.volume_type {
        Some(volume_type) => volume_type.clone(),
        None if config.csi_driver_available => VolumeType::Csi,
        None => VolumeType::Ephemeral,
    }
}

/// Code modules come from the CSI driver
pub fn is_csi_volume(overrides: &PodOverrides, config: &InjectionConfig) -> bool {
    effective_volume_type(overrides, config) == VolumeType::Csi
}

/// The install container image extracts itself instead of downloading
pub fn is_self_extracting(config: &InjectionConfig, is_csi: bool) -> bool {
    config.node_image_pull && !is_csi
}

fn namespace_labels(namespace: &Namespace) -> &BTreeMap<String, String> {
    static EMPTY: BTreeMap<String, String> = BTreeMap::new();
    namespace.metadata.labels.as_ref().unwrap_or(&EMPTY)
}
