//! Volumes and mounts for code modules
//!
//! The bin volume carries the agent binaries (CSI or emptyDir), the config
//! volume carries per-container configuration written by the bootstrapper,
//! and the input volume projects the replicated bootstrapper secrets.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    CSIVolumeSource, Container, EmptyDirVolumeSource, PodSpec, ProjectedVolumeSource,
    SecretProjection, Volume, VolumeMount, VolumeProjection,
};

use crate::replicate::{CERTS_SECRET_NAME, CONFIG_SECRET_NAME};

/// Volume holding the code modules
pub const BIN_VOLUME_NAME: &str = "dynatrace-codemodules";
/// Volume holding bootstrapper output per container
pub const CONFIG_VOLUME_NAME: &str = "dynatrace-config";
/// Volume projecting the bootstrapper input secrets
pub const INPUT_VOLUME_NAME: &str = "dynatrace-input";

/// Where the install container writes the code modules
pub const BIN_INIT_MOUNT_PATH: &str = "/mnt/bin";
/// Where the install container writes container configuration
pub const CONFIG_INIT_MOUNT_PATH: &str = "/mnt/config";
/// Where the install container reads its input
pub const INPUT_INIT_MOUNT_PATH: &str = "/mnt/input";

/// Where user containers see their configuration
pub const CONFIG_CONTAINER_MOUNT_PATH: &str = "/var/lib/dynatrace/oneagent";

/// Driver name of the OneAgent CSI driver
pub const CSI_DRIVER_NAME: &str = "csi.oneagent.dynatrace.com";

fn add_volume(spec: &mut PodSpec, volume: Volume) {
    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    if !volumes.iter().any(|v| v.name == volume.name) {
        volumes.push(volume);
    }
}

/// Bin volume served by the CSI driver
pub fn add_csi_bin_volume(spec: &mut PodSpec, dynakube: &str, max_retry_timeout: &str) {
    add_volume(
        spec,
        Volume {
            name: BIN_VOLUME_NAME.to_string(),
            csi: Some(CSIVolumeSource {
                driver: CSI_DRIVER_NAME.to_string(),
                read_only: Some(true),
                volume_attributes: Some(BTreeMap::from([
                    ("mode".to_string(), "app".to_string()),
                    ("dynakube".to_string(), dynakube.to_string()),
                    ("maxRetryTimeout".to_string(), max_retry_timeout.to_string()),
                ])),
                ..Default::default()
            }),
            ..Default::default()
        },
    );
}

/// Bin volume the install container fills
pub fn add_ephemeral_bin_volume(spec: &mut PodSpec) {
    add_volume(spec, empty_dir(BIN_VOLUME_NAME));
}

/// Config and input volumes
pub fn add_input_volumes(spec: &mut PodSpec) {
    add_volume(spec, empty_dir(CONFIG_VOLUME_NAME));
    add_volume(
        spec,
        Volume {
            name: INPUT_VOLUME_NAME.to_string(),
            projected: Some(ProjectedVolumeSource {
                sources: Some(vec![
                    secret_projection(CONFIG_SECRET_NAME, false),
                    secret_projection(CERTS_SECRET_NAME, true),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        },
    );
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn secret_projection(name: &str, optional: bool) -> VolumeProjection {
    VolumeProjection {
        secret: Some(SecretProjection {
            name: name.to_string(),
            optional: Some(optional),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str, read_only: bool, sub_path: Option<String>) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: read_only.then_some(true),
        sub_path,
        ..Default::default()
    }
}

/// Mounts of the install container
pub fn add_init_volume_mounts(install: &mut Container) {
    install.volume_mounts.get_or_insert_with(Vec::new).extend([
        mount(BIN_VOLUME_NAME, BIN_INIT_MOUNT_PATH, false, None),
        mount(CONFIG_VOLUME_NAME, CONFIG_INIT_MOUNT_PATH, false, None),
        mount(INPUT_VOLUME_NAME, INPUT_INIT_MOUNT_PATH, true, None),
    ]);
}

/// Mounts of an injected user container
pub fn add_container_volume_mounts(container: &mut Container, install_path: &str) {
    let config_sub_path = format!("{}/oneagent", container.name);
    container.volume_mounts.get_or_insert_with(Vec::new).extend([
        mount(BIN_VOLUME_NAME, install_path, true, None),
        mount(
            CONFIG_VOLUME_NAME,
            CONFIG_CONTAINER_MOUNT_PATH,
            false,
            Some(config_sub_path),
        ),
    ]);
}
