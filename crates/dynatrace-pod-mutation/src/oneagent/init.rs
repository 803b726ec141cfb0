//! Install container construction
//!
//! The install container runs the bootstrapper shipped in the code-modules
//! image. It copies (or extracts, or downloads) the agent into the bin volume
//! and writes per-container configuration into the config volume.

use dynatrace_common::{Error, Result};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, PodSecurityContext, PodSpec, SeccompProfile, SecurityContext,
};
use tracing::debug;

use crate::annotations::PodOverrides;
use crate::args::{self, Arg};
use crate::attributes::{K8S_NODE_NAME_ENV, K8S_POD_NAME_ENV, K8S_POD_UID_ENV};
use crate::config::InjectionConfig;
use crate::eligibility::{is_csi_volume, is_self_extracting};
use crate::oneagent::env::field_ref_env;
use crate::oneagent::volumes;
use crate::INSTALL_CONTAINER_NAME;

/// Folder inside the code-modules image that holds the agent
pub const AGENT_CODE_MODULE_SOURCE: &str = "/opt/dynatrace/oneagent";

/// User and group used when neither pod nor container set one
pub const DEFAULT_USER: i64 = 1001;

const ROOT_ID: i64 = 0;

/// Install container before any pod-specific arguments
pub fn base_install_container(spec: &PodSpec, config: &InjectionConfig) -> Container {
    Container {
        name: INSTALL_CONTAINER_NAME.to_string(),
        image: config.code_modules_image.clone(),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args: Some(vec![args::BOOTSTRAP_COMMAND.to_string()]),
        env: Some(vec![
            field_ref_env(K8S_POD_NAME_ENV, "metadata.name"),
            field_ref_env(K8S_POD_UID_ENV, "metadata.uid"),
            field_ref_env(K8S_NODE_NAME_ENV, "spec.nodeName"),
        ]),
        resources: config.init_resources.clone(),
        security_context: Some(security_context(spec, config.is_openshift)),
        ..Default::default()
    }
}

/// Restricted security context matching the user of the first container
///
/// OpenShift assigns users per namespace, so no user or group is set there.
pub fn security_context(spec: &PodSpec, is_openshift: bool) -> SecurityContext {
    let mut ctx = SecurityContext {
        read_only_root_filesystem: Some(true),
        allow_privilege_escalation: Some(false),
        privileged: Some(false),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    };

    if is_openshift {
        return ctx;
    }

    let pod_ctx: Option<&PodSecurityContext> = spec.security_context.as_ref();
    let container_ctx = spec
        .containers
        .first()
        .and_then(|c| c.security_context.as_ref());

    let user = container_ctx
        .and_then(|c| c.run_as_user)
        .or(pod_ctx.and_then(|p| p.run_as_user))
        .unwrap_or(DEFAULT_USER);
    let group = container_ctx
        .and_then(|c| c.run_as_group)
        .or(pod_ctx.and_then(|p| p.run_as_group))
        .unwrap_or(DEFAULT_USER);

    ctx.run_as_user = Some(user);
    ctx.run_as_group = Some(group);
    ctx.run_as_non_root = Some(user != ROOT_ID && group != ROOT_ID);
    ctx
}

/// Add volumes to the pod and arguments and mounts to the install container
///
/// Fails when full-stack mode has no tenant; arguments added before that
/// point stay on the container.
pub fn configure_install_container(
    install: &mut Container,
    spec: &mut PodSpec,
    config: &InjectionConfig,
    overrides: &PodOverrides,
) -> Result<()> {
    let is_csi = is_csi_volume(overrides, config);
    let self_extracting = is_self_extracting(config, is_csi);
    let install_path = overrides.install_path();

    if is_csi {
        volumes::add_csi_bin_volume(spec, &config.dynakube_name, &config.max_csi_mount_timeout);
    } else {
        volumes::add_ephemeral_bin_volume(spec);
    }
    volumes::add_input_volumes(spec);

    if self_extracting {
        install.command = None;
    } else if !is_csi {
        let technologies = overrides.technologies.as_deref().unwrap_or("all");
        args::append(
            &mut install.args,
            [
                Arg::new(args::TARGET_VERSION, config.code_modules_version.clone()),
                Arg::new(args::TECHNOLOGIES, query_escape(technologies)),
                Arg::new(args::FLAVOR, overrides.flavor.clone().unwrap_or_default()),
            ],
        );
    }

    volumes::add_init_volume_mounts(install);

    args::append(
        &mut install.args,
        [
            Arg::new(args::SOURCE_FOLDER, AGENT_CODE_MODULE_SOURCE),
            Arg::new(args::TARGET_FOLDER, volumes::BIN_INIT_MOUNT_PATH),
            Arg::new(args::INSTALL_PATH, install_path),
        ],
    );

    if config.full_stack {
        let tenant = config.tenant_uuid.as_deref().ok_or_else(|| {
            Error::configuration_for_field(
                &config.dynakube_name,
                "status.oneAgent.connectionInfoStatus.tenantUUID",
                "full-stack injection needs a tenant UUID",
            )
        })?;
        args::append(
            &mut install.args,
            [Arg::flag(args::FULLSTACK), Arg::new(args::TENANT, tenant)],
        );
    }

    if let Some(technology) = technology(config, overrides) {
        args::append(&mut install.args, [Arg::new(args::TECHNOLOGY, technology)]);
    }

    debug!(
        csi = is_csi,
        self_extracting,
        install_path,
        "configured install container"
    );
    Ok(())
}

/// Technology from the pod annotation, else from the feature flag
fn technology<'a>(config: &'a InjectionConfig, overrides: &'a PodOverrides) -> Option<&'a str> {
    match overrides.technologies.as_deref() {
        Some(technology) => Some(technology).filter(|t| !t.is_empty()),
        None => Some(config.node_image_pull_technology.as_str()).filter(|t| !t.is_empty()),
    }
}

fn query_escape(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
