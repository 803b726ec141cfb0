//! OneAgent code-module injection
//!
//! On first admission the install container is configured and every user
//! container gets the agent. On reinvocation only containers added since are
//! described to the install container and injected.

pub mod containers;
pub mod env;
pub mod init;
pub mod volumes;

use dynatrace_common::{Error, Result};
use tracing::info;

use crate::annotations::NotInjectedReason;
use crate::attributes;
use crate::eligibility;
use crate::request::{MutationRequest, ReinvocationRequest};

/// Injects code modules into user containers
#[derive(Clone, Debug, Default)]
pub struct OneAgentMutator;

impl OneAgentMutator {
    /// Code modules should be injected into this pod
    pub fn is_enabled(&self, request: &MutationRequest) -> bool {
        eligibility::is_agent_enabled(
            &request.annotations.overrides,
            &request.config,
            &request.namespace,
        )
    }

    /// First admission: configure the install container and inject containers
    ///
    /// Records `injected=true` when at least one container was injected,
    /// otherwise `NoMutationNeeded`.
    pub fn mutate(&self, request: &mut MutationRequest) -> Result<()> {
        let namespace_name = request.namespace_name().to_string();
        let MutationRequest {
            pod,
            namespace,
            config,
            annotations,
            install_container,
            ..
        } = request;

        let install = install_container.as_mut().ok_or_else(|| {
            Error::internal_with_context("oneagent", "install container not allocated")
        })?;
        let spec = pod.spec.get_or_insert_with(Default::default);

        attributes::add_container_attributes(install, &spec.containers)?;
        init::configure_install_container(install, spec, config, &annotations.overrides)?;

        let mutated = containers::mutate_user_containers(
            &mut spec.containers,
            namespace,
            config,
            annotations.overrides.install_path(),
        );
        if mutated == 0 {
            annotations
                .state
                .set_agent_not_injected(NotInjectedReason::NoMutationNeeded);
        } else {
            annotations.state.set_agent_injected();
        }

        attributes::add_pod_attributes(install, &namespace_name, config);
        Ok(())
    }

    /// Second pass: describe and inject containers added since the first
    ///
    /// Returns whether any container was injected.
    pub fn reinvoke(&self, request: &mut ReinvocationRequest<'_>) -> Result<bool> {
        let described = attributes::add_container_attributes(
            &mut *request.install_container,
            &request.containers[..],
        )?;

        let mutated = containers::mutate_user_containers(
            &mut request.containers[..],
            request.namespace,
            request.config,
            request.annotations.overrides.install_path(),
        );
        if mutated > 0 {
            info!(containers = mutated, described, "injected containers on reinvocation");
        }
        Ok(mutated > 0)
    }
}
