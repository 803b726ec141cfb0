//! Per-admission request types

use dynatrace_common::crd::DynaKube;
use k8s_openapi::api::core::v1::{Container, Namespace, Pod};

use crate::annotations::PodAnnotations;
use crate::config::{InjectionConfig, WebhookSettings};
use crate::context::MutationContext;
use crate::INSTALL_CONTAINER_NAME;

/// Everything one run of the pipeline works on
///
/// Created per admission, discarded once the pipeline returns.
#[derive(Clone, Debug)]
pub struct MutationRequest {
    /// The pod being admitted, mutated in place
    pub pod: Pod,
    /// Namespace the pod is created in
    pub namespace: Namespace,
    /// Configuration snapshot
    pub config: InjectionConfig,
    /// Typed pod annotations, written back into `pod` on success
    pub annotations: PodAnnotations,
    /// Install container being built on the first admission
    pub install_container: Option<Container>,
    /// Cancellation and deadline
    pub context: MutationContext,
}

impl MutationRequest {
    /// Bind a pod, its namespace and a DynaKube into a request
    pub fn new(
        pod: Pod,
        namespace: Namespace,
        dynakube: &DynaKube,
        settings: &WebhookSettings,
        context: MutationContext,
    ) -> Self {
        let annotations = PodAnnotations::parse(&pod);
        Self {
            pod,
            namespace,
            config: InjectionConfig::resolve(dynakube, settings),
            annotations,
            install_container: None,
            context,
        }
    }

    /// Pod name for logs and events; falls back to `generateName`
    pub fn pod_name(&self) -> &str {
        pod_display_name(&self.pod)
    }

    /// Name of the namespace the pod is admitted into
    pub fn namespace_name(&self) -> &str {
        self.namespace
            .metadata
            .name
            .as_deref()
            .or(self.pod.metadata.namespace.as_deref())
            .unwrap_or_default()
    }

    /// The pod already carries the install container from an earlier admission
    pub fn has_install_container(&self) -> bool {
        self.pod
            .spec
            .as_ref()
            .and_then(|s| s.init_containers.as_ref())
            .is_some_and(|ics| ics.iter().any(|c| c.name == INSTALL_CONTAINER_NAME))
    }

    /// View for the second pass over a pod that already has the install container
    pub fn reinvocation(&mut self) -> Option<ReinvocationRequest<'_>> {
        let spec = self.pod.spec.as_mut()?;
        let install_container = spec
            .init_containers
            .as_mut()?
            .iter_mut()
            .find(|c| c.name == INSTALL_CONTAINER_NAME)?;

        Some(ReinvocationRequest {
            install_container,
            containers: &mut spec.containers,
            namespace: &self.namespace,
            config: &self.config,
            annotations: &self.annotations,
        })
    }

    /// Consume the request, returning the mutated pod
    pub fn into_pod(self) -> Pod {
        self.pod
    }
}

/// Narrow view used when the pod is seen again after other webhooks ran
pub struct ReinvocationRequest<'a> {
    /// The install container added on the first admission
    pub install_container: &'a mut Container,
    /// User containers, possibly including ones added since
    pub containers: &'a mut Vec<Container>,
    /// Namespace of the pod
    pub namespace: &'a Namespace,
    /// Configuration snapshot
    pub config: &'a InjectionConfig,
    /// Pod annotations as parsed at the start
    pub annotations: &'a PodAnnotations,
}

pub(crate) fn pod_display_name(pod: &Pod) -> &str {
    pod.metadata
        .name
        .as_deref()
        .filter(|n| !n.is_empty())
        .or(pod.metadata.generate_name.as_deref())
        .unwrap_or_default()
}
