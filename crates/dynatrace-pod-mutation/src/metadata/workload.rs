//! Owning workload of a pod
//!
//! Pods are usually created by a ReplicaSet or Job, which in turn belong to
//! a Deployment or CronJob. The workload reported is the outermost of those
//! two levels; only object metadata is read.

use async_trait::async_trait;
use dynatrace_common::kube_utils::parse_api_version;
use dynatrace_common::{Error, Result};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::annotations::WorkloadInfo;
use crate::context::MutationContext;
use crate::request::pod_display_name;

/// Kind reported for pods without a controller
pub const BARE_POD_KIND: &str = "pod";

/// Owner kinds that are resolved one level further
const INTERMEDIATE_KINDS: [&str; 2] = ["ReplicaSet", "Job"];

/// Reads owner references of arbitrary namespaced objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OwnerLookup: Send + Sync {
    /// Owner references of `kind/name` in `namespace`
    async fn owner_references(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<OwnerReference>>;
}

/// [`OwnerLookup`] using metadata-only reads against the Kubernetes API
pub struct KubeOwnerLookup {
    client: Client,
}

impl KubeOwnerLookup {
    /// Create a lookup using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl OwnerLookup for KubeOwnerLookup {
    async fn owner_references(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<OwnerReference>> {
        let (group, version) = parse_api_version(api_version);
        let gvk = GroupVersionKind::gvk(&group, &version, kind);
        let resource = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);

        let meta = api
            .get_metadata(name)
            .await
            .map_err(|e| Error::workload_lookup(kind, name, e.to_string()))?;
        Ok(meta.metadata.owner_references.unwrap_or_default())
    }
}

fn controller_of(refs: &[OwnerReference]) -> Option<&OwnerReference> {
    refs.iter().find(|r| r.controller == Some(true))
}

fn workload_info(owner: &OwnerReference) -> WorkloadInfo {
    WorkloadInfo {
        kind: owner.kind.to_lowercase(),
        name: owner.name.clone(),
    }
}

/// Resolve the workload owning `pod`
///
/// Lookup failures (including cancellation) are returned as errors.
pub async fn resolve_workload(
    lookup: &dyn OwnerLookup,
    ctx: &MutationContext,
    pod: &Pod,
    namespace: &str,
) -> Result<WorkloadInfo> {
    let refs = pod.metadata.owner_references.as_deref().unwrap_or_default();
    let Some(owner) = controller_of(refs) else {
        return Ok(WorkloadInfo {
            kind: BARE_POD_KIND.to_string(),
            name: pod_display_name(pod).to_string(),
        });
    };

    if INTERMEDIATE_KINDS.contains(&owner.kind.as_str()) {
        let parents = ctx
            .run(
                &format!("get owner of {}/{}", owner.kind, owner.name),
                lookup.owner_references(&owner.api_version, &owner.kind, namespace, &owner.name),
            )
            .await?;
        if let Some(parent) = controller_of(&parents) {
            debug!(
                owner = %owner.name,
                parent_kind = %parent.kind,
                parent = %parent.name,
                "resolved workload through intermediate owner"
            );
            return Ok(workload_info(parent));
        }
    }

    Ok(workload_info(owner))
}
