//! Workload metadata enrichment
//!
//! Attaches the owning workload and user-defined namespace metadata to the
//! install container arguments and records them on the pod.

pub mod workload;

use std::collections::BTreeMap;
use std::sync::Arc;

use dynatrace_common::crd::{EnrichmentRule, EnrichmentRuleType};
use dynatrace_common::{Error, Result};
use k8s_openapi::api::core::v1::Namespace;
use tracing::{debug, info};

use crate::annotations::{InjectionState, METADATA_PREFIX, WORKLOAD_KIND, WORKLOAD_NAME};
use crate::attributes;
use crate::eligibility;
use crate::request::MutationRequest;

pub use workload::{resolve_workload, KubeOwnerLookup, OwnerLookup};

/// Attaches workload metadata to the pod
#[derive(Clone)]
pub struct MetadataMutator {
    owners: Arc<dyn OwnerLookup>,
}

impl MetadataMutator {
    /// Create a mutator resolving owners through `owners`
    pub fn new(owners: Arc<dyn OwnerLookup>) -> Self {
        Self { owners }
    }

    /// Metadata enrichment applies to this pod
    pub fn is_enabled(&self, request: &MutationRequest) -> bool {
        eligibility::is_metadata_enabled(
            &request.annotations.overrides,
            &request.config,
            &request.namespace,
        )
    }

    /// Resolve the workload and attach it with the copied namespace metadata
    pub async fn mutate(&self, request: &mut MutationRequest) -> Result<()> {
        info!(pod = %request.pod_name(), "adding metadata-enrichment to pod");

        let workload = resolve_workload(
            self.owners.as_ref(),
            &request.context,
            &request.pod,
            request.namespace_name(),
        )
        .await?;

        let user_defined = copy_namespace_metadata(
            &request.config.metadata_rules,
            &request.namespace,
            &mut request.annotations.state,
        );

        let install = request.install_container.as_mut().ok_or_else(|| {
            Error::internal_with_context("metadata", "install container not allocated")
        })?;
        attributes::add_workload_attributes(install, &workload.kind, &workload.name, &user_defined);

        request.annotations.state.set_metadata_injected(workload);
        Ok(())
    }
}

/// Copy namespace metadata onto the pod
///
/// Rule-selected labels and annotations become user-defined attributes,
/// keyed by the rule target. `metadata.dynatrace.com/*` namespace
/// annotations are copied onto the pod only. Values the pod already carries
/// are never overwritten.
pub fn copy_namespace_metadata(
    rules: &[EnrichmentRule],
    namespace: &Namespace,
    state: &mut InjectionState,
) -> BTreeMap<String, String> {
    let user_defined = copy_by_rules(rules, namespace, state);
    copy_by_prefix(namespace, state);
    user_defined
}

fn copy_by_rules(
    rules: &[EnrichmentRule],
    namespace: &Namespace,
    state: &mut InjectionState,
) -> BTreeMap<String, String> {
    let mut user_defined = BTreeMap::new();
    for rule in rules {
        if rule.target.is_empty() {
            debug!(source = %rule.source, "enrichment rule without target, skipping");
            continue;
        }
        let key = format!("{}{}", METADATA_PREFIX, rule.target);
        if key == WORKLOAD_KIND || key == WORKLOAD_NAME {
            debug!(rule_target = %rule.target, "enrichment rule targets a reserved key, skipping");
            continue;
        }

        let source = match rule.type_ {
            EnrichmentRuleType::Label => namespace.metadata.labels.as_ref(),
            EnrichmentRuleType::Annotation => namespace.metadata.annotations.as_ref(),
        };
        let Some(value) = source.and_then(|m| m.get(&rule.source)) else {
            continue;
        };

        state
            .copied_metadata
            .entry(key)
            .or_insert_with(|| value.clone());
        user_defined.insert(rule.target.clone(), value.clone());
    }
    user_defined
}

fn copy_by_prefix(namespace: &Namespace, state: &mut InjectionState) {
    let Some(annotations) = namespace.metadata.annotations.as_ref() else {
        return;
    };
    for (key, value) in annotations {
        if !key.starts_with(METADATA_PREFIX) || key == WORKLOAD_KIND || key == WORKLOAD_NAME {
            continue;
        }
        state
            .copied_metadata
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }
}
