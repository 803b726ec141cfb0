//! DynaKube CRD: the configuration object driving code-module injection
//!
//! Only the parts of the DynaKube the pod mutation webhook reads are modeled
//! here. Fields the operator owns (status) are filled in by the operator's
//! reconcilers and read back by the webhook.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements as K8sResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::feature_flags::FeatureFlags;
use super::selector::NamespaceSelector;
use crate::Error;

/// Suffix of the source bootstrapper config secret in the DynaKube namespace
pub const BOOTSTRAPPER_CONFIG_SUFFIX: &str = "-bootstrapper-config";
/// Suffix of the source bootstrapper certificate secret in the DynaKube namespace
pub const BOOTSTRAPPER_CERTS_SUFFIX: &str = "-bootstrapper-certs";

/// DynaKube describes how a cluster is monitored by Dynatrace.
///
/// Example:
/// ```yaml
/// apiVersion: dynatrace.com/v1beta5
/// kind: DynaKube
/// metadata:
///   name: dynakube
///   namespace: dynatrace
///   annotations:
///     feature.dynatrace.com/node-image-pull: "true"
/// spec:
///   apiUrl: https://abc12345.live.dynatrace.com/api
///   oneAgent:
///     applicationMonitoring:
///       codeModulesImage: registry.example.com/dynatrace/codemodules:1.303.0
///       namespaceSelector:
///         matchLabels:
///           monitoring: enabled
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "dynatrace.com",
    version = "v1beta5",
    kind = "DynaKube",
    shortname = "dk",
    namespaced,
    status = "DynaKubeStatus",
    printcolumn = r#"{"name":"ApiUrl","type":"string","jsonPath":".spec.apiUrl"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DynaKubeSpec {
    /// Dynatrace tenant API endpoint, e.g. `https://<tenant>.live.dynatrace.com/api`
    #[serde(default)]
    pub api_url: String,

    /// Network zone injected agents report through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_zone: Option<String>,

    /// Name of a ConfigMap holding custom CA certificates
    #[serde(
        default,
        rename = "trustedCAs",
        skip_serializing_if = "Option::is_none"
    )]
    pub trusted_cas: Option<String>,

    /// OneAgent deployment mode
    #[serde(default)]
    pub one_agent: OneAgentSpec,

    /// ActiveGate settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_gate: Option<ActiveGateSpec>,

    /// Workload metadata enrichment
    #[serde(default)]
    pub metadata_enrichment: MetadataEnrichmentSpec,
}

/// OneAgent modes; at most one is expected to be set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OneAgentSpec {
    /// Inject code modules into application pods only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_monitoring: Option<AppInjectionSpec>,

    /// Host agents plus code-module injection (full-stack)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_native_full_stack: Option<AppInjectionSpec>,
}

/// Settings shared by every mode that injects code modules into pods
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppInjectionSpec {
    /// Namespaces whose pods get injected; absent or empty selects all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<NamespaceSelector>,

    /// Image containing the code modules and the bootstrapper
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_modules_image: Option<String>,

    /// Resources for the install init container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_resources: Option<ResourceRequirements>,

    /// Code modules version to download when not using an image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// ActiveGate configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveGateSpec {
    /// Enabled capabilities (e.g. "routing", "kubernetes-monitoring")
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,

    /// Secret holding the ActiveGate TLS certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret_name: Option<String>,
}

/// Metadata enrichment configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetadataEnrichmentSpec {
    /// Whether pods get workload metadata attached
    #[serde(default)]
    pub enabled: bool,

    /// Namespaces whose pods get enriched; absent or empty selects all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<NamespaceSelector>,
}

/// Container resource limits and requests
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ResourceRequirements {
    /// Resource requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceQuantity>,

    /// Resource limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceQuantity>,
}

/// Resource quantity for CPU and memory
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ResourceQuantity {
    /// CPU quantity (e.g., "100m", "1")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory quantity (e.g., "128Mi", "1Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

impl ResourceQuantity {
    fn to_k8s(&self) -> BTreeMap<String, Quantity> {
        let mut map = BTreeMap::new();
        if let Some(cpu) = &self.cpu {
            map.insert("cpu".to_string(), Quantity(cpu.clone()));
        }
        if let Some(memory) = &self.memory {
            map.insert("memory".to_string(), Quantity(memory.clone()));
        }
        map
    }
}

impl ResourceRequirements {
    /// Convert to the core/v1 representation
    pub fn to_k8s(&self) -> K8sResourceRequirements {
        K8sResourceRequirements {
            requests: self.requests.as_ref().map(ResourceQuantity::to_k8s),
            limits: self.limits.as_ref().map(ResourceQuantity::to_k8s),
            ..Default::default()
        }
    }
}

/// Status written by the operator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DynaKubeStatus {
    /// UID of the kube-system namespace, identifies the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_system_uuid: Option<String>,

    /// Dynatrace entity id of the cluster
    #[serde(
        default,
        rename = "kubernetesClusterMEID",
        skip_serializing_if = "Option::is_none"
    )]
    pub kubernetes_cluster_meid: Option<String>,

    /// Display name of the cluster in Dynatrace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_cluster_name: Option<String>,

    /// Resolved code modules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_modules: Option<CodeModulesStatus>,

    /// OneAgent connection state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_agent: Option<OneAgentStatus>,

    /// Enrichment rules fetched from the tenant settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_enrichment: Option<MetadataEnrichmentStatus>,
}

/// Metadata enrichment state resolved by the operator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetadataEnrichmentStatus {
    /// Namespace labels and annotations to copy onto enriched pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<EnrichmentRule>,
}

/// Where an enrichment rule reads its value from
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum EnrichmentRuleType {
    /// A namespace label
    #[serde(rename = "LABEL")]
    Label,
    /// A namespace annotation
    #[serde(rename = "ANNOTATION")]
    Annotation,
}

/// Copy one namespace label or annotation onto pods as `metadata.dynatrace.com/<target>`
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct EnrichmentRule {
    /// Label or annotation
    #[serde(rename = "type")]
    pub type_: EnrichmentRuleType,
    /// Key on the namespace
    pub source: String,
    /// Attribute name; rules without a target are ignored
    #[serde(default)]
    pub target: String,
}

/// Code modules the operator resolved for this DynaKube
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CodeModulesStatus {
    /// Resolved version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Resolved image reference
    #[serde(
        default,
        rename = "imageID",
        skip_serializing_if = "Option::is_none"
    )]
    pub image_id: Option<String>,
}

/// OneAgent status subtree
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OneAgentStatus {
    /// Connection info fetched from the tenant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_info_status: Option<ConnectionInfoStatus>,
}

/// Tenant connection info
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfoStatus {
    /// Tenant the agents connect to
    #[serde(
        default,
        rename = "tenantUUID",
        skip_serializing_if = "Option::is_none"
    )]
    pub tenant_uuid: Option<String>,
}

impl DynaKube {
    /// Name of the DynaKube, empty when unset
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Namespace the DynaKube (and its source secrets) live in
    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    /// Feature flags from the DynaKube annotations
    pub fn feature_flags(&self) -> FeatureFlags {
        FeatureFlags::from_annotations(self.metadata.annotations.as_ref())
    }

    /// The injection settings of whichever code-module mode is configured
    pub fn app_injection(&self) -> Option<&AppInjectionSpec> {
        self.spec
            .one_agent
            .cloud_native_full_stack
            .as_ref()
            .or(self.spec.one_agent.application_monitoring.as_ref())
    }

    /// Whether a mode that injects code modules is configured
    pub fn is_app_injection_enabled(&self) -> bool {
        self.app_injection().is_some()
    }

    /// Full-stack mode: host agents are deployed alongside injected pods
    pub fn is_cloud_native_full_stack(&self) -> bool {
        self.spec.one_agent.cloud_native_full_stack.is_some()
    }

    /// Namespace selector of the injection mode
    pub fn namespace_selector(&self) -> Option<&NamespaceSelector> {
        self.app_injection()
            .and_then(|a| a.namespace_selector.as_ref())
    }

    /// Resources for the install container
    pub fn init_resources(&self) -> Option<&ResourceRequirements> {
        self.app_injection().and_then(|a| a.init_resources.as_ref())
    }

    /// Code modules image: the configured one, else the one the operator resolved
    pub fn code_modules_image(&self) -> Option<&str> {
        self.app_injection()
            .and_then(|a| a.code_modules_image.as_deref())
            .filter(|image| !image.is_empty())
            .or_else(|| {
                self.status
                    .as_ref()
                    .and_then(|s| s.code_modules.as_ref())
                    .and_then(|c| c.image_id.as_deref())
            })
            .filter(|image| !image.is_empty())
    }

    /// Code modules version: the configured one, else the one the operator resolved
    pub fn code_modules_version(&self) -> &str {
        self.app_injection()
            .and_then(|a| a.version.as_deref())
            .filter(|v| !v.is_empty())
            .or_else(|| {
                self.status
                    .as_ref()
                    .and_then(|s| s.code_modules.as_ref())
                    .and_then(|c| c.version.as_deref())
            })
            .unwrap_or_default()
    }

    /// ActiveGate serves TLS with a custom certificate that injected agents must trust
    pub fn is_ag_certificate_needed(&self) -> bool {
        self.spec.active_gate.as_ref().is_some_and(|ag| {
            !ag.capabilities.is_empty()
                && ag.tls_secret_name.as_deref().is_some_and(|s| !s.is_empty())
        })
    }

    /// Custom CAs are configured
    pub fn has_trusted_cas(&self) -> bool {
        self.spec.trusted_cas.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// Configured network zone, if any
    pub fn network_zone(&self) -> Option<&str> {
        self.spec.network_zone.as_deref().filter(|z| !z.is_empty())
    }

    /// Whether workload metadata enrichment is turned on
    pub fn metadata_enrichment_enabled(&self) -> bool {
        self.spec.metadata_enrichment.enabled
    }

    /// Namespace selector for metadata enrichment
    pub fn metadata_enrichment_namespace_selector(&self) -> Option<&NamespaceSelector> {
        self.spec.metadata_enrichment.namespace_selector.as_ref()
    }

    /// Tenant UUID from the status, else derived from the API URL
    ///
    /// SaaS URLs carry the tenant as the first host label
    /// (`https://<tenant>.live.dynatrace.com/api`), managed URLs as a path
    /// segment (`https://host/e/<tenant>/api`).
    pub fn tenant_uuid(&self) -> Result<String, Error> {
        let from_status = self
            .status
            .as_ref()
            .and_then(|s| s.one_agent.as_ref())
            .and_then(|o| o.connection_info_status.as_ref())
            .and_then(|c| c.tenant_uuid.as_deref())
            .filter(|t| !t.is_empty());
        if let Some(tenant) = from_status {
            return Ok(tenant.to_string());
        }

        tenant_from_api_url(&self.spec.api_url).ok_or_else(|| {
            Error::configuration_for_field(
                self.name(),
                "status.oneAgent.connectionInfoStatus.tenantUUID",
                format!(
                    "tenant UUID not in status and not derivable from apiUrl '{}'",
                    self.spec.api_url
                ),
            )
        })
    }

    /// Kube-system namespace UID recorded by the operator
    pub fn kube_system_uuid(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|s| s.kube_system_uuid.as_deref())
            .unwrap_or_default()
    }

    /// Dynatrace entity id of the cluster
    pub fn kubernetes_cluster_meid(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|s| s.kubernetes_cluster_meid.as_deref())
            .unwrap_or_default()
    }

    /// Cluster display name
    pub fn kubernetes_cluster_name(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|s| s.kubernetes_cluster_name.as_deref())
            .unwrap_or_default()
    }

    /// Enrichment rules from the status, empty when the operator has not resolved any
    pub fn metadata_enrichment_rules(&self) -> &[EnrichmentRule] {
        self.status
            .as_ref()
            .and_then(|s| s.metadata_enrichment.as_ref())
            .map(|m| m.rules.as_slice())
            .unwrap_or_default()
    }

    /// Source secret holding the bootstrapper config
    pub fn bootstrapper_config_secret_name(&self) -> String {
        format!("{}{}", self.name(), BOOTSTRAPPER_CONFIG_SUFFIX)
    }

    /// Source secret holding the bootstrapper certificates
    pub fn bootstrapper_certs_secret_name(&self) -> String {
        format!("{}{}", self.name(), BOOTSTRAPPER_CERTS_SUFFIX)
    }
}

fn tenant_from_api_url(api_url: &str) -> Option<String> {
    let parsed = url::Url::parse(api_url).ok()?;

    let segments: Vec<&str> = parsed.path_segments()?.collect();
    if let ["e", tenant, ..] = segments.as_slice() {
        if !tenant.is_empty() {
            return Some(tenant.to_string());
        }
    }

    parsed
        .host_str()
        .and_then(|host| host.split('.').next())
        .filter(|label| !label.is_empty())
        .map(str::to_string)
}
