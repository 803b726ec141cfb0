//! Configuration snapshot for one admission
//!
//! [`InjectionConfig::resolve`] reads everything the pipeline needs from the
//! DynaKube and the process settings once. Stages only see the snapshot.

use dynatrace_common::crd::{DynaKube, EnrichmentRule, NamespaceSelector};
use k8s_openapi::api::core::v1::{ObjectReference, ResourceRequirements};
use kube::Resource;

/// Process-level settings of the webhook
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WebhookSettings {
    /// The OneAgent CSI driver is installed on the cluster
    pub csi_driver_available: bool,
    /// Version of the operator, reported in deployment metadata
    pub operator_version: String,
    /// Running on OpenShift, which assigns container users itself
    pub is_openshift: bool,
}

/// Cluster identity attached to injected pods
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterInfo {
    /// UID of the kube-system namespace
    pub uid: String,
    /// Display name in Dynatrace
    pub name: String,
    /// Dynatrace entity id
    pub entity_id: String,
}

/// Source secrets the install container reads its input from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceSecrets {
    /// Namespace of the DynaKube
    pub namespace: String,
    /// `<dynakube>-bootstrapper-config`
    pub config: String,
    /// `<dynakube>-bootstrapper-certs`
    pub certs: String,
}

/// Immutable view of a DynaKube plus webhook settings
#[derive(Clone, Debug, PartialEq)]
pub struct InjectionConfig {
    /// Name of the DynaKube
    pub dynakube_name: String,
    /// Reference events are published on
    pub dynakube_ref: ObjectReference,

    /// A code-module injection mode is configured
    pub app_injection_enabled: bool,
    /// Cloud-native full-stack mode
    pub full_stack: bool,
    /// Namespace selector of the injection mode
    pub namespace_selector: Option<NamespaceSelector>,
    /// Image with code modules and bootstrapper
    pub code_modules_image: Option<String>,
    /// Version to download when not pulled as an image
    pub code_modules_version: String,
    /// Resources of the install container
    pub init_resources: Option<ResourceRequirements>,
    /// Tenant for full-stack mode, `None` when it cannot be determined
    pub tenant_uuid: Option<String>,
    /// The certs secret must be replicated too
    pub needs_certs: bool,
    /// Network zone for injected agents
    pub network_zone: Option<String>,
    /// Cluster identity
    pub cluster: ClusterInfo,
    /// Secrets to replicate into the pod namespace
    pub source_secrets: SourceSecrets,

    /// Metadata enrichment is turned on
    pub metadata_enrichment_enabled: bool,
    /// Namespace selector for metadata enrichment
    pub metadata_namespace_selector: Option<NamespaceSelector>,
    /// Namespace labels and annotations copied as user-defined attributes
    pub metadata_rules: Vec<EnrichmentRule>,

    /// `feature.dynatrace.com/automatic-injection`
    pub automatic_injection: bool,
    /// `feature.dynatrace.com/node-image-pull`
    pub node_image_pull: bool,
    /// `feature.dynatrace.com/node-image-pull-technology`
    pub node_image_pull_technology: String,
    /// `feature.dynatrace.com/label-version-detection`
    pub label_version_detection: bool,
    /// `feature.dynatrace.com/max-csi-mount-timeout`
    pub max_csi_mount_timeout: String,

    /// Copied from [`WebhookSettings`]
    pub csi_driver_available: bool,
    /// Copied from [`WebhookSettings`]
    pub operator_version: String,
    /// Copied from [`WebhookSettings`]
    pub is_openshift: bool,
}

impl InjectionConfig {
    /// Build the snapshot for one admission
    pub fn resolve(dk: &DynaKube, settings: &WebhookSettings) -> Self {
        let flags = dk.feature_flags();

        Self {
            dynakube_name: dk.name().to_string(),
            dynakube_ref: dk.object_ref(&()),
            app_injection_enabled: dk.is_app_injection_enabled(),
            full_stack: dk.is_cloud_native_full_stack(),
            namespace_selector: dk.namespace_selector().cloned(),
            code_modules_image: dk.code_modules_image().map(str::to_string),
            code_modules_version: dk.code_modules_version().to_string(),
            init_resources: dk.init_resources().map(|r| r.to_k8s()),
            tenant_uuid: dk.tenant_uuid().ok(),
            needs_certs: dk.is_ag_certificate_needed() || dk.has_trusted_cas(),
            network_zone: dk.network_zone().map(str::to_string),
            cluster: ClusterInfo {
                uid: dk.kube_system_uuid().to_string(),
                name: dk.kubernetes_cluster_name().to_string(),
                entity_id: dk.kubernetes_cluster_meid().to_string(),
            },
            source_secrets: SourceSecrets {
                namespace: dk.namespace().to_string(),
                config: dk.bootstrapper_config_secret_name(),
                certs: dk.bootstrapper_certs_secret_name(),
            },
            metadata_enrichment_enabled: dk.metadata_enrichment_enabled(),
            metadata_namespace_selector: dk.metadata_enrichment_namespace_selector().cloned(),
            metadata_rules: dk.metadata_enrichment_rules().to_vec(),
            automatic_injection: flags.automatic_injection(),
            node_image_pull: flags.node_image_pull(),
            node_image_pull_technology: flags.node_image_pull_technology().to_string(),
            label_version_detection: flags.label_version_detection(),
            max_csi_mount_timeout: flags.max_csi_mount_timeout().to_string(),
            csi_driver_available: settings.csi_driver_available,
            operator_version: settings.operator_version.clone(),
            is_openshift: settings.is_openshift,
        }
    }

    /// `orchestration_tech` part of `DT_DEPLOYMENT_METADATA`
    pub fn orchestration_tech(&self) -> &'static str {
        if self.full_stack {
            "Operator-cloud_native_fullstack"
        } else {
            "Operator-application_monitoring"
        }
    }
}
