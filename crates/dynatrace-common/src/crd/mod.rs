//! Custom Resource Definitions read by the webhook

mod dynakube;
pub mod feature_flags;
mod selector;

pub use dynakube::{
    ActiveGateSpec, AppInjectionSpec, CodeModulesStatus, ConnectionInfoStatus, DynaKube,
    DynaKubeSpec, DynaKubeStatus, EnrichmentRule, EnrichmentRuleType, MetadataEnrichmentSpec,
    MetadataEnrichmentStatus, OneAgentSpec, OneAgentStatus, ResourceQuantity, ResourceRequirements, BOOTSTRAPPER_CERTS_SUFFIX, BOOTSTRAPPER_CONFIG_SUFFIX,
};
pub use feature_flags::FeatureFlags;
pub use selector::{
    selector_matches, LabelSelectorOperator, LabelSelectorRequirement, NamespaceSelector,
};
