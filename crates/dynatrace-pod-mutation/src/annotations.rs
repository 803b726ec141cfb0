//! Typed pod annotation state
//!
//! The pipeline parses the pod annotation map once into [`PodAnnotations`]
//! and writes it back once when it finishes successfully. Everything in
//! between reads and updates the typed record, never the raw map.

use std::collections::BTreeMap;
use std::fmt;

use dynatrace_common::crd::feature_flags::parse_bool;
use k8s_openapi::api::core::v1::Pod;
use tracing::warn;

/// Per-pod opt-in/opt-out for code-module injection
pub const INJECT: &str = "oneagent.dynatrace.com/inject";
/// Per-pod opt-in/opt-out for metadata enrichment
pub const METADATA_INJECT: &str = "metadata-enrichment.dynatrace.com/inject";
/// Where code modules are mounted in user containers
pub const INSTALL_PATH: &str = "oneagent.dynatrace.com/install-path";
/// Volume type override: `csi` or `ephemeral`
pub const VOLUME_TYPE: &str = "oneagent.dynatrace.com/volume-type";
/// Technologies to download, comma separated
pub const TECHNOLOGIES: &str = "oneagent.dynatrace.com/technologies";
/// Code modules flavor (e.g. `musl`)
pub const FLAVOR: &str = "oneagent.dynatrace.com/flavor";

/// Whether code modules were injected
pub const INJECTED: &str = "oneagent.dynatrace.com/injected";
/// Why code modules were not injected
pub const REASON: &str = "oneagent.dynatrace.com/reason";
/// Whether workload metadata was attached
pub const METADATA_INJECTED: &str = "metadata-enrichment.dynatrace.com/injected";
/// Kind of the owning workload
pub const WORKLOAD_KIND: &str = "metadata.dynatrace.com/dt.kubernetes.workload.kind";
/// Name of the owning workload
pub const WORKLOAD_NAME: &str = "metadata.dynatrace.com/dt.kubernetes.workload.name";
/// Set once the whole webhook finished with the pod
pub const DYNATRACE_INJECTED: &str = "dynakube.dynatrace.com/injected";
/// Reason the webhook did not finish
pub const DYNATRACE_REASON: &str = "dynakube.dynatrace.com/reason";

/// Prefix of metadata annotations copied from the namespace
pub const METADATA_PREFIX: &str = "metadata.dynatrace.com/";

/// Install path used when the pod does not override it
pub const DEFAULT_INSTALL_PATH: &str = "/opt/dynatrace/oneagent-paas";

/// Volume the code modules are delivered through
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VolumeType {
    /// Mounted by the OneAgent CSI driver
    Csi,
    /// Extracted into an emptyDir by the install container
    Ephemeral,
    /// Any other value; neither CSI nor ephemeral
    Unrecognized(String),
}

impl VolumeType {
    /// Parse an annotation value
    pub fn parse(value: &str) -> Self {
        match value {
            "csi" => Self::Csi,
            "ephemeral" => Self::Ephemeral,
            other => Self::Unrecognized(other.to_string()),
        }
    }
}

/// Why a pod did not get code modules
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotInjectedReason {
    /// The bootstrapper config (or certs) secret could not be replicated
    NoBootstrapperConfig,
    /// The DynaKube does not name a code-modules image
    NoCodeModulesImage,
    /// Every user container was already injected
    NoMutationNeeded,
    /// A value written by someone else, kept as is
    Other(String),
}

impl NotInjectedReason {
    /// Annotation value
    pub fn as_str(&self) -> &str {
        match self {
            Self::NoBootstrapperConfig => "NoBootstrapperConfig",
            Self::NoCodeModulesImage => "NoCodeModulesImage",
            Self::NoMutationNeeded => "NoMutationNeeded",
            Self::Other(value) => value,
        }
    }

    /// Parse an annotation value; unknown values are preserved
    pub fn parse(value: &str) -> Self {
        match value {
            "NoBootstrapperConfig" => Self::NoBootstrapperConfig,
            "NoCodeModulesImage" => Self::NoCodeModulesImage,
            "NoMutationNeeded" => Self::NoMutationNeeded,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for NotInjectedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only settings a pod carries for itself
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PodOverrides {
    /// `oneagent.dynatrace.com/inject`
    pub inject: Option<bool>,
    /// `metadata-enrichment.dynatrace.com/inject`
    pub metadata_inject: Option<bool>,
    /// `oneagent.dynatrace.com/install-path`
    pub install_path: Option<String>,
    /// `oneagent.dynatrace.com/volume-type`
    pub volume_type: Option<VolumeType>,
    /// `oneagent.dynatrace.com/technologies`
    pub technologies: Option<String>,
    /// `oneagent.dynatrace.com/flavor`
    pub flavor: Option<String>,
}

impl PodOverrides {
    /// Effective install path
    pub fn install_path(&self) -> &str {
        self.install_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_INSTALL_PATH)
    }
}

/// Identity of the workload owning a pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadInfo {
    /// Lowercased kind, `pod` for bare pods
    pub kind: String,
    /// Name of the workload
    pub name: String,
}

/// Annotations the pipeline writes
///
/// `None` means the annotation is absent after write-back.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InjectionState {
    /// `oneagent.dynatrace.com/injected`
    pub agent_injected: Option<bool>,
    /// `oneagent.dynatrace.com/reason`
    pub agent_reason: Option<NotInjectedReason>,
    /// `metadata-enrichment.dynatrace.com/injected`
    pub metadata_injected: Option<bool>,
    /// Workload kind/name annotations
    pub workload: Option<WorkloadInfo>,
    /// `dynakube.dynatrace.com/injected`
    pub dynatrace_injected: Option<bool>,
    /// `dynakube.dynatrace.com/reason`
    pub dynatrace_reason: Option<String>,
    /// `metadata.dynatrace.com/*` annotations other than the workload pair
    pub copied_metadata: BTreeMap<String, String>,
}

impl InjectionState {
    /// Code modules were injected into at least one container
    pub fn set_agent_injected(&mut self) {
        self.agent_injected = Some(true);
        self.agent_reason = None;
    }

    /// Code modules were not injected
    pub fn set_agent_not_injected(&mut self, reason: NotInjectedReason) {
        self.agent_injected = Some(false);
        self.agent_reason = Some(reason);
    }

    /// Workload metadata was attached
    pub fn set_metadata_injected(&mut self, workload: WorkloadInfo) {
        self.metadata_injected = Some(true);
        self.workload = Some(workload);
    }

    /// The webhook is done with this pod
    pub fn finalize(&mut self) {
        self.dynatrace_injected = Some(true);
        self.dynatrace_reason = None;
    }
}

/// Everything the pipeline knows from and records into pod annotations
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PodAnnotations {
    /// Inputs
    pub overrides: PodOverrides,
    /// Outputs
    pub state: InjectionState,
}

impl PodAnnotations {
    /// Parse the annotations of `pod`
    pub fn parse(pod: &Pod) -> Self {
        let empty = BTreeMap::new();
        let map = pod.metadata.annotations.as_ref().unwrap_or(&empty);
        let text = |key: &str| map.get(key).cloned();

        let overrides = PodOverrides {
            inject: bool_annotation(map, INJECT),
            metadata_inject: bool_annotation(map, METADATA_INJECT),
            install_path: text(INSTALL_PATH),
            volume_type: map.get(VOLUME_TYPE).map(|v| VolumeType::parse(v)),
            technologies: text(TECHNOLOGIES),
            flavor: text(FLAVOR),
        };

        let workload = match (map.get(WORKLOAD_KIND), map.get(WORKLOAD_NAME)) {
            (Some(kind), Some(name)) => Some(WorkloadInfo {
                kind: kind.clone(),
                name: name.clone(),
            }),
            _ => None,
        };

        let copied_metadata = map
            .iter()
            .filter(|(k, _)| {
                k.starts_with(METADATA_PREFIX) && *k != WORKLOAD_KIND && *k != WORKLOAD_NAME
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let state = InjectionState {
            agent_injected: bool_annotation(map, INJECTED),
            agent_reason: map.get(REASON).map(|r| NotInjectedReason::parse(r)),
            metadata_injected: bool_annotation(map, METADATA_INJECTED),
            workload,
            dynatrace_injected: bool_annotation(map, DYNATRACE_INJECTED),
            dynatrace_reason: text(DYNATRACE_REASON),
            copied_metadata,
        };

        Self { overrides, state }
    }

    /// Write the output state back into `pod`
    ///
    /// Input annotations and annotations the pipeline does not own are left alone.
    pub fn write_to(&self, pod: &mut Pod) {
        let map = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
        let state = &self.state;

        set_or_remove(map, INJECTED, state.agent_injected.map(|b| b.to_string()));
        set_or_remove(
            map,
            REASON,
            state.agent_reason.as_ref().map(|r| r.as_str().to_string()),
        );
        set_or_remove(
            map,
            METADATA_INJECTED,
            state.metadata_injected.map(|b| b.to_string()),
        );
        set_or_remove(
            map,
            WORKLOAD_KIND,
            state.workload.as_ref().map(|w| w.kind.clone()),
        );
        set_or_remove(
            map,
            WORKLOAD_NAME,
            state.workload.as_ref().map(|w| w.name.clone()),
        );
        set_or_remove(
            map,
            DYNATRACE_INJECTED,
            state.dynatrace_injected.map(|b| b.to_string()),
        );
        set_or_remove(map, DYNATRACE_REASON, state.dynatrace_reason.clone());

        for (key, value) in &state.copied_metadata {
            map.insert(key.clone(), value.clone());
        }
    }
}

fn bool_annotation(map: &BTreeMap<String, String>, key: &str) -> Option<bool> {
    let value = map.get(key)?;
    let parsed = parse_bool(value);
    if parsed.is_none() {
        warn!(annotation = key, value = %value, "ignoring non-boolean pod annotation");
    }
    parsed
}

fn set_or_remove(map: &mut BTreeMap<String, String>, key: &str, value: Option<String>) {
    match value {
        Some(value) => {
            map.insert(key.to_string(), value);
        }
        None => {
            map.remove(key);
        }
    }
}
