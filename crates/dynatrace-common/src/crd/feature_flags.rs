//! Feature flags carried as annotations on a DynaKube

use std::collections::BTreeMap;

use tracing::warn;

/// Prefix shared by every feature flag annotation
pub const FEATURE_FLAG_PREFIX: &str = "feature.dynatrace.com/";

/// Whether pods are injected unless they opt out
pub const AUTOMATIC_INJECTION: &str = "feature.dynatrace.com/automatic-injection";
/// Let the node pull the code-modules image instead of downloading the agent
pub const NODE_IMAGE_PULL: &str = "feature.dynatrace.com/node-image-pull";
/// Technology passed to the bootstrapper when the pod does not name one
pub const NODE_IMAGE_PULL_TECHNOLOGY: &str = "feature.dynatrace.com/node-image-pull-technology";
/// Add release version detection env vars to user containers
pub const LABEL_VERSION_DETECTION: &str = "feature.dynatrace.com/label-version-detection";
/// How long the CSI driver may retry mounting code modules
pub const MAX_CSI_MOUNT_TIMEOUT: &str = "feature.dynatrace.com/max-csi-mount-timeout";

/// Default for [`MAX_CSI_MOUNT_TIMEOUT`]
pub const DEFAULT_MAX_CSI_MOUNT_TIMEOUT: &str = "10m";

/// Typed view over the feature flag annotations of one DynaKube
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeatureFlags {
    annotations: BTreeMap<String, String>,
}

impl FeatureFlags {
    /// Collect the flags from a DynaKube annotation map
    pub fn from_annotations(annotations: Option<&BTreeMap<String, String>>) -> Self {
        let annotations = annotations
            .map(|a| {
                a.iter()
                    .filter(|(k, _)| k.starts_with(FEATURE_FLAG_PREFIX))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Self { annotations }
    }

    /// Pods are injected by default (defaults to true)
    pub fn automatic_injection(&self) -> bool {
        self.bool_flag(AUTOMATIC_INJECTION, true)
    }

    /// Code modules come from a node-pulled image (defaults to false)
    pub fn node_image_pull(&self) -> bool {
        self.bool_flag(NODE_IMAGE_PULL, false)
    }

    /// Technology override for node image pull, empty when unset
    pub fn node_image_pull_technology(&self) -> &str {
        self.annotations
            .get(NODE_IMAGE_PULL_TECHNOLOGY)
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Release version detection through pod labels (defaults to false)
    pub fn label_version_detection(&self) -> bool {
        self.bool_flag(LABEL_VERSION_DETECTION, false)
    }

    /// CSI mount retry timeout as a duration string such as "10m" or "90s"
    ///
    /// Values that are not a duration fall back to [`DEFAULT_MAX_CSI_MOUNT_TIMEOUT`].
    pub fn max_csi_mount_timeout(&self) -> &str {
        match self.annotations.get(MAX_CSI_MOUNT_TIMEOUT) {
            Some(value) if is_duration(value) => value,
            Some(value) => {
                warn!(
                    flag = MAX_CSI_MOUNT_TIMEOUT,
                    value = %value,
                    default = DEFAULT_MAX_CSI_MOUNT_TIMEOUT,
                    "invalid duration in feature flag, using default"
                );
                DEFAULT_MAX_CSI_MOUNT_TIMEOUT
            }
            None => DEFAULT_MAX_CSI_MOUNT_TIMEOUT,
        }
    }

    fn bool_flag(&self, key: &str, default: bool) -> bool {
        match self.annotations.get(key) {
            Some(value) => parse_bool(value).unwrap_or_else(|| {
                warn!(flag = key, value = %value, default, "invalid boolean in feature flag, using default");
                default
            }),
            None => default,
        }
    }
}

/// Parse a boolean the way Kubernetes annotations are usually written
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "t" => Some(true),
        "false" | "0" | "f" => Some(false),
        _ => None,
    }
}

/// Duration strings are one or more `<number><unit>` groups, units h/m/s/ms
fn is_duration(value: &str) -> bool {
    let mut rest = value.trim();
    if rest.is_empty() {
        return false;
    }
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if digits == 0 || rest[..digits].parse::<f64>().is_err() {
            return false;
        }
        rest = &rest[digits..];
        let unit = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        if !matches!(&rest[..unit], "h" | "m" | "s" | "ms") {
            return false;
        }
        rest = &rest[unit..];
    }
    true
}
