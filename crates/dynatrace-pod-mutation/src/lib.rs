//! Pod mutation pipeline for OneAgent code-module injection
//!
//! Mutates pods admitted into monitored namespaces so an install init
//! container places the code modules before user containers start.
//!
//! Entry point is [`PodMutationWebhook::handle`]. The stages it runs:
//! - `replicate`: bootstrapper input secrets into the pod namespace
//! - `oneagent`: install container and user container injection
//! - `metadata`: owning workload and namespace metadata enrichment

#![deny(missing_docs)]

pub mod annotations;
pub mod args;
pub mod attributes;
pub mod config;
pub mod context;
pub mod eligibility;
pub mod handle;
pub mod metadata;
pub mod mutator;
pub mod oneagent;
pub mod replicate;
pub mod request;

#[cfg(test)]
mod test_support;

/// Reserved name of the install init container
pub const INSTALL_CONTAINER_NAME: &str = "dynatrace-operator";

pub use annotations::{NotInjectedReason, PodAnnotations};
pub use config::{InjectionConfig, WebhookSettings};
pub use context::MutationContext;
pub use handle::{MutationOutcome, PodMutationWebhook};
pub use metadata::{KubeOwnerLookup, OwnerLookup};
pub use replicate::{KubeSecretStore, SecretStore};
pub use request::MutationRequest;

// Re-export common error types
pub use dynatrace_common::{Error, Result};
