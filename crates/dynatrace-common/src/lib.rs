//! Common types for the Dynatrace webhook: DynaKube CRD, errors, events and telemetry

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod telemetry;

pub use error::Error;
pub use events::{EventPublisher, InjectionEvent, KubeEventPublisher, NoopEventPublisher};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Name used as the reporting component on events and as the telemetry service name
pub const WEBHOOK_COMPONENT: &str = "dynatrace-webhook";
