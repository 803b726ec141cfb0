//! Kubernetes Events recorded on the DynaKube that drove an injection
//!
//! Events are fire-and-forget: a failed publish is logged and never fails the
//! admission that caused it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// What the webhook did to a pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InjectionEvent {
    /// Code modules were injected into a newly admitted pod
    Injected {
        /// Pod name (or generateName)
        pod: String,
        /// Namespace of the pod
        namespace: String,
    },
    /// Containers added after the first admission were injected
    Updated {
        /// Pod name (or generateName)
        pod: String,
        /// Namespace of the pod
        namespace: String,
    },
}

impl InjectionEvent {
    /// REASON column of `kubectl get events`
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Injected { .. } => "Inject",
            Self::Updated { .. } => "UpdatePod",
        }
    }

    /// ACTION column of `kubectl get events`
    pub fn action(&self) -> &'static str {
        match self {
            Self::Injected { .. } => "Mutate",
            Self::Updated { .. } => "Reinvoke",
        }
    }

    /// Human-readable message
    pub fn note(&self) -> String {
        match self {
            Self::Injected { pod, namespace } => format!(
                "Injecting the necessary info into pod {} in namespace {}",
                pod, namespace
            ),
            Self::Updated { pod, namespace } => {
                format!("Updating pod {} in namespace {}", pod, namespace)
            }
        }
    }

    fn to_event(&self) -> Event {
        Event {
            type_: EventType::Normal,
            reason: self.reason().to_string(),
            note: Some(self.note()),
            action: self.action().to_string(),
            secondary: None,
        }
    }
}

/// Records [`InjectionEvent`]s
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record `event` on the DynaKube referenced by `dynakube`
    async fn publish(&self, dynakube: &ObjectReference, event: InjectionEvent);
}

/// Publishes through `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Report events as `component`, from `instance` (usually the webhook pod name)
    pub fn new(client: Client, component: &str, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: component.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, dynakube: &ObjectReference, event: InjectionEvent) {
        if let Err(e) = self.recorder.publish(&event.to_event(), dynakube).await {
            warn!(
                reason = event.reason(),
                dynakube = ?dynakube.name,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Drops every event; used for offline runs and tests
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _dynakube: &ObjectReference, _event: InjectionEvent) {}
}
