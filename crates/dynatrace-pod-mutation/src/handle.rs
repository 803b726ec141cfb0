//! Pod mutation pipeline
//!
//! Entry point for one admission: replicate the bootstrapper input secrets,
//! then either run every enabled mutator on a new pod or the reinvocation
//! pass on a pod that already carries the install container.

use std::fmt;
use std::sync::Arc;

use dynatrace_common::{Error, EventPublisher, InjectionEvent, Result};
use tracing::{debug, info, instrument, warn};

use crate::annotations::NotInjectedReason;
use crate::eligibility;
use crate::metadata::{MetadataMutator, OwnerLookup};
use crate::mutator::Mutator;
use crate::oneagent::init::base_install_container;
use crate::oneagent::OneAgentMutator;
use crate::replicate::{
    replicate, SecretPair, SecretStore, CERTS_SECRET_NAME, CONFIG_SECRET_NAME,
};
use crate::request::MutationRequest;

/// What the pipeline did with a pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MutationOutcome {
    /// Injection is not possible; the reason is recorded on the pod
    NotInjected(NotInjectedReason),
    /// First admission, the install container was added
    Injected,
    /// Containers added since the first admission were injected
    Reinvoked,
    /// The pod already had everything
    Unchanged,
}

impl fmt::Display for MutationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInjected(reason) => write!(f, "not injected ({reason})"),
            Self::Injected => f.write_str("injected"),
            Self::Reinvoked => f.write_str("reinvoked"),
            Self::Unchanged => f.write_str("unchanged"),
        }
    }
}

/// Runs the mutation pipeline against admitted pods
pub struct PodMutationWebhook {
    secrets: Arc<dyn SecretStore>,
    events: Arc<dyn EventPublisher>,
    mutators: Vec<Mutator>,
}

impl PodMutationWebhook {
    /// Create the pipeline with its external collaborators
    pub fn new(
        secrets: Arc<dyn SecretStore>,
        owners: Arc<dyn OwnerLookup>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            secrets,
            events,
            mutators: vec![
                Mutator::OneAgent(OneAgentMutator),
                Mutator::Metadata(MetadataMutator::new(owners)),
            ],
        }
    }

    /// This pipeline handles the pod at all
    pub fn is_enabled(&self, request: &MutationRequest) -> bool {
        eligibility::is_enabled(request)
    }

    /// Run the pipeline, mutating `request.pod` in place
    ///
    /// Annotations are written back to the pod only when this returns `Ok`.
    #[instrument(
        skip_all,
        fields(pod = %request.pod_name(), namespace = %request.namespace_name())
    )]
    pub async fn handle(&self, request: &mut MutationRequest) -> Result<MutationOutcome> {
        if let Some(reason) = self.prepare(request).await? {
            info!(%reason, "pod not injected");
            request.annotations.state.set_agent_not_injected(reason.clone());
            request.annotations.write_to(&mut request.pod);
            return Ok(MutationOutcome::NotInjected(reason));
        }

        let outcome = if request.has_install_container() {
            self.reinvoke(request).await
        } else {
            self.mutate(request).await?;
            MutationOutcome::Injected
        };

        request.annotations.state.finalize();
        request.annotations.write_to(&mut request.pod);
        info!(%outcome, "pod mutation finished");
        Ok(outcome)
    }

    /// Replicate input secrets and check the code-modules image
    ///
    /// Returns the reason injection is impossible, if any.
    async fn prepare(&self, request: &MutationRequest) -> Result<Option<NotInjectedReason>> {
        let sources = &request.config.source_secrets;
        let mut pairs = vec![SecretPair::new(
            &sources.namespace,
            &sources.config,
            CONFIG_SECRET_NAME,
        )];
        if request.config.needs_certs {
            pairs.push(SecretPair::new(
                &sources.namespace,
                &sources.certs,
                CERTS_SECRET_NAME,
            ));
        }

        for pair in &pairs {
            let replication = replicate(
                self.secrets.as_ref(),
                &request.context,
                pair,
                request.namespace_name(),
            )
            .await?;
            if !replication.is_available() {
                warn!(
                    secret = %pair.source_name,
                    namespace = %pair.source_namespace,
                    "bootstrapper source secret missing"
                );
                return Ok(Some(NotInjectedReason::NoBootstrapperConfig));
            }
        }

        if request.config.code_modules_image.is_none() {
            warn!(dynakube = %request.config.dynakube_name, "no code modules image available");
            return Ok(Some(NotInjectedReason::NoCodeModulesImage));
        }

        Ok(None)
    }

    /// First admission: build the install container and run every enabled mutator
    async fn mutate(&self, request: &mut MutationRequest) -> Result<()> {
        let spec = request.pod.spec.get_or_insert_with(Default::default);
        request.install_container = Some(base_install_container(spec, &request.config));

        for mutator in &self.mutators {
            if !mutator.is_enabled(request) {
                debug!(mutator = mutator.name(), "mutator disabled for pod");
                continue;
            }
            mutator.mutate(request).await?;
        }

        let install = request.install_container.take().ok_or_else(|| {
            Error::internal_with_context("mutation", "install container vanished")
        })?;
        request
            .pod
            .spec
            .get_or_insert_with(Default::default)
            .init_containers
            .get_or_insert_with(Vec::new)
            .push(install);

        let event = InjectionEvent::Injected {
            pod: request.pod_name().to_string(),
            namespace: request.namespace_name().to_string(),
        };
        self.events
            .publish(&request.config.dynakube_ref, event)
            .await;
        Ok(())
    }

    /// Later admission: inject containers added since the first one
    ///
    /// Errors are logged and reported as [`MutationOutcome::Unchanged`].
    async fn reinvoke(&self, request: &mut MutationRequest) -> MutationOutcome {
        let snapshot: &MutationRequest = request;
        let enabled: Vec<&Mutator> = self
            .mutators
            .iter()
            .filter(|m| m.is_enabled(snapshot))
            .collect();
        let event = InjectionEvent::Updated {
            pod: snapshot.pod_name().to_string(),
            namespace: snapshot.namespace_name().to_string(),
        };
        let dynakube_ref = snapshot.config.dynakube_ref.clone();

        let updated = {
            let Some(mut view) = request.reinvocation() else {
                return MutationOutcome::Unchanged;
            };
            let mut updated = false;
            for mutator in enabled {
                match mutator.reinvoke(&mut view) {
                    Ok(changed) => updated |= changed,
                    Err(e) => warn!(
                        mutator = mutator.name(),
                        error = %e,
                        "reinvocation failed"
                    ),
                }
            }
            updated
        };

        if !updated {
            debug!("no change, all containers already injected");
            return MutationOutcome::Unchanged;
        }

        self.events.publish(&dynakube_ref, event).await;
        MutationOutcome::Reinvoked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::{
        DYNATRACE_INJECTED, DYNATRACE_REASON, INJECTED, METADATA_INJECTED, REASON, WORKLOAD_KIND,
    };
    use crate::context::MutationContext;
    use crate::metadata::workload::MockOwnerLookup;
    use crate::oneagent::env::{is_injected, set_injected_env, INJECTED_ENV};
    use crate::test_support::{
        container, dynakube, namespace, owner_ref, request, secret, settings,
        InMemorySecretStore,
    };
    use crate::INSTALL_CONTAINER_NAME;
    use dynatrace_common::NoopEventPublisher;
    use k8s_openapi::api::core::v1::{Container, ObjectReference, Pod};
    use mockall::mock;
    use tokio_util::sync::CancellationToken;

    mock! {
        pub Events {}

        #[async_trait::async_trait]
        impl EventPublisher for Events {
            async fn publish(&self, dynakube: &ObjectReference, event: InjectionEvent);
        }
    }

    fn store_with_sources(certs: bool) -> Arc<InMemorySecretStore> {
        let store = InMemorySecretStore::default();
        store.insert(secret(
            "dynatrace",
            "dynakube-bootstrapper-config",
            &[("config", "{\"tenant\":\"abc12345\"}")],
        ));
        if certs {
            store.insert(secret(
                "dynatrace",
                "dynakube-bootstrapper-certs",
                &[("certs.pem", "-----BEGIN CERTIFICATE-----")],
            ));
        }
        Arc::new(store)
    }

    fn no_owners() -> Arc<MockOwnerLookup> {
        let mut owners = MockOwnerLookup::new();
        owners.expect_owner_references().never();
        Arc::new(owners)
    }

    fn webhook(store: Arc<InMemorySecretStore>) -> PodMutationWebhook {
        PodMutationWebhook::new(store, no_owners(), Arc::new(NoopEventPublisher))
    }

    fn annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
        pod.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    fn install_of(pod: &Pod) -> Option<&Container> {
        pod.spec
            .as_ref()
            .and_then(|s| s.init_containers.as_ref())
            .and_then(|ics| ics.iter().find(|c| c.name == INSTALL_CONTAINER_NAME))
    }

    fn readmit(pod: Pod) -> MutationRequest {
        MutationRequest::new(
            pod,
            namespace(),
            &dynakube(),
            &settings(),
            MutationContext::default(),
        )
    }

    #[tokio::test]
    async fn story_missing_source_secret_is_reported_not_failed() {
        let store = Arc::new(InMemorySecretStore::default());
        let wh = webhook(store.clone());
        let mut req = request();
        assert!(wh.is_enabled(&req));

        let outcome = wh.handle(&mut req).await.expect("handle");

        assert_eq!(
            outcome,
            MutationOutcome::NotInjected(NotInjectedReason::NoBootstrapperConfig)
        );
        assert_eq!(annotation(&req.pod, INJECTED), Some("false"));
        assert_eq!(annotation(&req.pod, REASON), Some("NoBootstrapperConfig"));
        assert_eq!(annotation(&req.pod, DYNATRACE_INJECTED), None);
        assert!(install_of(&req.pod).is_none());
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn story_config_and_certs_replicated_then_injected() {
        let store = store_with_sources(true);
        let wh = webhook(store.clone());
        let mut req = request();
        req.config.needs_certs = true;

        let outcome = wh.handle(&mut req).await.expect("handle");

        assert_eq!(outcome, MutationOutcome::Injected);
        let config = store
            .get_secret("shop", CONFIG_SECRET_NAME)
            .expect("config replicated");
        let source = store
            .get_secret("dynatrace", "dynakube-bootstrapper-config")
            .expect("source");
        assert_eq!(config.data, source.data);
        let certs = store
            .get_secret("shop", CERTS_SECRET_NAME)
            .expect("certs replicated");
        let certs_source = store
            .get_secret("dynatrace", "dynakube-bootstrapper-certs")
            .expect("certs source");
        assert!(certs.data.is_some());
        assert_eq!(certs.data, certs_source.data);

        assert_eq!(annotation(&req.pod, INJECTED), Some("true"));
        assert_eq!(annotation(&req.pod, REASON), None);
        assert_eq!(annotation(&req.pod, DYNATRACE_INJECTED), Some("true"));

        let install = install_of(&req.pod).expect("install container");
        assert_eq!(install.image, req.config.code_modules_image);
        let app = &req.pod.spec.as_ref().expect("spec").containers[0];
        assert!(is_injected(app));
    }

    #[tokio::test]
    async fn story_certs_missing_when_needed() {
        let store = store_with_sources(false);
        let wh = webhook(store.clone());
        let mut req = request();
        req.config.needs_certs = true;

        let outcome = wh.handle(&mut req).await.expect("handle");

        assert_eq!(
            outcome,
            MutationOutcome::NotInjected(NotInjectedReason::NoBootstrapperConfig)
        );
        assert!(store.get_secret("shop", CONFIG_SECRET_NAME).is_some());
        assert!(store.get_secret("shop", CERTS_SECRET_NAME).is_none());
    }

    #[tokio::test]
    async fn story_reinvocation_injects_only_new_container() {
        let store = store_with_sources(false);
        let wh = webhook(store);

        let mut req = request();
        set_injected_env(&mut req.pod.spec.as_mut().expect("spec").containers[0]);
        req.pod
            .spec
            .as_mut()
            .expect("spec")
            .containers
            .push(container("worker", "registry.example.com/shop/worker:3"));
        assert_eq!(wh.handle(&mut req).await.expect("admit"), MutationOutcome::Injected);

        // another webhook adds a sidecar after the first pass
        let mut pod = req.into_pod();
        pod.spec
            .as_mut()
            .expect("spec")
            .containers
            .push(container("mesh-proxy", "envoy:1.30"));
        let before = pod.spec.as_ref().expect("spec").containers.clone();

        let mut req = readmit(pod);
        let outcome = wh.handle(&mut req).await.expect("reinvoke");
        assert_eq!(outcome, MutationOutcome::Reinvoked);

        let after = &req.pod.spec.as_ref().expect("spec").containers;
        assert_eq!(after[0], before[0]);
        assert_eq!(after[1], before[1]);
        assert_ne!(after[2], before[2]);
        assert!(is_injected(&after[2]));

        let init_containers = req
            .pod
            .spec
            .as_ref()
            .and_then(|s| s.init_containers.as_ref())
            .expect("init containers");
        assert_eq!(
            init_containers
                .iter()
                .filter(|c| c.name == INSTALL_CONTAINER_NAME)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn story_full_stack_without_tenant_fails_mid_build() {
        let store = store_with_sources(false);
        let wh = webhook(store);
        let mut req = request();
        req.config.full_stack = true;
        req.config.tenant_uuid = None;

        let err = wh.handle(&mut req).await.expect_err("no tenant");
        assert!(matches!(err, Error::Configuration { .. }));

        let install = req.install_container.as_ref().expect("partially built");
        let args = install.args.as_ref().expect("args");
        assert_eq!(
            args.last().map(String::as_str),
            Some("--install-path=/opt/dynatrace/oneagent-paas")
        );
        assert!(!args.iter().any(|a| a == "--fullstack"));
        assert!(install_of(&req.pod).is_none());
        assert_eq!(annotation(&req.pod, DYNATRACE_INJECTED), None);
    }

    #[tokio::test]
    async fn no_code_modules_image_is_reported() {
        let store = store_with_sources(false);
        let wh = webhook(store);
        let mut req = request();
        req.config.code_modules_image = None;

        let outcome = wh.handle(&mut req).await.expect("handle");

        assert_eq!(
            outcome,
            MutationOutcome::NotInjected(NotInjectedReason::NoCodeModulesImage)
        );
        assert_eq!(annotation(&req.pod, REASON), Some("NoCodeModulesImage"));
        assert!(install_of(&req.pod).is_none());
    }

    #[tokio::test]
    async fn cancellation_before_replication_leaves_pod_untouched() {
        let store = store_with_sources(false);
        let wh = webhook(store.clone());
        let token = CancellationToken::new();
        let mut req = request();
        req.context = MutationContext::new(token.clone());
        let original = req.pod.clone();
        token.cancel();

        let err = wh.handle(&mut req).await.expect_err("cancelled");

        assert!(err.is_cancelled());
        assert_eq!(req.pod, original);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn admission_then_reinvocation_is_idempotent() {
        let wh = webhook(store_with_sources(false));
        let mut req = request();
        wh.handle(&mut req).await.expect("admit");
        let admitted = req.into_pod();

        let mut req = readmit(admitted.clone());
        let outcome = wh.handle(&mut req).await.expect("reinvoke");

        assert_eq!(outcome, MutationOutcome::Unchanged);
        assert_eq!(req.pod, admitted);
        for c in &req.pod.spec.as_ref().expect("spec").containers {
            let markers = c
                .env
                .as_ref()
                .map(|env| env.iter().filter(|e| e.name == INJECTED_ENV).count())
                .unwrap_or_default();
            assert_eq!(markers, 1);
        }
    }

    #[tokio::test]
    async fn finalization_replaces_stale_reason() {
        let wh = webhook(store_with_sources(false));
        let mut pod = request().into_pod();
        pod.metadata.annotations = Some(
            [(DYNATRACE_REASON.to_string(), "Previous".to_string())]
                .into_iter()
                .collect(),
        );
        let mut req = readmit(pod);

        wh.handle(&mut req).await.expect("handle");

        assert_eq!(annotation(&req.pod, DYNATRACE_INJECTED), Some("true"));
        assert_eq!(annotation(&req.pod, DYNATRACE_REASON), None);
    }

    #[tokio::test]
    async fn metadata_enrichment_runs_with_agent() {
        let mut owners = MockOwnerLookup::new();
        owners
            .expect_owner_references()
            .times(1)
            .returning(|_, _, _, _| Ok(vec![owner_ref("apps/v1", "Deployment", "web", true)]));
        let wh = PodMutationWebhook::new(
            store_with_sources(false),
            Arc::new(owners),
            Arc::new(NoopEventPublisher),
        );

        let mut req = request();
        req.config.metadata_enrichment_enabled = true;
        req.pod.metadata.owner_references =
            Some(vec![owner_ref("apps/v1", "ReplicaSet", "web-5d8f7", true)]);

        assert_eq!(wh.handle(&mut req).await.expect("handle"), MutationOutcome::Injected);
        assert_eq!(annotation(&req.pod, METADATA_INJECTED), Some("true"));
        assert_eq!(annotation(&req.pod, WORKLOAD_KIND), Some("deployment"));
        let install = install_of(&req.pod).expect("install container");
        assert!(install
            .args
            .as_ref()
            .expect("args")
            .contains(&"--attribute=k8s.workload.name=web".to_string()));
    }

    #[tokio::test]
    async fn owner_lookup_failure_fails_admission() {
        let mut owners = MockOwnerLookup::new();
        owners
            .expect_owner_references()
            .returning(|_, kind, _, name| Err(Error::workload_lookup(kind, name, "forbidden")));
        let wh = PodMutationWebhook::new(
            store_with_sources(false),
            Arc::new(owners),
            Arc::new(NoopEventPublisher),
        );

        let mut req = request();
        req.config.metadata_enrichment_enabled = true;
        req.pod.metadata.owner_references =
            Some(vec![owner_ref("apps/v1", "ReplicaSet", "web-5d8f7", true)]);

        assert!(wh.handle(&mut req).await.is_err());
        assert!(install_of(&req.pod).is_none());
    }

    #[tokio::test]
    async fn events_follow_the_branch_taken() {
        let mut events = MockEvents::new();
        events
            .expect_publish()
            .withf(|dk, event| {
                dk.name.as_deref() == Some("dynakube")
                    && matches!(event, InjectionEvent::Injected { pod, .. } if pod == "web-0")
            })
            .times(1)
            .return_const(());
        events
            .expect_publish()
            .withf(|_, event| {
                *event
                    == InjectionEvent::Updated {
                        pod: "web-0".to_string(),
                        namespace: "shop".to_string(),
                    }
            })
            .times(1)
            .return_const(());
        let wh = PodMutationWebhook::new(store_with_sources(false), no_owners(), Arc::new(events));

        let mut req = request();
        wh.handle(&mut req).await.expect("admit");

        let mut pod = req.into_pod();
        pod.spec
            .as_mut()
            .expect("spec")
            .containers
            .push(container("late", "busybox:1"));
        let mut req = readmit(pod);
        assert_eq!(wh.handle(&mut req).await.expect("reinvoke"), MutationOutcome::Reinvoked);

        // nothing new: no further event
        let mut req = readmit(req.into_pod());
        assert_eq!(wh.handle(&mut req).await.expect("again"), MutationOutcome::Unchanged);
    }

    #[test]
    fn outcome_display() {
        assert_eq!(
            MutationOutcome::NotInjected(NotInjectedReason::NoMutationNeeded).to_string(),
            "not injected (NoMutationNeeded)"
        );
        assert_eq!(MutationOutcome::Reinvoked.to_string(), "reinvoked");
    }
}
