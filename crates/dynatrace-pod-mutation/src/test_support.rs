//! Fixtures shared by the unit tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use dynatrace_common::crd::feature_flags::NODE_IMAGE_PULL;
use dynatrace_common::crd::{
    AppInjectionSpec, CodeModulesStatus, DynaKube, DynaKubeSpec, DynaKubeStatus,
    NamespaceSelector,
};
use dynatrace_common::Result;
use k8s_openapi::api::core::v1::{Container, Namespace, Pod, PodSpec, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;

use crate::config::WebhookSettings;
use crate::context::MutationContext;
use crate::replicate::{CreateOutcome, SecretStore};
use crate::request::MutationRequest;
use crate::INSTALL_CONTAINER_NAME;

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Application-monitoring DynaKube with node image pull enabled
pub fn dynakube() -> DynaKube {
    let mut spec = DynaKubeSpec {
        api_url: "https://abc12345.live.dynatrace.com/api".to_string(),
        ..Default::default()
    };
    spec.one_agent.application_monitoring = Some(AppInjectionSpec {
        namespace_selector: Some(NamespaceSelector {
            match_labels: Some(labels(&[("monitoring", "enabled")])),
            match_expressions: vec![],
        }),
        code_modules_image: Some("registry.example.com/dynatrace/codemodules:1.303.0".to_string()),
        ..Default::default()
    });

    let mut dk = DynaKube::new("dynakube", spec);
    dk.metadata.namespace = Some("dynatrace".to_string());
    dk.metadata.annotations = Some(labels(&[(NODE_IMAGE_PULL, "true")]));
    dk.status = Some(DynaKubeStatus {
        kube_system_uuid: Some("kube-system-uid".to_string()),
        kubernetes_cluster_meid: Some("KUBERNETES_CLUSTER-0123456789ABCDEF".to_string()),
        kubernetes_cluster_name: Some("prod-eu".to_string()),
        code_modules: Some(CodeModulesStatus {
            version: Some("1.303.0".to_string()),
            image_id: None,
        }),
        one_agent: None,
        metadata_enrichment: None,
    });
    dk
}

pub fn settings() -> WebhookSettings {
    WebhookSettings {
        csi_driver_available: false,
        operator_version: "1.5.0".to_string(),
        is_openshift: false,
    }
}

/// Namespace matched by the [`dynakube`] selector
pub fn namespace() -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some("shop".to_string()),
            labels: Some(labels(&[("monitoring", "enabled")])),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn container(name: &str, image: &str) -> Container {
    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        ..Default::default()
    }
}

/// Install container as found on a pod after the first admission
pub fn install_container() -> Container {
    Container {
        name: INSTALL_CONTAINER_NAME.to_string(),
        image: Some("registry.example.com/dynatrace/codemodules:1.303.0".to_string()),
        args: Some(vec!["bootstrap".to_string()]),
        ..Default::default()
    }
}

pub fn pod() -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some("web-0".to_string()),
            namespace: Some("shop".to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container("app", "registry.example.com/shop/web:1.2")],
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Eligible first admission of [`pod`]
pub fn request() -> MutationRequest {
    MutationRequest::new(
        pod(),
        namespace(),
        &dynakube(),
        &settings(),
        MutationContext::default(),
    )
}

pub fn owner_ref(api_version: &str, kind: &str, name: &str, controller: bool) -> OwnerReference {
    OwnerReference {
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        uid: format!("{}-uid", name),
        controller: Some(controller),
        ..Default::default()
    }
}

pub fn secret(namespace: &str, name: &str, data: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

/// [`SecretStore`] with atomic create-if-absent, keyed by namespace and name
#[derive(Default)]
pub struct InMemorySecretStore {
    secrets: Mutex<BTreeMap<(String, String), Secret>>,
    creates: AtomicUsize,
}

impl InMemorySecretStore {
    pub fn insert(&self, secret: Secret) {
        let key = (
            secret.metadata.namespace.clone().unwrap_or_default(),
            secret.metadata.name.clone().unwrap_or_default(),
        );
        self.secrets.lock().expect("lock").insert(key, secret);
    }

    pub fn get_secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.secrets
            .lock()
            .expect("lock")
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.secrets.lock().expect("lock").len()
    }

    /// Successful creates so far
    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        // let concurrent admissions interleave between get and create
        tokio::task::yield_now().await;
        Ok(self.get_secret(namespace, name))
    }

    async fn create(&self, namespace: &str, secret: &Secret) -> Result<CreateOutcome> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        let mut secrets = self.secrets.lock().expect("lock");
        let key = (namespace.to_string(), name);
        if secrets.contains_key(&key) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        secrets.insert(key, secret.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(CreateOutcome::Created)
    }
}
