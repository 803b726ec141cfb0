//! Replication of bootstrapper input secrets into the pod namespace
//!
//! The install container reads its configuration from secrets in its own
//! namespace. The operator maintains the source copies next to the DynaKube;
//! the webhook copies them on demand with create-if-absent semantics, so many
//! pods admitted at once into the same namespace race safely.

use async_trait::async_trait;
use dynatrace_common::error::{is_already_exists, is_not_found};
use dynatrace_common::Result;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::context::MutationContext;

/// Name of the replicated bootstrapper config secret in pod namespaces
pub const CONFIG_SECRET_NAME: &str = "dynatrace-bootstrapper-config";
/// Name of the replicated bootstrapper certificate secret in pod namespaces
pub const CERTS_SECRET_NAME: &str = "dynatrace-bootstrapper-certs";

/// Result of a create-if-absent
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    /// This call created the secret
    Created,
    /// Someone else created it first
    AlreadyExists,
}

/// Secret storage the replication reads from and writes to
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch a secret, `None` when it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Create a secret unless one with the same name exists
    async fn create(&self, namespace: &str, secret: &Secret) -> Result<CreateOutcome>;
}

/// [`SecretStore`] backed by the Kubernetes API
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    /// Create a store using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(secret) => Ok(Some(secret)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, namespace: &str, secret: &Secret) -> Result<CreateOutcome> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), secret).await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(e) if is_already_exists(&e) => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }
}

/// A source secret next to the DynaKube and its copy in the pod namespace
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretPair {
    /// Namespace of the source secret
    pub source_namespace: String,
    /// Name of the source secret
    pub source_name: String,
    /// Name of the copy
    pub target_name: String,
}

impl SecretPair {
    /// Pair for a source secret and its well-known target name
    pub fn new(
        source_namespace: impl Into<String>,
        source_name: impl Into<String>,
        target_name: impl Into<String>,
    ) -> Self {
        Self {
            source_namespace: source_namespace.into(),
            source_name: source_name.into(),
            target_name: target_name.into(),
        }
    }
}

/// What replication found or did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Replication {
    /// The target already existed (or a concurrent admission created it)
    AlreadyPresent,
    /// The target was created from the source
    Created,
    /// Neither target nor source exist; injection is not possible
    SourceMissing,
}

impl Replication {
    /// The target secret exists after replication
    pub fn is_available(self) -> bool {
        !matches!(self, Self::SourceMissing)
    }
}

/// Ensure the target of `pair` exists in `target_namespace`
///
/// Reads the target first, then the source, then creates the copy. At most
/// one read and one write touch each secret. A missing source is reported
/// as [`Replication::SourceMissing`]; every other failure is an error.
pub async fn replicate(
    store: &dyn SecretStore,
    ctx: &MutationContext,
    pair: &SecretPair,
    target_namespace: &str,
) -> Result<Replication> {
    let existing = ctx
        .run(
            &format!("get secret {}/{}", target_namespace, pair.target_name),
            store.get(target_namespace, &pair.target_name),
        )
        .await?;
    if existing.is_some() {
        debug!(
            secret = %pair.target_name,
            namespace = %target_namespace,
            "target secret already present"
        );
        return Ok(Replication::AlreadyPresent);
    }

    info!(
        secret = %pair.target_name,
        namespace = %target_namespace,
        source = %pair.source_name,
        "target secret not available, replicating"
    );

    let source = ctx
        .run(
            &format!("get secret {}/{}", pair.source_namespace, pair.source_name),
            store.get(&pair.source_namespace, &pair.source_name),
        )
        .await?;
    let Some(source) = source else {
        return Ok(Replication::SourceMissing);
    };

    let target = Secret {
        metadata: ObjectMeta {
            name: Some(pair.target_name.clone()),
            namespace: Some(target_namespace.to_string()),
            ..Default::default()
        },
        type_: source.type_,
        data: source.data,
        string_data: source.string_data,
        ..Default::default()
    };

    let outcome = ctx
        .run(
            &format!("create secret {}/{}", target_namespace, pair.target_name),
            store.create(target_namespace, &target),
        )
        .await?;

    Ok(match outcome {
        CreateOutcome::Created => Replication::Created,
        CreateOutcome::AlreadyExists => {
            debug!(
                secret = %pair.target_name,
                namespace = %target_namespace,
                "secret created concurrently"
            );
            Replication::AlreadyPresent
        }
    })
}
