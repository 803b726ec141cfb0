//! Dynatrace webhook - OneAgent code-module injection for Kubernetes pods

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::CustomResourceExt;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dynatrace_common::crd::DynaKube;
use dynatrace_common::kube_utils::create_client;
use dynatrace_common::telemetry::{init_telemetry, TelemetryConfig};
use dynatrace_common::{Error, KubeEventPublisher, WEBHOOK_COMPONENT};
use dynatrace_pod_mutation::{
    KubeOwnerLookup, KubeSecretStore, MutationContext, MutationRequest, PodMutationWebhook,
    WebhookSettings,
};

/// Dynatrace webhook - injects OneAgent code modules into admitted pods
#[derive(Parser, Debug)]
#[command(name = "dynatrace-webhook", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: SettingsArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Process-level settings, usually injected by the operator deployment
#[derive(Args, Debug)]
struct SettingsArgs {
    /// Path to a kubeconfig; inferred when omitted
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    /// Deadline for one pipeline run, in seconds
    #[arg(long, global = true, default_value_t = 10)]
    timeout_secs: u64,

    /// The OneAgent CSI driver is installed in the cluster
    #[arg(long, global = true, env = "DT_CSI_DRIVER_INSTALLED")]
    csi_driver: bool,

    /// Operator version reported in DT_DEPLOYMENT_METADATA
    #[arg(long, global = true, env = "DT_OPERATOR_VERSION", default_value = "snapshot")]
    operator_version: String,

    /// The cluster is OpenShift
    #[arg(long, global = true, env = "DT_IS_OPENSHIFT")]
    openshift: bool,

    /// Instance reported on Kubernetes events (usually the webhook pod name)
    #[arg(long, global = true, env = "POD_NAME")]
    instance: Option<String>,
}

impl SettingsArgs {
    fn webhook_settings(&self) -> WebhookSettings {
        WebhookSettings {
            csi_driver_available: self.csi_driver,
            operator_version: self.operator_version.clone(),
            is_openshift: self.openshift,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the DynaKube CRD manifest and exit
    Crd,

    /// Run the mutation pipeline for one pod and print the resulting patch
    ///
    /// Secrets are replicated, owners looked up and events published against
    /// the cluster the kubeconfig points at. The pod itself is not written.
    Mutate {
        /// Pod manifest (YAML or JSON)
        #[arg(long)]
        pod: PathBuf,

        /// Namespace manifest of the pod
        #[arg(long)]
        namespace: PathBuf,

        /// DynaKube manifest
        #[arg(long)]
        dynakube: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Crd => {
            let crd = serde_yaml::to_string(&DynaKube::crd())
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("{crd}");
            Ok(())
        }
        Commands::Mutate {
            pod,
            namespace,
            dynakube,
        } => {
            init_telemetry(TelemetryConfig::default())
                .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;
            run_mutate(&cli.settings, &pod, &namespace, &dynakube).await
        }
    }
}

async fn run_mutate(
    settings: &SettingsArgs,
    pod_path: &Path,
    namespace_path: &Path,
    dynakube_path: &Path,
) -> anyhow::Result<()> {
    let pod: Pod = load_manifest(pod_path)?;
    let namespace: Namespace = load_manifest(namespace_path)?;
    let dynakube: DynaKube = load_manifest(dynakube_path)?;

    let client = create_client(settings.kubeconfig.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let webhook = PodMutationWebhook::new(
        Arc::new(KubeSecretStore::new(client.clone())),
        Arc::new(KubeOwnerLookup::new(client.clone())),
        Arc::new(KubeEventPublisher::new(
            client,
            WEBHOOK_COMPONENT,
            settings.instance.clone(),
        )),
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling pipeline");
            on_signal.cancel();
        }
    });
    let deadline = tokio::time::Instant::now() + Duration::from_secs(settings.timeout_secs);
    let context = MutationContext::new(cancel).with_deadline(deadline);

    let original = serde_json::to_value(&pod)?;
    let mut request = MutationRequest::new(
        pod,
        namespace,
        &dynakube,
        &settings.webhook_settings(),
        context,
    );

    if !webhook.is_enabled(&request) {
        info!(pod = %request.pod_name(), "pod is not eligible for injection");
        println!("outcome: not eligible");
        return Ok(());
    }

    let outcome = match webhook.handle(&mut request).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(
                error = %e,
                stage = e.context().unwrap_or("-"),
                retryable = e.is_retryable(),
                "pod mutation failed"
            );
            anyhow::bail!("Pod mutation failed ({}): {}", failure_hint(&e), e);
        }
    };

    let mutated = serde_json::to_value(request.into_pod())?;
    let patch = json_patch::diff(&original, &mutated);

    println!("outcome: {outcome}");
    println!("{}", serde_json::to_string_pretty(&patch)?);
    Ok(())
}

/// How an operator should react to a failed run
fn failure_hint(err: &Error) -> &'static str {
    if err.is_cancelled() {
        "interrupted or timed out, safe to retry"
    } else if err.is_retryable() {
        "transient, safe to retry"
    } else {
        "fails again until the DynaKube or cluster state changes"
    }
}

/// Read a Kubernetes object from a YAML (or JSON) file
fn load_manifest<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
    serde_yaml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn mutate_takes_three_manifests_and_global_settings() {
        let cli = Cli::try_parse_from([
            "dynatrace-webhook",
            "mutate",
            "--pod",
            "pod.yaml",
            "--namespace",
            "ns.yaml",
            "--dynakube",
            "dk.yaml",
            "--csi-driver",
            "--operator-version",
            "1.5.0",
        ])
        .expect("parse");

        let settings = cli.settings.webhook_settings();
        assert!(settings.csi_driver_available);
        assert_eq!(settings.operator_version, "1.5.0");
        assert!(matches!(cli.command, Commands::Mutate { .. }));
    }

    #[test]
    fn mutate_requires_dynakube() {
        let parsed = Cli::try_parse_from([
            "dynatrace-webhook",
            "mutate",
            "--pod",
            "pod.yaml",
            "--namespace",
            "ns.yaml",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn failure_hints_follow_retryability() {
        assert_eq!(
            failure_hint(&Error::deadline_exceeded("owner lookup")),
            "interrupted or timed out, safe to retry"
        );
        assert_eq!(
            failure_hint(&Error::workload_lookup("ReplicaSet", "web-5d8f", "timeout")),
            "transient, safe to retry"
        );
        assert_eq!(
            failure_hint(&Error::configuration_for_field(
                "dynakube",
                "status.oneAgent.connectionInfoStatus.tenantUUID",
                "tenant UUID not available",
            )),
            "fails again until the DynaKube or cluster state changes"
        );
    }

    #[test]
    fn crd_names_dynakube() {
        let crd = DynaKube::crd();
        assert_eq!(crd.metadata.name.as_deref(), Some("dynakubes.dynatrace.com"));
    }
}
