// Copyright (c) Microsoft. All rights reserved.

//! The controller daemon: load configuration, dial the SPIRE server, wire
//! the entry and federation reconcilers to their triggers and the webhook
//! credential manager to its timers, and run until SIGTERM or ctrl-c.

#![deny(rust_2018_idioms)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::default_trait_access,
    clippy::let_unit_value,
    clippy::missing_errors_doc,
    clippy::similar_names,
    clippy::too_many_lines
)]

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use futures_util::StreamExt;
use kube::api::ListParams;
use log::{error, info, warn};
use tokio::sync::{mpsc, watch};

use cluster_resources::{ClusterFederatedTrustDomain, ClusterSpiffeId, ClusterStaticEntry};
use controller_config::Config;
use entry_reconciler::{
    prefix::{CleanupMatcher, EntryIdPrefix},
    EntryReconciler, EntryReconcilerConfig,
};
use federation_reconciler::FederationReconciler;
use reconcile_trigger::{run_reconciler, Trigger};
use resource_loader::{kube_state::KubeClusterState, static_state::StaticClusterState, ClusterState};
use spire_client::SpireClient;
use webhook_manager::{api::KubeWebhookConfigApi, WebhookManager};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

const CONTROLLER_SPIFFE_ID_PATH: &str = "/spire-controller/webhook";
const WEBHOOK_KEYPAIR_FILE: &str = "keypair.pem";

#[derive(Parser)]
#[command(about = "Reconciles SPIFFE identities between Kubernetes and SPIRE")]
struct Args {
    /// Path to the controller configuration file.
    #[arg(long, default_value = "controller-config.yaml")]
    config: PathBuf,

    /// Expand ${VAR} references in the config file and static manifests.
    #[arg(long)]
    expand_env: bool,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(err) = run(args).await {
        error!("{}", err);
        std::process::exit(1);
    }
}

fn webhooks_enabled() -> bool {
    std::env::var("ENABLE_WEBHOOKS").map_or(true, |value| value != "false")
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load(&args.config, args.expand_env)?;
    let trust_domain = config.trust_domain();

    // Dial failure is fatal; verify connectivity before starting any loop.
    let rpc = Arc::new(spire_client::http::Client::new(
        &config.spire_server_socket_path,
    )?);
    let spire = Arc::new(SpireClient::new(rpc, trust_domain.clone()));
    spire
        .get_bundle()
        .await
        .map_err(|err| format!("cannot reach SPIRE server: {err}"))?;
    info!(
        "Connected to SPIRE server at {}",
        config.spire_server_socket_path.display()
    );

    let static_mode = config.static_mode();
    let kube_client = if static_mode {
        None
    } else {
        Some(kube::Client::try_default().await?)
    };

    let state: Arc<dyn ClusterState> = match &config.static_manifest_path {
        Some(path) => {
            info!("Static manifest mode, reading {}", path.display());
            Arc::new(StaticClusterState::new(path.clone(), args.expand_env))
        }
        None => Arc::new(KubeClusterState::new(
            kube_client.clone().expect("kube client in kube mode"),
        )),
    };

    let cluster_domain = match &config.cluster_domain {
        Some(domain) => Some(domain.clone()),
        None if !static_mode => {
            let detected = controller_config::detect_cluster_domain().await;
            match &detected {
                Some(domain) => info!("Detected cluster domain {}", domain),
                None => warn!("Could not detect cluster domain; endpoint DNS names will omit it"),
            }
            detected
        }
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let gc_interval = Duration::from_secs(config.gc_interval);
    let mut tasks = Vec::new();

    // Entry reconciler.
    let entry_trigger = Trigger::new();
    if config.reconcile.cluster_spiffe_ids || config.reconcile.cluster_static_entries {
        let reconciler = Arc::new(EntryReconciler::new(
            state.clone(),
            spire.clone(),
            EntryReconcilerConfig {
                trust_domain: trust_domain.clone(),
                cluster_name: config.cluster_name.clone(),
                cluster_domain: cluster_domain.clone(),
                default_parent_id_template: config
                    .parent_id_template
                    .clone()
                    .unwrap_or_else(|| entry_renderer::DEFAULT_PARENT_ID_TEMPLATE.to_string()),
                ignore_namespaces: config.ignore_namespace_patterns()?,
                class_matcher: config.class_matcher(),
                reconcile_cluster_spiffe_ids: config.reconcile.cluster_spiffe_ids,
                reconcile_cluster_static_entries: config.reconcile.cluster_static_entries,
                entry_id_prefix: config.entry_id_prefix.as_deref().map(EntryIdPrefix::new),
                entry_id_prefix_cleanup: config
                    .entry_id_prefix_cleanup
                    .as_deref()
                    .map(CleanupMatcher::from_config),
            },
        ));
        tasks.push(tokio::spawn(run_reconciler(
            reconciler,
            entry_trigger.clone(),
            gc_interval,
            shutdown_rx.clone(),
        )));
    }

    // Federation reconciler.
    let federation_trigger = Trigger::new();
    if config.reconcile.cluster_federated_trust_domains {
        let reconciler = Arc::new(FederationReconciler::new(
            state.clone(),
            spire.clone(),
            config.class_matcher(),
        ));
        tasks.push(tokio::spawn(run_reconciler(
            reconciler,
            federation_trigger.clone(),
            gc_interval,
            shutdown_rx.clone(),
        )));
    }

    // Object-cache change notifications feed the triggers.
    if let Some(client) = &kube_client {
        spawn_trigger_watch::<ClusterSpiffeId>(client.clone(), entry_trigger.clone());
        spawn_trigger_watch::<ClusterStaticEntry>(client.clone(), entry_trigger.clone());
        spawn_trigger_watch::<k8s_openapi::api::core::v1::Pod>(
            client.clone(),
            entry_trigger.clone(),
        );
        spawn_trigger_watch::<k8s_openapi::api::core::v1::Namespace>(
            client.clone(),
            entry_trigger.clone(),
        );
        spawn_trigger_watch::<k8s_openapi::api::core::v1::Node>(
            client.clone(),
            entry_trigger.clone(),
        );
        spawn_trigger_watch::<k8s_openapi::api::core::v1::Endpoints>(
            client.clone(),
            entry_trigger.clone(),
        );
        spawn_trigger_watch::<ClusterFederatedTrustDomain>(
            client.clone(),
            federation_trigger.clone(),
        );
    }

    // Webhook credential manager, kube mode only. The temp directory lives
    // until shutdown; dropping it removes the keypair file.
    let mut keypair_dir_guard: Option<tempfile::TempDir> = None;
    if let Some(client) = &kube_client {
        if webhooks_enabled() {
            let keypair_dir = tempfile::tempdir()?;
            let manager = Arc::new(WebhookManager::new(
                spire.clone(),
                Arc::new(KubeWebhookConfigApi::new(
                    client.clone(),
                    &config.validating_webhook_configuration_name,
                )),
                core_objects::SPIFFEID::new(trust_domain.clone(), CONTROLLER_SPIFFE_ID_PATH)?,
                keypair_dir.path().join(WEBHOOK_KEYPAIR_FILE),
            ));

            manager
                .initialize()
                .await
                .map_err(|err| format!("webhook manager startup failed: {err}"))?;
            info!(
                "Webhook credentials ready in {}",
                keypair_dir.path().display()
            );

            let events = spawn_webhook_watch(
                client.clone(),
                config.validating_webhook_configuration_name.clone(),
            );
            let manager_shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                manager.run(events, manager_shutdown).await;
            }));

            keypair_dir_guard = Some(keypair_dir);
        } else {
            info!("Webhook management disabled via ENABLE_WEBHOOKS");
        }
    }

    wait_for_termination().await;
    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    drop(keypair_dir_guard);

    Ok(())
}

/// Forward every change event of a watched kind into a reconcile trigger.
fn spawn_trigger_watch<K>(client: kube::Client, trigger: Trigger)
where
    K: kube::core::Resource<DynamicType = ()>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug
        + Send
        + 'static,
{
    let api: kube::Api<K> = kube::Api::all(client);
    tokio::spawn(async move {
        let mut stream = Box::pin(kube::runtime::watcher(api, ListParams::default()));
        while let Some(event) = stream.next().await {
            match event {
                Ok(_) => trigger.trigger(),
                Err(err) => {
                    warn!("Watch error ({}): {}", K::kind(&()), err);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });
}

/// Watch the webhook configuration and deliver change events to the
/// manager.
fn spawn_webhook_watch(client: kube::Client, name: String) -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(8);
    let api: kube::Api<k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration> =
        kube::Api::all(client);

    tokio::spawn(async move {
        let params = ListParams::default().fields(&format!("metadata.name={name}"));
        let mut stream = Box::pin(kube::runtime::watcher(api, params));
        while let Some(event) = stream.next().await {
            match event {
                Ok(_) => {
                    if tx.send(()).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    warn!("Webhook watch error: {}", err);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    rx
}

async fn wait_for_termination() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("cannot install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhooks_are_enabled_unless_explicitly_disabled() {
        std::env::remove_var("ENABLE_WEBHOOKS");
        assert!(webhooks_enabled());

        std::env::set_var("ENABLE_WEBHOOKS", "true");
        assert!(webhooks_enabled());

        std::env::set_var("ENABLE_WEBHOOKS", "false");
        assert!(!webhooks_enabled());

        std::env::remove_var("ENABLE_WEBHOOKS");
    }
}
