pub mod cloud;
pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod store;

pub use cloud::{CloudClient, CloudClientBuilder, CloudError, RoleAssumer};
pub use config::OperatorConfig;
pub use controller::{BackoffConfig, Context, Error, Result, Settings, error_policy, reconcile};
pub use crd::{Account, AccountClaim};
pub use health::{HealthState, Metrics};
pub use store::{AccountStore, KubeStore};

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::Controller;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client};

/// Options for running the Account controller
#[derive(Clone, Debug)]
pub struct ControllerOptions {
    /// Namespace holding Accounts and the operator ConfigMap
    pub namespace: String,
    /// Name of the operator ConfigMap
    pub config_map: String,
    /// Accounts reconciled at the same time
    pub max_concurrent_reconciles: u16,
    pub settings: Settings,
}

/// Run the Account controller.
///
/// Watches Accounts in the operator namespace, plus the credential secrets
/// they own, and reconciles them. It can be called from main.rs or spawned
/// as a background task.
///
/// If health_state is provided, metrics will be recorded for reconciliations.
pub async fn run_controller(
    client: Client,
    cloud: Arc<dyn CloudClientBuilder>,
    options: ControllerOptions,
    health_state: Option<Arc<HealthState>>,
) {
    tracing::info!(
        "Starting controller for Account resources (namespace: {}, concurrency: {})",
        options.namespace,
        options.max_concurrent_reconciles
    );

    // Mark as ready once we start the controller
    if let Some(ref state) = health_state {
        state.set_ready(true);
    }

    let store = Arc::new(KubeStore::new(
        client.clone(),
        &options.namespace,
        &options.config_map,
    ));
    let ctx = Arc::new(Context::new(store, cloud, health_state).with_settings(options.settings));

    let accounts: Api<Account> = Api::namespaced(client.clone(), &options.namespace);
    let secrets: Api<Secret> = Api::namespaced(client, &options.namespace);

    let watcher_config = WatcherConfig::default().any_semantic();
    let controller_config =
        ControllerConfig::default().concurrency(options.max_concurrent_reconciles);

    Controller::new(accounts, watcher_config.clone())
        .with_config(controller_config)
        .owns(secrets, watcher_config)
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!("Reconciled: {}", obj.name);
                }
                Err(e) => {
                    // Secret events can arrive for an Account that was just deleted
                    let is_not_found = matches!(
                        &e,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) if err.is_not_found()
                    );
                    if is_not_found {
                        tracing::debug!("Object no longer exists (likely deleted): {:?}", e);
                    } else {
                        tracing::error!("Reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    // This should never complete in normal operation
    tracing::error!("Controller stream ended unexpectedly");
}
