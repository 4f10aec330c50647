pub mod controller;
pub mod crd;
pub mod health;
pub mod postgres;

pub use controller::{BackoffSchedule, Context, Error, FINALIZER, Result, error_policy, reconcile};
pub use crd::PostgresUserRole;

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::Controller;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client};

use crate::health::HealthState;

/// Run the operator controller
///
/// This is the main controller loop that watches PostgresUserRole
/// resources and reconciles them. It can be called from main.rs or
/// spawned as a background task during integration tests.
pub async fn run_user_role_controller(client: Client, health_state: Option<Arc<HealthState>>) {
    tracing::info!("Starting controller for PostgresUserRole resources");

    let ctx = Arc::new(Context::new(client.clone(), health_state));

    // Set up APIs for the controller
    let user_roles: Api<PostgresUserRole> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::all(client.clone());

    // Configure watcher to handle dynamic resource creation
    // Use any_semantic() for more reliable resource discovery in test environments
    let watcher_config = WatcherConfig::default().any_semantic();

    // Create and run the controller
    // Watch PostgresUserRole and the owned secrets to trigger reconciliation
    Controller::new(user_roles, watcher_config.clone())
        .owns(secrets, watcher_config)
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!("Reconciled: {}", obj.name);
                }
                Err(e) => {
                    tracing::error!("Reconciliation error: {:?}", e);
                }
            }
        })
        .await;

    // This should never complete in normal operation
    tracing::error!("Controller stream ended unexpectedly");
}
