//! Status management for PostgresUserRole resources
//!
//! The reconciler mutates a working copy of the status throughout the
//! pass (queued old roles, active login name, rotation timestamp); these
//! helpers stamp the outcome on it and patch the status subresource, so a
//! failed pass still persists whatever bookkeeping already happened.

use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use tracing::{error, info};

use crate::controller::context::{Context, FIELD_MANAGER};
use crate::controller::error::{Error, Result};
use crate::crd::{PostgresUserRole, PostgresUserRoleStatus, UserRolePhase};

/// Patch the status subresource with the given working copy
pub async fn patch_status(
    ctx: &Context,
    user_role: &PostgresUserRole,
    namespace: &str,
    status: &PostgresUserRoleStatus,
) -> Result<()> {
    let name = user_role.name_any();
    let api: Api<PostgresUserRole> = Api::namespaced(ctx.client.clone(), namespace);

    let patch = serde_json::json!({ "status": status });

    api.patch_status(
        &name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;

    Ok(())
}

/// Record a failed pass: phase Failed, not ready, message set, error
/// counter incremented, warning event emitted
pub async fn manage_error(
    ctx: &Context,
    user_role: &PostgresUserRole,
    namespace: &str,
    status: &mut PostgresUserRoleStatus,
    issue: &Error,
) {
    let name = user_role.name_any();
    error!(name = %name, namespace = %namespace, error = %issue, "issue raised in reconcile");

    ctx.publish_warning_event(
        user_role,
        "ProcessingError",
        "Reconciling",
        Some(issue.to_string()),
    )
    .await;

    status.message = issue.to_string();
    status.ready = false;
    status.phase = UserRolePhase::Failed;

    ctx.record_error(namespace, &name);

    if let Err(e) = patch_status(ctx, user_role, namespace, status).await {
        error!(name = %name, error = %e, "unable to update status");
    }
}

/// Record a successful pass: phase Created, ready, message cleared
pub async fn manage_success(
    ctx: &Context,
    user_role: &PostgresUserRole,
    namespace: &str,
    status: &mut PostgresUserRoleStatus,
) -> Result<()> {
    status.message = String::new();
    status.ready = true;
    status.phase = UserRolePhase::Created;

    if let Err(e) = patch_status(ctx, user_role, namespace, status).await {
        let name = user_role.name_any();
        ctx.record_error(namespace, &name);
        error!(name = %name, error = %e, "unable to update status");
        return Err(e);
    }

    info!("Reconcile done");

    Ok(())
}
