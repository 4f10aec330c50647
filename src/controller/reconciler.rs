//! Reconciliation logic for PostgresUserRole resources
//!
//! A pass runs the stages in a fixed order: validate, resolve
//! collaborators, converge the work secret, reap superseded roles,
//! converge the login role, converge privileges, project output secrets,
//! patch status. A failure short-circuits the remainder; the next pass
//! restarts from the top. The whole pass runs under a wall-clock budget,
//! and the deadline failure is recorded against the object outside the
//! expired window.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{error, info, instrument, warn};

use crate::controller::context::{Context, FIELD_MANAGER};
use crate::controller::error::{BackoffSchedule, Error, Result};
use crate::controller::output_secrets::{clean_old_secrets, manage_secrets};
use crate::controller::privileges::manage_user_rights;
use crate::controller::reaper::manage_active_sessions_and_drop_old_roles;
use crate::controller::resolver::{
    get_database_instances, get_engine_configurations, get_engines, secret_key,
};
use crate::controller::role_engine::manage_user_roles;
use crate::controller::status::{manage_error, manage_success};
use crate::controller::validation::{validate_instance, validate_with_cluster_info};
use crate::controller::work_secret::{
    PASSWORD_SECRET_KEY, USERNAME_SECRET_KEY, WorkSecretResult,
    create_or_update_work_secret_managed, create_or_update_work_secret_provided,
    generate_work_secret_name,
};
use crate::crd::{PostgresUserRole, PostgresUserRoleStatus, UserRoleMode, UserRolePhase};

/// Finalizer name for cleanup
pub const FINALIZER: &str = "postgresuserrole.postgres-role-operator.example.com/finalizer";

/// Key for the per-object failure streak. The UID survives status churn
/// and recreations under the same name start a fresh streak.
fn failure_key(user_role: &PostgresUserRole) -> String {
    user_role.metadata.uid.clone().unwrap_or_else(|| {
        format!(
            "{}/{}",
            user_role.namespace().unwrap_or_default(),
            user_role.name_any()
        )
    })
}

/// Main reconciliation function
#[instrument(skip(user_role, ctx), fields(name = %user_role.name_any(), namespace = user_role.namespace().unwrap_or_default()))]
pub async fn reconcile(user_role: Arc<PostgresUserRole>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = user_role
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let name = user_role.name_any();

    info!("Reconciling PostgresUserRole");

    let start = Instant::now();
    let mut status = user_role.status.clone().unwrap_or_default();

    let outcome = tokio::time::timeout(
        ctx.reconcile_timeout,
        main_reconcile(&user_role, &ctx, &namespace, &mut status),
    )
    .await;

    match outcome {
        Ok(Ok(action)) => {
            ctx.record_reconcile(&namespace, &name, start.elapsed().as_secs_f64());
            // A clean pass ends the failure streak
            ctx.failures.reset(&failure_key(&user_role));
            Ok(action)
        }
        Ok(Err(e)) => {
            manage_error(&ctx, &user_role, &namespace, &mut status, &e).await;
            Err(e)
        }
        Err(_elapsed) => {
            // The pass context is gone; the status patch runs against the
            // live one so the failure is persisted.
            let e = Error::DeadlineError(ctx.reconcile_timeout);
            manage_error(&ctx, &user_role, &namespace, &mut status, &e).await;
            Err(e)
        }
    }
}

async fn main_reconcile(
    user_role: &PostgresUserRole,
    ctx: &Context,
    namespace: &str,
    status: &mut PostgresUserRoleStatus,
) -> Result<Action> {
    if user_role.metadata.deletion_timestamp.is_some() {
        return handle_deletion(user_role, ctx, namespace, status).await;
    }

    validate_instance(ctx, user_role, namespace).await?;

    let (databases, privilege_groups) =
        get_database_instances(ctx, user_role, namespace, false).await?;

    // On the very first pass the linked databases must be fully
    // provisioned. Later passes ignore readiness: the engine may well be
    // usable while database bookkeeping is mid-flight.
    if status.phase == UserRolePhase::None {
        let not_ready = databases
            .values()
            .any(|db| !db.status.as_ref().map(|s| s.ready).unwrap_or_default());

        if not_ready {
            info!("PostgresDatabase not ready, waiting for it");
            ctx.publish_warning_event(
                user_role,
                "Processing",
                "Reconciling",
                Some(
                    "Processing stopped because PostgresDatabase isn't ready. Waiting for it."
                        .to_string(),
                ),
            )
            .await;

            return Ok(Action::requeue(Duration::from_secs(1)));
        }
    }

    let configs = get_engine_configurations(ctx, &databases, namespace, false).await?;

    validate_with_cluster_info(user_role, namespace, &databases, &configs)?;

    if ensure_finalizer_and_work_secret_name(ctx, user_role, namespace).await? {
        // The spec update retriggers the watch; restart from a clean pass
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let WorkSecretResult {
        secret: work_secret,
        old_username,
        password_changed,
        rotation_halted,
    } = match user_role.spec.mode {
        UserRoleMode::Provided => {
            create_or_update_work_secret_provided(ctx, user_role, namespace).await?
        }
        UserRoleMode::Managed => {
            create_or_update_work_secret_managed(ctx, user_role, namespace).await?
        }
    };

    let username = secret_key(&work_secret, USERNAME_SECRET_KEY);
    let password = secret_key(&work_secret, PASSWORD_SECRET_KEY);

    if username.is_empty() || password.is_empty() {
        return Err(Error::ValidationError(
            "username or password in work secret are empty so something is interfering with \
             operator"
                .to_string(),
        ));
    }

    let username_changed = username != old_username && !old_username.is_empty();
    if username_changed {
        // Queue the superseded login for session-aware deletion
        status.old_postgres_roles.push(old_username.clone());
    }

    let engines = get_engines(ctx, &configs, false).await?;

    manage_active_sessions_and_drop_old_roles(
        ctx,
        user_role,
        status,
        &engines,
        &configs,
        &privilege_groups,
    )
    .await?;

    // A halted rotation only clears once the reaper drained the queued
    // name; until then the object stays in error.
    if rotation_halted && !status.old_postgres_roles.is_empty() {
        return Err(Error::RotationHaltedError(
            "Old user password rotation wasn't a success and another one must be done.".to_string(),
        ));
    }

    manage_user_roles(
        ctx,
        user_role,
        &engines,
        &configs,
        &username,
        &password,
        password_changed,
    )
    .await?;

    // Saved before privileges and secrets so a failure below still leaves
    // the old username reachable for deletion on the next pass
    status.postgres_role = username.clone();
    status.role_prefix = user_role.spec.role_prefix.clone().unwrap_or_default();

    if password_changed || username_changed || status.last_password_changed_time.is_empty() {
        status.last_password_changed_time = Utc::now().to_rfc3339();
    }

    manage_user_rights(ctx, user_role, &engines, &privilege_groups, &username).await?;

    manage_secrets(
        ctx,
        user_role,
        namespace,
        &configs,
        &privilege_groups,
        &username,
        &password,
    )
    .await?;

    clean_old_secrets(ctx, user_role, namespace, &privilege_groups).await?;

    manage_success(ctx, user_role, namespace, status).await?;

    // Periodic re-check; owned-secret changes wake the controller earlier
    Ok(Action::requeue(Duration::from_secs(300)))
}

/// Handle deletion of a PostgresUserRole resource
async fn handle_deletion(
    user_role: &PostgresUserRole,
    ctx: &Context,
    namespace: &str,
    status: &mut PostgresUserRoleStatus,
) -> Result<Action> {
    let name = user_role.name_any();
    info!(name = %name, namespace = %namespace, "Handling PostgresUserRole deletion");

    if !has_finalizer(user_role) {
        return Ok(Action::await_change());
    }

    // The current login is just another role to reap now
    if !status.postgres_role.is_empty()
        && !status.old_postgres_roles.contains(&status.postgres_role)
    {
        let role = status.postgres_role.clone();
        status.old_postgres_roles.push(role);
    }

    // Collaborators may already be gone mid-teardown; skip the missing
    // ones instead of wedging the finalizer
    let (databases, privilege_groups) =
        get_database_instances(ctx, user_role, namespace, true).await?;
    let configs = get_engine_configurations(ctx, &databases, namespace, true).await?;
    let engines = get_engines(ctx, &configs, true).await?;

    manage_active_sessions_and_drop_old_roles(
        ctx,
        user_role,
        status,
        &engines,
        &configs,
        &privilege_groups,
    )
    .await?;

    if !status.old_postgres_roles.is_empty() {
        return Err(Error::FinalizerError(
            "old postgres roles still present".to_string(),
        ));
    }

    remove_finalizer(user_role, ctx, namespace).await?;

    info!(name = %name, namespace = %namespace, "Successfully deleted");
    Ok(Action::await_change())
}

/// Check if the resource has the finalizer
fn has_finalizer(user_role: &PostgresUserRole) -> bool {
    user_role
        .metadata
        .finalizers
        .as_ref()
        .map(|f| f.contains(&FINALIZER.to_string()))
        .unwrap_or(false)
}

/// Ensure the finalizer is attached and the work secret name assigned.
///
/// Returns true when the object was updated, in which case the current
/// pass stops and the watch event re-enters reconciliation.
async fn ensure_finalizer_and_work_secret_name(
    ctx: &Context,
    user_role: &PostgresUserRole,
    namespace: &str,
) -> Result<bool> {
    let needs_finalizer = !has_finalizer(user_role);
    let needs_secret_name = user_role
        .spec
        .work_generated_secret_name
        .as_deref()
        .map(str::is_empty)
        .unwrap_or(true);

    if !needs_finalizer && !needs_secret_name {
        return Ok(false);
    }

    let mut finalizers = user_role.metadata.finalizers.clone().unwrap_or_default();
    if needs_finalizer {
        finalizers.push(FINALIZER.to_string());
    }

    let work_secret_name = if needs_secret_name {
        generate_work_secret_name()
    } else {
        user_role
            .spec
            .work_generated_secret_name
            .clone()
            .unwrap_or_default()
    };

    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers,
        },
        "spec": {
            "workGeneratedSecretName": work_secret_name,
        }
    });

    let api: Api<PostgresUserRole> = Api::namespaced(ctx.client.clone(), namespace);
    api.patch(
        &user_role.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;

    Ok(true)
}

/// Remove finalizer from the resource
async fn remove_finalizer(
    user_role: &PostgresUserRole,
    ctx: &Context,
    namespace: &str,
) -> Result<()> {
    let remaining: Vec<String> = user_role
        .metadata
        .finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|f| f != FINALIZER)
        .collect();

    let patch = serde_json::json!({
        "metadata": {
            "finalizers": if remaining.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::json!(remaining)
            }
        }
    });

    let api: Api<PostgresUserRole> = Api::namespaced(ctx.client.clone(), namespace);
    api.patch(
        &user_role.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;

    Ok(())
}

/// Requeue policy for failed passes.
///
/// Consecutive failures of the same object escalate the delay through
/// [`BackoffSchedule`]; the streak is tracked in the shared context and
/// cleared by the next successful pass.
pub fn error_policy(user_role: Arc<PostgresUserRole>, error: &Error, ctx: Arc<Context>) -> Action {
    let attempt = ctx.failures.record(&failure_key(&user_role));
    let delay = BackoffSchedule::default().delay(error, attempt);

    if error.is_retryable() {
        warn!(
            name = %user_role.name_any(),
            attempt,
            delay = ?delay,
            error = %error,
            "Reconcile failed, backing off"
        );
    } else {
        error!(
            name = %user_role.name_any(),
            delay = ?delay,
            error = %error,
            "Reconcile failed permanently, waiting for a spec change"
        );
    }

    Action::requeue(delay)
}
