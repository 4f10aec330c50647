//! Session-aware reaper
//!
//! Drops superseded login roles queued in `status.oldPostgresRoles`. A
//! role with a live session is kept for the next pass instead of killing
//! the session; a droppable role first has its owned objects reassigned
//! to the database owner on every database under the engine, since
//! PostgreSQL refuses to drop a role that still owns anything.

use tracing::info;

use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::controller::resolver::{EngineCache, EngineConfigCache, PrivilegeGroups};
use crate::crd::{PostgresUserRole, PostgresUserRoleStatus};

/// Reap the queued roles, leaving the survivors (active sessions) in
/// `status.old_postgres_roles`
pub async fn manage_active_sessions_and_drop_old_roles(
    ctx: &Context,
    user_role: &PostgresUserRole,
    status: &mut PostgresUserRoleStatus,
    engines: &EngineCache,
    configs: &EngineConfigCache,
    privilege_groups: &PrivilegeGroups,
) -> Result<()> {
    let mut surviving_roles: Vec<String> = Vec::new();

    for old_username in &status.old_postgres_roles {
        for (key, engine) in engines {
            if !engine.is_role_exist(old_username).await? {
                continue;
            }

            if engine.does_role_have_active_session(old_username).await? {
                // Deletion would disrupt the live session; retry next pass
                surviving_roles.push(old_username.clone());

                info!(engine = %key, role = %old_username, "Role still active sessions, ignoring deletion");
                ctx.publish_warning_event(
                    user_role,
                    "Warning",
                    "Reconciling",
                    Some(format!(
                        "Role {old_username} still have active session on engine {key}, ignoring \
                         deletion"
                    )),
                )
                .await;
                continue;
            }

            let allow_admin = configs
                .get(key)
                .map(|config| config.spec.allow_grant_admin_option)
                .unwrap_or_default();

            if let Some(group) = privilege_groups.get(key) {
                for db_privilege in group {
                    // Membership in the doomed role gives the operator the
                    // rights over its owned objects that some engines
                    // require for reassignment.
                    engine
                        .grant_role(old_username, &engine.get_user(), allow_admin)
                        .await?;

                    let db_status = db_privilege.database.status.clone().unwrap_or_default();
                    let owner = db_status.roles.unwrap_or_default().owner;
                    engine
                        .change_and_drop_owned_by(old_username, &owner, &db_status.database)
                        .await?;
                }
            }

            engine.drop_role(old_username).await?;

            info!(engine = %key, role = %old_username, "Role successfully deleted");
            ctx.publish_normal_event(
                user_role,
                "Processing",
                "Reconciling",
                Some(format!(
                    "Role {old_username} successfully deleted on engine {key}"
                )),
            )
            .await;
        }
    }

    // A role surviving on several engines shows up once
    let mut unique = Vec::new();
    for role in surviving_roles {
        if !unique.contains(&role) {
            unique.push(role);
        }
    }

    status.old_postgres_roles = unique;

    Ok(())
}
