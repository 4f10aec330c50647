//! Privilege engine
//!
//! Synchronizes group-role memberships and per-database default login
//! roles. The desired sets are computed up front from the privilege list,
//! then diffed against the live engine state: missing entries are granted
//! or set, and whatever remains observed but undesired is revoked.
//! Iteration order cannot change the converged state because grants and
//! revokes are idempotent at the engine.

use tracing::info;

use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::controller::resolver::{EngineCache, PrivilegeGroups};
use crate::crd::{PostgresDatabase, PostgresUserRole, PrivilegeLevel};
use crate::postgres::SetRoleOnDatabaseSetting;

/// Resolve the group role a privilege level maps to on a database
pub fn group_role_for_privilege(database: &PostgresDatabase, privilege: PrivilegeLevel) -> String {
    let roles = database
        .status
        .as_ref()
        .and_then(|status| status.roles.clone())
        .unwrap_or_default();

    match privilege {
        PrivilegeLevel::Reader => roles.reader,
        PrivilegeLevel::Writer => roles.writer,
        PrivilegeLevel::Owner => roles.owner,
    }
}

/// One desired binding: the group role and the database it covers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredRight {
    pub group_role: String,
    pub database: String,
}

/// Changes needed to move the engine from the observed state to the
/// desired one
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RightsChanges {
    /// Group roles to grant membership in
    pub grants: Vec<String>,
    /// `(database, group_role)` login defaults to set
    pub set_defaults: Vec<(String, String)>,
    /// Memberships to revoke
    pub revokes: Vec<String>,
    /// Databases whose login default must be dropped
    pub reset_defaults: Vec<String>,
}

/// Diff observed memberships and login defaults against the desired
/// bindings.
///
/// Observed entries matched by a desired binding are consumed; the
/// leftovers become revocations.
pub fn compute_rights_changes(
    member_of: &[String],
    settings: &[SetRoleOnDatabaseSetting],
    desired: &[DesiredRight],
) -> RightsChanges {
    let mut member_of: Vec<String> = member_of.to_vec();
    let mut settings: Vec<SetRoleOnDatabaseSetting> = settings.to_vec();
    let mut changes = RightsChanges::default();

    for right in desired {
        if let Some(position) = member_of.iter().position(|role| role == &right.group_role) {
            member_of.remove(position);
        } else {
            changes.grants.push(right.group_role.clone());
        }

        let found = settings
            .iter()
            .position(|setting| setting.database == right.database);
        let needs_alter = match found {
            Some(position) => settings[position].role != right.group_role,
            None => true,
        };

        if needs_alter {
            changes
                .set_defaults
                .push((right.database.clone(), right.group_role.clone()));
        }

        if let Some(position) = found {
            settings.remove(position);
        }
    }

    changes.revokes = member_of;
    changes.reset_defaults = settings.into_iter().map(|s| s.database).collect();

    changes
}

/// Converge memberships and login-role defaults for the user on every
/// engine
pub async fn manage_user_rights(
    ctx: &Context,
    user_role: &PostgresUserRole,
    engines: &EngineCache,
    privilege_groups: &PrivilegeGroups,
    username: &str,
) -> Result<()> {
    for (key, engine) in engines {
        let member_of = engine.get_role_membership(username).await?;
        let settings = engine.get_set_role_on_databases(username).await?;

        let empty = Vec::new();
        let group = privilege_groups.get(key).unwrap_or(&empty);

        let desired: Vec<DesiredRight> = group
            .iter()
            .map(|db_privilege| DesiredRight {
                group_role: group_role_for_privilege(
                    &db_privilege.database,
                    db_privilege.privilege.privilege,
                ),
                database: db_privilege
                    .database
                    .status
                    .as_ref()
                    .map(|status| status.database.clone())
                    .unwrap_or_default(),
            })
            .collect();

        let changes = compute_rights_changes(&member_of, &settings, &desired);

        for group_role in &changes.grants {
            // The user must not administer the group it is placed in
            engine.grant_role(group_role, username, false).await?;

            info!(
                postgresqlEngine = %key,
                groupRole = %group_role,
                "Successfully granted user in engine"
            );
            ctx.publish_normal_event(
                user_role,
                "Updated",
                "Reconciling",
                Some(format!(
                    "Successfully granted user to {group_role} in engine {key}"
                )),
            )
            .await;
        }

        for (database, group_role) in &changes.set_defaults {
            engine
                .alter_default_login_role_on_database(username, group_role, database)
                .await?;

            info!(
                postgresqlEngine = %key,
                groupRole = %group_role,
                postgresqlDatabase = %database,
                "Successfully altered default login role in engine on specific database"
            );
            ctx.publish_normal_event(
                user_role,
                "Updated",
                "Reconciling",
                Some(format!(
                    "Successfully altered default login role {group_role} in engine {key} on \
                     specific database {database}"
                )),
            )
            .await;
        }

        for role in &changes.revokes {
            engine.revoke_role(role, username).await?;

            info!(postgresqlEngine = %key, role = %role, "Successfully revoked role from user in engine");
            ctx.publish_normal_event(
                user_role,
                "Updated",
                "Reconciling",
                Some(format!(
                    "Successfully revoked role {role} from user in engine {key}"
                )),
            )
            .await;
        }

        for database in &changes.reset_defaults {
            engine
                .revoke_user_set_role_on_database(username, database)
                .await?;

            info!(
                postgresqlEngine = %key,
                database = %database,
                "Successfully revoked set role from user on specific database in engine"
            );
            ctx.publish_normal_event(
                user_role,
                "Updated",
                "Reconciling",
                Some(format!(
                    "Successfully revoked set role from user on specific database {database} in \
                     engine {key}"
                )),
            )
            .await;
        }
    }

    Ok(())
}
