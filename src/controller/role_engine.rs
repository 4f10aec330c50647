//! Role engine
//!
//! Converges the login role on every engine: creates it when missing,
//! diffs and alters its attributes, reconverges the password when the
//! work-secret stage changed it, and grants the operator's own login
//! membership in the managed role so ownership can later be reassigned
//! during reaping.

use tracing::info;

use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::resolver::{EngineCache, EngineConfigCache};
use crate::crd::{PostgresUserRole, UserRoleAttributes, UserRolePhase};
use crate::postgres::{
    DEFAULT_BYPASS_RLS, DEFAULT_CONNECTION_LIMIT, DEFAULT_REPLICATION, RoleAttributes,
};

/// Convert the CRD attribute block into engine attributes
pub fn to_role_attributes(attributes: Option<&UserRoleAttributes>) -> Option<RoleAttributes> {
    attributes.map(|attributes| RoleAttributes {
        connection_limit: attributes.connection_limit,
        replication: attributes.replication,
        bypass_rls: attributes.bypass_rls,
    })
}

/// Compute the minimal attribute change between the engine state and the
/// wanted spec.
///
/// A wanted field that is absent resets the engine value to the default
/// when it drifted, and is otherwise left alone. The returned set only
/// contains fields that must change.
pub fn diff_attributes(
    current: &RoleAttributes,
    wanted: Option<&RoleAttributes>,
) -> RoleAttributes {
    let mut changes = RoleAttributes::default();

    let Some(wanted) = wanted else {
        // The attribute block was removed entirely; reset whatever
        // drifted from the defaults.
        if let Some(limit) = current.connection_limit {
            if limit != DEFAULT_CONNECTION_LIMIT {
                changes.connection_limit = Some(DEFAULT_CONNECTION_LIMIT);
            }
        }

        if let Some(replication) = current.replication {
            if replication != DEFAULT_REPLICATION {
                changes.replication = Some(DEFAULT_REPLICATION);
            }
        }

        if let Some(bypass_rls) = current.bypass_rls {
            if bypass_rls != DEFAULT_BYPASS_RLS {
                changes.bypass_rls = Some(DEFAULT_BYPASS_RLS);
            }
        }

        return changes;
    };

    if current.connection_limit != wanted.connection_limit {
        if wanted.connection_limit.is_none()
            && current.connection_limit.is_some_and(|c| c != DEFAULT_CONNECTION_LIMIT)
        {
            changes.connection_limit = Some(DEFAULT_CONNECTION_LIMIT);
        } else {
            changes.connection_limit = wanted.connection_limit;
        }
    }

    if current.replication != wanted.replication {
        if wanted.replication.is_none()
            && current.replication.is_some_and(|c| c != DEFAULT_REPLICATION)
        {
            changes.replication = Some(DEFAULT_REPLICATION);
        } else {
            changes.replication = wanted.replication;
        }
    }

    if current.bypass_rls != wanted.bypass_rls {
        if wanted.bypass_rls.is_none()
            && current.bypass_rls.is_some_and(|c| c != DEFAULT_BYPASS_RLS)
        {
            changes.bypass_rls = Some(DEFAULT_BYPASS_RLS);
        } else {
            changes.bypass_rls = wanted.bypass_rls;
        }
    }

    changes
}

/// Create or converge the login role on every engine
pub async fn manage_user_roles(
    ctx: &Context,
    user_role: &PostgresUserRole,
    engines: &EngineCache,
    configs: &EngineConfigCache,
    username: &str,
    password: &str,
    password_changed: bool,
) -> Result<()> {
    let wanted_attributes = to_role_attributes(user_role.spec.role_attributes.as_ref());
    let phase = user_role
        .status
        .as_ref()
        .map(|s| s.phase)
        .unwrap_or_default();

    for (key, engine) in engines {
        let exists = engine.is_role_exist(username).await?;

        if !exists {
            engine
                .create_user_role(username, password, wanted_attributes.as_ref())
                .await?;

            info!(postgresqlEngine = %key, "Successfully created user in engine");
            ctx.publish_normal_event(
                user_role,
                "Updated",
                "Reconciling",
                Some(format!("Successfully created user in engine {key}")),
            )
            .await;
            // Freshly created with the wanted attributes and password;
            // nothing left to converge on this engine this pass.
            continue;
        }

        let current_attributes = engine.get_role_attributes(username).await?.ok_or_else(|| {
            Error::EngineError(crate::postgres::PgError::UnexpectedState(
                "seems that role attributes cannot be found (maybe role has been removed)"
                    .to_string(),
            ))
        })?;

        let changes = diff_attributes(&current_attributes, wanted_attributes.as_ref());
        engine.alter_role_attributes(username, &changes).await?;

        // On the first pass over an existing role the password must be
        // ensured even without a recorded change.
        if password_changed || phase == UserRolePhase::None {
            engine.update_password(username, password).await?;

            info!(postgresqlEngine = %key, "Successfully updated user password in engine");
            ctx.publish_normal_event(
                user_role,
                "Updated",
                "Reconciling",
                Some(format!(
                    "Successfully updated user password in engine {key}"
                )),
            )
            .await;
        }

        let allow_admin = configs
            .get(key)
            .map(|config| config.spec.allow_grant_admin_option)
            .unwrap_or_default();
        engine
            .grant_role(username, &engine.get_user(), allow_admin)
            .await?;
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn full(limit: i32, replication: bool, bypass_rls: bool) -> RoleAttributes {
        RoleAttributes {
            connection_limit: Some(limit),
            replication: Some(replication),
            bypass_rls: Some(bypass_rls),
        }
    }

    #[test]
    fn test_diff_no_spec_resets_drifted_fields() {
        let current = full(10, true, false);
        let changes = diff_attributes(&current, None);

        assert_eq!(changes.connection_limit, Some(DEFAULT_CONNECTION_LIMIT));
        assert_eq!(changes.replication, Some(DEFAULT_REPLICATION));
        // Already at default, untouched
        assert_eq!(changes.bypass_rls, None);
    }

    #[test]
    fn test_diff_no_spec_all_default_is_noop() {
        let current = full(DEFAULT_CONNECTION_LIMIT, DEFAULT_REPLICATION, DEFAULT_BYPASS_RLS);
        assert_eq!(diff_attributes(&current, None), RoleAttributes::default());
    }

    #[test]
    fn test_diff_wanted_value_applied() {
        let current = full(DEFAULT_CONNECTION_LIMIT, false, false);
        let wanted = RoleAttributes {
            connection_limit: Some(5),
            ..Default::default()
        };
        let changes = diff_attributes(&current, Some(&wanted));

        assert_eq!(changes.connection_limit, Some(5));
        assert_eq!(changes.replication, None);
        assert_eq!(changes.bypass_rls, None);
    }

    #[test]
    fn test_diff_cleared_field_resets_to_default() {
        let current = full(20, false, true);
        let wanted = RoleAttributes {
            connection_limit: None,
            replication: None,
            bypass_rls: None,
        };
        let changes = diff_attributes(&current, Some(&wanted));

        assert_eq!(changes.connection_limit, Some(DEFAULT_CONNECTION_LIMIT));
        assert_eq!(changes.replication, None);
        assert_eq!(changes.bypass_rls, Some(DEFAULT_BYPASS_RLS));
    }

    #[test]
    fn test_diff_matching_values_are_noop() {
        let current = full(5, true, false);
        let wanted = RoleAttributes {
            connection_limit: Some(5),
            replication: Some(true),
            bypass_rls: None,
        };
        let changes = diff_attributes(&current, Some(&wanted));

        assert_eq!(changes.connection_limit, None);
        assert_eq!(changes.replication, None);
        assert_eq!(changes.bypass_rls, None);
    }

    #[test]
    fn test_to_role_attributes_maps_fields() {
        let spec = UserRoleAttributes {
            connection_limit: Some(3),
            replication: Some(true),
            bypass_rls: None,
        };
        let attributes = to_role_attributes(Some(&spec)).unwrap();
        assert_eq!(attributes.connection_limit, Some(3));
        assert_eq!(attributes.replication, Some(true));
        assert_eq!(attributes.bypass_rls, None);

        assert!(to_role_attributes(None).is_none());
    }
}
