//! Validation logic for PostgresUserRole specs
//!
//! Static checks run before anything touches an engine; the cluster-aware
//! check runs after the resolver so bouncer availability can be verified
//! against the live engine configurations. Validation failures are
//! permanent: retrying without a spec change cannot help.

use kube::Api;
use kube::api::ListParams;
use kube::ResourceExt;

use crate::controller::common::name_key;
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::resolver::{
    DatabaseCache, EngineConfigCache, engine_key_for_database,
};
use crate::controller::work_secret::{
    LOGIN_0_SUFFIX, PASSWORD_SECRET_KEY, USERNAME_SECRET_KEY,
};
use crate::crd::{ConnectionType, PostgresUserRole, UserRoleMode};
use crate::postgres::MAX_IDENTIFIER_LENGTH;

/// Page size for cluster-wide list requests
pub const LIST_LIMIT: u32 = 10;

/// Validate a PostgresUserRole before reconciling it
pub async fn validate_instance(
    ctx: &Context,
    user_role: &PostgresUserRole,
    namespace: &str,
) -> Result<()> {
    match user_role.spec.mode {
        UserRoleMode::Provided => {
            let import_secret_name = user_role
                .spec
                .import_secret_name
                .as_deref()
                .filter(|name| !name.is_empty())
                .ok_or_else(|| {
                    Error::ValidationError(
                        "PostgresUserRole is in provided mode without any importSecretName"
                            .to_string(),
                    )
                })?;

            let api: Api<k8s_openapi::api::core::v1::Secret> =
                Api::namespaced(ctx.client.clone(), namespace);
            let secret = api.get(import_secret_name).await.map_err(|e| match e {
                kube::Error::Api(ref ae) if ae.code == 404 => Error::NotFound(format!(
                    "import secret {namespace}/{import_secret_name}"
                )),
                e => e.into(),
            })?;

            validate_import_secret(&secret)?;
        }
        UserRoleMode::Managed => {
            validate_managed_spec(user_role)?;
        }
    }

    validate_no_duplicate_databases(user_role, namespace)?;
    validate_unique_role_prefix(ctx, user_role).await?;

    Ok(())
}

/// Check the static shape of a Managed spec
pub fn validate_managed_spec(user_role: &PostgresUserRole) -> Result<()> {
    let role_prefix = user_role
        .spec
        .role_prefix
        .as_deref()
        .filter(|prefix| !prefix.is_empty())
        .ok_or_else(|| {
            Error::ValidationError(
                "PostgresUserRole is in managed mode without any rolePrefix".to_string(),
            )
        })?;

    // One extra character on top of the rotation suffix keeps headroom
    // for engine-side canonicalization.
    let candidate = format!("{role_prefix}{LOGIN_0_SUFFIX}X");
    if candidate.len() > MAX_IDENTIFIER_LENGTH {
        return Err(Error::ValidationError(format!(
            "Role prefix is too long. It must be <= {}. {} is {} character. Role prefix length \
             must be reduced",
            MAX_IDENTIFIER_LENGTH,
            candidate,
            candidate.len()
        )));
    }

    if let Some(duration) = user_role
        .spec
        .user_password_rotation_duration
        .as_deref()
        .filter(|d| !d.is_empty())
    {
        humantime::parse_duration(duration).map_err(|e| {
            Error::ValidationError(format!("invalid userPasswordRotationDuration {duration:?}: {e}"))
        })?;
    }

    Ok(())
}

/// Check that an import secret carries usable credentials
pub fn validate_import_secret(secret: &k8s_openapi::api::core::v1::Secret) -> Result<()> {
    let username = crate::controller::resolver::secret_key(secret, USERNAME_SECRET_KEY);
    let password = crate::controller::resolver::secret_key(secret, PASSWORD_SECRET_KEY);

    if username.is_empty() || password.is_empty() {
        return Err(Error::ValidationError(format!(
            "Import secret must have a {USERNAME_SECRET_KEY} and {PASSWORD_SECRET_KEY} valuated keys"
        )));
    }

    if username.len() > MAX_IDENTIFIER_LENGTH {
        return Err(Error::ValidationError(format!(
            "Username is too long. It must be <= {}. {} is {} character. Username length must be \
             reduced",
            MAX_IDENTIFIER_LENGTH,
            username,
            username.len()
        )));
    }

    Ok(())
}

/// Check that no database is listed twice in the privilege list
pub fn validate_no_duplicate_databases(
    user_role: &PostgresUserRole,
    namespace: &str,
) -> Result<()> {
    let privileges = &user_role.spec.privileges;

    for (i, privilege) in privileges.iter().enumerate() {
        let key = name_key(
            &privilege.database.name,
            privilege.database.namespace.as_deref(),
            namespace,
        );

        for other in privileges.iter().skip(i + 1) {
            let other_key = name_key(
                &other.database.name,
                other.database.namespace.as_deref(),
                namespace,
            );

            if key == other_key {
                return Err(Error::ValidationError(
                    "Privilege list mustn't have the same database listed multiple times"
                        .to_string(),
                ));
            }
        }
    }

    Ok(())
}

/// Check that the role prefix is not declared by any other
/// PostgresUserRole in the cluster
async fn validate_unique_role_prefix(ctx: &Context, user_role: &PostgresUserRole) -> Result<()> {
    let Some(role_prefix) = user_role
        .spec
        .role_prefix
        .as_deref()
        .filter(|prefix| !prefix.is_empty())
    else {
        return Ok(());
    };

    let api: Api<PostgresUserRole> = Api::all(ctx.client.clone());
    let mut continue_token: Option<String> = None;

    loop {
        let mut params = ListParams::default().limit(LIST_LIMIT);
        if let Some(token) = &continue_token {
            params = params.continue_token(token);
        }

        let list = api.list(&params).await?;

        for other in &list.items {
            let same_object = other.name_any() == user_role.name_any()
                && other.namespace() == user_role.namespace();
            if same_object {
                continue;
            }

            if other.spec.role_prefix.as_deref() == Some(role_prefix) {
                return Err(Error::ValidationError(
                    "rolePrefix is declared in another PostgresUserRole. This field value must \
                     be unique."
                        .to_string(),
                ));
            }
        }

        match list.metadata.continue_.filter(|token| !token.is_empty()) {
            Some(token) => continue_token = Some(token),
            None => break,
        }
    }

    Ok(())
}

/// Cluster-aware validation: every privilege asking for the bouncer needs
/// an engine configuration that declares one
pub fn validate_with_cluster_info(
    user_role: &PostgresUserRole,
    namespace: &str,
    databases: &DatabaseCache,
    configs: &EngineConfigCache,
) -> Result<()> {
    for privilege in &user_role.spec.privileges {
        if privilege.connection_type != ConnectionType::Bouncer {
            continue;
        }

        let db_key = name_key(
            &privilege.database.name,
            privilege.database.namespace.as_deref(),
            namespace,
        );
        let database = databases.get(&db_key).ok_or_else(|| {
            Error::NotFound(format!("PostgresDatabase {db_key}"))
        })?;

        let engine_key = engine_key_for_database(database, namespace);
        let config = configs.get(&engine_key).ok_or_else(|| {
            Error::NotFound(format!("PostgresEngineConfiguration {engine_key}"))
        })?;

        if config.spec.user_connections.bouncer_connection.is_none() {
            return Err(Error::ValidationError(
                "bouncer connection asked but not supported in engine configuration".to_string(),
            ));
        }
    }

    Ok(())
}
