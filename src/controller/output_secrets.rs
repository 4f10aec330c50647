//! Output secret manager
//!
//! Projects one connection-credential secret per privilege entry, carrying
//! fully assembled connection URIs for the selected endpoint kind plus the
//! same keys per replica endpoint. Secrets are only written when their
//! data actually differs, and a paged sweep removes owned secrets that no
//! longer correspond to a declared name.

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{ListParams, ObjectMeta, PostParams};
use kube::{Api, ResourceExt};
use tracing::info;

use crate::controller::common::{owner_reference, owned_secret_labels};
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::resolver::{EngineConfigCache, PrivilegeGroups};
use crate::controller::validation::LIST_LIMIT;
use crate::crd::{
    ConnectionInfo, ConnectionType, PostgresDatabase, PostgresEngineConfiguration,
    PostgresUserRole, UserRolePrivilege,
};
use crate::postgres::url::{template_postgres_url, template_postgres_url_with_args};

/// Connection URL including credentials
pub const SECRET_KEY_POSTGRES_URL: &str = "POSTGRES_URL";
/// Connection URL including credentials and URI arguments
pub const SECRET_KEY_POSTGRES_URL_ARGS: &str = "POSTGRES_URL_ARGS";
pub const SECRET_KEY_PASSWORD: &str = "PASSWORD";
pub const SECRET_KEY_LOGIN: &str = "LOGIN";
pub const SECRET_KEY_DATABASE: &str = "DATABASE";
pub const SECRET_KEY_HOST: &str = "HOST";
pub const SECRET_KEY_PORT: &str = "PORT";
pub const SECRET_KEY_ARGS: &str = "ARGS";

/// Prefix of per-replica key sets
pub const SECRET_KEY_REPLICA_PREFIX: &str = "REPLICA";

/// Join the endpoint's baked-in URI arguments with the user-declared
/// extra parameters
fn join_uri_args(endpoint_args: &str, extra: &BTreeMap<String, String>) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(1 + extra.len());
    parts.push(endpoint_args.to_string());

    for (key, value) in extra {
        parts.push(format!("{key}={value}"));
    }

    parts.join("&")
}

fn insert_connection_keys(
    data: &mut BTreeMap<String, ByteString>,
    key_prefix: &str,
    connection: &ConnectionInfo,
    username: &str,
    password: &str,
    database: &str,
    extra: &BTreeMap<String, String>,
) {
    let uri_args = join_uri_args(&connection.uri_args, extra);
    let url = template_postgres_url(&connection.host, username, password, database, connection.port);
    let url_with_args = template_postgres_url_with_args(
        &connection.host,
        username,
        password,
        &uri_args,
        database,
        connection.port,
    );

    let mut put = |key: &str, value: String| {
        data.insert(
            format!("{key_prefix}{key}"),
            ByteString(value.into_bytes()),
        );
    };

    put(SECRET_KEY_POSTGRES_URL, url);
    put(SECRET_KEY_POSTGRES_URL_ARGS, url_with_args);
    put(SECRET_KEY_PASSWORD, password.to_string());
    put(SECRET_KEY_LOGIN, username.to_string());
    put(SECRET_KEY_DATABASE, database.to_string());
    put(SECRET_KEY_HOST, connection.host.clone());
    put(SECRET_KEY_PORT, connection.port.to_string());
    put(SECRET_KEY_ARGS, uri_args);
}

/// Assemble the data block of an output secret
pub fn build_user_secret_data(
    privilege: &UserRolePrivilege,
    database: &PostgresDatabase,
    config: &PostgresEngineConfiguration,
    username: &str,
    password: &str,
) -> Result<BTreeMap<String, ByteString>> {
    let database_name = database
        .status
        .as_ref()
        .map(|status| status.database.clone())
        .unwrap_or_default();

    let connections = &config.spec.user_connections;
    let (primary, replicas) = match privilege.connection_type {
        ConnectionType::Primary => (
            &connections.primary_connection,
            &connections.replica_connections,
        ),
        ConnectionType::Bouncer => (
            connections.bouncer_connection.as_ref().ok_or_else(|| {
                Error::ValidationError(
                    "bouncer connection asked but not supported in engine configuration"
                        .to_string(),
                )
            })?,
            &connections.replica_bouncer_connections,
        ),
    };

    let mut data = BTreeMap::new();

    insert_connection_keys(
        &mut data,
        "",
        primary,
        username,
        password,
        &database_name,
        &privilege.extra_connection_url_parameters,
    );

    for (index, replica) in replicas.iter().enumerate() {
        let key_prefix = format!("{SECRET_KEY_REPLICA_PREFIX}_{index}_");
        insert_connection_keys(
            &mut data,
            &key_prefix,
            replica,
            username,
            password,
            &database_name,
            &privilege.extra_connection_url_parameters,
        );
    }

    Ok(data)
}

/// Build the full output secret object
fn new_user_secret(
    user_role: &PostgresUserRole,
    namespace: &str,
    privilege: &UserRolePrivilege,
    data: BTreeMap<String, ByteString>,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(privilege.generated_secret_name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(owned_secret_labels(user_role)),
            owner_references: Some(vec![owner_reference(user_role)]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(data),
        ..Default::default()
    }
}

/// Create or update the output secret of every privilege
pub async fn manage_secrets(
    ctx: &Context,
    user_role: &PostgresUserRole,
    namespace: &str,
    config_cache: &EngineConfigCache,
    privilege_groups: &PrivilegeGroups,
    username: &str,
    password: &str,
) -> Result<()> {
    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);

    for (key, group) in privilege_groups {
        let config = config_cache
            .get(key)
            .ok_or_else(|| Error::NotFound(format!("PostgresEngineConfiguration {key}")))?;

        for db_privilege in group {
            let secret_name = &db_privilege.privilege.generated_secret_name;

            let found = match api.get(secret_name).await {
                Ok(secret) => Some(secret),
                Err(kube::Error::Api(ae)) if ae.code == 404 => None,
                Err(e) => return Err(e.into()),
            };

            let data = build_user_secret_data(
                &db_privilege.privilege,
                &db_privilege.database,
                config,
                username,
                password,
            )?;
            let generated = new_user_secret(user_role, namespace, &db_privilege.privilege, data);

            match found {
                None => {
                    api.create(&PostParams::default(), &generated).await?;

                    info!(
                        postgresqlEngine = %key,
                        secret = %secret_name,
                        "Successfully created secret for engine and database"
                    );
                    ctx.publish_normal_event(
                        user_role,
                        "Updated",
                        "Reconciling",
                        Some(format!("Generated secret {secret_name} saved")),
                    )
                    .await;
                }
                Some(mut existing) if existing.data != generated.data => {
                    existing.data = generated.data.clone();
                    api.replace(secret_name, &PostParams::default(), &existing)
                        .await?;

                    info!(
                        postgresqlEngine = %key,
                        secret = %secret_name,
                        "Successfully updated secret for engine and database"
                    );
                    ctx.publish_normal_event(
                        user_role,
                        "Updated",
                        "Reconciling",
                        Some(format!("Generated secret {secret_name} saved")),
                    )
                    .await;
                    ctx.publish_secret_event(&existing, "Updated", Some("Secret updated".to_string()))
                        .await;
                }
                // Byte-identical, leave it alone
                Some(_) => {}
            }
        }
    }

    Ok(())
}

/// Delete owned secrets whose name is neither the work secret nor any
/// declared output secret
pub async fn clean_old_secrets(
    ctx: &Context,
    user_role: &PostgresUserRole,
    namespace: &str,
    privilege_groups: &PrivilegeGroups,
) -> Result<()> {
    let mut keep_names: Vec<String> = Vec::new();
    if let Some(work_name) = user_role.spec.work_generated_secret_name.as_deref() {
        keep_names.push(work_name.to_string());
    }

    for group in privilege_groups.values() {
        for db_privilege in group {
            keep_names.push(db_privilege.privilege.generated_secret_name.clone());
        }
    }

    let owner_uid = user_role.metadata.uid.clone().unwrap_or_default();
    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    let mut continue_token: Option<String> = None;

    loop {
        let mut params = ListParams::default().limit(LIST_LIMIT);
        if let Some(token) = &continue_token {
            params = params.continue_token(token);
        }

        let list = api.list(&params).await?;

        for secret in &list.items {
            if keep_names.iter().any(|name| name == &secret.name_any()) {
                continue;
            }

            let owned = secret
                .metadata
                .owner_references
                .as_ref()
                .is_some_and(|refs| refs.iter().any(|r| r.uid == owner_uid));

            if owned {
                api.delete(&secret.name_any(), &Default::default()).await?;

                info!(secret = %secret.name_any(), "Deleted stale owned secret");
            }
        }

        match list.metadata.continue_.filter(|token| !token.is_empty()) {
            Some(token) => continue_token = Some(token),
            None => break,
        }
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_join_uri_args_with_extras() {
        let extra = BTreeMap::from([
            ("application_name".to_string(), "svc".to_string()),
            ("connect_timeout".to_string(), "5".to_string()),
        ]);
        assert_eq!(
            join_uri_args("sslmode=require", &extra),
            "sslmode=require&application_name=svc&connect_timeout=5"
        );
    }

    #[test]
    fn test_join_uri_args_without_extras() {
        assert_eq!(join_uri_args("sslmode=require", &BTreeMap::new()), "sslmode=require");
    }
}
