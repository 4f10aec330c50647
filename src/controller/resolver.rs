//! Dependency resolver for PostgresUserRole reconciliation
//!
//! Walks the privilege list to the PostgresDatabase objects, from there to
//! the PostgresEngineConfiguration objects, and finally to live engine
//! handles. Databases and handles are grouped under one deterministic
//! engine key so every downstream stage sees the same partitioning.
//!
//! The `ignore_not_found` mode is used on the deletion path, where missing
//! collaborators are skipped instead of failing the pass.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::Api;
use tracing::debug;

use crate::controller::common::name_key;
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::work_secret::{PASSWORD_SECRET_KEY, USERNAME_SECRET_KEY};
use crate::crd::{
    PostgresDatabase, PostgresEngineConfiguration, PostgresUserRole, UserRolePrivilege,
};
use crate::postgres::PgEngine;
use crate::postgres::engine::{PgServer, PgServerConfig};

/// A database paired with the privilege entry referencing it
#[derive(Clone)]
pub struct DbPrivilege {
    pub database: PostgresDatabase,
    pub privilege: UserRolePrivilege,
}

/// Databases keyed by `namespace/name`
pub type DatabaseCache = BTreeMap<String, PostgresDatabase>;

/// Per-engine groups of database privileges, keyed by the engine key
pub type PrivilegeGroups = BTreeMap<String, Vec<DbPrivilege>>;

/// Engine configurations keyed by the engine key
pub type EngineConfigCache = BTreeMap<String, PostgresEngineConfiguration>;

/// Live engine handles keyed by the engine key
pub type EngineCache = BTreeMap<String, Arc<dyn PgEngine>>;

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Resolve the PostgresDatabase objects referenced by the privilege list.
///
/// Returns both the flat database cache and the per-engine privilege
/// groups; the group key is the engine key reused by
/// [`get_engine_configurations`] and [`get_engines`].
pub async fn get_database_instances(
    ctx: &Context,
    user_role: &PostgresUserRole,
    namespace: &str,
    ignore_not_found: bool,
) -> Result<(DatabaseCache, PrivilegeGroups)> {
    let mut databases = DatabaseCache::new();
    let mut privilege_groups = PrivilegeGroups::new();

    for privilege in &user_role.spec.privileges {
        let db_namespace = privilege
            .database
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(namespace);
        let api: Api<PostgresDatabase> = Api::namespaced(ctx.client.clone(), db_namespace);

        let database = match api.get(&privilege.database.name).await {
            Ok(database) => database,
            Err(e) if is_not_found(&e) && ignore_not_found => {
                debug!(
                    database = %privilege.database.name,
                    namespace = %db_namespace,
                    "Database not found, skipping"
                );
                continue;
            }
            Err(e) if is_not_found(&e) => {
                return Err(Error::NotFound(format!(
                    "PostgresDatabase {}/{}",
                    db_namespace, privilege.database.name
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let db_key = name_key(
            &privilege.database.name,
            database.metadata.namespace.as_deref(),
            namespace,
        );
        databases.insert(db_key, database.clone());

        let engine_key = engine_key_for_database(&database, namespace);
        privilege_groups
            .entry(engine_key)
            .or_default()
            .push(DbPrivilege {
                database,
                privilege: privilege.clone(),
            });
    }

    Ok((databases, privilege_groups))
}

/// The engine key of the engine configuration a database points at
pub fn engine_key_for_database(database: &PostgresDatabase, default_namespace: &str) -> String {
    let db_namespace = database
        .metadata
        .namespace
        .as_deref()
        .unwrap_or(default_namespace);

    name_key(
        &database.spec.engine_configuration.name,
        database.spec.engine_configuration.namespace.as_deref(),
        db_namespace,
    )
}

/// Resolve the engine configurations behind the database cache
pub async fn get_engine_configurations(
    ctx: &Context,
    databases: &DatabaseCache,
    default_namespace: &str,
    ignore_not_found: bool,
) -> Result<EngineConfigCache> {
    let mut configs = EngineConfigCache::new();

    for database in databases.values() {
        let key = engine_key_for_database(database, default_namespace);
        if configs.contains_key(&key) {
            continue;
        }

        let db_namespace = database
            .metadata
            .namespace
            .as_deref()
            .unwrap_or(default_namespace);
        let config_namespace = database
            .spec
            .engine_configuration
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(db_namespace);
        let api: Api<PostgresEngineConfiguration> =
            Api::namespaced(ctx.client.clone(), config_namespace);

        let config = match api.get(&database.spec.engine_configuration.name).await {
            Ok(config) => config,
            Err(e) if is_not_found(&e) && ignore_not_found => {
                debug!(engine = %key, "Engine configuration not found, skipping");
                continue;
            }
            Err(e) if is_not_found(&e) => {
                return Err(Error::NotFound(format!(
                    "PostgresEngineConfiguration {key}"
                )));
            }
            Err(e) => return Err(e.into()),
        };

        configs.insert(key, config);
    }

    Ok(configs)
}

/// Build live engine handles from the engine configurations and their
/// admin secrets.
///
/// The handle key is the same engine key as the configuration cache's.
pub async fn get_engines(
    ctx: &Context,
    configs: &EngineConfigCache,
    ignore_not_found: bool,
) -> Result<EngineCache> {
    let mut engines = EngineCache::new();

    for (key, config) in configs {
        let namespace = config
            .metadata
            .namespace
            .as_deref()
            .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
        let api: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);

        let secret = match api.get(&config.spec.secret_name).await {
            Ok(secret) => secret,
            Err(e) if is_not_found(&e) && ignore_not_found => {
                debug!(engine = %key, "Engine admin secret not found, skipping");
                continue;
            }
            Err(e) if is_not_found(&e) => {
                return Err(Error::NotFound(format!(
                    "engine admin secret {}/{}",
                    namespace, config.spec.secret_name
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let user = secret_key(&secret, USERNAME_SECRET_KEY);
        let password = secret_key(&secret, PASSWORD_SECRET_KEY);
        if user.is_empty() || password.is_empty() {
            return Err(Error::ValidationError(format!(
                "engine admin secret {}/{} must have {} and {} valuated keys",
                namespace, config.spec.secret_name, USERNAME_SECRET_KEY, PASSWORD_SECRET_KEY
            )));
        }

        let server = PgServer::new(PgServerConfig {
            host: config.spec.host.clone(),
            port: config.spec.port,
            user,
            password,
            maintenance_database: config.spec.maintenance_database.clone(),
        });

        engines.insert(key.clone(), Arc::new(server) as Arc<dyn PgEngine>);
    }

    Ok(engines)
}

/// Read a data key from a secret as a UTF-8 string, empty when absent
pub fn secret_key(secret: &Secret, key: &str) -> String {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|value| String::from_utf8_lossy(&value.0).to_string())
        .unwrap_or_default()
}
