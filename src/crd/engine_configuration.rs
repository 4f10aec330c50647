//! PostgresEngineConfiguration CRD definition
//!
//! Describes how to reach a PostgreSQL engine: the admin connection used by
//! the operator itself and the user-facing endpoints (primary, optional
//! bouncer, replicas) projected into generated credential secrets.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// PostgresEngineConfiguration is the Schema for the
/// postgresengineconfigurations API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "postgres-role-operator.example.com",
    version = "v1alpha1",
    kind = "PostgresEngineConfiguration",
    plural = "postgresengineconfigurations",
    shortname = "pgec",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresEngineConfigurationSpec {
    /// Engine host for the operator's admin connection
    pub host: String,

    /// Engine port for the operator's admin connection
    #[serde(default = "default_port")]
    pub port: i32,

    /// Database the operator connects to for engine-level statements
    #[serde(default = "default_maintenance_database")]
    pub maintenance_database: String,

    /// Name of the secret holding the operator's admin USERNAME/PASSWORD
    pub secret_name: String,

    /// Whether GRANT ... WITH ADMIN OPTION is used when the operator
    /// grants itself membership in managed roles. Some hosted engines
    /// require this to reassign ownership.
    #[serde(default)]
    pub allow_grant_admin_option: bool,

    /// Endpoints projected into user credential secrets
    pub user_connections: UserConnections,
}

fn default_port() -> i32 {
    5432
}

fn default_maintenance_database() -> String {
    "postgres".to_string()
}

/// User-facing connection endpoints of an engine
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserConnections {
    /// Direct primary endpoint
    pub primary_connection: ConnectionInfo,

    /// Connection pooler front-end, when deployed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bouncer_connection: Option<ConnectionInfo>,

    /// Direct replica endpoints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replica_connections: Vec<ConnectionInfo>,

    /// Pooler replica endpoints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replica_bouncer_connections: Vec<ConnectionInfo>,
}

/// A single connection endpoint
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Endpoint host
    pub host: String,

    /// Endpoint port
    #[serde(default = "default_port")]
    pub port: i32,

    /// URI arguments baked into generated connection strings
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uri_args: String,
}
