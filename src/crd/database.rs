//! PostgresDatabase CRD definition
//!
//! Databases are provisioned by their own controller; the user-role
//! reconciler only consumes the outputs recorded here: the engine
//! configuration link, the created database name, and the per-database
//! group roles that login roles are granted membership in.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// PostgresDatabase is the Schema for the postgresdatabases API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "postgres-role-operator.example.com",
    version = "v1alpha1",
    kind = "PostgresDatabase",
    plural = "postgresdatabases",
    shortname = "pgdb",
    namespaced,
    status = "PostgresDatabaseStatus",
    printcolumn = r#"{"name":"Database", "type":"string", "jsonPath":".status.database"}"#,
    printcolumn = r#"{"name":"Ready", "type":"boolean", "jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresDatabaseSpec {
    /// Name of the database to create on the engine
    pub database: String,

    /// Reference to the PostgresEngineConfiguration hosting this database
    pub engine_configuration: EngineConfigurationRef,
}

/// Reference to a PostgresEngineConfiguration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfigurationRef {
    /// Name of the PostgresEngineConfiguration
    pub name: String,

    /// Namespace of the PostgresEngineConfiguration (defaults to the
    /// database's namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Status of the PostgresDatabase resource
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PostgresDatabaseStatus {
    /// Whether the database and its group roles exist on the engine
    #[serde(default)]
    pub ready: bool,

    /// Name of the created database
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub database: String,

    /// Group roles created for this database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<DatabaseRoles>,

    /// Human-readable message, empty on success
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Per-database group roles
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseRoles {
    /// Role owning the database objects
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owner: String,

    /// Role bundle with read and write access
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub writer: String,

    /// Role bundle with read-only access
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reader: String,
}
