//! PostgresUserRole CRD definition
//!
//! A PostgresUserRole declares a PostgreSQL login role with access to one or
//! more databases managed by this operator. Creating a PostgresUserRole will:
//! - Create (or import) a PostgreSQL login role on every engine referenced
//!   through the privilege list
//! - Rotate its credentials on a schedule (Managed mode)
//! - Grant membership in the per-database group roles and configure the
//!   default login role per database
//! - Generate one Kubernetes secret with connection strings per privilege

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// PostgresUserRole is the Schema for the postgresuserroles API
///
/// The operator converges live engines toward this declaration and records
/// the currently active login name in the status subresource.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "postgres-role-operator.example.com",
    version = "v1alpha1",
    kind = "PostgresUserRole",
    plural = "postgresuserroles",
    shortname = "pgur",
    namespaced,
    status = "PostgresUserRoleStatus",
    printcolumn = r#"{"name":"Mode", "type":"string", "jsonPath":".spec.mode"}"#,
    printcolumn = r#"{"name":"Role", "type":"string", "jsonPath":".status.postgresRole"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresUserRoleSpec {
    /// How the login role identity is produced
    #[serde(default)]
    pub mode: UserRoleMode,

    /// Prefix of the generated login name (Managed mode only).
    /// The operator appends a `-0`/`-1` rotation suffix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_prefix: Option<String>,

    /// Name of a user-supplied secret holding USERNAME and PASSWORD
    /// (Provided mode only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_secret_name: Option<String>,

    /// Name of the operator-owned work secret recording the intended
    /// identity. Assigned by the operator on first reconcile when empty
    /// and stable afterwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_generated_secret_name: Option<String>,

    /// Databases this role has access to, one entry per database
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub privileges: Vec<UserRolePrivilege>,

    /// Optional PostgreSQL role attributes. Absent fields are kept at the
    /// engine defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_attributes: Option<UserRoleAttributes>,

    /// Rotation period for the generated credentials, as a duration string
    /// such as "24h" (Managed mode only). No rotation when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_password_rotation_duration: Option<String>,
}

/// Identity mode for a PostgresUserRole
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum UserRoleMode {
    /// Operator owns the credentials and rotates them via the two-slot
    /// login suffix
    #[default]
    Managed,
    /// Credentials are imported from a user-supplied secret
    Provided,
}

impl std::fmt::Display for UserRoleMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserRoleMode::Managed => write!(f, "Managed"),
            UserRoleMode::Provided => write!(f, "Provided"),
        }
    }
}

/// Access declaration for one database
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserRolePrivilege {
    /// Reference to the PostgresDatabase resource
    pub database: DatabaseRef,

    /// Privilege level, mapped to the database's group roles
    #[serde(default)]
    pub privilege: PrivilegeLevel,

    /// Which connection endpoint the generated secret points at
    #[serde(default)]
    pub connection_type: ConnectionType,

    /// Name of the Secret to create with connection credentials.
    /// The secret will contain:
    /// - POSTGRES_URL / POSTGRES_URL_ARGS: ready-to-use connection URLs
    /// - LOGIN / PASSWORD: current credentials
    /// - DATABASE / HOST / PORT / ARGS: connection components
    /// - REPLICA_<i>_<key>: the same keys per replica endpoint
    pub generated_secret_name: String,

    /// Extra query parameters appended to the connection URI args
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_connection_url_parameters: BTreeMap<String, String>,
}

/// Reference to a PostgresDatabase
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseRef {
    /// Name of the PostgresDatabase
    pub name: String,

    /// Namespace of the PostgresDatabase (defaults to same namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Privilege levels over a database
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum PrivilegeLevel {
    /// Full ownership of the database objects
    Owner,
    /// Read and write access
    Writer,
    /// Read-only access
    #[default]
    Reader,
}

impl std::fmt::Display for PrivilegeLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrivilegeLevel::Owner => write!(f, "Owner"),
            PrivilegeLevel::Writer => write!(f, "Writer"),
            PrivilegeLevel::Reader => write!(f, "Reader"),
        }
    }
}

/// Connection endpoint kinds
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum ConnectionType {
    /// Direct engine endpoint
    #[default]
    Primary,
    /// Connection pooler front-end
    Bouncer,
}

/// Sparse PostgreSQL role attributes
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserRoleAttributes {
    /// CONNECTION LIMIT for the role (-1 for unlimited)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_limit: Option<i32>,

    /// REPLICATION attribute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication: Option<bool>,

    /// BYPASSRLS attribute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bypass_rls: Option<bool>,
}

/// Status of the PostgresUserRole resource
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PostgresUserRoleStatus {
    /// Current phase of the user role
    #[serde(default)]
    pub phase: UserRolePhase,

    /// Whether the role is converged and usable
    #[serde(default)]
    pub ready: bool,

    /// Human-readable message, empty on success
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Currently active login name on the engines
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub postgres_role: String,

    /// Last-seen role prefix (Managed mode)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role_prefix: String,

    /// RFC3339 timestamp of the last credential change
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_password_changed_time: String,

    /// Superseded login names queued for session-aware deletion
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub old_postgres_roles: Vec<String>,
}

/// Phase of the user role lifecycle
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum UserRolePhase {
    /// Not yet processed
    #[default]
    None,
    /// Role converged on all engines
    Created,
    /// Last pass failed - see message for details
    Failed,
}

impl std::fmt::Display for UserRolePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserRolePhase::None => write!(f, "None"),
            UserRolePhase::Created => write!(f, "Created"),
            UserRolePhase::Failed => write!(f, "Failed"),
        }
    }
}
