//! PostgreSQL engine capability port
//!
//! The reconciler talks to engines exclusively through the [`PgEngine`]
//! trait so the convergence logic stays independent of the wire driver.
//! [`engine::PgServer`] is the tokio-postgres implementation used in
//! production; tests substitute a mock.

pub mod engine;
pub mod url;

use async_trait::async_trait;
use thiserror::Error;

/// Default CONNECTION LIMIT for a role (-1 means unlimited)
pub const DEFAULT_CONNECTION_LIMIT: i32 = -1;

/// Default REPLICATION attribute for a role
pub const DEFAULT_REPLICATION: bool = false;

/// Default BYPASSRLS attribute for a role
pub const DEFAULT_BYPASS_RLS: bool = false;

/// Maximum length of a PostgreSQL identifier (NAMEDATALEN - 1)
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Errors raised by engine operations
#[derive(Error, Debug)]
pub enum PgError {
    /// Connection establishment or loss, usually transient
    #[error("engine connection error: {0}")]
    Connection(String),

    /// A statement was rejected by the engine
    #[error("SQL error: {0}")]
    Sql(String),

    /// A row or value the caller relies on is missing
    #[error("unexpected engine state: {0}")]
    UnexpectedState(String),
}

impl PgError {
    /// Connection-level failures are worth retrying; statement rejections
    /// generally are not until something changes.
    pub fn is_transient(&self) -> bool {
        matches!(self, PgError::Connection(_))
    }
}

impl From<tokio_postgres::Error> for PgError {
    fn from(err: tokio_postgres::Error) -> Self {
        if err.is_closed() {
            PgError::Connection(err.to_string())
        } else if err.as_db_error().is_some() {
            PgError::Sql(err.to_string())
        } else {
            PgError::Connection(err.to_string())
        }
    }
}

/// Result type for engine operations
pub type PgResult<T> = std::result::Result<T, PgError>;

/// Sparse role attributes. `None` fields are untouched by alters and mean
/// "unknown" when read back.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoleAttributes {
    pub connection_limit: Option<i32>,
    pub replication: Option<bool>,
    pub bypass_rls: Option<bool>,
}

/// A per-database default role applied at login (`SET ROLE` session
/// default)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetRoleOnDatabaseSetting {
    pub database: String,
    pub role: String,
}

/// Abstract operations on one PostgreSQL engine
///
/// All operations are idempotent at the surface the reconciler relies on:
/// re-granting an existing membership or re-setting an identical default
/// converges to the same state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PgEngine: Send + Sync {
    /// Login of the operator's own connection
    fn get_user(&self) -> String;

    async fn is_role_exist(&self, role: &str) -> PgResult<bool>;

    /// Create a login role. Returns the canonical role name, which may
    /// differ from the requested one on suffix-adding engines.
    async fn create_user_role<'a>(
        &self,
        role: &str,
        password: &str,
        attributes: Option<&'a RoleAttributes>,
    ) -> PgResult<String>;

    /// Read the attributes of an existing role. Returns `None` when the
    /// role vanished between checks.
    async fn get_role_attributes(&self, role: &str) -> PgResult<Option<RoleAttributes>>;

    /// Apply a sparse attribute change. Absent fields are left alone.
    async fn alter_role_attributes(&self, role: &str, attributes: &RoleAttributes) -> PgResult<()>;

    async fn update_password(&self, role: &str, password: &str) -> PgResult<()>;

    async fn drop_role(&self, role: &str) -> PgResult<()>;

    /// Grant `role` to `member`, optionally `WITH ADMIN OPTION`
    async fn grant_role(&self, role: &str, member: &str, with_admin_option: bool) -> PgResult<()>;

    async fn revoke_role(&self, role: &str, member: &str) -> PgResult<()>;

    /// Roles the given login is a member of
    async fn get_role_membership(&self, role: &str) -> PgResult<Vec<String>>;

    /// Current per-database login-role defaults for the given login
    async fn get_set_role_on_databases(
        &self,
        role: &str,
    ) -> PgResult<Vec<SetRoleOnDatabaseSetting>>;

    /// Configure the default role assumed at login on one database
    async fn alter_default_login_role_on_database(
        &self,
        role: &str,
        group_role: &str,
        database: &str,
    ) -> PgResult<()>;

    /// Drop the per-database login-role default
    async fn revoke_user_set_role_on_database(&self, role: &str, database: &str) -> PgResult<()>;

    /// Whether any live session belongs to the role
    async fn does_role_have_active_session(&self, role: &str) -> PgResult<bool>;

    /// Transfer everything `old_owner` owns inside `database` to
    /// `new_owner`, then drop the remaining dependents
    async fn change_and_drop_owned_by(
        &self,
        old_owner: &str,
        new_owner: &str,
        database: &str,
    ) -> PgResult<()>;
}

/// Quote a SQL identifier (role name, database name, etc.)
/// Uses PostgreSQL's standard double-quote escaping
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Escape a SQL string literal
/// Uses PostgreSQL's standard single-quote escaping
pub(crate) fn escape_sql_string(s: &str) -> String {
    s.replace('\'', "''")
}
