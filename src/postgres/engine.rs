//! tokio-postgres implementation of the engine capability port
//!
//! One `PgServer` is built per engine configuration per reconcile pass.
//! Statements that operate on engine-level catalogs run against the
//! maintenance database; ownership reassignment connects to the database
//! holding the objects, since `REASSIGN OWNED` only sees the current
//! database.

use async_trait::async_trait;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

use crate::postgres::{
    PgEngine, PgError, PgResult, RoleAttributes, SetRoleOnDatabaseSetting, escape_sql_string,
    quote_identifier,
};

/// Connection settings for one engine, taken from the engine
/// configuration and its admin secret
#[derive(Clone, Debug)]
pub struct PgServerConfig {
    pub host: String,
    pub port: i32,
    pub user: String,
    pub password: String,
    pub maintenance_database: String,
}

/// A live engine handle
pub struct PgServer {
    config: PgServerConfig,
}

impl PgServer {
    pub fn new(config: PgServerConfig) -> Self {
        Self { config }
    }

    /// Open a fresh connection to the given database and drive it in the
    /// background until the client is dropped.
    async fn client(&self, database: &str) -> PgResult<Client> {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&self.config.host)
            .port(u16::try_from(self.config.port).map_err(|_| {
                PgError::Connection(format!("invalid port {}", self.config.port))
            })?)
            .user(&self.config.user)
            .password(&self.config.password)
            .dbname(database);

        let (client, connection) = pg_config
            .connect(NoTls)
            .await
            .map_err(|e| PgError::Connection(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "Engine connection terminated");
            }
        });

        Ok(client)
    }

    async fn maintenance_client(&self) -> PgResult<Client> {
        self.client(&self.config.maintenance_database).await
    }

    async fn execute(&self, sql: &str) -> PgResult<()> {
        debug!(host = %self.config.host, "Executing engine statement");
        let client = self.maintenance_client().await?;
        client.batch_execute(sql).await?;
        Ok(())
    }
}

/// Render the attribute clauses of CREATE ROLE / ALTER ROLE.
/// Absent fields produce no clause.
fn attribute_clauses(attributes: &RoleAttributes) -> String {
    let mut clauses = String::new();

    if let Some(limit) = attributes.connection_limit {
        clauses.push_str(&format!(" CONNECTION LIMIT {limit}"));
    }

    if let Some(replication) = attributes.replication {
        clauses.push_str(if replication {
            " REPLICATION"
        } else {
            " NOREPLICATION"
        });
    }

    if let Some(bypass_rls) = attributes.bypass_rls {
        clauses.push_str(if bypass_rls { " BYPASSRLS" } else { " NOBYPASSRLS" });
    }

    clauses
}

#[async_trait]
impl PgEngine for PgServer {
    fn get_user(&self) -> String {
        self.config.user.clone()
    }

    async fn is_role_exist(&self, role: &str) -> PgResult<bool> {
        let client = self.maintenance_client().await?;
        let rows = client
            .query("SELECT 1 FROM pg_roles WHERE rolname = $1", &[&role])
            .await?;
        Ok(!rows.is_empty())
    }

    async fn create_user_role<'a>(
        &self,
        role: &str,
        password: &str,
        attributes: Option<&'a RoleAttributes>,
    ) -> PgResult<String> {
        let mut sql = format!(
            "CREATE ROLE {} WITH LOGIN PASSWORD '{}'",
            quote_identifier(role),
            escape_sql_string(password)
        );

        if let Some(attributes) = attributes {
            sql.push_str(&attribute_clauses(attributes));
        }

        self.execute(&sql).await?;

        // This engine keeps the requested name as-is. Suffix-adding
        // engines return their canonical form here.
        Ok(role.to_string())
    }

    async fn get_role_attributes(&self, role: &str) -> PgResult<Option<RoleAttributes>> {
        let client = self.maintenance_client().await?;
        let rows = client
            .query(
                "SELECT rolconnlimit, rolreplication, rolbypassrls FROM pg_roles WHERE rolname = $1",
                &[&role],
            )
            .await?;

        let Some(row) = rows.first() else {
            return Ok(None);
        };

        Ok(Some(RoleAttributes {
            connection_limit: Some(row.get::<_, i32>(0)),
            replication: Some(row.get::<_, bool>(1)),
            bypass_rls: Some(row.get::<_, bool>(2)),
        }))
    }

    async fn alter_role_attributes(&self, role: &str, attributes: &RoleAttributes) -> PgResult<()> {
        let clauses = attribute_clauses(attributes);
        if clauses.is_empty() {
            return Ok(());
        }

        let sql = format!("ALTER ROLE {} WITH{}", quote_identifier(role), clauses);
        self.execute(&sql).await
    }

    async fn update_password(&self, role: &str, password: &str) -> PgResult<()> {
        let sql = format!(
            "ALTER ROLE {} WITH PASSWORD '{}'",
            quote_identifier(role),
            escape_sql_string(password)
        );
        self.execute(&sql).await
    }

    async fn drop_role(&self, role: &str) -> PgResult<()> {
        let sql = format!("DROP ROLE IF EXISTS {}", quote_identifier(role));
        self.execute(&sql).await
    }

    async fn grant_role(&self, role: &str, member: &str, with_admin_option: bool) -> PgResult<()> {
        let mut sql = format!(
            "GRANT {} TO {}",
            quote_identifier(role),
            quote_identifier(member)
        );

        if with_admin_option {
            sql.push_str(" WITH ADMIN OPTION");
        }

        self.execute(&sql).await
    }

    async fn revoke_role(&self, role: &str, member: &str) -> PgResult<()> {
        let sql = format!(
            "REVOKE {} FROM {}",
            quote_identifier(role),
            quote_identifier(member)
        );
        self.execute(&sql).await
    }

    async fn get_role_membership(&self, role: &str) -> PgResult<Vec<String>> {
        let client = self.maintenance_client().await?;
        let rows = client
            .query(
                "SELECT g.rolname \
                 FROM pg_catalog.pg_auth_members m \
                 JOIN pg_catalog.pg_roles g ON g.oid = m.roleid \
                 JOIN pg_catalog.pg_roles u ON u.oid = m.member \
                 WHERE u.rolname = $1",
                &[&role],
            )
            .await?;

        Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
    }

    async fn get_set_role_on_databases(
        &self,
        role: &str,
    ) -> PgResult<Vec<SetRoleOnDatabaseSetting>> {
        let client = self.maintenance_client().await?;
        let rows = client
            .query(
                "SELECT d.datname, s.setconfig \
                 FROM pg_catalog.pg_db_role_setting s \
                 JOIN pg_catalog.pg_database d ON d.oid = s.setdatabase \
                 JOIN pg_catalog.pg_roles r ON r.oid = s.setrole \
                 WHERE r.rolname = $1",
                &[&role],
            )
            .await?;

        let mut settings = Vec::new();

        for row in rows {
            let database: String = row.get(0);
            let setconfig: Vec<String> = row.get(1);

            // setconfig entries look like "role=reader-group"
            for entry in setconfig {
                if let Some(value) = entry.strip_prefix("role=") {
                    settings.push(SetRoleOnDatabaseSetting {
                        database: database.clone(),
                        role: value.trim_matches('"').to_string(),
                    });
                }
            }
        }

        Ok(settings)
    }

    async fn alter_default_login_role_on_database(
        &self,
        role: &str,
        group_role: &str,
        database: &str,
    ) -> PgResult<()> {
        let sql = format!(
            "ALTER ROLE {} IN DATABASE {} SET ROLE = {}",
            quote_identifier(role),
            quote_identifier(database),
            quote_identifier(group_role)
        );
        self.execute(&sql).await
    }

    async fn revoke_user_set_role_on_database(&self, role: &str, database: &str) -> PgResult<()> {
        let sql = format!(
            "ALTER ROLE {} IN DATABASE {} RESET ROLE",
            quote_identifier(role),
            quote_identifier(database)
        );
        self.execute(&sql).await
    }

    async fn does_role_have_active_session(&self, role: &str) -> PgResult<bool> {
        let client = self.maintenance_client().await?;
        let rows = client
            .query(
                "SELECT 1 FROM pg_stat_activity WHERE usename = $1 LIMIT 1",
                &[&role],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn change_and_drop_owned_by(
        &self,
        old_owner: &str,
        new_owner: &str,
        database: &str,
    ) -> PgResult<()> {
        // REASSIGN OWNED only covers objects in the current database, so
        // this connects to the target database rather than the
        // maintenance one.
        let client = self.client(database).await?;

        let reassign = format!(
            "REASSIGN OWNED BY {} TO {}",
            quote_identifier(old_owner),
            quote_identifier(new_owner)
        );
        client.batch_execute(&reassign).await?;

        let drop_owned = format!("DROP OWNED BY {}", quote_identifier(old_owner));
        client.batch_execute(&drop_owned).await?;

        Ok(())
    }
}
