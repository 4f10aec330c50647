//! Test fixtures and builders for PostgresUserRole, PostgresDatabase and
//! PostgresEngineConfiguration resources
//!
//! # Quick Start
//!
//! For simple unit tests, use the convenience functions:
//! ```rust,ignore
//! let user_role = create_test_user_role("svc-x", "default");
//! let database = create_test_database("orders", "default", "orders", true);
//! ```
//!
//! For more complex configurations, use the builder pattern:
//! ```rust,ignore
//! let user_role = UserRoleBuilder::managed("svc-x", "default", "svc-x")
//!     .with_privilege("orders", PrivilegeLevel::Reader, "orders-svc-x")
//!     .with_rotation("1h")
//!     .build();
//! ```

use std::collections::BTreeMap;

use kube::core::ObjectMeta;
use postgres_role_operator::crd::{
    ConnectionInfo, ConnectionType, DatabaseRef, DatabaseRoles, EngineConfigurationRef,
    PostgresDatabase, PostgresDatabaseSpec, PostgresDatabaseStatus, PostgresEngineConfiguration,
    PostgresEngineConfigurationSpec, PostgresUserRole, PostgresUserRoleSpec,
    PostgresUserRoleStatus, PrivilegeLevel, UserConnections, UserRoleMode, UserRolePhase,
    UserRolePrivilege,
};

// =============================================================================
// Convenience Functions for Simple Test Cases
// =============================================================================

/// Create a basic Managed user role with a single Reader privilege
pub fn create_test_user_role(name: &str, namespace: &str) -> PostgresUserRole {
    UserRoleBuilder::managed(name, namespace, name)
        .with_privilege("orders", PrivilegeLevel::Reader, &format!("orders-{name}"))
        .build()
}

/// Create a ready database with the conventional group role names
pub fn create_test_database(
    name: &str,
    namespace: &str,
    database: &str,
    ready: bool,
) -> PostgresDatabase {
    PostgresDatabase {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("db-uid-{name}")),
            ..Default::default()
        },
        spec: PostgresDatabaseSpec {
            database: database.to_string(),
            engine_configuration: EngineConfigurationRef {
                name: "main-engine".to_string(),
                namespace: None,
            },
        },
        status: Some(PostgresDatabaseStatus {
            ready,
            database: database.to_string(),
            roles: Some(DatabaseRoles {
                owner: format!("{database}-owner"),
                writer: format!("{database}-writer"),
                reader: format!("{database}-reader"),
            }),
            message: String::new(),
        }),
    }
}

/// Create an engine configuration with a primary endpoint only
pub fn create_test_engine_config(name: &str, namespace: &str) -> PostgresEngineConfiguration {
    EngineConfigBuilder::new(name, namespace).build()
}

// =============================================================================
// Builders
// =============================================================================

/// Builder for PostgresUserRole resources
pub struct UserRoleBuilder {
    name: String,
    namespace: String,
    spec: PostgresUserRoleSpec,
    status: Option<PostgresUserRoleStatus>,
}

impl UserRoleBuilder {
    /// Start a Managed user role
    pub fn managed(name: &str, namespace: &str, role_prefix: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            spec: PostgresUserRoleSpec {
                mode: UserRoleMode::Managed,
                role_prefix: Some(role_prefix.to_string()),
                import_secret_name: None,
                work_generated_secret_name: Some(format!("pgcreds-work-{name}")),
                privileges: Vec::new(),
                role_attributes: None,
                user_password_rotation_duration: None,
            },
            status: None,
        }
    }

    /// Start a Provided user role importing the given secret
    pub fn provided(name: &str, namespace: &str, import_secret_name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            spec: PostgresUserRoleSpec {
                mode: UserRoleMode::Provided,
                role_prefix: None,
                import_secret_name: Some(import_secret_name.to_string()),
                work_generated_secret_name: Some(format!("pgcreds-work-{name}")),
                privileges: Vec::new(),
                role_attributes: None,
                user_password_rotation_duration: None,
            },
            status: None,
        }
    }

    /// Add a privilege entry targeting a database in the same namespace
    pub fn with_privilege(
        mut self,
        database: &str,
        privilege: PrivilegeLevel,
        generated_secret_name: &str,
    ) -> Self {
        self.spec.privileges.push(UserRolePrivilege {
            database: DatabaseRef {
                name: database.to_string(),
                namespace: None,
            },
            privilege,
            connection_type: ConnectionType::Primary,
            generated_secret_name: generated_secret_name.to_string(),
            extra_connection_url_parameters: BTreeMap::new(),
        });
        self
    }

    /// Add a privilege entry going through the bouncer
    pub fn with_bouncer_privilege(
        mut self,
        database: &str,
        privilege: PrivilegeLevel,
        generated_secret_name: &str,
    ) -> Self {
        self.spec.privileges.push(UserRolePrivilege {
            database: DatabaseRef {
                name: database.to_string(),
                namespace: None,
            },
            privilege,
            connection_type: ConnectionType::Bouncer,
            generated_secret_name: generated_secret_name.to_string(),
            extra_connection_url_parameters: BTreeMap::new(),
        });
        self
    }

    /// Enable credential rotation
    pub fn with_rotation(mut self, duration: &str) -> Self {
        self.spec.user_password_rotation_duration = Some(duration.to_string());
        self
    }

    /// Clear the operator-assigned work secret name
    pub fn without_work_secret_name(mut self) -> Self {
        self.spec.work_generated_secret_name = None;
        self
    }

    /// Attach a status block
    pub fn with_status(mut self, status: PostgresUserRoleStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn build(self) -> PostgresUserRole {
        PostgresUserRole {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                uid: Some(format!("user-role-uid-{}", self.name)),
                generation: Some(1),
                ..Default::default()
            },
            spec: self.spec,
            status: self.status,
        }
    }
}

/// Shorthand for a status block of an already-converged Managed role
pub fn created_status(postgres_role: &str, role_prefix: &str) -> PostgresUserRoleStatus {
    PostgresUserRoleStatus {
        phase: UserRolePhase::Created,
        ready: true,
        message: String::new(),
        postgres_role: postgres_role.to_string(),
        role_prefix: role_prefix.to_string(),
        last_password_changed_time: "2024-01-01T00:00:00+00:00".to_string(),
        old_postgres_roles: Vec::new(),
    }
}

/// Builder for PostgresEngineConfiguration resources
pub struct EngineConfigBuilder {
    name: String,
    namespace: String,
    spec: PostgresEngineConfigurationSpec,
}

impl EngineConfigBuilder {
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            spec: PostgresEngineConfigurationSpec {
                host: "pg.example.com".to_string(),
                port: 5432,
                maintenance_database: "postgres".to_string(),
                secret_name: format!("{name}-admin"),
                allow_grant_admin_option: false,
                user_connections: UserConnections {
                    primary_connection: ConnectionInfo {
                        host: "pg-primary.example.com".to_string(),
                        port: 5432,
                        uri_args: "sslmode=require".to_string(),
                    },
                    bouncer_connection: None,
                    replica_connections: Vec::new(),
                    replica_bouncer_connections: Vec::new(),
                },
            },
        }
    }

    /// Declare a bouncer endpoint
    pub fn with_bouncer(mut self) -> Self {
        self.spec.user_connections.bouncer_connection = Some(ConnectionInfo {
            host: "pg-bouncer.example.com".to_string(),
            port: 6432,
            uri_args: "sslmode=require".to_string(),
        });
        self
    }

    /// Add a direct replica endpoint
    pub fn with_replica(mut self, host: &str) -> Self {
        self.spec.user_connections.replica_connections.push(ConnectionInfo {
            host: host.to_string(),
            port: 5432,
            uri_args: "sslmode=require".to_string(),
        });
        self
    }

    pub fn build(self) -> PostgresEngineConfiguration {
        PostgresEngineConfiguration {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                uid: Some(format!("engine-uid-{}", self.name)),
                ..Default::default()
            },
            spec: self.spec,
        }
    }
}
