//! Unit tests for validation logic

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use postgres_role_operator::controller::resolver::engine_key_for_database;
use postgres_role_operator::controller::validation::{
    validate_import_secret, validate_managed_spec, validate_no_duplicate_databases,
    validate_with_cluster_info,
};
use postgres_role_operator::crd::PrivilegeLevel;
use postgres_role_operator::postgres::MAX_IDENTIFIER_LENGTH;

use crate::common::{
    EngineConfigBuilder, UserRoleBuilder, create_test_database,
};

fn import_secret(username: &str, password: &str) -> Secret {
    let mut data = BTreeMap::new();
    if !username.is_empty() {
        data.insert(
            "USERNAME".to_string(),
            ByteString(username.as_bytes().to_vec()),
        );
    }
    if !password.is_empty() {
        data.insert(
            "PASSWORD".to_string(),
            ByteString(password.as_bytes().to_vec()),
        );
    }

    Secret {
        data: Some(data),
        ..Default::default()
    }
}

mod managed_spec_tests {
    use super::*;

    #[test]
    fn test_valid_managed_spec() {
        let user_role = UserRoleBuilder::managed("svc-x", "default", "svc-x").build();
        assert!(validate_managed_spec(&user_role).is_ok());
    }

    #[test]
    fn test_missing_role_prefix_is_rejected() {
        let mut user_role = UserRoleBuilder::managed("svc-x", "default", "svc-x").build();
        user_role.spec.role_prefix = None;

        let result = validate_managed_spec(&user_role);
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("without any rolePrefix")
        );
    }

    #[test]
    fn test_role_prefix_length_limit() {
        // The suffix "-0" plus one headroom character count against the
        // identifier limit, so the longest accepted prefix is 63 - 3.
        let longest_valid = "a".repeat(MAX_IDENTIFIER_LENGTH - 3);
        let user_role = UserRoleBuilder::managed("svc-x", "default", &longest_valid).build();
        assert!(validate_managed_spec(&user_role).is_ok());

        let too_long = "a".repeat(MAX_IDENTIFIER_LENGTH - 2);
        let user_role = UserRoleBuilder::managed("svc-x", "default", &too_long).build();
        let result = validate_managed_spec(&user_role);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("too long"));
    }

    #[test]
    fn test_rotation_duration_must_parse() {
        let user_role = UserRoleBuilder::managed("svc-x", "default", "svc-x")
            .with_rotation("1h")
            .build();
        assert!(validate_managed_spec(&user_role).is_ok());

        let user_role = UserRoleBuilder::managed("svc-x", "default", "svc-x")
            .with_rotation("not-a-duration")
            .build();
        let result = validate_managed_spec(&user_role);
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("userPasswordRotationDuration")
        );
    }
}

mod import_secret_tests {
    use super::*;

    #[test]
    fn test_valid_import_secret() {
        assert!(validate_import_secret(&import_secret("alice", "p1")).is_ok());
    }

    #[test]
    fn test_missing_keys_are_rejected() {
        assert!(validate_import_secret(&import_secret("", "p1")).is_err());
        assert!(validate_import_secret(&import_secret("alice", "")).is_err());
        assert!(validate_import_secret(&import_secret("", "")).is_err());
    }

    #[test]
    fn test_username_length_is_bounded() {
        let username = "a".repeat(MAX_IDENTIFIER_LENGTH);
        assert!(validate_import_secret(&import_secret(&username, "p1")).is_ok());

        let username = "a".repeat(MAX_IDENTIFIER_LENGTH + 1);
        let result = validate_import_secret(&import_secret(&username, "p1"));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("too long"));
    }
}

mod duplicate_database_tests {
    use super::*;

    #[test]
    fn test_distinct_databases_pass() {
        let user_role = UserRoleBuilder::managed("svc-x", "default", "svc-x")
            .with_privilege("orders", PrivilegeLevel::Reader, "orders-svc-x")
            .with_privilege("billing", PrivilegeLevel::Writer, "billing-svc-x")
            .build();

        assert!(validate_no_duplicate_databases(&user_role, "default").is_ok());
    }

    #[test]
    fn test_same_database_twice_is_rejected() {
        let user_role = UserRoleBuilder::managed("svc-x", "default", "svc-x")
            .with_privilege("orders", PrivilegeLevel::Reader, "orders-reader-svc-x")
            .with_privilege("orders", PrivilegeLevel::Writer, "orders-writer-svc-x")
            .build();

        let result = validate_no_duplicate_databases(&user_role, "default");
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("listed multiple times")
        );
    }

    #[test]
    fn test_same_name_in_other_namespace_passes() {
        let mut user_role = UserRoleBuilder::managed("svc-x", "default", "svc-x")
            .with_privilege("orders", PrivilegeLevel::Reader, "orders-a")
            .with_privilege("orders", PrivilegeLevel::Writer, "orders-b")
            .build();
        // Same database name but resolved into a different namespace
        user_role.spec.privileges[1].database.namespace = Some("other".to_string());

        assert!(validate_no_duplicate_databases(&user_role, "default").is_ok());
    }

    #[test]
    fn test_explicit_default_namespace_still_collides() {
        let mut user_role = UserRoleBuilder::managed("svc-x", "default", "svc-x")
            .with_privilege("orders", PrivilegeLevel::Reader, "orders-a")
            .with_privilege("orders", PrivilegeLevel::Writer, "orders-b")
            .build();
        // One entry spells the namespace out, the other leaves it empty;
        // both resolve to the same database
        user_role.spec.privileges[1].database.namespace = Some("default".to_string());

        assert!(validate_no_duplicate_databases(&user_role, "default").is_err());
    }
}

mod cluster_info_tests {
    use super::*;

    #[test]
    fn test_bouncer_privilege_needs_bouncer_endpoint() {
        let user_role = UserRoleBuilder::managed("svc-x", "default", "svc-x")
            .with_bouncer_privilege("orders", PrivilegeLevel::Reader, "orders-svc-x")
            .build();

        let database = create_test_database("orders", "default", "orders", true);
        let engine_key = engine_key_for_database(&database, "default");

        let mut databases = std::collections::BTreeMap::new();
        databases.insert("default/orders".to_string(), database);

        // Engine without a bouncer endpoint
        let mut configs = std::collections::BTreeMap::new();
        configs.insert(
            engine_key.clone(),
            EngineConfigBuilder::new("main-engine", "default").build(),
        );

        let result = validate_with_cluster_info(&user_role, "default", &databases, &configs);
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("bouncer connection asked but not supported")
        );

        // Same engine with a bouncer endpoint passes
        configs.insert(
            engine_key,
            EngineConfigBuilder::new("main-engine", "default")
                .with_bouncer()
                .build(),
        );
        assert!(validate_with_cluster_info(&user_role, "default", &databases, &configs).is_ok());
    }

    #[test]
    fn test_primary_privilege_ignores_bouncer_availability() {
        let user_role = UserRoleBuilder::managed("svc-x", "default", "svc-x")
            .with_privilege("orders", PrivilegeLevel::Reader, "orders-svc-x")
            .build();

        // No caches needed: primary-only privileges skip the check
        let databases = std::collections::BTreeMap::new();
        let configs = std::collections::BTreeMap::new();

        assert!(validate_with_cluster_info(&user_role, "default", &databases, &configs).is_ok());
    }
}
