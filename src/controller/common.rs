//! Shared helpers for owned objects and cross-resource keys

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

use crate::crd::PostgresUserRole;

/// Create a controller owner reference for a PostgresUserRole
pub fn owner_reference(user_role: &PostgresUserRole) -> OwnerReference {
    OwnerReference {
        api_version: PostgresUserRole::api_version(&()).to_string(),
        kind: PostgresUserRole::kind(&()).to_string(),
        name: user_role.name_any(),
        uid: user_role.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Standard labels stamped on secrets owned by a PostgresUserRole
pub fn owned_secret_labels(user_role: &PostgresUserRole) -> BTreeMap<String, String> {
    BTreeMap::from([(
        "app.kubernetes.io/name".to_string(),
        user_role.name_any(),
    )])
}

/// Deterministic `namespace/name` key for a referenced resource.
///
/// The same key partitions databases, engine configurations, and live
/// engine handles, so it must stay stable across all resolver stages.
pub fn name_key(name: &str, namespace: Option<&str>, default_namespace: &str) -> String {
    let namespace = match namespace {
        Some(ns) if !ns.is_empty() => ns,
        _ => default_namespace,
    };

    format!("{namespace}/{name}")
}
