//! Shared context for the PostgresUserRole controller
//!
//! This module provides the shared state and utilities used across
//! the reconciliation loop.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

use crate::controller::error::FailureTracker;
use crate::crd::PostgresUserRole;
use crate::health::HealthState;

/// Field manager name for the operator
pub(crate) const FIELD_MANAGER: &str = "postgres-role-operator";

/// Default wall-clock budget for a single reconcile pass
pub(crate) const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Wall-clock budget for a single reconcile pass
    pub reconcile_timeout: Duration,
    /// Event reporter identity
    reporter: Reporter,
    /// Health state for metrics (optional for tests)
    pub health_state: Option<Arc<HealthState>>,
    /// Consecutive failure counts feeding the requeue schedule
    pub failures: FailureTracker,
}

impl Context {
    /// Create a new context with the given Kubernetes client
    pub fn new(client: Client, health_state: Option<Arc<HealthState>>) -> Self {
        Self {
            client,
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
            health_state,
            failures: FailureTracker::default(),
        }
    }

    /// Override the reconcile deadline
    pub fn with_reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = timeout;
        self
    }

    /// Record a successful reconciliation in metrics
    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        if let Some(ref state) = self.health_state {
            state
                .metrics
                .record_reconcile(namespace, name, duration_secs);
        }
    }

    /// Record a failed reconciliation in metrics
    pub fn record_error(&self, namespace: &str, name: &str) {
        if let Some(ref state) = self.health_state {
            state.metrics.record_error(namespace, name);
        }
    }

    /// Create an event recorder
    fn recorder(&self) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone())
    }

    /// Publish a normal event for a user role
    pub async fn publish_normal_event(
        &self,
        user_role: &PostgresUserRole,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let recorder = self.recorder();
        let object_ref = user_role.object_ref(&());
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!("Failed to publish event: {}", e);
        }
    }

    /// Publish a warning event for a user role
    pub async fn publish_warning_event(
        &self,
        user_role: &PostgresUserRole,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let recorder = self.recorder();
        let object_ref = user_role.object_ref(&());
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_: EventType::Warning,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!("Failed to publish warning event: {}", e);
        }
    }

    /// Publish a normal event against a mutated secret
    pub async fn publish_secret_event(&self, secret: &Secret, reason: &str, note: Option<String>) {
        let recorder = self.recorder();
        let object_ref = secret.object_ref(&());
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: reason.into(),
                    note,
                    action: "Reconciling".into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!("Failed to publish secret event: {}", e);
        }
    }
}
