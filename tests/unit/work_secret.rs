//! Unit tests for work-secret identity planning
//!
//! These cover the Managed two-slot rotation lifecycle and the Provided
//! mirror logic without touching a cluster.

use chrono::{Duration, Utc};
use postgres_role_operator::controller::work_secret::{
    ManagedPlan, ProvidedPlan, plan_managed_identity, plan_provided_identity,
};
use postgres_role_operator::crd::PostgresUserRoleStatus;

use crate::common::created_status;

fn none_phase_status() -> PostgresUserRoleStatus {
    PostgresUserRoleStatus::default()
}

mod managed_tests {
    use super::*;

    #[test]
    fn test_first_reconcile_creates_slot_zero() {
        let plan =
            plan_managed_identity("svc-x", None, &none_phase_status(), None, Utc::now()).unwrap();

        assert_eq!(
            plan,
            ManagedPlan::Create {
                username: "svc-x-0".to_string(),
                old_username: String::new(),
                password_changed: false,
            }
        );
    }

    #[test]
    fn test_deleted_work_secret_forces_password_reconvergence() {
        // The secret vanished after the role was already managed at the
        // intended name: recreate and re-ensure the password.
        let status = created_status("svc-x-0", "svc-x");
        let plan = plan_managed_identity("svc-x", None, &status, None, Utc::now()).unwrap();

        assert_eq!(
            plan,
            ManagedPlan::Create {
                username: "svc-x-0".to_string(),
                old_username: String::new(),
                password_changed: true,
            }
        );
    }

    #[test]
    fn test_deleted_work_secret_with_moved_name_is_a_username_change() {
        // The secret vanished while the active login sat on slot 1; the
        // recreation resets to slot 0 and queues the old login instead of
        // flagging a password change.
        let status = created_status("svc-x-1", "svc-x");
        let plan = plan_managed_identity("svc-x", None, &status, None, Utc::now()).unwrap();

        assert_eq!(
            plan,
            ManagedPlan::Create {
                username: "svc-x-0".to_string(),
                old_username: "svc-x-1".to_string(),
                password_changed: false,
            }
        );
    }

    #[test]
    fn test_prefix_change_resets_to_slot_zero() {
        let status = created_status("svc-old-0", "svc-old");
        let plan = plan_managed_identity(
            "svc-new",
            None,
            &status,
            Some(("svc-old-0", "password")),
            Utc::now(),
        )
        .unwrap();

        assert_eq!(
            plan,
            ManagedPlan::Replace {
                username: "svc-new-0".to_string(),
                old_username: "svc-old-0".to_string(),
            }
        );
    }

    #[test]
    fn test_emptied_password_key_is_not_a_username_change() {
        // Someone cleared only the PASSWORD key; the username matches the
        // intended one so nothing is queued for deletion.
        let status = created_status("svc-x-0", "svc-x");
        let plan =
            plan_managed_identity("svc-x", None, &status, Some(("svc-x-0", "")), Utc::now())
                .unwrap();

        assert_eq!(
            plan,
            ManagedPlan::Replace {
                username: "svc-x-0".to_string(),
                old_username: String::new(),
            }
        );
    }

    #[test]
    fn test_rotation_not_due_keeps_identity() {
        let mut status = created_status("svc-x-0", "svc-x");
        status.last_password_changed_time = Utc::now().to_rfc3339();

        let plan = plan_managed_identity(
            "svc-x",
            Some("1h"),
            &status,
            Some(("svc-x-0", "password")),
            Utc::now(),
        )
        .unwrap();

        assert_eq!(plan, ManagedPlan::Keep);
    }

    #[test]
    fn test_due_rotation_flips_the_suffix() {
        let mut status = created_status("svc-x-0", "svc-x");
        status.last_password_changed_time = (Utc::now() - Duration::hours(2)).to_rfc3339();

        let plan = plan_managed_identity(
            "svc-x",
            Some("1h"),
            &status,
            Some(("svc-x-0", "password")),
            Utc::now(),
        )
        .unwrap();

        assert_eq!(
            plan,
            ManagedPlan::Rotate {
                username: "svc-x-1".to_string(),
                old_username: "svc-x-0".to_string(),
            }
        );
    }

    #[test]
    fn test_rotation_back_to_slot_zero() {
        let mut status = created_status("svc-x-1", "svc-x");
        status.last_password_changed_time = (Utc::now() - Duration::hours(2)).to_rfc3339();

        let plan = plan_managed_identity(
            "svc-x",
            Some("1h"),
            &status,
            Some(("svc-x-1", "password")),
            Utc::now(),
        )
        .unwrap();

        assert_eq!(
            plan,
            ManagedPlan::Rotate {
                username: "svc-x-0".to_string(),
                old_username: "svc-x-1".to_string(),
            }
        );
    }

    #[test]
    fn test_rotation_halts_when_flipped_name_awaits_reaping() {
        // Slot 0 still has a live session from the previous rotation;
        // flipping back onto it would resurrect a role slated for
        // deletion.
        let mut status = created_status("svc-x-1", "svc-x");
        status.last_password_changed_time = (Utc::now() - Duration::hours(2)).to_rfc3339();
        status.old_postgres_roles = vec!["svc-x-0".to_string()];

        let plan = plan_managed_identity(
            "svc-x",
            Some("1h"),
            &status,
            Some(("svc-x-1", "password")),
            Utc::now(),
        )
        .unwrap();

        assert_eq!(plan, ManagedPlan::RotationHalted);
    }

    #[test]
    fn test_rotation_needs_a_previous_timestamp() {
        // Before any recorded change there is nothing to rotate from
        let mut status = created_status("svc-x-0", "svc-x");
        status.last_password_changed_time = String::new();

        let plan = plan_managed_identity(
            "svc-x",
            Some("1h"),
            &status,
            Some(("svc-x-0", "password")),
            Utc::now(),
        )
        .unwrap();

        assert_eq!(plan, ManagedPlan::Keep);
    }

    #[test]
    fn test_invalid_stored_timestamp_is_an_error() {
        let mut status = created_status("svc-x-0", "svc-x");
        status.last_password_changed_time = "yesterday".to_string();

        let result = plan_managed_identity(
            "svc-x",
            Some("1h"),
            &status,
            Some(("svc-x-0", "password")),
            Utc::now(),
        );

        assert!(result.is_err());
    }
}

mod provided_tests {
    use super::*;

    #[test]
    fn test_first_reconcile_mirrors_import() {
        let plan = plan_provided_identity("alice", "p1", &none_phase_status(), None);

        assert_eq!(
            plan,
            ProvidedPlan::Create {
                old_username: String::new(),
                password_changed: false,
            }
        );
    }

    #[test]
    fn test_matching_work_secret_is_kept() {
        let status = created_status("alice", "");
        let plan = plan_provided_identity("alice", "p1", &status, Some(("alice", "p1")));

        assert_eq!(plan, ProvidedPlan::Keep);
    }

    #[test]
    fn test_username_rotation_queues_the_old_login() {
        let status = created_status("alice", "");
        let plan = plan_provided_identity("alice2", "p2", &status, Some(("alice", "p1")));

        assert_eq!(
            plan,
            ProvidedPlan::Update {
                old_username: "alice".to_string(),
                password_changed: true,
            }
        );
    }

    #[test]
    fn test_password_only_change() {
        let status = created_status("alice", "");
        let plan = plan_provided_identity("alice", "p2", &status, Some(("alice", "p1")));

        assert_eq!(
            plan,
            ProvidedPlan::Update {
                old_username: "alice".to_string(),
                password_changed: true,
            }
        );
    }

    #[test]
    fn test_deleted_work_secret_with_changed_import_username() {
        let status = created_status("alice", "");
        let plan = plan_provided_identity("alice2", "p2", &status, None);

        assert_eq!(
            plan,
            ProvidedPlan::Create {
                old_username: "alice".to_string(),
                password_changed: false,
            }
        );
    }
}
