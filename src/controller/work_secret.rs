//! Work-secret manager
//!
//! The work secret is the authoritative record of the intended
//! `(username, password)` pair for a PostgresUserRole; engines are
//! converged toward it. In Managed mode the operator owns the credentials
//! and rotates them by flipping a `-0`/`-1` login suffix; in Provided mode
//! the work secret mirrors a user-supplied import secret.
//!
//! Identity decisions are pure ([`plan_managed_identity`],
//! [`plan_provided_identity`]) so the rotation invariants can be tested
//! without a cluster; the surrounding functions materialize the decision
//! against the secret store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::Api;
use kube::api::{Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use rand::Rng;
use tracing::info;

use crate::controller::common::{owned_secret_labels, owner_reference};
use crate::controller::context::{Context, FIELD_MANAGER};
use crate::controller::error::{Error, Result};
use crate::controller::resolver::secret_key;
use crate::crd::{PostgresUserRole, PostgresUserRoleStatus};

/// Key of the login name inside work and import secrets
pub const USERNAME_SECRET_KEY: &str = "USERNAME";

/// Key of the password inside work and import secrets
pub const PASSWORD_SECRET_KEY: &str = "PASSWORD";

/// First rotation slot suffix
pub const LOGIN_0_SUFFIX: &str = "-0";

/// Second rotation slot suffix
pub const LOGIN_1_SUFFIX: &str = "-1";

/// Prefix of generated work secret names
pub const WORK_SECRET_NAME_PREFIX: &str = "pgcreds-work-";

/// Random suffix length of generated work secret names
pub const WORK_SECRET_NAME_RANDOM_LENGTH: usize = 20;

/// Length of generated passwords in Managed mode
pub const MANAGED_PASSWORD_SIZE: usize = 15;

/// Generate a secure random password
pub fn generate_password(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

/// Generate a work secret name: `pgcreds-work-` + random lowercase suffix
pub fn generate_work_secret_name() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    let suffix: String = (0..WORK_SECRET_NAME_RANDOM_LENGTH)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect();

    format!("{WORK_SECRET_NAME_PREFIX}{suffix}")
}

/// Flip the rotation suffix of a login name
pub fn opposite_login(role_prefix: &str, current_username: &str) -> String {
    if current_username.ends_with(LOGIN_0_SUFFIX) {
        format!("{role_prefix}{LOGIN_1_SUFFIX}")
    } else {
        format!("{role_prefix}{LOGIN_0_SUFFIX}")
    }
}

/// Outcome of the work-secret stage
pub struct WorkSecretResult {
    /// The work secret after materialization
    pub secret: Secret,
    /// Previous login name, empty when the identity did not move
    pub old_username: String,
    /// Whether the engines must reconverge the password
    pub password_changed: bool,
    /// Whether a due rotation was aborted because the flipped name is
    /// still queued for deletion
    pub rotation_halted: bool,
}

/// Decision of the Managed identity planner
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManagedPlan {
    /// Work secret is missing; recreate it at the intended identity
    Create {
        username: String,
        old_username: String,
        password_changed: bool,
    },
    /// Prefix changed or the secret was emptied; reset to slot `-0`
    Replace {
        username: String,
        old_username: String,
    },
    /// Rotation is due; move to the flipped slot
    Rotate {
        username: String,
        old_username: String,
    },
    /// Rotation is due but the flipped name has not been reaped yet
    RotationHalted,
    /// Nothing to do
    Keep,
}

/// Decide what to do with the Managed work secret.
///
/// `existing` carries the `(username, password)` currently stored in the
/// work secret, or `None` when the secret is missing.
pub fn plan_managed_identity(
    role_prefix: &str,
    rotation_duration: Option<&str>,
    status: &PostgresUserRoleStatus,
    existing: Option<(&str, &str)>,
    now: DateTime<Utc>,
) -> Result<ManagedPlan> {
    let intended_username = format!("{role_prefix}{LOGIN_0_SUFFIX}");

    let Some((current_username, current_password)) = existing else {
        // The secret vanished. Outside the very first pass that means
        // something external interfered and the password must be
        // reconverged; unless the intended name also moved, in which case
        // this is a username change instead.
        let mut password_changed = false;
        let mut old_username = String::new();

        if status.phase != crate::crd::UserRolePhase::None {
            password_changed = true;

            if !status.postgres_role.is_empty() && status.postgres_role != intended_username {
                old_username = status.postgres_role.clone();
                password_changed = false;
            }
        }

        return Ok(ManagedPlan::Create {
            username: intended_username,
            old_username,
            password_changed,
        });
    };

    let prefix_changed = !status.role_prefix.is_empty() && role_prefix != status.role_prefix;
    if prefix_changed || current_username.is_empty() || current_password.is_empty() {
        // The secret may have been edited so that only one key was
        // cleared; in that case the username did not actually move.
        let old_username = if current_username == intended_username {
            String::new()
        } else {
            current_username.to_string()
        };

        return Ok(ManagedPlan::Replace {
            username: intended_username,
            old_username,
        });
    }

    if let Some(duration) = rotation_duration.filter(|d| !d.is_empty()) {
        if !status.last_password_changed_time.is_empty() {
            let duration = humantime::parse_duration(duration).map_err(|e| {
                Error::ValidationError(format!("invalid rotation duration {duration:?}: {e}"))
            })?;
            let last_change = DateTime::parse_from_rfc3339(&status.last_password_changed_time)
                .map_err(|e| {
                    Error::ValidationError(format!(
                        "invalid lastPasswordChangedTime {:?}: {e}",
                        status.last_password_changed_time
                    ))
                })?
                .with_timezone(&Utc);

            if now.signed_duration_since(last_change).to_std().unwrap_or_default() >= duration {
                let flipped_username = opposite_login(role_prefix, current_username);

                // The flipped name still being queued means the previous
                // rotation never finished reaping; creating the role again
                // would resurrect it right before deletion.
                if status
                    .old_postgres_roles
                    .iter()
                    .any(|r| r == &flipped_username)
                {
                    return Ok(ManagedPlan::RotationHalted);
                }

                return Ok(ManagedPlan::Rotate {
                    username: flipped_username,
                    old_username: current_username.to_string(),
                });
            }
        }
    }

    Ok(ManagedPlan::Keep)
}

/// Decision of the Provided identity planner
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProvidedPlan {
    /// Work secret is missing; recreate it from the import secret
    Create {
        old_username: String,
        password_changed: bool,
    },
    /// Import secret diverged from the work secret
    Update {
        old_username: String,
        password_changed: bool,
    },
    /// Nothing to do
    Keep,
}

/// Decide what to do with the Provided work secret given the imported
/// credentials and the current work secret contents.
pub fn plan_provided_identity(
    import_username: &str,
    import_password: &str,
    status: &PostgresUserRoleStatus,
    existing: Option<(&str, &str)>,
) -> ProvidedPlan {
    let Some((current_username, current_password)) = existing else {
        let mut password_changed = false;
        let mut old_username = String::new();

        if status.phase != crate::crd::UserRolePhase::None {
            password_changed = true;

            if !status.postgres_role.is_empty() && status.postgres_role != import_username {
                old_username = status.postgres_role.clone();
                password_changed = false;
            }
        }

        return ProvidedPlan::Create {
            old_username,
            password_changed,
        };
    };

    if current_username != import_username || current_password != import_password {
        return ProvidedPlan::Update {
            old_username: current_username.to_string(),
            password_changed: current_password != import_password,
        };
    }

    ProvidedPlan::Keep
}

/// Build the work secret object for the given identity
pub fn new_work_secret(
    user_role: &PostgresUserRole,
    name: &str,
    namespace: &str,
    username: &str,
    password: &str,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(owned_secret_labels(user_role)),
            owner_references: Some(vec![owner_reference(user_role)]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([
            (
                USERNAME_SECRET_KEY.to_string(),
                ByteString(username.as_bytes().to_vec()),
            ),
            (
                PASSWORD_SECRET_KEY.to_string(),
                ByteString(password.as_bytes().to_vec()),
            ),
        ])),
        ..Default::default()
    }
}

fn work_secret_name(user_role: &PostgresUserRole) -> Result<&str> {
    user_role
        .spec
        .work_generated_secret_name
        .as_deref()
        .filter(|name| !name.is_empty())
        .ok_or(Error::MissingObjectKey("spec.workGeneratedSecretName"))
}

async fn get_optional_secret(api: &Api<Secret>, name: &str) -> Result<Option<Secret>> {
    match api.get(name).await {
        Ok(secret) => Ok(Some(secret)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Create or update the work secret in Managed mode
pub async fn create_or_update_work_secret_managed(
    ctx: &Context,
    user_role: &PostgresUserRole,
    namespace: &str,
) -> Result<WorkSecretResult> {
    let role_prefix = user_role
        .spec
        .role_prefix
        .as_deref()
        .ok_or(Error::MissingObjectKey("spec.rolePrefix"))?;
    let name = work_secret_name(user_role)?;
    let status = user_role.status.clone().unwrap_or_default();

    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    let found = get_optional_secret(&api, name).await?;
    let existing = found.as_ref().map(|secret| {
        (
            secret_key(secret, USERNAME_SECRET_KEY),
            secret_key(secret, PASSWORD_SECRET_KEY),
        )
    });

    let plan = plan_managed_identity(
        role_prefix,
        user_role.spec.user_password_rotation_duration.as_deref(),
        &status,
        existing.as_ref().map(|(u, p)| (u.as_str(), p.as_str())),
        Utc::now(),
    )?;

    match plan {
        ManagedPlan::Create {
            username,
            old_username,
            password_changed,
        } => {
            let password = generate_password(MANAGED_PASSWORD_SIZE);
            let secret = new_work_secret(user_role, name, namespace, &username, &password);
            let secret = api.create(&PostParams::default(), &secret).await?;

            info!("Successfully created work secret");
            ctx.publish_normal_event(
                user_role,
                "Updated",
                "Reconciling",
                Some("Work secret created".to_string()),
            )
            .await;

            Ok(WorkSecretResult {
                secret,
                old_username,
                password_changed,
                rotation_halted: false,
            })
        }
        ManagedPlan::Replace {
            username,
            old_username,
        } => {
            let password = generate_password(MANAGED_PASSWORD_SIZE);
            let secret = new_work_secret(user_role, name, namespace, &username, &password);
            let secret = api
                .patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&secret))
                .await?;

            info!(
                "Successfully updated work secret with new user/password tuple because role name \
                 have changed or work secret have been edited"
            );
            ctx.publish_normal_event(
                user_role,
                "Updated",
                "Reconciling",
                Some(
                    "Work secret updated with new user/password tuple because role name have \
                     changed or work secret have been edited"
                        .to_string(),
                ),
            )
            .await;
            ctx.publish_secret_event(
                &secret,
                "Updated",
                Some("Secret updated by PostgresUserRole controller".to_string()),
            )
            .await;

            Ok(WorkSecretResult {
                secret,
                old_username,
                password_changed: true,
                rotation_halted: false,
            })
        }
        ManagedPlan::Rotate {
            username,
            old_username,
        } => {
            let password = generate_password(MANAGED_PASSWORD_SIZE);
            let secret = new_work_secret(user_role, name, namespace, &username, &password);
            let secret = api
                .patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&secret))
                .await?;

            info!(
                "Successfully updated work secret with new user/password tuple because user \
                 password rotation have been triggered"
            );
            ctx.publish_normal_event(
                user_role,
                "Updated",
                "Reconciling",
                Some(
                    "Work secret updated with new user/password tuple because user password \
                     rotation have been triggered"
                        .to_string(),
                ),
            )
            .await;
            ctx.publish_secret_event(
                &secret,
                "Updated",
                Some("Secret updated by PostgresUserRole controller".to_string()),
            )
            .await;

            Ok(WorkSecretResult {
                secret,
                old_username,
                password_changed: true,
                rotation_halted: false,
            })
        }
        ManagedPlan::RotationHalted => {
            let secret = found.ok_or(Error::MissingObjectKey("work secret"))?;

            Ok(WorkSecretResult {
                secret,
                old_username: String::new(),
                password_changed: false,
                rotation_halted: true,
            })
        }
        ManagedPlan::Keep => {
            let secret = found.ok_or(Error::MissingObjectKey("work secret"))?;

            Ok(WorkSecretResult {
                secret,
                old_username: String::new(),
                password_changed: false,
                rotation_halted: false,
            })
        }
    }
}

/// Create or update the work secret in Provided mode, mirroring the
/// user-supplied import secret
pub async fn create_or_update_work_secret_provided(
    ctx: &Context,
    user_role: &PostgresUserRole,
    namespace: &str,
) -> Result<WorkSecretResult> {
    let import_secret_name = user_role
        .spec
        .import_secret_name
        .as_deref()
        .ok_or(Error::MissingObjectKey("spec.importSecretName"))?;
    let name = work_secret_name(user_role)?;
    let status = user_role.status.clone().unwrap_or_default();

    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);

    let import_secret = api.get(import_secret_name).await.map_err(|e| match e {
        kube::Error::Api(ref ae) if ae.code == 404 => {
            Error::NotFound(format!("import secret {namespace}/{import_secret_name}"))
        }
        e => e.into(),
    })?;
    let import_username = secret_key(&import_secret, USERNAME_SECRET_KEY);
    let import_password = secret_key(&import_secret, PASSWORD_SECRET_KEY);

    let found = get_optional_secret(&api, name).await?;
    let existing = found.as_ref().map(|secret| {
        (
            secret_key(secret, USERNAME_SECRET_KEY),
            secret_key(secret, PASSWORD_SECRET_KEY),
        )
    });

    let plan = plan_provided_identity(
        &import_username,
        &import_password,
        &status,
        existing.as_ref().map(|(u, p)| (u.as_str(), p.as_str())),
    );

    match plan {
        ProvidedPlan::Create {
            old_username,
            password_changed,
        } => {
            let secret =
                new_work_secret(user_role, name, namespace, &import_username, &import_password);
            let secret = api.create(&PostParams::default(), &secret).await?;

            info!("Successfully created work secret");
            ctx.publish_normal_event(
                user_role,
                "Updated",
                "Reconciling",
                Some("Work secret created".to_string()),
            )
            .await;

            Ok(WorkSecretResult {
                secret,
                old_username,
                password_changed,
                rotation_halted: false,
            })
        }
        ProvidedPlan::Update {
            old_username,
            password_changed,
        } => {
            let secret =
                new_work_secret(user_role, name, namespace, &import_username, &import_password);
            let secret = api
                .patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&secret))
                .await?;

            info!("Successfully updated work secret");
            ctx.publish_secret_event(&secret, "Updated", Some("Secret updated".to_string()))
                .await;
            ctx.publish_normal_event(
                user_role,
                "Updated",
                "Reconciling",
                Some("Work secret updated".to_string()),
            )
            .await;

            Ok(WorkSecretResult {
                secret,
                old_username,
                password_changed,
                rotation_halted: false,
            })
        }
        ProvidedPlan::Keep => {
            let secret = found.ok_or(Error::MissingObjectKey("work secret"))?;

            Ok(WorkSecretResult {
                secret,
                old_username: String::new(),
                password_changed: false,
                rotation_halted: false,
            })
        }
    }
}
