//! Operator entrypoint.
//!
//! Wires together structured logging, the Kubernetes client, leader
//! election (the controller assumes a single active reconciler per
//! object), the probe/metrics server, and the PostgresUserRole
//! controller, then waits for a termination signal.

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tracing::{error, info, warn};

use postgres_role_operator::health::{HealthState, run_health_server};
use postgres_role_operator::run_user_role_controller;

const LEADER_LEASE_NAME: &str = "postgres-role-operator-leader";
const LEASE_TTL: Duration = Duration::from_secs(15);
const LEASE_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// How long in-flight passes get to finish once termination is requested
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("postgres_role_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .init();

    let client = Client::try_default().await?;
    let (holder_id, lease_namespace) = pod_identity();

    info!(
        holder_id = %holder_id,
        namespace = %lease_namespace,
        lease = LEADER_LEASE_NAME,
        "postgres-role-operator starting"
    );

    let health_state = Arc::new(HealthState::new());

    // Probes answer before leadership is settled so rollouts don't flap
    let probes = {
        let state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(state).await {
                error!(error = %e, "Probe server stopped");
            }
        })
    };

    wait_for_leadership(new_lease(&client, &lease_namespace, &holder_id)).await;
    let lease_watchdog = tokio::spawn(hold_leadership(new_lease(
        &client,
        &lease_namespace,
        &holder_id,
    )));

    health_state.set_ready(true).await;
    info!("Leader lease held, starting PostgresUserRole controller");

    let controller = run_user_role_controller(client, Some(health_state.clone()));

    tokio::select! {
        () = controller => {
            error!("Controller loop returned, shutting down");
        }
        result = probes => {
            if let Err(e) = result {
                error!(error = %e, "Probe server task panicked");
            }
        }
        result = lease_watchdog => {
            if let Err(e) = result {
                error!(error = %e, "Lease watchdog task panicked");
            }
        }
        () = termination() => {
            info!(drain = ?SHUTDOWN_DRAIN, "Termination requested, draining in-flight passes");
            health_state.set_ready(false).await;
            tokio::time::sleep(SHUTDOWN_DRAIN).await;
        }
    }

    info!("postgres-role-operator stopped");
    Ok(())
}

/// Identity of this replica for the leader lease, from the downward API
/// with hostname and namespace fallbacks
fn pod_identity() -> (String, String) {
    let holder = std::env::var("POD_NAME").unwrap_or_else(|_| {
        hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "postgres-role-operator".to_string())
    });
    let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| "default".to_string());

    (holder, namespace)
}

fn new_lease(client: &Client, namespace: &str, holder_id: &str) -> LeaseLock {
    LeaseLock::new(
        client.clone(),
        namespace,
        LeaseLockParams {
            holder_id: holder_id.to_string(),
            lease_name: LEADER_LEASE_NAME.to_string(),
            lease_ttl: LEASE_TTL,
        },
    )
}

/// Block until this replica owns the leader lease
async fn wait_for_leadership(lease: LeaseLock) {
    loop {
        match lease.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("Acquired leader lease");
                return;
            }
            Ok(_) => info!("Leader lease held elsewhere, standing by"),
            Err(e) => warn!(error = %e, "Leader lease request failed, retrying"),
        }

        tokio::time::sleep(LEASE_RETRY_INTERVAL).await;
    }
}

/// Keep renewing the lease. Losing it exits the process so the
/// replacement replica goes through a clean election instead of two
/// reconcilers racing on the same objects.
async fn hold_leadership(lease: LeaseLock) {
    loop {
        tokio::time::sleep(LEASE_RETRY_INTERVAL).await;

        let lost = match lease.try_acquire_or_renew().await {
            Ok(result) => !result.acquired_lease,
            Err(e) => {
                error!(error = %e, "Leader lease renewal failed");
                true
            }
        };

        if lost {
            error!("Leader lease lost, exiting for a clean re-election");
            std::process::exit(1);
        }
    }
}

/// Resolves when SIGTERM or ctrl-c arrives
async fn termination() {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler");

        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}
