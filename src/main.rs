use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use elasticsearch_operator::health::{HealthState, run_health_server};
use elasticsearch_operator::resources::KubeClientImpl;
use elasticsearch_operator::webhooks::run_webhook_server;
use elasticsearch_operator::{OperatorConfig, build_context, run_controllers, run_metrics_refresh};

const LEASE_NAME: &str = "elasticsearch-operator-leader";
const LEASE_TTL: Duration = Duration::from_secs(15);
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Time given to in-flight reconciliations after the cancel token fires
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Must precede the first TLS connection
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err("no rustls crypto provider could be installed".into());
    }

    init_tracing()?;

    let config = OperatorConfig::from_env()?;
    info!(?config, "starting elasticsearch-operator");

    let client = Client::try_default().await?;
    let health_state = Arc::new(HealthState::new());

    // Probes must answer even while waiting for leadership
    let health_handle = tokio::spawn({
        let state = health_state.clone();
        let port = config.health_port;
        async move {
            if let Err(e) = run_health_server(state, port).await {
                error!(error = %e, "health server stopped");
            }
        }
    });

    // Admission requests may reach any replica, leader or not
    let webhook_handle = if config.webhook_cert_path.exists() && config.webhook_key_path.exists() {
        info!("webhook certificates found, starting admission webhook");
        let webhook_client = Arc::new(KubeClientImpl::new(client.clone()));
        let port = config.webhook_port;
        let cert = config.webhook_cert_path.clone();
        let key = config.webhook_key_path.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = run_webhook_server(webhook_client, port, &cert, &key).await {
                error!(error = %e, "webhook server stopped");
            }
        }))
    } else {
        info!(
            cert = %config.webhook_cert_path.display(),
            key = %config.webhook_key_path.display(),
            "webhook certificates not found, admission webhook disabled"
        );
        None
    };

    let lease_lock = || {
        let params = LeaseLockParams {
            holder_id: config.pod_name.clone(),
            lease_name: LEASE_NAME.to_string(),
            lease_ttl: LEASE_TTL,
        };
        LeaseLock::new(client.clone(), &config.pod_namespace, params)
    };
    acquire_leadership(&lease_lock()).await;
    let renewal_handle = spawn_lease_renewal(lease_lock());

    let cancel = CancellationToken::new();
    let watch_namespace = config.watch_namespace.clone();
    let ctx = build_context(client.clone(), config, Some(health_state.clone()), cancel.clone());

    let controller_handle = tokio::spawn({
        let client = client.clone();
        let ctx = ctx.clone();
        let ns = watch_namespace.clone();
        async move { run_controllers(client, ctx, ns.as_deref()).await }
    });
    let metrics_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { run_metrics_refresh(client, ctx, watch_namespace.as_deref(), cancel).await }
    });

    tokio::select! {
        result = controller_handle => {
            if let Err(e) = result {
                error!(error = %e, "controller task panicked");
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!(error = %e, "health server task panicked");
            }
        }
        Err(e) = metrics_handle => error!(error = %e, "metrics refresh task panicked"),
        result = async {
            match webhook_handle {
                Some(handle) => handle.await,
                None => std::future::pending().await,
            }
        } => {
            if let Err(e) = result {
                error!(error = %e, "webhook server task panicked");
            }
        }
        // Renewal only returns by panicking; a lost lease exits the process
        Err(e) = renewal_handle => error!(error = %e, "lease renewal task panicked"),
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            health_state.set_ready(false);
            // Stops backup schedules and interrupts readiness and restore waits
            cancel.cancel();
            info!(grace_secs = SHUTDOWN_GRACE_PERIOD.as_secs(), "draining in-flight reconciliations");
            tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;
        }
    }

    info!("operator stopped");
    Ok(())
}

/// Block until this replica holds the lease
async fn acquire_leadership(lock: &LeaseLock) {
    info!(lease = LEASE_NAME, "waiting for leadership");
    loop {
        match lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("acquired leadership");
                return;
            }
            Ok(_) => info!("another replica is leader"),
            Err(e) => warn!(error = %e, "lease acquisition failed, retrying"),
        }
        tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
    }
}

/// Renew the lease forever; exits the process once it is lost so the pod
/// restarts and re-enters the election
fn spawn_lease_renewal(lock: LeaseLock) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
            match lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {}
                Ok(_) => {
                    error!("leadership lost, exiting");
                    std::process::exit(1);
                }
                Err(e) => {
                    error!(error = %e, "lease renewal failed, exiting");
                    std::process::exit(1);
                }
            }
        }
    })
}

/// `LOG_FORMAT=json` switches to JSON lines
fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("elasticsearch_operator=info".parse()?)
        .add_directive("kube=info".parse()?)
        .add_directive("kube_leader_election=info".parse()?);

    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

/// Resolves on SIGTERM or ctrl-c
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
