// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

use anyhow::{Context as _, Result};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use clap::Parser;
use futures::StreamExt;
use handoff::{
    config::HandlerConfig,
    constants::{FAIL_RETRY_ENGINE_NAME, METRICS_SERVER_PATH, SHUTDOWN_POLL_INTERVAL_SECS},
    context::{Collaborators, Context},
    crd::VirtualMachineInstance,
    domain::SharedDomainCache,
    driver::DetachedLaunchers,
    fail_retry::FailRetryManager,
    metrics,
    node::{StaticMemoryOverhead, UnmanagedNode},
    reconcilers::{error_requeue_delay, held_back, sync_source, sync_target, SyncOutcome},
    store::{KubeEventRecorder, KubeVmiStore},
    tunnel::{TunnelConfig, TunnelManager},
};
use kube::{
    runtime::{controller::Action, watcher::Config, Controller},
    Api, Client,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};


const SOURCE_CONTROLLER: &str = "source";
const TARGET_CONTROLLER: &str = "target";

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
struct ReconcileError(#[from] anyhow::Error);

fn main() -> Result<()> {
    let config = HandlerConfig::parse();

    // Build Tokio runtime with custom thread names
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .thread_name("virt-handoff")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(config))
}

/// Initialize logging.
///
/// Respects `RUST_LOG` (defaults to `info`) and `RUST_LOG_FORMAT` (`json` or text).
fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let log_format = std::env::var("RUST_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    match log_format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(false)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(false)
                .with_ansi(true)
                .compact()
                .init();
        }
    }
}

async fn async_main(config: HandlerConfig) -> Result<()> {
    init_logging();

    info!(node = %config.node_name, "Starting live migration handler");
    debug!("Logging initialized with file and line number tracking");

    debug!("Initializing Kubernetes client");
    let client = Client::try_default().await?;
    debug!("Kubernetes client initialized successfully");

    let tunnel_config =
        TunnelConfig::from_handler_config(&config).context("invalid migration tunnel settings")?;
    let tunnels = Arc::new(TunnelManager::new(tunnel_config));

    let (initial_wait, max_wait, max_fail_response) = config.fail_retry_parameters();
    let fail_retry = Arc::new(FailRetryManager::new(
        FAIL_RETRY_ENGINE_NAME,
        initial_wait,
        max_wait,
        max_fail_response,
    ));
    let shutdown = CancellationToken::new();
    tokio::spawn(fail_retry.clone().run(shutdown.clone()));

    let domains = Arc::new(SharedDomainCache::new());
    let collaborators = Collaborators {
        store: Arc::new(KubeVmiStore::new(client.clone())),
        recorder: Arc::new(KubeEventRecorder::new(client.clone(), config.node_name.clone())),
        launchers: Arc::new(DetachedLaunchers),
        domains: domains.clone(),
        isolation: Arc::new(UnmanagedNode),
        volumes: Arc::new(UnmanagedNode),
        network: Arc::new(UnmanagedNode),
        devices: Arc::new(UnmanagedNode),
        memory_overhead: Arc::new(StaticMemoryOverhead::default()),
    };
    let ctx = Arc::new(Context::new(
        &config,
        tunnels.clone(),
        collaborators,
        fail_retry,
    ));
    let metrics_address = config.metrics_address()?;

    info!("Starting all controllers");

    let services = run_services(client, ctx, domains, metrics_address);
    tokio::pin!(services);

    tokio::select! {
        result = &mut services => return result,
        result = shutdown_signal() => result?,
    }

    // Controllers keep running so finished migrations still close their tunnels
    shutdown.cancel();
    tunnels.initiate_graceful_shutdown();
    tokio::select! {
        result = &mut services => result,
        drained = tunnels.drain(
            config.graceful_shutdown_timeout(),
            Duration::from_secs(SHUTDOWN_POLL_INTERVAL_SECS),
        ) => {
            if drained {
                info!("Graceful shutdown completed successfully");
            } else {
                warn!("Graceful shutdown timed out with migration tunnels still open");
            }
            Ok(())
        }
    }
}

/// Run both controllers and the metrics server.
///
/// Controllers should never exit - if one fails, we log it and exit the main process.
async fn run_services(
    client: Client,
    ctx: Arc<Context>,
    domains: Arc<SharedDomainCache>,
    metrics_address: SocketAddr,
) -> Result<()> {
    tokio::select! {
        result = run_source_controller(client.clone(), ctx.clone(), domains.clone()) => {
            error!("CRITICAL: migration source controller exited unexpectedly: {:?}", result);
            result?;
            anyhow::bail!("migration source controller exited unexpectedly without error")
        }
        result = run_target_controller(client, ctx, domains) => {
            error!("CRITICAL: migration target controller exited unexpectedly: {:?}", result);
            result?;
            anyhow::bail!("migration target controller exited unexpectedly without error")
        }
        result = run_metrics_server(metrics_address) => {
            error!("CRITICAL: metrics server exited unexpectedly: {:?}", result);
            result?;
            anyhow::bail!("metrics server exited unexpectedly without error")
        }
    }
}

/// Wait for SIGTERM (pod termination) or SIGINT.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT, initiating graceful shutdown...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM (pod termination), initiating graceful shutdown...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received SIGINT, initiating graceful shutdown...");
    }
    Ok(())
}

/// Run the migration source controller
async fn run_source_controller(
    client: Client,
    ctx: Arc<Context>,
    domains: Arc<SharedDomainCache>,
) -> Result<()> {
    info!("Starting migration source controller");

    // Every VMI is watched: the sync itself decides whether this node is involved
    let api = Api::<VirtualMachineInstance>::all(client);

    Controller::new(api, Config::default())
        .reconcile_all_on(domains.change_triggers())
        .run(
            reconcile_source_wrapper,
            |vmi, err, ctx| error_policy(SOURCE_CONTROLLER, vmi, err, ctx),
            ctx,
        )
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

/// Run the migration target controller
async fn run_target_controller(
    client: Client,
    ctx: Arc<Context>,
    domains: Arc<SharedDomainCache>,
) -> Result<()> {
    info!("Starting migration target controller");

    let api = Api::<VirtualMachineInstance>::all(client);

    Controller::new(api, Config::default())
        .reconcile_all_on(domains.change_triggers())
        .run(
            reconcile_target_wrapper,
            |vmi, err, ctx| error_policy(TARGET_CONTROLLER, vmi, err, ctx),
            ctx,
        )
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

/// Reconcile wrapper for the source side
async fn reconcile_source_wrapper(
    vmi: Arc<VirtualMachineInstance>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    if let Some(action) = hold_back(SOURCE_CONTROLLER, &ctx, &vmi) {
        return Ok(action);
    }
    let start = Instant::now();
    let result = sync_source(ctx.clone(), (*vmi).clone()).await;
    finish_reconcile(SOURCE_CONTROLLER, &vmi, start.elapsed(), result)
}

/// Reconcile wrapper for the target side
async fn reconcile_target_wrapper(
    vmi: Arc<VirtualMachineInstance>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    if let Some(action) = hold_back(TARGET_CONTROLLER, &ctx, &vmi) {
        return Ok(action);
    }
    let start = Instant::now();
    let result = sync_target(ctx.clone(), (*vmi).clone()).await;
    finish_reconcile(TARGET_CONTROLLER, &vmi, start.elapsed(), result)
}

/// Requeue a VMI whose syncs keep failing until its backoff has elapsed.
fn hold_back(
    controller: &'static str,
    ctx: &Context,
    vmi: &VirtualMachineInstance,
) -> Option<Action> {
    let wait = held_back(ctx, controller, vmi)?;
    debug!(controller, vmi = %vmi.key(), after = ?wait, "VMI held back after repeated failures");
    metrics::record_reconciliation_requeue(controller, "failure_backoff");
    Some(Action::requeue(wait))
}

/// Record metrics for one sync and turn it into an [`Action`].
fn finish_reconcile(
    controller: &'static str,
    vmi: &VirtualMachineInstance,
    duration: Duration,
    result: Result<SyncOutcome>,
) -> Result<Action, ReconcileError> {
    match result {
        Ok(outcome) => {
            metrics::record_reconciliation_success(controller, duration);
            if let Some(reason) = outcome.reason {
                debug!(controller, vmi = %vmi.key(), reason, after = ?outcome.requeue_after, "Requeueing VMI");
                metrics::record_reconciliation_requeue(controller, reason);
            }
            Ok(outcome.action())
        }
        Err(e) => {
            metrics::record_reconciliation_error(controller, duration);
            error!(controller, vmi = %vmi.key(), error = %format!("{e:#}"), "Failed to reconcile VMI");
            Err(e.into())
        }
    }
}

/// Error policy for both controllers
fn error_policy(
    controller: &'static str,
    vmi: Arc<VirtualMachineInstance>,
    _err: &ReconcileError,
    ctx: Arc<Context>,
) -> Action {
    Action::requeue(error_requeue_delay(&ctx, controller, &vmi))
}

/// Serve the Prometheus endpoint
async fn run_metrics_server(address: SocketAddr) -> Result<()> {
    let app = Router::new().route(METRICS_SERVER_PATH, get(metrics_handler));

    let listener = tokio::net::TcpListener::bind(address)
        .await
        .with_context(|| format!("failed to bind metrics server to {address}"))?;
    info!(%address, path = METRICS_SERVER_PATH, "Metrics server listening");
    axum::serve(listener, app).await?;

    Ok(())
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics::gather_metrics() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
