use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use mcp_orchestrator::Orchestrator;
use mcp_orchestrator::agents::{AgentRegistry, BuiltinAgent, register_builtin_agents};
use mcp_orchestrator::api::api_routes;
use mcp_orchestrator::config::{AgentSettings, OrchestratorConfig};
use mcp_orchestrator::dispatch::{Dispatcher, DurableQueue, ResultStore};
use mcp_orchestrator::store::{Database, LibSqlBackend};

/// Console logging plus an optional daily-rolling file log. The returned guard
/// must live until exit so buffered file output is flushed.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_target(false);

    match log_dir {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "orchestrator.log"));
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(console).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OrchestratorConfig::from_env().context("Invalid configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("MCP Orchestrator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   API: http://0.0.0.0:{}/api", config.port);
    eprintln!("   Events: ws://0.0.0.0:{}/ws", config.port);
    eprintln!(
        "   Workers: {} (max {} attempts, backoff base {:?})",
        config.dispatcher.workers,
        config.dispatcher.retry.max_attempts,
        config.dispatcher.retry.base_delay
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Agents ───────────────────────────────────────────────────────────
    let mut settings = HashMap::new();
    for agent in BuiltinAgent::ALL {
        settings.insert(agent, AgentSettings::from_env(agent)?);
    }
    let registry = Arc::new(AgentRegistry::new());
    register_builtin_agents(&registry, |agent| {
        settings.get(&agent).cloned().unwrap_or_default()
    })
    .await?;

    let enabled: Vec<String> = registry
        .list()
        .await
        .into_iter()
        .filter(|a| a.enabled)
        .map(|a| a.name)
        .collect();
    if enabled.is_empty() {
        eprintln!("   Agents: none enabled (set <AGENT>_ENABLED=true)");
    } else {
        eprintln!("   Agents: {}", enabled.join(", "));
    }

    // ── Dispatch ─────────────────────────────────────────────────────────
    let queue = DurableQueue::new(Arc::clone(&db));
    let results = ResultStore::new(Arc::clone(&db), config.result_ttl);
    let dispatcher = Dispatcher::new(
        Arc::clone(&queue),
        Arc::clone(&registry),
        Arc::clone(&results),
        config.dispatcher.clone(),
    );

    // Startup recovery: tasks left active by a previous process
    let report = dispatcher
        .sweep(&config.maintenance())
        .await
        .context("Startup recovery failed")?;
    if report.requeued + report.interrupted > 0 {
        eprintln!(
            "   Recovered {} interrupted tasks ({} failed)",
            report.requeued + report.interrupted,
            report.interrupted
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance = dispatcher.spawn_maintenance(config.maintenance(), shutdown_rx.clone());
    let mut pool = tokio::spawn(Arc::clone(&dispatcher).run(shutdown_rx.clone()));

    // ── HTTP API ─────────────────────────────────────────────────────────
    let app = api_routes(Orchestrator::new(queue, registry, results));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });
    tracing::info!(port = config.port, "API server started");

    // ── Run until Ctrl-C or a fatal store error ──────────────────────────
    let stopped_early = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            }
            eprintln!("Ctrl+C received, shutting down...");
            None
        }
        joined = &mut pool => Some(joined),
    };

    let _ = shutdown_tx.send(true);
    let pool_result = match stopped_early {
        Some(joined) => joined,
        None => pool.await,
    };
    if let Ok(Err(e)) = server.await {
        tracing::warn!(error = %e, "API server stopped with error");
    }
    let maintenance_result = maintenance.await;

    pool_result
        .context("Dispatcher panicked")?
        .context("Dispatcher stopped on store error")?;
    maintenance_result
        .context("Maintenance task panicked")?
        .context("Maintenance sweep failed")?;

    eprintln!("MCP Orchestrator stopped");
    Ok(())
}
