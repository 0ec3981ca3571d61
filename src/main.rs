use anyhow::Context;
use binmatch::ledger::{Ledger, SqliteLedger};
use binmatch::orchestration::{CycleScheduler, MemberLocks, SettlementOrchestrator};
use binmatch::{api, config::Config, db::init_db, Repository};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    let config = Config::from_env().context("configuration error")?;
    tracing::info!(
        policy = ?config.placement.policy,
        max_tree_depth = ?config.placement.max_depth,
        max_propagation_depth = ?config.max_propagation_depth,
        rate = %config.settlement.pv_to_currency_rate,
        "engine configured"
    );

    let pool = init_db(&config.database_path)
        .await
        .with_context(|| format!("failed to initialize database at {}", config.database_path))?;
    let repo = Arc::new(Repository::new(pool));

    let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::new(repo.clone()));
    let orchestrator = Arc::new(
        SettlementOrchestrator::new(
            repo.clone(),
            ledger,
            MemberLocks::new(),
            config.settlement.clone(),
        )
        .with_concurrency(config.settlement_concurrency)
        .with_ledger_timeout(Duration::from_millis(config.ledger_timeout_ms)),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = if config.scheduler_enabled {
        Some(CycleScheduler::new(orchestrator.clone(), config.cycle_boundary).spawn(shutdown_rx))
    } else {
        tracing::info!("cycle scheduler disabled");
        None
    };

    let app = api::create_router(api::AppState::new(repo, orchestrator));

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("server error")?;

    shutdown_tx.send_replace(true);
    if let Some(handle) = scheduler {
        let _ = handle.await;
    }
    Ok(())
}
