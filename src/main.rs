use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use form_dispatch::clock::SystemClock;
use form_dispatch::config::DispatchConfig;
use form_dispatch::forms::FormStore;
use form_dispatch::jobs::JobAggregator;
use form_dispatch::reclaim::spawn_sweep_loop;
use form_dispatch::rewards::RewardRecorder;
use form_dispatch::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = DispatchConfig::from_env();
    config.validate().context("invalid dispatch configuration")?;

    eprintln!("Form Dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Claim TTL: {}s", config.claim_ttl.as_secs());
    eprintln!("   Job TTL: {}s", config.job_ttl.as_secs());
    eprintln!("   Sweep every: {}s\n", config.sweep_interval.as_secs());

    // ── Database ─────────────────────────────────────────────────────────
    let db_path = std::env::var("FORM_DISPATCH_DB_PATH")
        .unwrap_or_else(|_| "./data/form-dispatch.db".to_string());

    let backend = Arc::new(
        LibSqlBackend::new_local(Path::new(&db_path))
            .await
            .with_context(|| format!("failed to open database at {db_path}"))?,
    );
    let db: Arc<dyn Database> = backend.clone();

    // ── Engine ───────────────────────────────────────────────────────────
    let clock = Arc::new(SystemClock);
    let jobs = Arc::new(JobAggregator::new(
        db.clone(),
        clock.clone(),
        config.clone(),
        backend.clone(),
    ));
    let forms = Arc::new(FormStore::new(
        db,
        clock,
        config.clone(),
        RewardRecorder::new(backend),
        jobs.clone(),
    ));

    let sweep = spawn_sweep_loop(forms, jobs, config.sweep_interval);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    tracing::info!("Shutting down");
    sweep.abort();
    Ok(())
}
