use std::sync::Arc;
use std::time::Duration;

use driftfeed::config::Config;
use driftfeed::infrastructure::crawler::Crawler;
use driftfeed::infrastructure::database::setup_database;
use driftfeed::infrastructure::normaliser::Normaliser;
use driftfeed::infrastructure::orchestrator::Orchestrator;
use driftfeed::infrastructure::rate_limiter::RateLimiter;
use driftfeed::infrastructure::repository::SqliteRepository;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;

/// Wires config → database → the five core components → one refresh
/// cycle, optionally repeated on a cron cadence. The CLI flag surface,
/// OPML import, and the static-site template rendering this feeds into
/// are external collaborators this binary does not implement.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "driftfeed=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    tracing::info!(database_url = %config.database_url, "connecting to database");

    let db_pool = setup_database(&config.database_url).await?;
    tracing::info!("running database migrations");
    sqlx::migrate!("./migrations").run(&db_pool).await?;

    let orchestrator = build_orchestrator(&config, db_pool);

    if let Ok(cron) = std::env::var("DRIFTFEED_CRON_SCHEDULE") {
        run_on_schedule(orchestrator, cron).await?;
    } else {
        run_once(&orchestrator).await?;
    }

    Ok(())
}

fn build_orchestrator(config: &Config, db_pool: sqlx::SqlitePool) -> Orchestrator {
    let repository = Arc::new(SqliteRepository::new(db_pool));
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_rpm, config.rate_limit_burst));
    let crawler = Arc::new(Crawler::new(
        config.user_agent(),
        Duration::from_secs(config.request_timeout_secs),
    ));
    let normaliser = Arc::new(Normaliser::new());

    Orchestrator::new(repository, rate_limiter, crawler, normaliser, config.concurrency, config.max_retries)
}

async fn run_once(orchestrator: &Orchestrator) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received, cancelling in-flight refreshes");
            ctrl_c.cancel();
        }
    });

    let outcomes = orchestrator.refresh_all(cancel).await?;
    let failures = outcomes.iter().filter(|o| o.result.is_err()).count();
    tracing::info!(total = outcomes.len(), failures, "refresh cycle complete");
    Ok(())
}

async fn run_on_schedule(orchestrator: Orchestrator, cron: String) -> anyhow::Result<()> {
    let orchestrator = Arc::new(orchestrator);
    let scheduler = JobScheduler::new().await?;

    let job_orchestrator = Arc::clone(&orchestrator);
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let orchestrator = Arc::clone(&job_orchestrator);
        Box::pin(async move {
            let cancel = CancellationToken::new();
            match orchestrator.refresh_all(cancel).await {
                Ok(outcomes) => {
                    let failures = outcomes.iter().filter(|o| o.result.is_err()).count();
                    tracing::info!(total = outcomes.len(), failures, "scheduled refresh cycle complete");
                }
                Err(err) => tracing::error!(error = %err, "scheduled refresh cycle failed"),
            }
        })
    })?;

    scheduler.add(job).await?;
    scheduler.start().await?;
    tracing::info!(cron = %cron, "refresh scheduler started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    Ok(())
}
