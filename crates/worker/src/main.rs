//! Scheduling worker process.
//!
//! Loads configuration from the environment (and `.env`), reconciles the
//! delayed transition jobs against the database, then runs every lane
//! consumer until SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::Context;
use classrep_events::{BusRealtimeChannel, InMemoryEventBus, RealtimeChannel, RealtimeEvent};
use classrep_infra::db::{self, PgAdapters};
use classrep_infra::jobs::{InMemoryJobStore, JobQueue, JobStore};
use classrep_infra::{HttpMailer, Mailer, QueueBackend, Settings, TracingMailer};
use classrep_scheduler::{EngineConfig, EnginePorts, SchedulingEngine};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            return Err(e).context("failed to read .env");
        }
    }
    classrep_observability::init();

    let settings = Settings::from_env().context("invalid configuration")?;
    info!(
        queue_backend = ?settings.queue_backend,
        reconcile_on_start = settings.reconcile_on_start,
        "starting scheduling worker"
    );

    let pool = db::connect(&settings.database_url, settings.database_max_connections)
        .await
        .context("failed to connect to Postgres")?;
    let pg = PgAdapters::new(pool);

    let (store, realtime) = transports(&settings).await?;
    let queue = JobQueue::new(store).with_default_retry(settings.retry_policy());

    let ports = EnginePorts {
        classes: Arc::new(pg.classes),
        assessments: Arc::new(pg.assessments),
        submissions: Arc::new(pg.submissions),
        audience: Arc::new(pg.audience),
        notifications: Arc::new(pg.notifications),
        realtime,
        mailer: mailer(&settings)?,
    };
    let engine = SchedulingEngine::new(queue, ports, EngineConfig::from_settings(&settings));

    if settings.reconcile_on_start {
        match engine.run_reconciliation().await {
            Ok(report) => info!(?report, "startup reconciliation complete"),
            // Jobs already in the queue keep running; the next restart retries.
            Err(e) => warn!(error = %e, "startup reconciliation failed"),
        }
    }

    engine.start().await;
    shutdown_signal().await;
    info!("shutdown signal received; draining lanes");
    engine.stop().await?;
    Ok(())
}

type Transports = (Arc<dyn JobStore>, Arc<dyn RealtimeChannel>);

async fn transports(settings: &Settings) -> anyhow::Result<Transports> {
    match settings.queue_backend {
        QueueBackend::Memory => {
            warn!("in-memory job queue: pending jobs are lost on restart until reconciliation");
            Ok(in_process())
        }
        QueueBackend::Redis => redis_transports(settings).await,
    }
}

fn in_process() -> Transports {
    let bus = Arc::new(InMemoryEventBus::<RealtimeEvent>::new());
    let store: Arc<dyn JobStore> = InMemoryJobStore::arc();
    let realtime: Arc<dyn RealtimeChannel> = Arc::new(BusRealtimeChannel::new(bus));
    (store, realtime)
}

#[cfg(feature = "redis")]
async fn redis_transports(settings: &Settings) -> anyhow::Result<Transports> {
    use classrep_infra::jobs::RedisJobStore;
    use classrep_infra::realtime::{DEFAULT_CHANNEL, RedisRealtimeChannel};

    let url = settings
        .redis_url
        .as_deref()
        .context("REDIS_URL is required for the redis queue backend")?;
    let store: Arc<dyn JobStore> = Arc::new(
        RedisJobStore::connect(url, settings.queue_prefix.clone())
            .await
            .context("failed to connect the Redis job store")?,
    );
    let realtime: Arc<dyn RealtimeChannel> = Arc::new(
        RedisRealtimeChannel::connect(url, DEFAULT_CHANNEL)
            .await
            .context("failed to connect the Redis realtime channel")?,
    );
    Ok((store, realtime))
}

#[cfg(not(feature = "redis"))]
async fn redis_transports(_settings: &Settings) -> anyhow::Result<Transports> {
    anyhow::bail!("QUEUE_BACKEND=redis requires a build with the `redis` feature")
}

fn mailer(settings: &Settings) -> anyhow::Result<Arc<dyn Mailer>> {
    match &settings.mail {
        Some(mail) => {
            let http = HttpMailer::new(
                mail.api_url.clone(),
                mail.api_key.clone(),
                mail.from.clone(),
                settings.external_call_timeout,
            )
            .context("failed to build mail client")?;
            Ok(Arc::new(http))
        }
        None => {
            warn!("MAIL_API_URL not set; emails are logged instead of sent");
            Ok(Arc::new(TracingMailer))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
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
