mod observability;
mod pipeline;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use conveyor_core::{ConveyorConfig, ConveyorError};
use conveyor_core::app::{App, AppBuilder, Chainer, PublisherLoop, ScheduleOptions, WorkerGroup};
use conveyor_core::config::DatabaseConfig;
use conveyor_core::domain::{JobType, OutboxEvent, RunContext};
use conveyor_core::impls::{InMemoryEventStore, InMemoryJobQueue};
use conveyor_core::ports::{Clock, EventStore, IdGenerator, NoTargetProbe, SystemClock, UlidGenerator};
use conveyor_core::typed::Job;

use crate::pipeline::{DiscoverLeads, EnrichLead, PipelineRecords, Stages};

const SCHEDULER_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(name = "conveyor", version, about = "Run the lead pipeline on the in-process queue")]
struct Args {
    /// Config file, without extension. Defaults to `config/conveyor` when present.
    #[arg(long, env = "CONVEYOR_CONFIG")]
    config: Option<String>,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long, value_name = "SECS")]
    run_for: Option<u64>,

    /// Region for the discovery run started at boot.
    #[arg(long, default_value = "emea")]
    region: String,

    /// Leads discovered by the boot run.
    #[arg(long, default_value_t = 3)]
    leads: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = ConveyorConfig::load(args.config.as_deref()).context("Failed to load config")?;
    observability::init(&config.logging);

    let records = PipelineRecords::new();
    let app = build_app(&config, &records)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(SystemClock));
    let store = event_store(&config.database).await?;
    let queue = InMemoryJobQueue::new(Arc::clone(&clock)).with_lease_timeout(config.worker.lease_timeout());

    let dispatcher = app.dispatcher(
        Arc::clone(&store),
        Arc::new(queue.clone()),
        Arc::new(NoTargetProbe),
        Arc::clone(&clock),
        config.dispatcher_settings(),
    );
    let chainer = Arc::new(app.chainer(
        Arc::new(queue.clone()),
        Arc::clone(&ids),
        Duration::from_millis(config.worker.queue_timeout_ms),
    ));
    let worker = Arc::new(app.worker(
        Arc::new(queue.clone()),
        Arc::clone(&chainer),
        config.worker.settings(),
    ));

    let mut scheduler = app.scheduler(Arc::clone(&chainer), Arc::clone(&clock), SCHEDULER_POLL);
    for entry in &config.schedules {
        let queue_name = JobType::parse(entry.queue.as_str())
            .with_context(|| format!("schedule '{}'", entry.name))?;
        scheduler
            .schedule(
                &queue_name,
                &entry.cron,
                entry.payload.clone(),
                ScheduleOptions::named(&entry.name),
            )
            .with_context(|| format!("schedule '{}'", entry.name))?;
    }

    seed_runs(&args, &chainer, store.as_ref(), ids.as_ref(), clock.as_ref())
        .await
        .context("Failed to seed boot runs")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let publisher = Arc::new(PublisherLoop::new(
        Arc::new(dispatcher),
        config.dispatcher.poll_interval(),
    ))
    .spawn(shutdown_rx.clone());
    let scheduled = tokio::spawn(scheduler.run(shutdown_rx));
    let workers = WorkerGroup::spawn(worker, &app.worker_queues());
    info!(workers = workers.len(), schedules = config.schedules.len(), "conveyor running");

    wait_for_stop(args.run_for).await;

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    if let Err(e) = publisher.await {
        warn!(error = %e, "publisher task ended abnormally");
    }
    if let Err(e) = scheduled.await {
        warn!(error = %e, "scheduler task ended abnormally");
    }
    workers.shutdown_and_join().await;

    report(store.as_ref(), &queue, &records).await?;
    Ok(())
}

fn build_app(config: &ConveyorConfig, records: &PipelineRecords) -> Result<App, ConveyorError> {
    let policies = if config.policies.is_empty() {
        warn!("no [policies] configured; using pipeline defaults");
        pipeline::default_policies()?
    } else {
        config.policy_table()?
    };
    let app = pipeline::register(AppBuilder::new(), &Stages::new(records.clone()))?
        .policies(policies)
        .expect_jobs(&pipeline::JOB_TYPES)
        .build()?;
    Ok(app)
}

/// Boot runs: one discovery through the queue, one enrichment through the outbox.
async fn seed_runs(
    args: &Args,
    chainer: &Chainer,
    store: &dyn EventStore,
    ids: &dyn IdGenerator,
    clock: &dyn Clock,
) -> Result<(), ConveyorError> {
    let discovery = DiscoverLeads {
        region: args.region.clone(),
        limit: args.leads,
    };
    let started = chainer.start_run(&discovery).await?;
    info!(run_id = %started.run.run_id, "discovery run started");

    let seed = EnrichLead {
        lead_id: format!("{}-inbound-1", args.region),
        provider: "apollo".to_string(),
    };
    let run = RunContext::start(ids.run_id(), &EnrichLead::job_type());
    let event = OutboxEvent::for_job(ids.event_id(), &seed, &run, clock.now())?;
    info!(event_id = %event.id, run_id = %run.run_id, "outbox event written");
    store.append(event).await?;
    Ok(())
}

async fn event_store(database: &DatabaseConfig) -> anyhow::Result<Arc<dyn EventStore>> {
    match &database.url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            let store = conveyor_core::impls::PgEventStore::connect(url, database.max_connections)
                .await
                .context("Failed to connect to Postgres")?;
            store.migrate().await.context("Failed to run migrations")?;
            info!("using Postgres outbox store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => anyhow::bail!("database.url is set but conveyor was built without the `postgres` feature"),
        None => Ok(Arc::new(InMemoryEventStore::new())),
    }
}

async fn wait_for_stop(run_for: Option<u64>) {
    match run_for {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for Ctrl-C; stopping");
            }
        }
    }
}

async fn report(
    store: &dyn EventStore,
    queue: &InMemoryJobQueue,
    records: &PipelineRecords,
) -> anyhow::Result<()> {
    println!("outbox: {}", store.counts().await?);
    for name in queue.queues().await {
        println!("{name}: {}", queue.counts(&name).await);
    }
    println!("stage records: {}", records.len().await);
    Ok(())
}
