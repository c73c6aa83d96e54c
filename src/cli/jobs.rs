//! `jobherd work|scheduler|ping|submit` - Job processing and submission

use anyhow::{Context, Result, bail};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, info, warn};

use jobherd::infrastructure::{Config, process_span};
use jobherd_core::{Broker, SqliteBackend, SubmitOptions, Submission, Submitter};
use jobherd_worker::{
    DelayedScheduler, ProcessFlags, Role, Worker, abort_startup, signals,
};

use super::{PingArgs, SchedulerArgs, SubmitArgs, WorkArgs};

/// Opens the broker/store behind a configuration name
pub async fn open_backend(config: &Config, config_name: &str) -> Result<SqliteBackend> {
    let connection = config.connection(config_name)?;
    let backend = SqliteBackend::connect(&connection.database)
        .await
        .with_context(|| format!("Cannot open connection '{config_name}'"))?;
    Ok(backend
        .with_poll_interval(Duration::from_millis(config.poll_interval_ms))
        .with_result_ttl(config.result_timeout()))
}

/// Runs a single worker until it is stopped
pub async fn work(config: &Config, args: WorkArgs) -> Result<i32> {
    let config_name = config.config_name(args.config_name);
    let mut options = config.worker_options(&config_name);
    options.blocking |= args.blocking;
    options.atomic |= args.atomic;
    options.supervised = args.supervised;

    let span = process_span("worker");
    async move {
        let flags = ProcessFlags::new(Role::Worker);
        signals::install(&flags).context("Cannot install signal handlers")?;

        let resolver = match config.task_registry() {
            Ok(registry) => Arc::new(registry),
            Err(e) => return Ok(abort_startup(&e.to_string(), options.supervised)),
        };
        let backend = match open_backend(config, &config_name).await {
            Ok(backend) => Arc::new(backend),
            Err(e) => return Ok(abort_startup(&format!("{e:#}"), options.supervised)),
        };

        let worker = Worker::new(backend, resolver, flags, options);
        anyhow::Ok(worker.run().await)
    }
    .instrument(span)
    .await
}

/// Runs the delayed-job scheduler until it is stopped
pub async fn scheduler(config: &Config, args: SchedulerArgs) -> Result<i32> {
    let config_name = config.config_name(args.config_name);
    let span = process_span("scheduler");
    async move {
        let flags = ProcessFlags::new(Role::Scheduler);
        signals::install(&flags).context("Cannot install signal handlers")?;

        let backend = Arc::new(open_backend(config, &config_name).await?);
        let scheduler = DelayedScheduler::new(backend, args.interval)?;
        info!(config_name = %config_name, interval = ?scheduler.interval(), "Scheduler ready");
        scheduler.run(&flags).await;
        anyhow::Ok(0)
    }
    .instrument(span)
    .await
}

/// Submits a `ping` job and waits for the answer
pub async fn ping(config: &Config, args: PingArgs) -> Result<i32> {
    let config_name = config.config_name(args.config_name);
    let function = config.function(&config_name);
    let timeout = args
        .timeout
        .map_or_else(|| config.result_timeout(), Duration::from_secs);

    let span = process_span("cli");
    async move {
        let backend = Arc::new(open_backend(config, &config_name).await?);
        if backend.registered_workers(&function).await? == 0 {
            warn!(function = %function, "No worker is registered");
        }
        let submitter = Submitter::new(backend.clone(), backend, function.clone())
            .with_result_timeout(timeout);

        let result = if args.delay > 0 {
            let due = Utc::now() + delay_secs(args.delay)?;
            let submission = submitter
                .submit(&config_name, "ping", vec![], SubmitOptions::default().scheduled_at(due))
                .await?;
            let Some(id) = submission.job_id() else {
                bail!("Delayed ping was not scheduled");
            };
            submitter
                .await_job(id, Duration::from_secs(args.delay) + timeout)
                .await?
        } else {
            match submitter
                .submit(&config_name, "ping", vec![], SubmitOptions::default())
                .await?
            {
                Submission::Completed(result) => result,
                other => bail!("Unexpected submission outcome {other:?}"),
            }
        };

        if result != Some(json!("pong")) {
            bail!("Ping to {function} failed: unexpected answer {result:?}");
        }
        println!("pong");
        anyhow::Ok(0)
    }
    .instrument(span)
    .await
}

/// Submits an arbitrary job
pub async fn submit(config: &Config, args: SubmitArgs) -> Result<i32> {
    let config_name = config.config_name(args.config_name);
    let function = config.function(&config_name);
    let mut options = SubmitOptions {
        background: args.background,
        ..SubmitOptions::default()
    }
    .with_priority(args.priority);
    if let Some(delay) = args.delay {
        options = options.scheduled_at(Utc::now() + delay_secs(delay)?);
    }
    let task = args.task;
    let job_args: Vec<Value> = args.args.iter().map(|arg| parse_arg(arg)).collect();

    let span = process_span("cli");
    async move {
        let backend = Arc::new(open_backend(config, &config_name).await?);
        let submitter = Submitter::new(backend.clone(), backend, function)
            .with_result_timeout(config.result_timeout());

        match submitter.submit(&config_name, &task, job_args, options).await? {
            Submission::Scheduled(id) => println!("scheduled {id}"),
            Submission::Queued(handle) => println!("queued {}", handle.id),
            Submission::Completed(result) => {
                println!("{}", serde_json::to_string(&result.unwrap_or(Value::Null))?);
            }
        }
        anyhow::Ok(0)
    }
    .instrument(span)
    .await
}

fn delay_secs(secs: u64) -> Result<ChronoDuration> {
    let secs = i64::try_from(secs).context("Delay is too large")?;
    ChronoDuration::try_seconds(secs).context("Delay is too large")
}

/// JSON when the argument parses as JSON, a plain string otherwise
fn parse_arg(arg: &str) -> Value {
    serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.to_string()))
}
