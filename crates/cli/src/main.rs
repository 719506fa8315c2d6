//! wp-batch command-line entry point.

mod cli;
mod jobs;
mod pipeline;

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wp_batch_common::{AppResult, Config, get_metrics};
use wp_batch_queue::{
    BatchScheduler, CancellationFlag, ProgressCallback, SchedulerConfig, batch_count,
    load_checkpoint,
};

use crate::cli::{Cli, Command, RunArgs};
use crate::jobs::{load_jobs, write_failure_report};
use crate::pipeline::Pipeline;

/// Exit code when the run stopped on SIGINT/SIGTERM.
const EXIT_CANCELLED: u8 = 130;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, finishing running batches...");
        },
        () = terminate => {
            info!("Received SIGTERM, finishing running batches...");
        },
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "wp_batch=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_config(cli: &Cli) -> AppResult<Config> {
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(code = e.error_code(), error = %e, "wp-batch failed");
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}

async fn dispatch(cli: Cli) -> AppResult<ExitCode> {
    match &cli.command {
        Command::Status { checkpoint } => {
            match load_checkpoint(checkpoint).await? {
                Some(saved) => println!("{}", serde_json::to_string_pretty(&saved)?),
                None => info!(path = %checkpoint.display(), "No checkpoint found"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Verify => {
            let config = load_config(&cli)?;
            config.validate()?;

            let pipeline = Pipeline::build(&config)?;
            let result = pipeline.preflight().await;
            pipeline.shutdown().await;

            match result? {
                Some(user) => {
                    println!("{}", serde_json::to_string_pretty(&user)?);
                    Ok(ExitCode::SUCCESS)
                }
                None => Ok(ExitCode::FAILURE),
            }
        }
        Command::Run(args) => {
            let mut config = load_config(&cli)?;
            args.apply(&mut config);
            config.validate()?;
            run(config, args).await
        }
    }
}

async fn run(config: Config, args: &RunArgs) -> AppResult<ExitCode> {
    let jobs = load_jobs(&args.jobs).await?;
    let scheduler_config = SchedulerConfig::from_config(&config.batch);

    info!(
        site = %config.site.base_url(),
        mode = %config.batch.mode,
        jobs = jobs.len(),
        batches = batch_count(jobs.len(), scheduler_config.batch_size),
        batch_size = scheduler_config.batch_size,
        parallel_batches = scheduler_config.max_parallel_batches,
        workers_per_batch = scheduler_config.max_workers_per_batch,
        max_concurrent = config.transport.max_concurrent,
        "Starting wp-batch run"
    );

    if args.dry_run {
        info!("Dry run, nothing published");
        return Ok(ExitCode::SUCCESS);
    }
    if jobs.is_empty() {
        warn!("No jobs to publish");
        return Ok(ExitCode::SUCCESS);
    }

    let pipeline = Pipeline::build(&config)?;
    if let Err(e) = pipeline.preflight().await {
        pipeline.shutdown().await;
        return Err(e);
    }

    let cancel: CancellationFlag = Arc::new(AtomicBool::new(false));
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let progress: ProgressCallback = Arc::new(|completed: usize, total: usize, eta: f64| {
        info!(completed, total, eta_secs = eta.round() as u64, "Progress");
    });

    let publisher = pipeline.publisher.clone();
    let report = BatchScheduler::new(scheduler_config)
        .with_progress(progress)
        .with_cancellation(cancel)
        .run(jobs, move |job| {
            let publisher = publisher.clone();
            async move { publisher.publish(&job).await }
        })
        .await;
    pipeline.shutdown().await;
    let report = report?;

    info!(
        total = report.total,
        succeeded = report.success_count,
        failed = report.failed_count,
        retried = report.retried,
        elapsed_secs = report.elapsed.as_secs_f64(),
        posts_per_minute = report.posts_per_minute,
        cancelled = report.cancelled,
        "Run finished"
    );
    info!(
        metrics = %serde_json::to_string(&get_metrics().snapshot())?,
        "Metrics"
    );

    if !report.failed_jobs.is_empty() {
        write_failure_report(&args.failures, &report.failed_jobs).await?;
    }

    Ok(if report.cancelled {
        ExitCode::from(EXIT_CANCELLED)
    } else if report.failed_count > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
