//! Gauntlet CLI - run a staged test matrix against a flavor pool.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gauntlet::{
    FailurePolicy, FlavorCatalog, FlavorPool, PoolConfig, ProcessExecutor, RetryPolicy,
    RunnerBuilder, RunnerConfig, StepEvent, TestMatrix,
};

/// Exit code for malformed configuration, distinct from test failures.
const CONFIG_EXIT: i32 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "gauntlet",
    version,
    about = "Run a staged test matrix against a pool of hardware flavors"
)]
struct Cli {
    /// Path to the test matrix YAML document.
    matrix: PathBuf,

    /// Path to the flavor catalog YAML document.
    #[arg(long)]
    flavors: PathBuf,

    /// Maximum attempts per step, including the first.
    #[arg(long, default_value_t = 1)]
    max_attempts: u16,

    /// Run every stage even after one fails.
    #[arg(long)]
    continue_on_failure: bool,

    /// Wall-clock limit in seconds for a single step attempt.
    #[arg(long, default_value_t = 3600)]
    timeout_secs: u64,

    /// Write the full JSON report to this path.
    #[arg(long)]
    report: Option<PathBuf>,

    /// Retained output lines per attempt.
    #[arg(long, default_value_t = 64)]
    tail_lines: usize,

    /// Emit one JSON object per step on stdout instead of the human summary.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let code = run(cli).await;
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    let catalog = match FlavorCatalog::load(&cli.flavors) {
        Ok(catalog) => catalog,
        Err(err) => {
            eprintln!("{err}");
            return CONFIG_EXIT;
        }
    };
    let matrix = match TestMatrix::load(&cli.matrix, &catalog) {
        Ok(matrix) => matrix,
        Err(err) => {
            eprintln!("{err}");
            return CONFIG_EXIT;
        }
    };

    tracing::info!(
        stages = matrix.stages.len(),
        steps = matrix.step_count(),
        flavors = catalog.len(),
        "loaded test matrix"
    );

    let config = RunnerConfig {
        retry: RetryPolicy::new(cli.max_attempts),
        failure_policy: if cli.continue_on_failure {
            FailurePolicy::ContinueOnFailure
        } else {
            FailurePolicy::StopOnFailure
        },
        step_timeout: Duration::from_secs(cli.timeout_secs),
        ..RunnerConfig::default()
    };
    let pool = Arc::new(FlavorPool::new(PoolConfig::from_catalog(&catalog)));
    let executor = Arc::new(ProcessExecutor::new().with_tail_lines(cli.tail_lines));
    let runner = match RunnerBuilder::new(config)
        .with_pool(pool)
        .with_executor(executor)
        .build()
    {
        Ok(runner) => runner,
        Err(err) => {
            eprintln!("{err}");
            return CONFIG_EXIT;
        }
    };

    let shutdown = runner.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            shutdown.cancel();
        }
    });

    // Subscribe before the run starts so no progress event is missed.
    let observer = tokio::spawn(observe_progress(runner.events().subscribe()));

    let report = runner.run(&matrix).await;
    let _ = observer.await;

    if let Some(path) = &cli.report {
        match report.to_json() {
            Ok(json) => {
                if let Err(err) = std::fs::write(path, json) {
                    tracing::error!("cannot write report to {}: {err}", path.display());
                }
            }
            Err(err) => tracing::error!("cannot serialize report: {err}"),
        }
    }

    if cli.json {
        match report.to_json_lines() {
            Ok(lines) => print!("{lines}"),
            Err(err) => tracing::error!("cannot serialize report: {err}"),
        }
    } else {
        print!("{}", report.render_human());
    }

    report.exit_code()
}

/// Stream progress events to the log until the run finishes.
async fn observe_progress(mut rx: broadcast::Receiver<StepEvent>) {
    loop {
        match rx.recv().await {
            Ok(StepEvent::StageStarted { stage, .. }) => {
                tracing::info!(stage = %stage, "stage started");
            }
            Ok(StepEvent::StageFinished { stage, status, .. }) => {
                tracing::info!(stage = %stage, status = %status, "stage finished");
            }
            Ok(StepEvent::StepStarted {
                stage,
                step,
                flavor,
                attempt,
                ..
            }) => {
                tracing::info!(
                    stage = %stage,
                    step = %step,
                    flavor = %flavor,
                    attempt = attempt,
                    "step started"
                );
            }
            Ok(StepEvent::AttemptFinished {
                step,
                attempt,
                outcome,
                ..
            }) => {
                tracing::info!(step = %step, attempt = attempt, outcome = %outcome, "attempt finished");
            }
            Ok(StepEvent::StepFinished {
                step,
                status,
                attempts,
                ..
            }) => {
                tracing::info!(step = %step, status = %status, attempts = attempts, "step finished");
            }
            Ok(StepEvent::RunFinished { status, .. }) => {
                tracing::info!(status = %status, "run finished");
                break;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Closed) => break,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("progress observer lagged, skipped {skipped} events");
            }
        }
    }
}
