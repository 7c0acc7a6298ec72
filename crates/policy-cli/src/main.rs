//! policyctl - drive a policy executor with a synthetic workload.

use std::error::Error;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand, ValueEnum};
use policy_core::executor::ExecutorSnapshot;
use policy_core::logging::init_logging_with_default;
use policy_core::models::{QueueFullAction, TaskError};
use policy_core::{PolicyConfig, PolicyExecutorProvider, SharedPool};
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

type CliResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

#[derive(Parser)]
#[command(name = "policyctl")]
#[command(about = "Run workloads through a policy executor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit sleeping tasks and report how the policy admitted them
    Run(RunArgs),
    /// Validate a policy configuration file and print it normalized
    Check {
        /// JSON policy configuration
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FullAction {
    Abort,
    CallerRuns,
    CallerRunsIfSameExecutor,
}

impl From<FullAction> for QueueFullAction {
    fn from(action: FullAction) -> Self {
        match action {
            FullAction::Abort => Self::Abort,
            FullAction::CallerRuns => Self::CallerRuns,
            FullAction::CallerRunsIfSameExecutor => Self::CallerRunsIfSameExecutor,
        }
    }
}

#[derive(Args)]
struct RunArgs {
    /// JSON policy configuration (defaults apply when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides queueFullAction from the configuration
    #[arg(long, value_enum)]
    queue_full_action: Option<FullAction>,

    /// Number of tasks to submit
    #[arg(long, default_value = "8")]
    tasks: usize,

    /// How long each task sleeps
    #[arg(long, default_value = "50")]
    task_millis: u64,

    /// Executor identifier
    #[arg(long, default_value = "policyctl")]
    identifier: String,

    /// Cap on backing pool workers (unbounded when omitted)
    #[arg(long)]
    pool_workers: Option<usize>,

    /// Print a JSON report instead of the introspection dump
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct Tally {
    submitted: usize,
    rejected: usize,
    succeeded: usize,
    failed: usize,
    aborted: usize,
    cancelled: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunReport {
    started_at: String,
    elapsed_millis: u128,
    tally: Tally,
    executor: ExecutorSnapshot,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging_with_default("warn");
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run(args) => run(args).await,
        Command::Check { config } => check(&config),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("policyctl: {error}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: &Path) -> CliResult<PolicyConfig> {
    let json = std::fs::read_to_string(path)
        .map_err(|error| format!("cannot read {}: {error}", path.display()))?;
    Ok(PolicyConfig::from_json_str(&json)?)
}

fn check(path: &Path) -> CliResult<()> {
    let config = load_config(path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

async fn run(args: RunArgs) -> CliResult<()> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => PolicyConfig::default(),
    };
    if let Some(action) = args.queue_full_action {
        config.queue_full_action = action.into();
    }

    let handle = tokio::runtime::Handle::current();
    let pool = match args.pool_workers {
        Some(workers) => SharedPool::with_max_workers(handle, workers),
        None => SharedPool::new(handle),
    };
    let provider = PolicyExecutorProvider::new(Arc::new(pool));
    let executor = provider.create(args.identifier.as_str())?;
    executor.update_config(&config)?;

    let started_at = OffsetDateTime::now_utc().format(&Rfc3339)?;
    let started = Instant::now();
    let task_time = Duration::from_millis(args.task_millis);
    let mut tally = Tally::default();
    let mut futures = Vec::with_capacity(args.tasks);
    for index in 0..args.tasks {
        let submitted = executor
            .submit(move |_token| async move {
                tokio::time::sleep(task_time).await;
                Ok::<_, std::io::Error>(index)
            })
            .await;
        match submitted {
            Ok(future) => {
                tally.submitted += 1;
                futures.push(future);
            }
            Err(error) => {
                tracing::info!(task = index, message = %error.message, "submission rejected");
                tally.rejected += 1;
            }
        }
    }

    for future in futures {
        match future.join().await {
            Ok(_) => tally.succeeded += 1,
            Err(TaskError::Failed(_)) => tally.failed += 1,
            Err(TaskError::Aborted(_)) => tally.aborted += 1,
            Err(_) => tally.cancelled += 1,
        }
    }
    let elapsed = started.elapsed();

    if args.json {
        let report = RunReport {
            started_at,
            elapsed_millis: elapsed.as_millis(),
            tally,
            executor: executor.snapshot(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let mut stdout = std::io::stdout().lock();
        executor.introspect(&mut stdout)?;
        writeln!(stdout, "started {started_at}, finished in {elapsed:?}: {tally:?}")?;
    }

    provider.shutdown_all();
    if !executor.await_termination(Duration::from_secs(5)).await {
        return Err("executor did not terminate within 5s".into());
    }
    Ok(())
}
