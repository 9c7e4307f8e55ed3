use clap::{Parser, Subcommand};

use jobwarden::batch::BatchRegistry;
use jobwarden::config::{Config, ExitCodes, env};
use jobwarden::error::Result;
use jobwarden::operator::{Clearer, Killer, Operator, Syncer, Wiper};
use jobwarden::record::find_record;
use jobwarden::retry::Retryer;
use jobwarden::runner::{Runner, RunnerEnv, install_termination_handler, run_job};

/// jobwarden - run and manage batch jobs.
#[derive(Debug, Parser)]
#[command(name = "jobwarden")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute the job on the compute node. Started by the scheduler.
    Run {
        /// Script name, as passed by the scheduler.
        script: Option<String>,
    },
    /// Kill the job of the current directory.
    Kill {
        /// Kill regardless of the job's state.
        #[arg(long)]
        force: bool,
    },
    /// Fetch files from the job's working directory.
    Sync {
        /// Only these files (comma separated); everything if omitted.
        #[arg(long, value_delimiter = ',')]
        files: Vec<String>,
    },
    /// Delete the job's working directory.
    Wipe {
        /// Skip the state checks. The submission directory is still protected.
        #[arg(long)]
        force: bool,
    },
    /// Remove runtime files of killed, failed or inconsistent jobs.
    Clear {
        /// Remove all runtime files, whatever the state of their jobs.
        #[arg(long)]
        force: bool,
    },
    /// Show the job's recorded, scheduler and reconciled state.
    Status {
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let default_filter = if std::env::var_os(env::DEBUG).is_some() { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    let codes = ExitCodes::default();
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start the async runtime");
            std::process::exit(codes.unexpected);
        }
    };

    let code = runtime.block_on(async move {
        let result = match cli.command {
            Commands::Run { script } => return run(script).await,
            Commands::Kill { force } => kill(force).await,
            Commands::Sync { files } => sync(&files).await,
            Commands::Wipe { force } => wipe(force).await,
            Commands::Clear { force } => clear(force).await,
            Commands::Status { json } => status(json).await,
        };
        match result {
            Ok(()) => 0,
            Err(e) => {
                tracing::error!("{e}");
                e.exit_code(&codes)
            }
        }
    });
    std::process::exit(code);
}

async fn run(script: Option<String>) -> i32 {
    let codes = ExitCodes::default();
    let runner_env = match RunnerEnv::from_env() {
        Ok(runner_env) => runner_env,
        Err(e) => {
            tracing::error!(error = %e, "Refusing to run");
            return e.exit_code(&codes);
        }
    };
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration, the job may be in an inconsistent state");
            return codes.fatal;
        }
    };
    let codes = config.exit_codes;

    let token = match install_termination_handler() {
        Ok(token) => token,
        Err(e) => {
            tracing::error!(error = %e, "Could not install SIGTERM handler");
            return codes.fatal;
        }
    };

    if let Some(script) = &script {
        tracing::debug!(script = %script, info = %runner_env.info_file.display(), "Runner started");
    }

    let registry = BatchRegistry::with_defaults(&config);
    let task = tokio::spawn(async move {
        let runner = match Runner::load(runner_env, &registry, config, token).await {
            Ok(runner) => runner,
            Err(e) => {
                tracing::error!(error = %e, "Job could not be started, it may be in an inconsistent state");
                return e.exit_code(&codes);
            }
        };
        run_job(runner).await
    });

    match task.await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "Runner crashed, the job may be in an inconsistent state");
            codes.unexpected
        }
    }
}

/// Operator for the single job record in the current directory.
async fn load_operator() -> Result<Operator> {
    let config = Config::from_env()?;
    let registry = BatchRegistry::with_defaults(&config);
    let cwd = std::env::current_dir()?;
    let path = find_record(&cwd, &config.suffixes.record).await?;
    Ok(Operator::load(&path, &registry, Retryer::once()).await?)
}

async fn kill(force: bool) -> Result<()> {
    let mut killer = Killer::new(load_operator().await?);
    if !force {
        killer.ensure_suitable().await?;
    }
    let job_id = killer.terminate(force).await?;
    println!("Killed job '{job_id}'.");
    Ok(())
}

async fn sync(files: &[String]) -> Result<()> {
    let syncer = Syncer::new(load_operator().await?);
    syncer.ensure_suitable().await?;
    syncer.sync(files).await?;
    println!("Synchronized job '{}'.", syncer.operator().job_id());
    Ok(())
}

async fn wipe(force: bool) -> Result<()> {
    let wiper = Wiper::new(load_operator().await?);
    if !force {
        wiper.ensure_suitable().await?;
    }
    let job_id = wiper.wipe().await?;
    println!("Deleted working directory of job '{job_id}'.");
    Ok(())
}

async fn clear(force: bool) -> Result<()> {
    let config = Config::from_env()?;
    let registry = BatchRegistry::with_defaults(&config);
    let cwd = std::env::current_dir()?;
    let cleared = Clearer::new(&cwd, &registry, config.suffixes).clear(force).await?;
    println!("Removed {} runtime file(s).", cleared.removed.len());
    if !cleared.kept.is_empty() {
        println!(
            "{} file(s) belong to live or finished jobs. Rerun with --force to remove them.",
            cleared.kept.len()
        );
    }
    Ok(())
}

async fn status(json: bool) -> Result<()> {
    let op = load_operator().await?;
    let status = op.status().await?;
    let record = op.record();
    if json {
        let value = serde_json::json!({
            "job_id": record.job_id,
            "job_name": record.job_name,
            "naive_state": status.naive.to_string(),
            "batch_state": status.batch.to_string(),
            "real_state": status.real.to_string(),
            "exit_code": record.job_exit_code,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("Job '{}' ({}) is {}.", record.job_id, record.job_name, status.real);
        println!("  recorded: {}, scheduler: {}", status.naive, status.batch);
        if let Some(code) = record.job_exit_code {
            println!("  exit code: {code}");
        }
    }
    Ok(())
}
