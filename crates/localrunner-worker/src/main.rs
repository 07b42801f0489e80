// Entry point of the `localrunner` CLI.
//
// Loads a job document, runs it on the host and prints the job result as
// JSON. The process exits with a return code that encodes the conclusion.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use localrunner_common::{ActionResult, ResultUtil, RunnerSettings, SecretMasker};
use localrunner_worker::handlers::step_host::ProcessStepRunner;
use localrunner_worker::{JobDefinition, JobRunner};

#[derive(Parser, Debug)]
#[command(name = "localrunner", about = "Run workflow jobs locally", version)]
struct Cli {
    /// Log engine diagnostics at debug level (RUST_LOG takes precedence).
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one job document.
    Run {
        /// Path to the job document (YAML).
        #[arg(long)]
        job: PathBuf,

        /// Path to a JSON settings file.
        #[arg(long)]
        settings: Option<PathBuf>,

        /// Secret to mask in step logs, as NAME=VALUE. The value is also
        /// exported to the job environment under NAME.
        #[arg(long = "secret", value_name = "NAME=VALUE")]
        secrets: Vec<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to build Tokio runtime: {e}");
            std::process::exit(ResultUtil::translate_to_return_code(ActionResult::Failure));
        }
    };

    let exit_code = runtime.block_on(async move {
        match run(cli.command).await {
            Ok(code) => code,
            Err(e) => {
                tracing::error!("localrunner failed: {:#}", e);
                ResultUtil::translate_to_return_code(ActionResult::Failure)
            }
        }
    });

    std::process::exit(exit_code);
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(command: Command) -> Result<i32> {
    let Command::Run {
        job,
        settings,
        secrets,
    } = command;

    let settings = Arc::new(RunnerSettings::load(settings.as_deref())?);
    let definition = JobDefinition::load(&job)?;
    tracing::info!(job = definition.display_name(), path = %job.display(), "loaded job");

    let mut env = definition.env.clone();
    let secret_masker = SecretMasker::new();
    for secret in &secrets {
        let (name, value) = secret
            .split_once('=')
            .with_context(|| format!("Secret '{secret}' is not in NAME=VALUE form"))?;
        secret_masker.add_value(value);
        env.insert(name.to_string(), value.to_string());
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    ctrlc::set_handler(move || {
        tracing::warn!("Interrupt received, cancelling job");
        on_interrupt.cancel();
    })
    .context("Failed to install the interrupt handler")?;

    let runner = JobRunner::new(Arc::new(ProcessStepRunner::new(&settings)), Arc::clone(&settings))
        .with_secret_masker(secret_masker.clone());
    let result = runner
        .run_job(&definition.steps, env, &definition.resolver(), cancel)
        .await?;

    let rendered = serde_json::to_string_pretty(&result).context("Failed to render job result")?;
    println!("{}", secret_masker.mask_secrets(&rendered));

    let return_code = result.return_code();
    tracing::info!(conclusion = %result.conclusion, return_code, "job completed");
    Ok(return_code)
}
