use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;

mod cmd;

#[derive(Parser)]
#[command(name = "runwright")]
#[command(version, about = "Crash-safe orchestrator for paragraph translation runs")]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run, resume or inspect a translation run
    Run(RunArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Initial cycle: ingest through merge
    Full,
    /// Targeted cycle over the rework queue
    ReworkOnly,
    /// Read-only report; never takes the lock
    Status,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[arg(long)]
    pub run_id: String,

    #[arg(long, value_enum, default_value = "full")]
    pub mode: Mode,

    /// Directory holding all runs. Defaults to ./runs
    #[arg(long, env = "RUNWRIGHT_RUNS_DIR")]
    pub runs_dir: Option<PathBuf>,

    /// Source document. Required for the first full invocation.
    #[arg(long)]
    pub source: Option<PathBuf>,

    /// Model name passed to tools. Required for the first full invocation.
    #[arg(long)]
    pub model: Option<String>,

    #[arg(long)]
    pub pipeline_profile: Option<String>,

    #[arg(long, allow_negative_numbers = true)]
    pub max_paragraph_attempts: Option<i64>,

    #[arg(long, allow_negative_numbers = true)]
    pub phase_timeout_seconds: Option<i64>,

    /// TOML file listing paragraph ids and glob patterns to exclude
    #[arg(long)]
    pub exclusion_policy: Option<PathBuf>,

    /// Path to runwright.toml. Defaults to ./runwright.toml when present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print the status report as JSON
    #[arg(long)]
    pub json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Run(args) => cmd::cmd_run(&cli, args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("runwright: {}: {e}", e.class());
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}
