//! Accord CLI - Main Entry Point
//!
//! Runs acceptance-test features against live services, validates feature
//! files offline and checks application readiness.

use std::path::PathBuf;
use std::process::ExitCode;

use accord_engine::SuiteConfig;
use clap::{Parser, Subcommand};

mod commands;
mod output;

use commands::{apps, check, run};

/// Accord - acceptance tests for independently deployed HTTP services
#[derive(Parser)]
#[command(name = "accord")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Suite configuration file
    #[arg(short, long, default_value = "accord.toml", env = "ACCORD_CONFIG", global = true)]
    config: PathBuf,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run features against the configured applications
    Run(run::RunArgs),

    /// Parse every feature and resolve its steps without running them
    Check(check::CheckArgs),

    /// Inspect the applications under test
    #[command(subcommand)]
    Apps(apps::AppsCommands),

    /// Show version information
    Version,
}

fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    let config = match SuiteConfig::load(&cli.config) {
        Ok(config) => {
            tracing::debug!(
                "Loaded {} with {} application(s)",
                cli.config.display(),
                config.applications.len()
            );
            config
        }
        Err(e) => {
            output::print_error(&format!("Cannot load {}: {}", cli.config.display(), e));
            return ExitCode::from(2);
        }
    };

    let outcome = match cli.command {
        Commands::Run(args) => run::execute(args, &config, cli.format).await,
        Commands::Check(args) => check::execute(args, &config, cli.format),
        Commands::Apps(cmd) => apps::execute(cmd, &config, cli.format).await,
        Commands::Version => {
            println!("Accord CLI v{}", env!("CARGO_PKG_VERSION"));
            Ok(true)
        }
    };

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            output::print_error(&format!("{:#}", e));
            ExitCode::from(2)
        }
    }
}
