use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::bootstrap::build_limiter;
use gatekeeper::config::{BackendKind, GatekeeperConfig, LoggingConfig};
use gatekeeper::ratelimit::{Limiter, RuleDefinition};

/// Attempt limiting for authentication flows and API actions.
///
/// With the default `local` backend every invocation starts from empty
/// state, so only the distributed backend remembers earlier commands.
#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record one attempt and print the resulting status
    Record { identifier: String, action: String },
    /// Print whether another attempt would be allowed
    Check { identifier: String, action: String },
    /// Print the current status without recording anything
    Status { identifier: String, action: String },
    /// Forget all state for a pair
    Reset { identifier: String, action: String },
    /// Block a pair; omit the duration or pass 0 for an indefinite block
    Block {
        identifier: String,
        action: String,
        #[arg(long, default_value_t = 0)]
        duration_secs: u64,
    },
    /// Lift a block on a pair
    Unblock { identifier: String, action: String },
    /// List the configured rules
    Rules,
    /// Print rule and key counts
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = GatekeeperConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;
    init_tracing(&config.logging);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?cli.config,
        backend = ?config.backend,
        "Starting gatekeeper"
    );
    if config.backend == BackendKind::Local && cli.command.mutates() {
        warn!("Local backend state is discarded when this command exits");
    }

    let limiter = build_limiter(&config)
        .await
        .context("failed to initialise limiter")?;

    let outcome = run(limiter.as_ref(), cli.command).await;
    limiter.shutdown().await;
    outcome
}

impl Command {
    /// Whether the command changes attempt state.
    fn mutates(&self) -> bool {
        matches!(
            self,
            Command::Record { .. }
                | Command::Reset { .. }
                | Command::Block { .. }
                | Command::Unblock { .. }
        )
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    // Logs go to stderr so command output on stdout stays parseable.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(limiter: &dyn Limiter, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Record { identifier, action } => {
            print_json(&limiter.record_attempt(&identifier, &action).await?)
        }
        Command::Check { identifier, action } => {
            let status = limiter.get_status(&identifier, &action).await?;
            print_json(&status.check_result())
        }
        Command::Status { identifier, action } => {
            print_json(&limiter.get_status(&identifier, &action).await?)
        }
        Command::Reset { identifier, action } => {
            limiter.reset(&identifier, &action).await?;
            print_json(&Ack::new("reset", &identifier, &action))
        }
        Command::Block {
            identifier,
            action,
            duration_secs,
        } => {
            limiter
                .block(&identifier, &action, Duration::from_secs(duration_secs))
                .await?;
            print_json(&limiter.get_status(&identifier, &action).await?)
        }
        Command::Unblock { identifier, action } => {
            limiter.unblock(&identifier, &action).await?;
            print_json(&Ack::new("unblock", &identifier, &action))
        }
        Command::Rules => {
            let rules: Vec<RuleDefinition> =
                limiter.rules().iter().map(|rule| rule.to_definition()).collect();
            print_json(&rules)
        }
        Command::Stats => print_json(&limiter.stats().await?),
    }
}

#[derive(Serialize)]
struct Ack<'a> {
    operation: &'a str,
    identifier: &'a str,
    action: &'a str,
}

impl<'a> Ack<'a> {
    fn new(operation: &'a str, identifier: &'a str, action: &'a str) -> Self {
        Self {
            operation,
            identifier,
            action,
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
