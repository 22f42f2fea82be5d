//! Batchline CLI - Replay scripted store calls and inspect the results.
//!
//! Scripts run against the in-memory backend, so batching, caching and
//! retry behavior can be observed without a server.

mod script;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use batchline_sync::BatchConfig;

#[derive(Parser)]
#[command(name = "batchline")]
#[command(about = "Batchline - Batched writes and cached reads over a record backend")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSON script of store calls against the in-memory backend.
    Replay {
        /// Script file (JSON array of steps).
        #[arg(short, long)]
        script: PathBuf,

        /// Configuration file (JSON, missing fields use defaults).
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the idle flush interval in milliseconds.
        #[arg(long)]
        batch_interval: Option<u64>,

        /// Override the batch size threshold.
        #[arg(long)]
        max_batch_size: Option<usize>,

        /// Override the cache TTL in milliseconds.
        #[arg(long)]
        cache_ttl: Option<u64>,
    },

    /// Print the default configuration.
    Config,

    /// Generate shell completions.
    Completions {
        /// Target shell.
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase())),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Replay {
            script,
            config,
            batch_interval,
            max_batch_size,
            cache_ttl,
        } => {
            let overrides = Overrides {
                batch_interval,
                max_batch_size,
                cache_ttl,
            };
            cmd_replay(&script, config.as_ref(), overrides).await
        }

        Commands::Config => cmd_config(),

        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "batchline",
                &mut std::io::stdout(),
            );
            Ok(())
        }
    }
}

/// Command line values that take precedence over the config file.
#[derive(Debug, Default)]
struct Overrides {
    batch_interval: Option<u64>,
    max_batch_size: Option<usize>,
    cache_ttl: Option<u64>,
}

impl Overrides {
    fn apply(self, mut config: BatchConfig) -> Result<BatchConfig> {
        if let Some(ms) = self.batch_interval {
            config = config.with_batch_interval(Duration::from_millis(ms));
        }
        if let Some(size) = self.max_batch_size {
            config = config.with_max_batch_size(size);
        }
        if let Some(ms) = self.cache_ttl {
            config = config.with_cache_ttl(Duration::from_millis(ms));
        }
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

/// Replay a script and print the report.
async fn cmd_replay(
    script_path: &PathBuf,
    config_path: Option<&PathBuf>,
    overrides: Overrides,
) -> Result<()> {
    let config = overrides.apply(script::load_config(config_path.map(PathBuf::as_path))?)?;
    let steps = script::load_script(script_path)?;
    info!(
        "Replaying {} with batch interval {}ms",
        script_path.display(),
        config.batch_interval
    );

    let report = script::replay(steps, config).await?;

    let failed = report.steps.iter().filter(|s| s.error.is_some()).count();
    if failed > 0 {
        info!("{} steps failed", failed);
    }

    let json = serde_json::to_string_pretty(&report).context("Failed to encode report")?;
    println!("{}", json);
    Ok(())
}

/// Print the default configuration.
fn cmd_config() -> Result<()> {
    let json = BatchConfig::default()
        .to_json()
        .context("Failed to encode configuration")?;
    println!("{}", json);
    Ok(())
}
