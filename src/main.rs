//! Vouch CLI - verify an artifact against its referrers

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vouch_core::{default_plugin_dir, Config, Verdict};
use vouch_executor::{Executor, StaticComponents};
use vouch_plugins::{default_factories, PluginRunner};

#[derive(Parser)]
#[command(name = "vouch", about = "Vouch - referrer-based artifact verification")]
struct Cli {
    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify one subject and print the decision as JSON.
    /// Exit status: 0 allow, 1 deny, 2 indeterminate or error.
    Verify {
        /// Configuration file (JSON)
        #[arg(short, long)]
        config: PathBuf,
        /// Directory searched for plugin executables when the config names none
        #[arg(long)]
        plugin_dir: Option<PathBuf>,
        /// Subject reference, `repository[:tag]@sha256:<hex>`
        subject: String,
    },
    /// Build every configured plugin and list what resolved
    Plugins {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        plugin_dir: Option<PathBuf>,
    },
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let outcome = match cli.command {
        Commands::Verify {
            config,
            plugin_dir,
            subject,
        } => verify(&config, plugin_dir, &subject).await,
        Commands::Plugins { config, plugin_dir } => list_plugins(&config, plugin_dir),
        Commands::Version => {
            println!("vouch v{}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "vouch=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn load(path: &Path, plugin_dir: Option<PathBuf>) -> anyhow::Result<(Config, StaticComponents)> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config = Config::from_json(&raw).with_context(|| format!("parsing config {}", path.display()))?;
    let plugin_dir = plugin_dir.unwrap_or_else(default_plugin_dir);
    let factories = default_factories(PluginRunner::new(&config.executor.plugins));
    let components = StaticComponents::from_config(&config, &factories, &plugin_dir)?;
    Ok((config, components))
}

async fn verify(config: &Path, plugin_dir: Option<PathBuf>, subject: &str) -> anyhow::Result<ExitCode> {
    let (config, components) = load(config, plugin_dir)?;
    let executor = Executor::new(Arc::new(components), config.executor)?;
    let decision = executor.verify(subject).await?;

    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(match decision.verdict {
        Verdict::Allow => ExitCode::SUCCESS,
        Verdict::Deny => ExitCode::from(1),
        Verdict::Indeterminate => ExitCode::from(2),
    })
}

fn list_plugins(config: &Path, plugin_dir: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let (_, components) = load(config, plugin_dir)?;
    for store in &components.stores {
        println!("store     {}", store.name());
    }
    for verifier in &components.verifiers {
        println!("verifier  {}", verifier.name());
    }
    println!("policy    {}", components.policy.name());
    Ok(ExitCode::SUCCESS)
}
