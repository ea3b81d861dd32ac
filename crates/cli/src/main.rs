//! Vigil CLI - vigil command

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

mod alerts;
mod cmd;
mod config;

/// Vigil - real-time file change watcher
#[derive(Parser)]
#[command(name = "vigil")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/vigil/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "vigil_watcher=debug" (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Write logs to a daily rolling file in this directory instead of stderr
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch paths and report changes until Ctrl-C
    Watch {
        /// Paths to watch, in addition to configured targets
        paths: Vec<PathBuf>,

        /// Watch whole trees (default)
        #[arg(long, overrides_with = "no_recursive")]
        recursive: bool,

        /// Watch only each root's direct entries
        #[arg(long)]
        no_recursive: bool,

        /// Exclude glob, gitignore syntax (repeatable)
        #[arg(long, value_name = "GLOB")]
        exclude: Vec<String>,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,

        /// Honor each root's .gitignore
        #[arg(long)]
        gitignore: bool,
    },
    /// Show or check the configuration
    Config {
        /// Print the config file location
        #[arg(long)]
        path: bool,

        /// Print an annotated example config
        #[arg(long)]
        example: bool,

        /// Validate the config file
        #[arg(long)]
        check: bool,

        /// Write the example config if none exists
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_level.as_deref(), cli.log_dir.as_deref())?;

    match cli.command {
        Commands::Watch {
            paths,
            recursive: _,
            no_recursive,
            exclude,
            json,
            gitignore,
        } => {
            let config = config::load(cli.config.as_deref())?;
            config.validate().context("Invalid configuration")?;
            let args = cmd::watch::WatchArgs {
                paths,
                recursive: !no_recursive,
                exclude,
                json,
                gitignore,
            };
            cmd::watch::run(config, args).await
        }
        Commands::Config {
            path,
            example,
            check,
            init,
        } => {
            let args = cmd::config::ConfigArgs {
                path,
                example,
                check,
                init,
            };
            cmd::config::run(cli.config.as_deref(), args).await
        }
    }
}

/// Install the fmt subscriber on stderr, or on a daily rolling file
///
/// The returned guard flushes the file writer on drop.
fn init_tracing(level: Option<&str>, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).with_context(|| format!("Invalid log filter: {level}"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "vigil.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}
