//! Watch paths until interrupted

use crate::alerts::{ConsoleChannel, JsonChannel, LogChannel};
use crate::config::{TargetSection, VigilConfig};
use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use vigil_watcher::{AlertChannel, SubscriptionId, TargetStatus, Watcher};

/// Targets and output options given on the command line
#[derive(Debug, Clone, Default)]
pub struct WatchArgs {
    pub paths: Vec<PathBuf>,
    pub recursive: bool,
    pub exclude: Vec<String>,
    pub json: bool,
    pub gitignore: bool,
}

/// Configured targets plus the ones named on the command line
pub fn merge_targets(config: &VigilConfig, args: &WatchArgs) -> Vec<TargetSection> {
    let mut targets = config.targets.clone();
    targets.extend(args.paths.iter().map(|path| TargetSection {
        path: path.clone(),
        recursive: args.recursive,
        exclude: args.exclude.clone(),
        use_gitignore: args.gitignore,
        skip_editor_temp: false,
    }));
    targets
}

pub async fn run(config: VigilConfig, args: WatchArgs) -> Result<()> {
    let targets = merge_targets(&config, &args);
    if targets.is_empty() {
        anyhow::bail!("Nothing to watch. Pass paths to 'vigil watch' or add [[targets]] to the config file.");
    }
    let json = args.json || config.alerts.json;

    let watcher = Watcher::new(config.to_watcher_config());
    let mut ids = Vec::with_capacity(targets.len());
    for target in &targets {
        let id = watcher
            .configure_target_with(&target.path, target.options())
            .with_context(|| format!("Failed to watch {}", target.path.display()))?;
        ids.push(id);
    }

    // Alert channels
    let mut channels: Vec<(SubscriptionId, &'static str)> = Vec::new();
    let mut attach = |channel: Arc<dyn AlertChannel>, name: &'static str| -> Result<()> {
        let id = watcher.subscribe_channel(channel)?;
        channels.push((id, name));
        Ok(())
    };
    if json {
        attach(Arc::new(JsonChannel::stdout()), "json")?;
    } else if config.alerts.console {
        attach(Arc::new(ConsoleChannel::new()), "console")?;
    }
    if config.alerts.log {
        attach(Arc::new(LogChannel), "log")?;
    }

    watcher.start().context("Failed to start watcher")?;
    for id in &ids {
        let Some(target) = watcher.target(*id) else {
            continue;
        };
        let status = watcher.status(*id).unwrap_or(TargetStatus::Idle);
        let scope = if target.recursive { "recursive" } else { "flat" };
        notice(
            json,
            format!("{} {} {}", "Watching".green().bold(), target.root.display(), format!("({scope}, {status})").dimmed()),
        );
    }
    notice(json, "Press Ctrl-C to stop".dimmed());

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("interrupted, stopping");

    // Joining the pipeline blocks; keep the runtime's other workers free
    tokio::task::block_in_place(|| watcher.stop()).context("Failed to stop watcher")?;
    // Let the drain tasks deliver what the final flush published
    tokio::time::sleep(Duration::from_millis(100)).await;

    let drops = watcher.drop_counts();
    for (id, name) in &channels {
        let dropped = drops.iter().find(|(sub, _)| sub == id).map(|(_, n)| *n).unwrap_or(0);
        notice(json, format!("{:<8} {} dropped", name.cyan(), dropped));
    }
    let metrics = watcher.metrics();
    notice(
        json,
        format!(
            "{} raw, {} emitted ({} renames), {} overflows, {} targets lost",
            metrics.raw_events, metrics.emitted_events, metrics.renames_paired, metrics.overflows, metrics.targets_lost
        )
        .dimmed(),
    );
    Ok(())
}

/// Human-facing output; stderr when stdout carries JSON
fn notice(json: bool, message: impl Display) {
    if json {
        eprintln!("{message}");
    } else {
        println!("{message}");
    }
}
