//! Configuration command
//!
//! Shows where the config lives, prints an annotated example, and checks a
//! file against the valid ranges.

use crate::config::{self, VigilConfig};
use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigArgs {
    pub path: bool,
    pub example: bool,
    pub check: bool,
    pub init: bool,
}

pub async fn run(explicit: Option<&Path>, args: ConfigArgs) -> Result<()> {
    let location = resolve_path(explicit)?;

    if args.path {
        println!("{}", location.display());
        return Ok(());
    }
    if args.example {
        print!("{}", config::example_config());
        return Ok(());
    }
    if args.init {
        return run_init(&location);
    }
    if args.check {
        return run_check(explicit, &location);
    }
    run_list(explicit, &location)
}

fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => config::config_file_path().context("Could not determine config file path"),
    }
}

fn run_init(location: &Path) -> Result<()> {
    if location.exists() {
        anyhow::bail!("Config file already exists at {}", location.display());
    }
    if let Some(parent) = location.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(location, config::example_config())
        .with_context(|| format!("Failed to write {}", location.display()))?;
    println!("{} {}", "Wrote".green(), location.display());
    Ok(())
}

fn run_check(explicit: Option<&Path>, location: &Path) -> Result<()> {
    let config = config::load(explicit)?;
    config.validate().context("Invalid configuration")?;
    let origin = if explicit.is_some() || location.exists() {
        location.display().to_string()
    } else {
        "built-in defaults".to_string()
    };
    println!(
        "{} {} ({} targets)",
        "✓".green(),
        origin,
        config.targets.len()
    );
    Ok(())
}

/// Print the effective configuration
fn run_list(explicit: Option<&Path>, location: &Path) -> Result<()> {
    let config = config::load(explicit)?;

    println!("{}", "Vigil Configuration".bold());
    println!("{}: {}\n", "Location".dimmed(), location.display().dimmed());
    print_watcher(&config);

    println!("\n{}", "[alerts]".yellow());
    println!("  {} = {}", "console".cyan(), config.alerts.console);
    println!("  {} = {}", "json".cyan(), config.alerts.json);
    println!("  {} = {}", "log".cyan(), config.alerts.log);

    for target in &config.targets {
        println!("\n{}", "[[targets]]".yellow());
        println!("  {} = {}", "path".cyan(), target.path.display());
        println!("  {} = {}", "recursive".cyan(), target.recursive);
        println!("  {} = {:?}", "exclude".cyan(), target.exclude);
        println!("  {} = {}", "use_gitignore".cyan(), target.use_gitignore);
    }

    println!("\n{}", "Valid Ranges:".bold());
    println!("  debounce_interval_ms: 10-10000");
    println!("  debounce_hard_cap_ms: debounce_interval_ms-60000");
    println!("  polling_interval_ms: 100-3600000");
    println!("  consumer_queue_capacity: 1-1,000,000");
    println!("  max_rescan_attempts: 1-10");

    Ok(())
}

fn print_watcher(config: &VigilConfig) {
    let w = &config.watcher;
    println!("{}", "[watcher]".yellow());
    println!(
        "  {} = {} {}",
        "debounce_interval_ms".cyan(),
        w.debounce_interval_ms,
        format!("({}ms quiet period)", w.debounce_interval_ms).dimmed()
    );
    println!(
        "  {} = {} {}",
        "debounce_hard_cap_ms".cyan(),
        w.debounce_hard_cap_ms,
        format!("({:.1}s max latency)", w.debounce_hard_cap_ms as f64 / 1000.0).dimmed()
    );
    println!("  {} = {}", "polling_interval_ms".cyan(), w.polling_interval_ms);
    println!("  {} = {}", "consumer_queue_capacity".cyan(), w.consumer_queue_capacity);
    println!("  {} = {}", "event_queue_capacity".cyan(), w.event_queue_capacity);
    println!("  {} = {}", "hash_contents".cyan(), w.hash_contents);
    println!("  {} = {}", "max_rescan_attempts".cyan(), w.max_rescan_attempts);
}
