//! Wrapper around the `vigil` binary with timing and assertions

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

pub struct VigilCommand {
    binary_path: PathBuf,
    working_dir: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl VigilCommand {
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        Self {
            binary_path: PathBuf::from(env!("CARGO_BIN_EXE_vigil")),
            working_dir: working_dir.as_ref().to_path_buf(),
            args: Vec::new(),
            // Keep the caller's RUST_LOG out of the output under test
            env: vec![("RUST_LOG".into(), "warn".into())],
        }
    }

    pub fn args(&mut self, args: &[&str]) -> &mut Self {
        self.args.extend(args.iter().map(|s| s.to_string()));
        self
    }

    pub fn execute(&self) -> Result<CommandResult> {
        let start = Instant::now();
        let output = Command::new(&self.binary_path)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .output()
            .context("Failed to execute vigil")?;

        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            duration: start.elapsed(),
        })
    }

    pub fn assert_success(&self) -> Result<CommandResult> {
        let result = self.execute()?;
        if !result.success() {
            anyhow::bail!(
                "Command failed (exit code: {}):\nArgs: {:?}\nStdout: {}\nStderr: {}",
                result.exit_code,
                self.args,
                result.stdout,
                result.stderr
            );
        }
        Ok(result)
    }

    pub fn assert_failure(&self) -> Result<CommandResult> {
        let result = self.execute()?;
        if result.success() {
            anyhow::bail!(
                "Command should have failed but succeeded:\nArgs: {:?}\nStdout: {}",
                self.args,
                result.stdout
            );
        }
        Ok(result)
    }
}

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// `vigil!(dir, "config", "--check")`
#[macro_export]
macro_rules! vigil {
    ($dir:expr, $($arg:expr),*) => {{
        let mut cmd = $crate::common::cli::VigilCommand::new($dir);
        cmd.args(&[$($arg),*]);
        cmd
    }};
}
