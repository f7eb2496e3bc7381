//! Git command execution inside a workspace

use backspace_core::{BackspaceError, Result};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, instrument};

/// Output from a git command
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl From<Output> for GitOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
        }
    }
}

/// Runs git in one working tree
#[derive(Debug, Clone)]
pub struct GitCommand {
    repo_root: PathBuf,
    /// Replaced by `***` in logs and errors
    secret: Option<String>,
}

impl GitCommand {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            secret: None,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    fn redact(&self, text: &str) -> String {
        match &self.secret {
            Some(secret) if !secret.is_empty() => text.replace(secret.as_str(), "***"),
            _ => text.to_string(),
        }
    }

    #[instrument(skip(self, args), fields(repo = %self.repo_root.display()))]
    pub async fn exec(&self, args: &[&str]) -> Result<GitOutput> {
        debug!("Executing git {}", self.redact(&args.join(" ")));

        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BackspaceError::Publish(format!("Failed to execute git: {}", e)))?;

        let mut git_output = GitOutput::from(output);
        git_output.stderr = self.redact(&git_output.stderr);
        if !git_output.success {
            debug!("git command failed: {}", git_output.stderr);
        }
        Ok(git_output)
    }

    /// Like [`exec`](Self::exec) but a non-zero exit is an error
    pub async fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.exec(args).await?;
        if output.success {
            Ok(output.stdout.trim().to_string())
        } else {
            Err(BackspaceError::Publish(format!(
                "git {} failed: {}",
                self.redact(args.first().copied().unwrap_or_default()),
                output.stderr.trim()
            )))
        }
    }
}
