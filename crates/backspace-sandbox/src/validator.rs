//! Validator - runs check commands against a workspace
//!
//! Commands run sequentially through `sh -c` in the workspace root, each in
//! its own process group so a timeout or cancellation kills the whole tree.
//! A timed-out command is recorded as failed and the remaining commands still
//! run. Only an unreadable workspace or a cancellation ends validation early.

use backspace_core::{BackspaceError, CommandOutcome, Result, ValidationCommand, ValidationResult};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Per-stream cap on captured output
pub const MAX_OUTPUT_CHARS: usize = 4000;

/// Runs validation commands with per-command timeouts
#[derive(Debug, Clone)]
pub struct Validator {
    default_timeout: Duration,
    shell: String,
}

impl Validator {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            shell: "sh".to_string(),
        }
    }

    /// Run every command in order
    ///
    /// `on_command` is called as each command finishes. Returns
    /// `Err(Cancelled)` if `cancel` fires, after the running command has been
    /// killed, and `Err(Workspace)` if the workspace cannot be read.
    pub async fn validate<F>(
        &self,
        root: &Path,
        commands: &[ValidationCommand],
        cancel: &CancellationToken,
        mut on_command: F,
    ) -> Result<ValidationResult>
    where
        F: FnMut(&CommandOutcome) + Send,
    {
        ensure_readable(root).await?;

        let mut outcomes = Vec::with_capacity(commands.len());
        for command in commands {
            let outcome = self.run_one(root, command, cancel).await?;
            on_command(&outcome);
            outcomes.push(outcome);
        }

        let passed = outcomes.iter().all(|o| o.passed);
        info!(
            "Validation {}: {}/{} commands passed",
            if passed { "passed" } else { "failed" },
            outcomes.iter().filter(|o| o.passed).count(),
            outcomes.len()
        );
        Ok(ValidationResult {
            passed,
            commands: outcomes,
        })
    }

    #[instrument(skip(self, root, cancel), fields(name = %command.name))]
    async fn run_one(
        &self,
        root: &Path,
        command: &ValidationCommand,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome> {
        let timeout = command.timeout(self.default_timeout);
        let started = Instant::now();
        debug!("Running `{}` (timeout {:?})", command.command, timeout);

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&command.command)
            .current_dir(root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                ensure_readable(root).await?;
                return Ok(CommandOutcome {
                    name: command.name.clone(),
                    command: command.command.clone(),
                    passed: false,
                    exit_code: None,
                    timed_out: false,
                    stdout: String::new(),
                    stderr: format!("Failed to start: {}", e),
                    duration_ms: elapsed_ms(started),
                });
            }
        };
        let pid = child.id();

        // Dropping the wait future drops the child, which kills the shell
        // (kill_on_drop); kill_process_group takes care of its descendants
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Cancelled while running `{}`", command.command);
                kill_process_group(pid).await;
                Err(BackspaceError::Cancelled)
            }
            waited = tokio::time::timeout(timeout, child.wait_with_output()) => match waited {
                Ok(Ok(output)) => Ok(CommandOutcome {
                    name: command.name.clone(),
                    command: command.command.clone(),
                    passed: output.status.success(),
                    exit_code: output.status.code(),
                    timed_out: false,
                    stdout: truncate(&String::from_utf8_lossy(&output.stdout)),
                    stderr: truncate(&String::from_utf8_lossy(&output.stderr)),
                    duration_ms: elapsed_ms(started),
                }),
                Ok(Err(e)) => Err(BackspaceError::Io(e)),
                Err(_) => {
                    warn!("`{}` timed out after {:?}", command.command, timeout);
                    kill_process_group(pid).await;
                    Ok(CommandOutcome {
                        name: command.name.clone(),
                        command: command.command.clone(),
                        passed: false,
                        exit_code: None,
                        timed_out: true,
                        stdout: String::new(),
                        stderr: format!("Timeout: command exceeded {}s and was killed", timeout.as_secs_f64()),
                        duration_ms: elapsed_ms(started),
                    })
                }
            }
        }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

async fn ensure_readable(root: &Path) -> Result<()> {
    tokio::fs::read_dir(root).await.map(|_| ()).map_err(|e| {
        BackspaceError::Workspace(format!("Workspace {} unreadable: {}", root.display(), e))
    })
}

#[cfg(unix)]
async fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    let status = Command::new("kill")
        .args(["-s", "KILL", "--", &format!("-{}", pid)])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = status {
        warn!("Failed to kill process group {}: {}", pid, e);
    }
}

#[cfg(not(unix))]
async fn kill_process_group(_pid: Option<u32>) {}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn truncate(s: &str) -> String {
    let s = s.trim();
    match s.char_indices().nth(MAX_OUTPUT_CHARS) {
        Some((idx, _)) => format!("{}...[truncated]", &s[..idx]),
        None => s.to_string(),
    }
}

/// Default commands for the project type found in `root`
pub fn detect_commands(root: &Path) -> Vec<ValidationCommand> {
    if root.join("Cargo.toml").exists() {
        vec![
            ValidationCommand::new("build", "cargo check"),
            ValidationCommand::new("tests", "cargo test"),
        ]
    } else if root.join("pyproject.toml").exists()
        || root.join("requirements.txt").exists()
        || root.join("setup.py").exists()
    {
        vec![ValidationCommand::new("syntax", "python -m compileall -q .")]
    } else if root.join("package.json").exists() {
        vec![ValidationCommand::new("tests", "npm test")]
    } else {
        Vec::new()
    }
}

/// Format failed commands as feedback for the next generation attempt
pub fn format_diagnostics(result: &ValidationResult) -> String {
    if result.passed {
        return "All checks passed!\n".to_string();
    }

    let mut output = String::from("## Validation Failures\n\n");
    output.push_str("The following checks failed. Fix these issues:\n\n");

    for failed in result.failed() {
        let status = if failed.timed_out {
            "timed out".to_string()
        } else {
            match failed.exit_code {
                Some(code) => format!("exit code {}", code),
                None => "killed".to_string(),
            }
        };
        output.push_str(&format!("### {} (`{}`, {})\n", failed.name, failed.command, status));
        output.push_str("```\n");
        if !failed.stdout.is_empty() {
            output.push_str(&failed.stdout);
            output.push('\n');
        }
        if !failed.stderr.is_empty() {
            output.push_str(&failed.stderr);
            output.push('\n');
        }
        output.push_str("```\n\n");
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn run(root: &Path, commands: &[ValidationCommand]) -> Result<ValidationResult> {
        Validator::new(Duration::from_secs(10))
            .validate(root, commands, &CancellationToken::new(), |_| {})
            .await
    }

    #[tokio::test]
    async fn test_all_pass() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("marker"), "present").unwrap();

        let result = run(
            temp.path(),
            &[
                ValidationCommand::new("cat", "cat marker"),
                ValidationCommand::shell("true"),
            ],
        )
        .await
        .unwrap();

        assert!(result.passed);
        assert_eq!(result.exit_codes(), vec![Some(0), Some(0)]);
        assert_eq!(result.commands[0].stdout, "present");
    }

    #[tokio::test]
    async fn test_failure_keeps_running_later_commands() {
        let temp = TempDir::new().unwrap();
        let result = run(
            temp.path(),
            &[
                ValidationCommand::new("tests", "echo 'ImportError: missing import' >&2; exit 3"),
                ValidationCommand::new("after", "echo still-ran"),
            ],
        )
        .await
        .unwrap();

        assert!(!result.passed);
        assert_eq!(result.exit_codes(), vec![Some(3), Some(0)]);
        assert_eq!(result.commands[1].stdout, "still-ran");

        let diagnostics = format_diagnostics(&result);
        assert!(diagnostics.contains("missing import"));
        assert!(diagnostics.contains("exit code 3"));
        assert!(!diagnostics.contains("still-ran"));
    }

    #[tokio::test]
    async fn test_timeout_is_recorded_and_validation_continues() {
        let temp = TempDir::new().unwrap();
        let started = Instant::now();
        let result = run(
            temp.path(),
            &[
                ValidationCommand::new("hang", "sleep 30").with_timeout(Duration::from_secs(1)),
                ValidationCommand::shell("true"),
            ],
        )
        .await
        .unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!result.passed);
        assert!(result.commands[0].timed_out);
        assert!(result.commands[0].stderr.starts_with("Timeout"));
        assert!(result.commands[1].passed);
    }

    #[tokio::test]
    async fn test_cancellation_kills_running_command() {
        let temp = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = Validator::new(Duration::from_secs(60))
            .validate(
                temp.path(),
                &[ValidationCommand::shell("sleep 30")],
                &cancel,
                |_| {},
            )
            .await;

        assert!(matches!(result, Err(BackspaceError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_unreadable_workspace_fails_fast() {
        let temp = TempDir::new().unwrap();
        let gone = temp.path().join("gone");
        let result = run(&gone, &[ValidationCommand::shell("true")]).await;
        assert!(matches!(result, Err(BackspaceError::Workspace(_))));
    }

    #[tokio::test]
    async fn test_on_command_sees_each_result() {
        let temp = TempDir::new().unwrap();
        let mut seen = Vec::new();
        Validator::new(Duration::from_secs(10))
            .validate(
                temp.path(),
                &[ValidationCommand::shell("true"), ValidationCommand::shell("false")],
                &CancellationToken::new(),
                |o| seen.push((o.name.clone(), o.passed)),
            )
            .await
            .unwrap();
        assert_eq!(
            seen,
            vec![("true".to_string(), true), ("false".to_string(), false)]
        );
    }

    #[test]
    fn test_truncate_long_output() {
        let long = "é".repeat(MAX_OUTPUT_CHARS + 10);
        let out = truncate(&long);
        assert!(out.ends_with("...[truncated]"));
        assert_eq!(out.chars().count(), MAX_OUTPUT_CHARS + "...[truncated]".len());
    }

    #[test]
    fn test_detect_commands() {
        let temp = TempDir::new().unwrap();
        assert!(detect_commands(temp.path()).is_empty());

        std::fs::write(temp.path().join("requirements.txt"), "flask\n").unwrap();
        let cmds = detect_commands(temp.path());
        assert_eq!(cmds[0].command, "python -m compileall -q .");

        std::fs::write(temp.path().join("Cargo.toml"), "[package]\n").unwrap();
        let cmds = detect_commands(temp.path());
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[1].command, "cargo test");
    }
}
