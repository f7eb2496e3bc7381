//! Publisher capability and the GitHub implementation

use async_trait::async_trait;
use backspace_core::config::GitHubConfig;
use backspace_core::{
    validate_branch_name, AppliedDiff, BackspaceError, JobId, PublishedReference, RepositoryRef,
    Result,
};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::git::GitCommand;
use crate::pr::{pr_body, pr_title};
use crate::repo_url::{parse_github_url, GitHubRepo};

const USER_AGENT: &str = "backspace";
const COMMIT_AUTHOR: &str = "Backspace";
const COMMIT_EMAIL: &str = "backspace@users.noreply.github.com";
const SLUG_MAX_LEN: usize = 40;

/// Everything needed to publish one accepted change
#[derive(Debug, Clone)]
pub struct PublishRequest<'a> {
    pub job_id: JobId,
    pub repository: &'a RepositoryRef,
    /// The diff that passed validation
    pub diff: &'a AppliedDiff,
    pub description: &'a str,
    /// Workspace holding the applied change
    pub workspace_root: &'a Path,
    /// Branch to create; derived from the job id when absent
    pub branch: Option<&'a str>,
}

impl PublishRequest<'_> {
    /// `backspace/<short id>-<slug of the description>` unless a branch was given
    pub fn branch_name(&self) -> String {
        if let Some(branch) = self.branch {
            return branch.to_string();
        }
        match slug(self.description) {
            slug if slug.is_empty() => format!("backspace/{}", self.job_id.short()),
            slug => format!("backspace/{}-{}", self.job_id.short(), slug),
        }
    }

    /// Workspace-relative paths the accepted diff touched
    pub fn changed_paths(&self) -> Vec<&str> {
        self.diff.files.iter().map(|f| f.path.as_str()).collect()
    }
}

/// Lowercase ASCII words of `text` joined by `-`, cut at a word boundary
fn slug(text: &str) -> String {
    let mut slug = String::new();
    for word in text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        if slug.len() + word.len() + 1 > SLUG_MAX_LEN {
            break;
        }
        if !slug.is_empty() {
            slug.push('-');
        }
        slug.push_str(&word.to_ascii_lowercase());
    }
    slug
}

/// Pushes an accepted diff upstream
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, request: &PublishRequest<'_>) -> Result<PublishedReference>;
}

#[derive(Debug, Deserialize)]
struct PullRequestResponse {
    html_url: String,
}

/// Commits in the workspace, pushes a branch and opens a pull request
#[derive(Debug, Clone)]
pub struct GitHubPublisher {
    client: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl GitHubPublisher {
    pub fn new(token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: "https://api.github.com".to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
        }
    }

    /// Read the token from the configured environment variable
    pub fn from_config(config: &GitHubConfig) -> Self {
        let token = std::env::var(&config.token_env).ok();
        if token.is_none() {
            warn!("{} is not set; publishing will fail", config.token_env);
        }
        Self::new(token).with_api_base(&config.api_base)
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    fn token(&self) -> Result<&str> {
        self.token
            .as_deref()
            .ok_or_else(|| BackspaceError::Auth("GitHub token not configured".to_string()))
    }

    /// Refuse names git would read as options or not accept as a branch
    pub async fn check_branch(&self, git: &GitCommand, branch: &str) -> Result<()> {
        validate_branch_name(branch).map_err(|reason| {
            BackspaceError::Publish(format!("Invalid branch name {:?}: {}", branch, reason))
        })?;
        let output = git.exec(&["check-ref-format", "--branch", branch]).await?;
        if !output.success {
            return Err(BackspaceError::Publish(format!(
                "Invalid branch name {:?}: {}",
                branch,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Create `branch` from the current HEAD and commit exactly `paths`
    ///
    /// Anything else in the worktree (build output, caches written by
    /// validation commands) stays out of the commit. Returns the branch the
    /// work started from (if any) and the new commit.
    #[instrument(skip(self, git, paths), fields(repo = %git.repo_root().display()))]
    pub async fn commit_changes(
        &self,
        git: &GitCommand,
        branch: &str,
        paths: &[&str],
        message: &str,
    ) -> Result<(Option<String>, String)> {
        if paths.is_empty() {
            return Err(BackspaceError::Publish("No changes to commit".to_string()));
        }
        self.check_branch(git, branch).await?;

        let base = git
            .run(&["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .ok()
            .filter(|b| b != "HEAD");

        git.run(&["checkout", "--quiet", "-B", branch]).await?;

        // -f: the diff is explicit, even for paths .gitignore would skip
        let mut add = vec!["add", "-A", "-f", "--"];
        add.extend_from_slice(paths);
        git.run(&add).await?;

        let staged = git.run(&["diff", "--cached", "--name-only"]).await?;
        if staged.is_empty() {
            return Err(BackspaceError::Publish("No changes to commit".to_string()));
        }

        let name = format!("user.name={}", COMMIT_AUTHOR);
        let email = format!("user.email={}", COMMIT_EMAIL);
        git.run(&["-c", &name, "-c", &email, "commit", "--quiet", "-m", message])
            .await?;
        let commit = git.run(&["rev-parse", "HEAD"]).await?;
        info!(
            "Committed {} ({} path(s)) on {}",
            &commit[..commit.len().min(8)],
            paths.len(),
            branch
        );

        Ok((base, commit))
    }

    /// Open a pull request, trying each base branch in turn on HTTP 422
    #[instrument(skip(self, body), fields(repo = %repo))]
    pub async fn create_pull_request(
        &self,
        repo: &GitHubRepo,
        head: &str,
        title: &str,
        body: &str,
        bases: &[String],
    ) -> Result<String> {
        let token = self.token()?;
        let url = format!("{}/repos/{}/{}/pulls", self.api_base, repo.owner, repo.name);

        for base in bases {
            let response = self
                .client
                .post(&url)
                .bearer_auth(token)
                .header("Accept", "application/vnd.github+json")
                .header("User-Agent", USER_AGENT)
                .timeout(Duration::from_secs(30))
                .json(&json!({
                    "title": title,
                    "body": body,
                    "head": head,
                    "base": base,
                }))
                .send()
                .await
                .map_err(|e| BackspaceError::Publish(format!("PR request failed: {}", e)))?;

            let status = response.status();
            if status.as_u16() == 422 {
                let message = response.text().await.unwrap_or_default();
                warn!("Could not open PR against '{}': {}", base, message);
                continue;
            }
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(BackspaceError::Publish(format!(
                    "GitHub API error {}: {}",
                    status, message
                )));
            }

            let pr: PullRequestResponse = response
                .json()
                .await
                .map_err(|e| BackspaceError::Publish(format!("Invalid PR response: {}", e)))?;
            info!("Pull request created: {}", pr.html_url);
            return Ok(pr.html_url);
        }

        Err(BackspaceError::Publish(format!(
            "Failed to create PR against any of: {}",
            bases.join(", ")
        )))
    }
}

/// Candidate base branches: the cloned branch first, then main, then master
fn base_candidates(detected: Option<String>) -> Vec<String> {
    let mut bases = Vec::new();
    for candidate in detected
        .into_iter()
        .chain(["main".to_string(), "master".to_string()])
    {
        if !bases.contains(&candidate) {
            bases.push(candidate);
        }
    }
    bases
}

#[async_trait]
impl Publisher for GitHubPublisher {
    async fn publish(&self, request: &PublishRequest<'_>) -> Result<PublishedReference> {
        let url = match request.repository {
            RepositoryRef::Remote { url } => url,
            RepositoryRef::Local { path } => {
                return Err(BackspaceError::Publish(format!(
                    "{} is a local directory; only GitHub repositories can be published",
                    path.display()
                )))
            }
        };
        let repo = parse_github_url(url)
            .ok_or_else(|| BackspaceError::Publish(format!("Not a GitHub URL: {}", url)))?;
        let token = self.token()?;

        let git = GitCommand::new(request.workspace_root).with_secret(token);
        let branch = request.branch_name();
        let message = format!("backspace: {}", request.description);
        let paths = request.changed_paths();
        let (base, commit) = self
            .commit_changes(&git, &branch, &paths, &message)
            .await?;

        let remote = repo.authenticated_url(token);
        let refspec = format!("HEAD:refs/heads/{}", branch);
        git.run(&["push", "--quiet", &remote, &refspec]).await?;
        info!("Pushed {} to {}", branch, repo);

        let title = pr_title(request.description, &request.diff.files);
        let body = pr_body(request.description, request.diff);
        let pr_url = self
            .create_pull_request(&repo, &branch, &title, &body, &base_candidates(base))
            .await?;

        Ok(PublishedReference {
            url: pr_url,
            branch: Some(branch),
            commit: Some(commit),
        })
    }
}

/// A publish call as [`RecordingPublisher`] saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPublish {
    pub job_id: JobId,
    pub diff: AppliedDiff,
    pub description: String,
    pub branch: String,
}

/// Publisher double that records calls and returns a fixed result
#[derive(Debug)]
pub struct RecordingPublisher {
    failure: Option<String>,
    delay: Option<Duration>,
    calls: Mutex<Vec<RecordedPublish>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self {
            failure: None,
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fail every call with this message
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::new()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<RecordedPublish> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for RecordingPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, request: &PublishRequest<'_>) -> Result<PublishedReference> {
        let branch = request.branch_name();
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedPublish {
                job_id: request.job_id,
                diff: request.diff.clone(),
                description: request.description.to_string(),
                branch: branch.clone(),
            });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.failure {
            Some(message) => Err(BackspaceError::Publish(message.clone())),
            None => Ok(PublishedReference {
                url: format!("https://example.test/pulls/{}", request.job_id.short()),
                branch: Some(branch),
                commit: None,
            }),
        }
    }
}
