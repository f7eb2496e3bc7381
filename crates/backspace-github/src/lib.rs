//! Publisher adapters for Backspace
//!
//! [`GitHubPublisher`] turns an accepted workspace into a pull request:
//! branch, commit, push with a token-authenticated URL, then open the PR.
//! [`RecordingPublisher`] is the test double.

pub mod git;
pub mod pr;
pub mod publisher;
pub mod repo_url;

pub use git::{GitCommand, GitOutput};
pub use pr::{pr_body, pr_title};
pub use publisher::{GitHubPublisher, PublishRequest, Publisher, RecordedPublish, RecordingPublisher};
pub use repo_url::{parse_github_url, GitHubRepo};
