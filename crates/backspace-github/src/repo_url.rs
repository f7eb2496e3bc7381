//! GitHub repository URL parsing

use regex::Regex;
use std::sync::OnceLock;

/// Owner and name of a GitHub repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitHubRepo {
    pub owner: String,
    pub name: String,
}

impl GitHubRepo {
    pub fn https_url(&self) -> String {
        format!("https://github.com/{}/{}.git", self.owner, self.name)
    }

    pub fn ssh_url(&self) -> String {
        format!("git@github.com:{}/{}.git", self.owner, self.name)
    }

    /// HTTPS URL carrying an access token, for pushing
    pub fn authenticated_url(&self, token: &str) -> String {
        format!(
            "https://x-access-token:{}@github.com/{}/{}.git",
            token, self.owner, self.name
        )
    }
}

impl std::fmt::Display for GitHubRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

fn patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"^https?://(?:www\.)?github\.com/([^/\s]+)/([^/\s]+?)(?:\.git)?/?$",
            r"^git@github\.com:([^/\s]+)/([^/\s]+?)(?:\.git)?$",
            r"^ssh://git@github\.com/([^/\s]+)/([^/\s]+?)(?:\.git)?/?$",
            r"^github\.com/([^/\s]+)/([^/\s]+?)(?:\.git)?/?$",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Parse https, ssh and bare `github.com/owner/repo` forms
pub fn parse_github_url(url: &str) -> Option<GitHubRepo> {
    let url = url.trim();
    patterns().iter().find_map(|re| {
        re.captures(url).map(|caps| GitHubRepo {
            owner: caps[1].to_string(),
            name: caps[2].to_string(),
        })
    })
}
