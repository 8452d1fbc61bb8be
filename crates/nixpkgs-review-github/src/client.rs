//! GitHub REST client
//!
//! Only what a review needs: hosting build logs as gists. Requests that fail
//! with a retryable status are repeated with exponential backoff until the
//! configured time budget is spent.

use crate::error::GithubError;
use crate::Result;
use async_trait::async_trait;
use nixpkgs_review_report::{LogSink, LogUploadError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default API endpoint
pub const GITHUB_API: &str = "https://api.github.com/";

/// Environment variable holding the API token
pub const GITHUB_TOKEN_ENV: &str = "GITHUB_TOKEN";

/// GitHub client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GithubConfig {
    /// API token; anonymous requests are heavily rate limited
    pub token: Option<String>,
    /// API base URL
    pub api_base: String,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Give up retrying once this much time has passed
    pub max_elapsed: Duration,
}

impl Default for GithubConfig {
    fn default() -> Self {
        GithubConfig {
            token: std::env::var(GITHUB_TOKEN_ENV).ok().filter(|t| !t.is_empty()),
            api_base: GITHUB_API.to_string(),
            initial_backoff: Duration::from_secs(1),
            max_elapsed: Duration::from_secs(60),
        }
    }
}

impl GithubConfig {
    /// Config from environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Set the API token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Talk to a different API endpoint
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

/// A created gist
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Gist {
    pub html_url: String,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Serialize)]
struct GistFile<'a> {
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct NewGist<'a> {
    files: BTreeMap<&'a str, GistFile<'a>>,
    public: bool,
    description: &'a str,
}

/// Client for one GitHub repository
pub struct GithubClient {
    config: GithubConfig,
    owner: String,
    repo: String,
    http_client: reqwest::Client,
}

impl GithubClient {
    /// Create a client for `remote`, e.g. `https://github.com/NixOS/nixpkgs`
    pub fn new(config: GithubConfig, remote: &str) -> Result<Self> {
        let (owner, repo) = parse_remote(remote)?;
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("nixpkgs-review/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(GithubClient {
            config,
            owner,
            repo,
            http_client,
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    /// Web URL of pull request `pr`
    pub fn pr_url(&self, pr: u64) -> String {
        format!("https://github.com/{}/{}/pull/{pr}", self.owner, self.repo)
    }

    /// Upload `content` as a public gist with a single file `name`
    pub async fn upload_gist(&self, name: &str, content: &str, description: &str) -> Result<Gist> {
        let mut files = BTreeMap::new();
        files.insert(name, GistFile { content });
        let body = serde_json::to_value(NewGist {
            files,
            public: true,
            description,
        })?;

        let response = self.post("gists", &body).await?;
        Ok(serde_json::from_value(response)?)
    }

    /// POST `body` to `path`, retrying with exponential backoff
    pub async fn post(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let started = Instant::now();
        let mut delay = self.config.initial_backoff;
        let mut attempt = 1u32;

        loop {
            match self.post_once(path, body).await {
                Ok(value) => return Ok(value),
                Err(e)
                    if e.is_retryable() && started.elapsed() + delay <= self.config.max_elapsed =>
                {
                    warn!(
                        path,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying GitHub request"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn post_once(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let url = format!(
            "{}/{}",
            self.config.api_base.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let mut request = self
            .http_client
            .post(&url)
            .header("Accept", "application/vnd.github.v3+json")
            .json(body);
        if let Some(token) = &self.config.token {
            request = request.header("Authorization", format!("token {token}"));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(url = %url, status = status.as_u16(), body = %body, "GitHub request failed");
            return Err(GithubError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl LogSink for GithubClient {
    async fn upload(
        &self,
        name: &str,
        content: &str,
        description: &str,
    ) -> std::result::Result<String, LogUploadError> {
        self.upload_gist(name, content, description)
            .await
            .map(|gist| gist.html_url)
            .map_err(|e| LogUploadError(e.to_string()))
    }
}

/// Owner and repository of a GitHub remote URL
pub fn parse_remote(remote: &str) -> Result<(String, String)> {
    static REMOTE: OnceLock<Regex> = OnceLock::new();
    let re = REMOTE.get_or_init(|| {
        Regex::new(r"^https?://github\.com/(\w+)/(\w+)").expect("remote regex is valid")
    });

    re.captures(remote)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .ok_or_else(|| GithubError::UnparsableRemote(remote.to_string()))
}
