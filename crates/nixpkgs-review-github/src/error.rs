//! Error types for nixpkgs-review-github

use thiserror::Error;

/// Errors that can occur while talking to the GitHub API
#[derive(Error, Debug)]
pub enum GithubError {
    /// The API answered with an error status
    #[error("GitHub API returned {status}: {body}")]
    Http { status: u16, body: String },

    /// The request did not complete
    #[error("GitHub request failed: {0}")]
    Transport(String),

    /// Response body was not the expected JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The remote URL does not name a GitHub repository
    #[error("Unparsable remote: {0}")]
    UnparsableRemote(String),
}

impl GithubError {
    /// Whether repeating the request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            GithubError::Http { status, .. } => {
                matches!(status, 403 | 429) || (500..600).contains(status)
            }
            GithubError::Transport(_) => true,
            GithubError::Json(_) | GithubError::UnparsableRemote(_) => false,
        }
    }
}

impl From<reqwest::Error> for GithubError {
    fn from(err: reqwest::Error) -> Self {
        GithubError::Transport(err.to_string())
    }
}
