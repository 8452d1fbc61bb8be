//! nixpkgs-review-github: GitHub API access
//!
//! Hosts build logs of failed packages as gists, so review reports can link
//! to them. [`GithubClient`] implements the report layer's
//! [`nixpkgs_review_report::LogSink`].

pub mod client;
pub mod error;

pub use client::{parse_remote, Gist, GithubClient, GithubConfig, GITHUB_API, GITHUB_TOKEN_ENV};
pub use error::GithubError;

/// Result type for GitHub operations
pub type Result<T> = std::result::Result<T, GithubError>;
