//! Error types for nixpkgs-review-nix

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while evaluating or building attributes
#[derive(Error, Debug)]
pub enum NixError {
    /// The evaluator exited non-zero. The attribute file is kept for inspection.
    #[error("{command} failed to run, {} was stored for inspection", attr_file.display())]
    Evaluation { command: String, attr_file: PathBuf },

    /// A required executable is not in PATH
    #[error("{tool} not found in PATH{}", hint_suffix(hint))]
    ToolNotFound { tool: String, hint: Option<String> },

    /// A feature was requested on a host that cannot provide it
    #[error("{feature} is only available on {supported}, not on {platform}")]
    PlatformUnsupported {
        feature: String,
        supported: String,
        platform: String,
    },

    /// Nix command execution failed
    #[error("Nix command failed: {0}")]
    CommandFailed(String),

    /// A pre-build filter hook failed or produced garbage
    #[error("pre-build filter {} failed: {reason}", hook.display())]
    Hook { hook: PathBuf, reason: String },

    /// Evaluator output did not match the expected shape
    #[error("Invalid evaluation output: {0}")]
    InvalidEvalOutput(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NixError {
    /// Map a spawn failure of `tool` to [`NixError::ToolNotFound`] when the
    /// executable is missing, keeping every other IO error as is.
    pub(crate) fn from_spawn(tool: &std::path::Path, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            NixError::ToolNotFound {
                tool: tool.display().to_string(),
                hint: None,
            }
        } else {
            NixError::Io(err)
        }
    }
}

fn hint_suffix(hint: &Option<String>) -> String {
    hint.as_deref().map(|h| format!(". {h}")).unwrap_or_default()
}
