//! Error types for nixpkgs-review-report

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while writing a report
#[derive(Error, Debug)]
pub enum ReportError {
    /// A report artifact could not be written
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Unknown checkout mode
    #[error("invalid checkout mode '{0}', expected 'merge' or 'commit'")]
    InvalidCheckout(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ReportError {
    pub(crate) fn write(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| ReportError::Write { path, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_error_names_path() {
        let err = ReportError::write("/out/report.md")(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        let msg = err.to_string();
        assert!(msg.contains("/out/report.md"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn test_invalid_checkout_display() {
        let err = ReportError::InvalidCheckout("rebase".to_string());
        assert_eq!(
            err.to_string(),
            "invalid checkout mode 'rebase', expected 'merge' or 'commit'"
        );
    }
}
