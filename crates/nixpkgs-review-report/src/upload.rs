//! Build log upload
//!
//! Logs of failed records are published through a [`LogSink`] and linked
//! from the markdown report. Upload failures are logged and otherwise
//! ignored; they never change the outcome of a review.

use crate::report::{pr_url, Report};
use async_trait::async_trait;
use nixpkgs_review_nix::{BuildLogSource, LogOptions};
use thiserror::Error;
use tracing::{error, info, warn};

/// Bytes of each log kept for upload
pub const UPLOAD_LOG_TAIL: usize = 1024 * 1024;

/// A log upload that did not go through
#[derive(Error, Debug)]
#[error("log upload failed: {0}")]
pub struct LogUploadError(pub String);

/// Somewhere build logs can be published
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Publish `content` as `name` and return its URL
    async fn upload(
        &self,
        name: &str,
        content: &str,
        description: &str,
    ) -> std::result::Result<String, LogUploadError>;
}

impl Report {
    /// Upload the log of every failed record and link it from the report.
    ///
    /// Records without log content are skipped. Uploads run one after another
    /// and a failed upload does not stop the rest.
    pub async fn upload_logs(
        &mut self,
        sink: &dyn LogSink,
        source: &dyn BuildLogSource,
        pr: Option<u64>,
    ) {
        let options = LogOptions {
            tail: Some(UPLOAD_LOG_TAIL),
            strip_colors: true,
        };

        for (system, report) in self.system_reports.iter_mut() {
            for attr in report.failed.iter_mut() {
                let content = attr.log(source, options).await.unwrap_or_default();
                if content.is_empty() {
                    warn!(attr = %attr.name, system = %system, "Log content was empty");
                    continue;
                }

                let description = gist_description(system, attr.build_time(), pr);
                match sink.upload(&attr.name, &content, &description).await {
                    Ok(url) => {
                        info!(
                            attr = %attr.name,
                            system = %system,
                            url = %url,
                            "Uploaded build log"
                        );
                        attr.log_url = Some(url);
                    }
                    Err(e) => {
                        error!(
                            attr = %attr.name,
                            system = %system,
                            error = %e,
                            "Could not upload build log"
                        );
                    }
                }
            }
        }
    }
}

/// Description attached to an uploaded log
pub fn gist_description(
    system: &str,
    build_time: Option<chrono::Duration>,
    pr: Option<u64>,
) -> String {
    let mut description = format!("system: {system}");
    if let Some(build_time) = build_time {
        description.push_str(&format!(" | build_time: {}", natural_delta(build_time)));
    }
    if let Some(pr) = pr {
        description.push_str(&format!(" | {}", pr_url(pr)));
    }
    description
}

/// Coarse human readable duration, e.g. "3 minutes"
pub fn natural_delta(duration: chrono::Duration) -> String {
    let seconds = duration.num_seconds().abs();
    let (count, unit) = match seconds {
        0 => return "a moment".to_string(),
        1..=59 => (seconds, "second"),
        60..=3599 => (seconds / 60, "minute"),
        3600..=86399 => (seconds / 3600, "hour"),
        _ => (seconds / 86400, "day"),
    };
    match (count, unit) {
        (1, "hour") => "an hour".to_string(),
        (1, unit) => format!("a {unit}"),
        (count, unit) => format!("{count} {unit}s"),
    }
}
