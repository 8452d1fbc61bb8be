//! nixpkgs-review-report: classification and reporting
//!
//! Turns the annotated records of a review into outcome buckets per system
//! and renders them:
//!
//! - `report.md`: collapsible lists per system and bucket
//! - `report.json`: bucket name lists with sorted keys
//! - `results/`, `failed_results/`: links to output paths
//! - `logs/`: build logs of failed records
//!
//! Outputs must be verified with [`verify_outputs`] before a [`Report`] is
//! created; unverified records classify as failed.

pub mod classify;
pub mod error;
pub mod markdown;
pub mod materialize;
pub mod ordering;
pub mod report;
pub mod upload;
pub mod verify;

pub use classify::{classify, Bucket, SystemReport, SystemReportDocument};
pub use error::ReportError;
pub use markdown::{bucket_label, html_pkgs_section};
pub use materialize::{write_error_logs, write_result_links};
pub use ordering::{order_systems, system_order_key};
pub use report::{pr_url, Checkout, Report, ReportDocument, ReportOptions};
pub use upload::{gist_description, natural_delta, LogSink, LogUploadError, UPLOAD_LOG_TAIL};
pub use verify::verify_outputs;

/// Result type for report operations
pub type Result<T> = std::result::Result<T, ReportError>;
