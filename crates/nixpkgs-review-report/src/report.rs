//! Review report
//!
//! [`Report`] classifies the records of every system and renders them as
//! markdown, as a structured JSON document and as a console summary.

use crate::classify::{Bucket, SystemReport, SystemReportDocument};
use crate::error::ReportError;
use crate::markdown::{bucket_label, html_pkgs_section, MARKDOWN_ORDER};
use crate::materialize::{write_error_logs, write_result_links};
use crate::ordering::order_systems;
use crate::Result;
use nixpkgs_review_nix::{AttrsPerSystem, BuildLogSource, LogOptions, System};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Extra nixpkgs config value meaning "no extra config"
const EMPTY_NIXPKGS_CONFIG: &str = "{ }";

/// How the pull request was checked out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Checkout {
    /// The pull request merged into its base branch
    #[default]
    Merge,
    /// The pull request head commit
    Commit,
}

impl fmt::Display for Checkout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checkout::Merge => write!(f, "merge"),
            Checkout::Commit => write!(f, "commit"),
        }
    }
}

impl FromStr for Checkout {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "merge" => Ok(Checkout::Merge),
            "commit" => Ok(Checkout::Commit),
            other => Err(ReportError::InvalidCheckout(other.to_string())),
        }
    }
}

/// Report settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportOptions {
    /// Render the markdown title and reproduction command
    pub show_header: bool,
    pub checkout: Checkout,
    /// Extra nixpkgs config the review ran with
    pub extra_nixpkgs_config: Option<String>,
    /// Maximum number of entries per markdown list
    pub display_limit: Option<usize>,
    /// Keep only the last bytes of each written error log
    pub error_log_tail: Option<usize>,
}

impl Default for ReportOptions {
    fn default() -> Self {
        ReportOptions {
            show_header: true,
            checkout: Checkout::Merge,
            extra_nixpkgs_config: None,
            display_limit: None,
            error_log_tail: None,
        }
    }
}

/// The structured report document, `report.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportDocument {
    pub checkout: Checkout,
    #[serde(rename = "extra-nixpkgs-config")]
    pub extra_nixpkgs_config: Option<String>,
    pub pr: Option<u64>,
    pub result: BTreeMap<System, SystemReportDocument>,
    pub systems: Vec<System>,
}

impl ReportDocument {
    /// Parse a previously written document
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Render with sorted keys and four space indentation
    pub fn to_json(&self) -> Result<String> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut ser)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Classified outcome of a review across all systems
#[derive(Debug, Clone)]
pub struct Report {
    pub(crate) attrs: AttrsPerSystem,
    pub(crate) system_reports: Vec<(System, SystemReport)>,
    pub(crate) options: ReportOptions,
}

impl Report {
    /// Classify `attrs_per_system`. Outputs must have been verified first.
    pub fn new(attrs_per_system: AttrsPerSystem, mut options: ReportOptions) -> Self {
        if options.extra_nixpkgs_config.as_deref() == Some(EMPTY_NIXPKGS_CONFIG) {
            options.extra_nixpkgs_config = None;
        }

        let system_reports = order_systems(attrs_per_system.keys().cloned())
            .into_iter()
            .map(|system| {
                let report = SystemReport::new(attrs_per_system[&system].iter().cloned());
                (system, report)
            })
            .collect();

        Report {
            attrs: attrs_per_system,
            system_reports,
            options,
        }
    }

    /// Per-system reports in display order
    pub fn system_reports(&self) -> &[(System, SystemReport)] {
        &self.system_reports
    }

    pub fn options(&self) -> &ReportOptions {
        &self.options
    }

    /// Names of the built packages per system
    pub fn built_packages(&self) -> BTreeMap<System, Vec<String>> {
        self.system_reports
            .iter()
            .map(|(system, report)| {
                let names = report.built.iter().map(|a| a.name.clone()).collect();
                (system.clone(), names)
            })
            .collect()
    }

    /// A review succeeds when nothing failed to build on any system
    pub fn succeeded(&self) -> bool {
        self.system_reports
            .iter()
            .all(|(_, report)| report.failed.is_empty())
    }

    /// The structured document for `pr`
    pub fn document(&self, pr: Option<u64>) -> ReportDocument {
        ReportDocument {
            checkout: self.options.checkout,
            extra_nixpkgs_config: self.options.extra_nixpkgs_config.clone(),
            pr,
            result: self
                .system_reports
                .iter()
                .map(|(system, report)| (system.clone(), report.serialize()))
                .collect(),
            systems: self.system_reports.iter().map(|(s, _)| s.clone()).collect(),
        }
    }

    /// `report.json` content
    pub fn json(&self, pr: Option<u64>) -> Result<String> {
        self.document(pr).to_json()
    }

    /// `report.md` content
    pub fn markdown(&self, pr: Option<u64>) -> String {
        let mut msg = String::new();
        if self.options.show_header {
            msg.push_str("## `nixpkgs-review` result\n\n");
            msg.push_str(
                "Generated using [`nixpkgs-review`](https://github.com/Mic92/nixpkgs-review).\n\n",
            );
            msg.push_str(&format!("Command: `{}`\n", self.command(pr)));
        }

        for (system, report) in &self.system_reports {
            msg.push_str("\n---\n");
            msg.push_str(&format!("### `{system}`\n"));
            for bucket in MARKDOWN_ORDER {
                let (emoji, label, what) = bucket_label(bucket);
                msg.push_str(&html_pkgs_section(
                    emoji,
                    report.bucket(bucket),
                    label,
                    what,
                    self.options.display_limit,
                ));
            }
        }
        msg
    }

    /// Command line reproducing this review
    fn command(&self, pr: Option<u64>) -> String {
        let mut cmd = String::from("nixpkgs-review");
        if let Some(pr) = pr {
            cmd.push_str(&format!(" pr {pr}"));
        }
        if let Some(config) = &self.options.extra_nixpkgs_config {
            cmd.push_str(&format!(" --extra-nixpkgs-config '{config}'"));
        }
        if self.options.checkout != Checkout::Merge {
            cmd.push_str(&format!(" --checkout {}", self.options.checkout));
        }
        cmd
    }

    /// Human readable summary
    pub fn console(&self, pr: Option<u64>) -> String {
        let mut out = String::new();
        if let Some(pr) = pr {
            let url = pr_url(pr);
            out.push_str("\nLink to currently reviewing PR:\n");
            out.push_str(&format!("\u{1b}]8;;{url}\u{1b}\\{url}\u{1b}]8;;\u{1b}\\\n\n"));
        }

        for (system, report) in &self.system_reports {
            out.push_str(&format!("--------- Report for '{system}' ---------\n"));
            for bucket in MARKDOWN_ORDER {
                let attrs = report.bucket(bucket);
                if attrs.is_empty() {
                    continue;
                }
                let (_, label, what) = bucket_label(bucket);
                let plural = if attrs.len() > 1 { "s" } else { "" };
                let names: Vec<&str> = attrs.iter().map(|a| a.name.as_str()).collect();
                out.push_str(&format!("{} {what}{plural} {label}:\n", attrs.len()));
                out.push_str(&names.join(" "));
                out.push_str("\n\n");
            }
        }
        out
    }

    /// Print [`Report::console`] to stdout
    pub fn print_console(&self, pr: Option<u64>) {
        print!("{}", self.console(pr));
    }

    /// Write `report.md`, `report.json`, result links and error logs into `directory`
    pub async fn write(
        &self,
        directory: &Path,
        pr: Option<u64>,
        logs: &dyn BuildLogSource,
    ) -> Result<()> {
        let markdown_path = directory.join("report.md");
        tokio::fs::write(&markdown_path, self.markdown(pr))
            .await
            .map_err(ReportError::write(&markdown_path))?;

        let json_path = directory.join("report.json");
        tokio::fs::write(&json_path, self.json(pr)?)
            .await
            .map_err(ReportError::write(&json_path))?;

        write_result_links(&self.attrs, directory)?;
        let log_options = LogOptions {
            tail: self.options.error_log_tail,
            strip_colors: true,
        };
        write_error_logs(&self.system_reports, directory, logs, log_options).await?;

        info!(
            directory = %directory.display(),
            succeeded = self.succeeded(),
            "Wrote report"
        );
        Ok(())
    }

    /// Number of records in `bucket` across all systems
    pub fn count(&self, bucket: Bucket) -> usize {
        self.system_reports
            .iter()
            .map(|(_, report)| report.bucket(bucket).len())
            .sum()
    }
}

/// Web URL of a nixpkgs pull request
pub fn pr_url(pr: u64) -> String {
    format!("https://github.com/NixOS/nixpkgs/pull/{pr}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use nixpkgs_review_nix::Attr;

    fn built(name: &str) -> Attr {
        let mut attr = Attr::new(name, true, false)
            .with_paths(format!("/nix/store/o-{name}"), format!("/nix/store/d-{name}.drv"));
        attr.path_verified = Some(true);
        attr
    }

    fn sample() -> AttrsPerSystem {
        let mut failed = built("curl");
        failed.path_verified = Some(false);
        let mut attrs = AttrsPerSystem::new();
        attrs.insert("aarch64-linux".to_string(), vec![built("hello")]);
        attrs.insert("x86_64-linux".to_string(), vec![built("hello"), failed]);
        attrs
    }

    #[test]
    fn test_checkout_parse_and_display() {
        assert_eq!("merge".parse::<Checkout>().unwrap(), Checkout::Merge);
        assert_eq!("commit".parse::<Checkout>().unwrap(), Checkout::Commit);
        assert!("rebase".parse::<Checkout>().is_err());
        assert_eq!(Checkout::Commit.to_string(), "commit");
    }

    #[test]
    fn test_empty_extra_config_is_dropped() {
        let options = ReportOptions {
            extra_nixpkgs_config: Some("{ }".to_string()),
            ..Default::default()
        };
        let report = Report::new(sample(), options);
        assert!(report.options().extra_nixpkgs_config.is_none());
        assert!(!report.markdown(Some(1)).contains("--extra-nixpkgs-config"));
    }

    #[test]
    fn test_systems_in_display_order() {
        let report = Report::new(sample(), ReportOptions::default());
        let systems: Vec<_> = report.system_reports().iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(systems, vec!["x86_64-linux", "aarch64-linux"]);
    }

    #[test]
    fn test_built_packages_and_counts() {
        let report = Report::new(sample(), ReportOptions::default());
        let built = report.built_packages();
        assert_eq!(built["x86_64-linux"], vec!["hello"]);
        assert_eq!(built["aarch64-linux"], vec!["hello"]);
        assert_eq!(report.count(Bucket::Built), 2);
        assert_eq!(report.count(Bucket::Failed), 1);
        assert!(!report.succeeded());
    }

    #[test]
    fn test_markdown_header_and_sections() {
        let options = ReportOptions {
            checkout: Checkout::Commit,
            extra_nixpkgs_config: Some("{ allowUnfree = true; }".to_string()),
            ..Default::default()
        };
        let md = Report::new(sample(), options).markdown(Some(1234));

        assert!(md.starts_with("## `nixpkgs-review` result\n\n"));
        assert!(md.contains(
            "Command: `nixpkgs-review pr 1234 --extra-nixpkgs-config '{ allowUnfree = true; }' --checkout commit`\n"
        ));
        let x86 = md.find("### `x86_64-linux`").unwrap();
        let arm = md.find("### `aarch64-linux`").unwrap();
        assert!(x86 < arm);
        assert!(md.contains(":x: 1 package failed to build:"));
    }

    #[test]
    fn test_markdown_without_header() {
        let options = ReportOptions {
            show_header: false,
            ..Default::default()
        };
        let md = Report::new(sample(), options).markdown(None);
        assert!(md.starts_with("\n---\n### `x86_64-linux`\n"));
    }

    #[test]
    fn test_json_layout() {
        let mut attrs = AttrsPerSystem::new();
        attrs.insert("x86_64-linux".to_string(), vec![built("hello")]);
        let json = Report::new(attrs, ReportOptions::default()).json(Some(1)).unwrap();

        assert!(json.starts_with(
            "{\n    \"checkout\": \"merge\",\n    \"extra-nixpkgs-config\": null,\n    \"pr\": 1,\n"
        ));
        assert!(json.contains("\"built\": [\n                \"hello\"\n            ],"));
        assert!(json.ends_with("    \"systems\": [\n        \"x86_64-linux\"\n    ]\n}"));
    }

    #[test]
    fn test_console_summary() {
        let console = Report::new(sample(), ReportOptions::default()).console(Some(7));
        assert!(console.contains("https://github.com/NixOS/nixpkgs/pull/7"));
        assert!(console.contains("--------- Report for 'x86_64-linux' ---------\n"));
        assert!(console.contains("1 package failed to build:\ncurl\n"));
    }
}
