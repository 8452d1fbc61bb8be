//! Review configuration
//!
//! Turns command line values into the settings of one review run.

use anyhow::{bail, Result};
use nixpkgs_review_nix::{AllowedFeatures, PreBuildFilter, System};
use nixpkgs_review_report::Checkout;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Systems selected by `--systems all`
pub const ALL_SYSTEMS: &[&str] = &[
    "x86_64-linux",
    "aarch64-linux",
    "x86_64-darwin",
    "aarch64-darwin",
];

/// Settings of one review run
#[derive(Debug, Clone)]
pub struct ReviewConfig {
    /// Attribute names to review
    pub packages: BTreeSet<String>,
    pub systems: Vec<System>,
    pub local_system: System,
    /// The nixpkgs tree to review
    pub nixpkgs: PathBuf,
    /// Holds `attrs.nix`, the nix expressions and the nixpkgs link
    pub cache_dir: PathBuf,
    /// Receives `report.md`, `report.json`, result links and logs
    pub output_dir: PathBuf,
    pub pr: Option<u64>,
    /// `nix` or `nom`
    pub build_graph: String,
    pub build_args: Vec<String>,
    pub allow: AllowedFeatures,
    pub extra_nixpkgs_config: String,
    pub checkout: Checkout,
    pub show_header: bool,
    pub display_limit: Option<usize>,
    /// Bytes kept from the end of each written error log; `None` keeps all
    pub error_log_tail: Option<usize>,
    pub post_logs: bool,
    pub token: Option<String>,
    /// Repository the review belongs to
    pub remote: String,
    pub eval_threads: usize,
    pub sandbox: bool,
    pub pre_build_filter: PreBuildFilter,
}

impl ReviewConfig {
    /// Path of the generated nixpkgs config
    pub fn nixpkgs_config_path(&self) -> PathBuf {
        self.cache_dir.join("nixpkgs-config.nix")
    }

    /// Link to the reviewed nixpkgs tree inside the cache directory
    pub fn nixpkgs_link(&self) -> PathBuf {
        self.cache_dir.join("nixpkgs")
    }
}

/// Features accepted by `--allow`
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum AllowOption {
    /// Import from derivation
    Ifd,
    /// URL literals
    UrlLiterals,
}

/// Fold `--allow` values into evaluation features
pub fn allowed_features(values: &[AllowOption]) -> AllowedFeatures {
    AllowedFeatures {
        ifd: values.contains(&AllowOption::Ifd),
        url_literals: values.contains(&AllowOption::UrlLiterals),
    }
}

/// Parse `--systems`. Entries are separated by commas or whitespace;
/// `current` is the local system and `all` the common platforms.
pub fn parse_systems(value: &str, local_system: &str) -> Result<Vec<System>> {
    let mut systems: Vec<System> = Vec::new();
    let mut push = |system: &str| {
        if !systems.iter().any(|s| s == system) {
            systems.push(system.to_string());
        }
    };

    for entry in value.split(|c: char| c == ',' || c.is_whitespace()) {
        match entry {
            "" => {}
            "current" => push(local_system),
            "all" => ALL_SYSTEMS.iter().for_each(|s| push(s)),
            other if other.contains('-') => push(other),
            other => bail!("invalid system '{other}', expected e.g. x86_64-linux"),
        }
    }
    if systems.is_empty() {
        bail!("no systems selected");
    }
    Ok(systems)
}

/// Split `--build-args` on whitespace
pub fn split_build_args(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

/// Content of the nixpkgs config used for evaluation and build
pub fn nixpkgs_config_nix(extra_nixpkgs_config: &str) -> String {
    format!(
        "{{\n  allowUnfree = true;\n  allowBroken = false;\n  checkMeta = true;\n}} // ({extra_nixpkgs_config})\n"
    )
}

/// Default cache directory for a review
pub fn default_cache_dir(pr: Option<u64>) -> Result<PathBuf> {
    let base = match std::env::var_os("XDG_CACHE_HOME") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => match std::env::var_os("HOME") {
            Some(home) => Path::new(&home).join(".cache"),
            None => bail!("neither XDG_CACHE_HOME nor HOME is set, pass --cache-dir"),
        },
    };
    let name = match pr {
        Some(pr) => format!("pr-{pr}"),
        None => "local".to_string(),
    };
    Ok(base.join("nixpkgs-review").join(name))
}
