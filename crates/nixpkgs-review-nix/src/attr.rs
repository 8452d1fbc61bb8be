//! Attribute records
//!
//! One [`Attr`] per package identifier and system. Records are created by the
//! evaluator, annotated by the build step, and read by the report layer. The
//! serialized form of [`Attr`] is also the record schema pre-build filter
//! hooks read and write, see [`crate::HookRecord`].

use crate::store::{BuildLogSource, StoreVerifier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A target system such as `x86_64-linux`
pub type System = String;

/// Evaluated (and possibly built) records, keyed by system
pub type AttrsPerSystem = BTreeMap<System, Vec<Attr>>;

/// Attributes that break review builds for reasons unrelated to the change
/// under review. See <https://github.com/NixOS/ofborg/issues/269>.
pub const BLACKLIST: &[&str] = &[
    "appimage-run-tests",
    "darwin.builder",
    "nixos-install-tools",
    "tests.nixos-functions.nixos-test",
    "tests.nixos-functions.nixosTest-test",
    "tests.php.overrideAttrs-preserves-enabled-extensions",
    "tests.php.withExtensions-enables-previously-disabled-extensions",
    "tests.trivial",
    "tests.writers",
];

/// Directory the nix daemon stores build logs in.
///
/// Non-default nix configurations may put logs elsewhere; in that case
/// [`Attr::log_path`] finds nothing and the build time is unknown.
pub const NIX_LOG_DIR: &str = "/nix/var/log/nix/drvs";

/// A single package attribute under review
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attr {
    /// Dotted attribute name, unique within a system
    pub name: String,
    /// Whether the attribute exists in the checkout
    pub exists: bool,
    /// Whether evaluation marked it broken (or failed to produce an output)
    pub broken: bool,
    /// Whether it is on the [`BLACKLIST`]
    pub blacklisted: bool,
    /// Set by pre-build filters to exclude the attribute from the build
    #[serde(default)]
    pub skipped: bool,
    /// Output path
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Derivation path
    #[serde(default)]
    pub drv_path: Option<String>,
    /// `meta.position` of the package
    #[serde(default)]
    pub position: Option<String>,
    /// Other attribute names that evaluate to the same output path
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Set when the build tool reported a timeout for this attribute
    #[serde(default)]
    pub timed_out: bool,
    /// Build error context captured from the build tool
    #[serde(default)]
    pub build_err_msg: Option<String>,
    /// Location of the uploaded build log
    #[serde(default)]
    pub log_url: Option<String>,
    /// Result of verifying `path` against the store. Set at most once.
    #[serde(skip)]
    pub path_verified: Option<bool>,
}

impl Attr {
    /// Create a record with no build state attached
    pub fn new(name: impl Into<String>, exists: bool, broken: bool) -> Self {
        let name = name.into();
        let blacklisted = is_blacklisted(&name);
        Attr {
            name,
            exists,
            broken,
            blacklisted,
            skipped: false,
            path: None,
            drv_path: None,
            position: None,
            aliases: Vec::new(),
            timed_out: false,
            build_err_msg: None,
            log_url: None,
            path_verified: None,
        }
    }

    /// Set output and derivation paths
    pub fn with_paths(mut self, path: impl Into<PathBuf>, drv_path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self.drv_path = Some(drv_path.into());
        self
    }

    /// NixOS VM tests are reported separately from packages
    pub fn is_test(&self) -> bool {
        self.name.starts_with("nixosTests.")
    }

    /// Whether the output path was verified in the store.
    ///
    /// Only meaningful after [`Attr::verify`]; unverified records count as not built.
    pub fn was_built(&self) -> bool {
        self.path_verified == Some(true)
    }

    /// Verify the output path against the store, memoizing the answer.
    ///
    /// Existence alone is not enough: a path left over from an unrelated run
    /// must still check out as valid and trusted.
    pub async fn verify(&mut self, verifier: &dyn StoreVerifier) -> bool {
        if let Some(verified) = self.path_verified {
            return verified;
        }
        let verified = match &self.path {
            Some(path) => verifier.verify(path).await,
            None => false,
        };
        self.path_verified = Some(verified);
        verified
    }

    /// Retrieve the build log, falling back from the derivation to the output
    /// path, and append any captured build error.
    pub async fn log(&self, source: &dyn BuildLogSource, options: LogOptions) -> Option<String> {
        let drv_path = self.drv_path.as_deref()?;

        let mut value = match fetch_log(source, Some(drv_path), options).await {
            Some(log) => log,
            None => {
                let path = self.path.as_deref().map(|p| p.to_string_lossy().into_owned());
                fetch_log(source, path.as_deref(), options)
                    .await
                    .unwrap_or_default()
            }
        };
        if let Some(msg) = &self.build_err_msg {
            value.push('\n');
            value.push_str(msg);
        }
        Some(value)
    }

    /// Locate the on-disk log written by the nix daemon
    pub fn log_path(&self) -> Option<PathBuf> {
        self.log_path_in(Path::new(NIX_LOG_DIR))
    }

    fn log_path_in(&self, log_dir: &Path) -> Option<PathBuf> {
        let drv_path = self.drv_path.as_deref()?;
        let base = Path::new(drv_path).file_name()?.to_str()?;
        if base.len() < 3 || !base.is_char_boundary(2) {
            return None;
        }
        let (prefix, rest) = base.split_at(2);
        [format!("{rest}.bz2"), rest.to_string()]
            .into_iter()
            .map(|file| log_dir.join(prefix).join(file))
            .find(|candidate| candidate.is_file())
    }

    /// Time between creation and last write of the build log
    pub fn build_time(&self) -> Option<chrono::Duration> {
        let log_path = self.log_path()?;
        log_file_span(&log_path)
    }
}

/// Whether `name` is on the [`BLACKLIST`]
pub fn is_blacklisted(name: &str) -> bool {
    BLACKLIST.contains(&name)
}

/// How to post-process a retrieved build log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Keep only the last `tail` bytes
    pub tail: Option<usize>,
    /// Remove ANSI escape sequences
    pub strip_colors: bool,
}

async fn fetch_log(
    source: &dyn BuildLogSource,
    key: Option<&str>,
    options: LogOptions,
) -> Option<String> {
    let log = source.build_log(key?).await?;
    if log.is_empty() {
        return None;
    }
    let log = match options.tail {
        Some(tail) if tail > 0 && log.len() > tail => {
            format!("This file has been truncated\n{}", tail_of(&log, tail))
        }
        _ => log,
    };
    if options.strip_colors {
        Some(crate::store::strip_ansi_colors(&log))
    } else {
        Some(log)
    }
}

/// The last `n` bytes of `s`, moved forward to the next char boundary
fn tail_of(s: &str, n: usize) -> &str {
    let mut start = s.len().saturating_sub(n);
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

fn log_file_span(path: &Path) -> Option<chrono::Duration> {
    let metadata = std::fs::metadata(path).ok()?;
    let created = metadata.created().ok()?;
    let modified = metadata.modified().ok()?;
    let span = modified.duration_since(created).ok()?;
    chrono::Duration::from_std(span).ok()
}
