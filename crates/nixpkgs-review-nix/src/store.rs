//! Nix store access
//!
//! [`NixContext`] carries the `nix` executable and the lazily resolved store
//! directory. It is passed explicitly to everything that talks to the store
//! and is cheap to clone; clones share the resolved store directory.

use crate::error::NixError;
use crate::Result;
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Checks that an output path is valid and trusted in the store
#[async_trait]
pub trait StoreVerifier: Send + Sync {
    /// Returns `true` when `path` verifies
    async fn verify(&self, path: &Path) -> bool;
}

/// Retrieves build logs by derivation or output path
#[async_trait]
pub trait BuildLogSource: Send + Sync {
    /// Returns the log text, or `None` if there is no log
    async fn build_log(&self, key: &str) -> Option<String>;
}

/// Handle to the local nix installation
#[derive(Debug, Clone)]
pub struct NixContext {
    program: PathBuf,
    store_dir: Arc<OnceCell<String>>,
}

impl Default for NixContext {
    fn default() -> Self {
        NixContext {
            program: PathBuf::from("nix"),
            store_dir: Arc::new(OnceCell::new()),
        }
    }
}

impl NixContext {
    /// Use `nix` from PATH
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific `nix` executable
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        NixContext {
            program: program.into(),
            store_dir: Arc::new(OnceCell::new()),
        }
    }

    /// Pin the store directory instead of asking nix for it
    pub fn with_store_dir(self, store_dir: impl Into<String>) -> Self {
        NixContext {
            program: self.program,
            store_dir: Arc::new(OnceCell::new_with(Some(store_dir.into()))),
        }
    }

    /// The `nix` executable
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// `builtins.storeDir`, queried once per context
    pub async fn store_dir(&self) -> Result<&str> {
        let dir = self
            .store_dir
            .get_or_try_init(|| async {
                let output = Command::new(&self.program)
                    .args([
                        "--extra-experimental-features",
                        "nix-command",
                        "eval",
                        "--raw",
                        "--expr",
                        "(builtins.storeDir)",
                    ])
                    .stderr(Stdio::piped())
                    .output()
                    .await
                    .map_err(|e| NixError::from_spawn(&self.program, e))?;

                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    return Err(NixError::CommandFailed(stderr.to_string()));
                }
                let dir = String::from_utf8_lossy(&output.stdout).trim().to_string();
                debug!(store_dir = %dir, "Resolved nix store directory");
                Ok(dir)
            })
            .await?;
        Ok(dir.as_str())
    }
}

#[async_trait]
impl StoreVerifier for NixContext {
    async fn verify(&self, path: &Path) -> bool {
        let status = Command::new(&self.program)
            .args([
                "--extra-experimental-features",
                "nix-command",
                "store",
                "verify",
                "--no-contents",
                "--no-trust",
            ])
            .arg(path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) => status.success(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not run nix store verify");
                false
            }
        }
    }
}

#[async_trait]
impl BuildLogSource for NixContext {
    async fn build_log(&self, key: &str) -> Option<String> {
        let output = Command::new(&self.program)
            .args(["--extra-experimental-features", "nix-command", "log", key])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .ok()?;

        let log = String::from_utf8_lossy(&output.stdout).into_owned();
        if log.is_empty() {
            None
        } else {
            Some(log)
        }
    }
}

/// Remove 7-bit C1 ANSI escape sequences
pub fn strip_ansi_colors(s: &str) -> String {
    static ANSI_ESCAPE: OnceLock<Regex> = OnceLock::new();
    let re = ANSI_ESCAPE.get_or_init(|| {
        // ESC, then either a 7-bit C1 Fe (except CSI) or CSI with
        // parameter, intermediate and final bytes
        Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("ANSI escape regex is valid")
    });
    re.replace_all(s, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ansi_colors() {
        assert_eq!(strip_ansi_colors("\x1b[1;31merror:\x1b[0m boom"), "error: boom");
        assert_eq!(strip_ansi_colors("plain"), "plain");
        assert_eq!(strip_ansi_colors("a\x1b]b"), "ab");
    }

    #[tokio::test]
    async fn test_pinned_store_dir_skips_nix() {
        let ctx = NixContext::with_program("/definitely/not/nix").with_store_dir("/nix/store");
        assert_eq!(ctx.store_dir().await.unwrap(), "/nix/store");
    }

    #[tokio::test]
    async fn test_clones_share_store_dir() {
        let ctx = NixContext::new().with_store_dir("/custom/store");
        let clone = ctx.clone();
        assert_eq!(clone.store_dir().await.unwrap(), "/custom/store");
    }

    #[tokio::test]
    async fn test_missing_nix_is_tool_not_found() {
        let ctx = NixContext::with_program("/definitely/not/nix");
        let err = ctx.store_dir().await.unwrap_err();
        assert!(matches!(err, NixError::ToolNotFound { .. }));
    }

    #[tokio::test]
    async fn test_verify_with_missing_nix_is_false() {
        let ctx = NixContext::with_program("/definitely/not/nix");
        assert!(!ctx.verify(Path::new("/nix/store/aaa-hello")).await);
    }
}
