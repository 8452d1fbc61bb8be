//! Nix expressions shipped with nixpkgs-review
//!
//! The evaluator and the build tool are driven through two small Nix files.
//! They are embedded into the binary and written next to the review's cache
//! directory before use.

use crate::Result;
use std::path::{Path, PathBuf};
use tracing::debug;

const EVAL_ATTRS_NIX: &str = include_str!("../nix/evalAttrs.nix");
const REVIEW_SHELL_NIX: &str = include_str!("../nix/review-shell.nix");

/// Paths of the installed expressions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NixExpressions {
    /// Evaluates a JSON list of attribute names to their properties
    pub eval_attrs: PathBuf,
    /// Shell derivation that pulls in every attribute of `attrs.nix`
    pub review_shell: PathBuf,
}

impl NixExpressions {
    /// Write the expressions into `dir/nix/`
    pub fn install(dir: &Path) -> Result<Self> {
        let nix_dir = dir.join("nix");
        std::fs::create_dir_all(&nix_dir)?;

        let eval_attrs = nix_dir.join("evalAttrs.nix");
        std::fs::write(&eval_attrs, EVAL_ATTRS_NIX)?;
        let review_shell = nix_dir.join("review-shell.nix");
        std::fs::write(&review_shell, REVIEW_SHELL_NIX)?;

        debug!(dir = %nix_dir.display(), "Installed nix expressions");
        Ok(NixExpressions {
            eval_attrs,
            review_shell,
        })
    }
}
