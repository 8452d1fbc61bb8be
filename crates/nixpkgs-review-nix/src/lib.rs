//! nixpkgs-review-nix: Nix evaluation and build driver
//!
//! This crate is the layer of nixpkgs-review that talks to Nix.
//! It evaluates attribute names into [`Attr`] records, builds them with
//! `nix build --keep-going` (or `nom`), and records per-attribute failure
//! context from the build tool's stderr.
//!
//! ## Flow
//!
//! ```text
//! names per system ──► multi_system_eval ──► PreBuildFilter ──► nix_build
//!                        (chunked nix eval)     (hooks)          (stderr parsing)
//! ```
//!
//! Everything that needs the store goes through an explicitly passed
//! [`NixContext`].

pub mod attr;
pub mod build;
pub mod error;
pub mod eval;
pub mod expressions;
pub mod hooks;
pub mod preflight;
pub mod store;

pub use attr::{is_blacklisted, Attr, AttrsPerSystem, LogOptions, System, BLACKLIST};
pub use build::{
    annotate_build_failures, build_shell_file_args, buildable_per_system, nix_build,
    parse_build_stderr, render_attrs_nix, strip_copying_lines, BuildFailures, BuildRequest,
};
pub use error::NixError;
pub use eval::{
    eval_filter, multi_system_eval, nix_eval, AllowedFeatures, EvalEntry, EvalOptions, EvalOutput,
    EVAL_CHUNK_SIZE, NIXPKGS_CONFIG_ENV,
};
pub use expressions::NixExpressions;
pub use hooks::{HookRecord, PreBuildFilter, PRE_BUILD_FILTER_ENV};
pub use preflight::{require_platform, require_tool, require_tools};
pub use store::{strip_ansi_colors, BuildLogSource, NixContext, StoreVerifier};

/// Result type for nix operations
pub type Result<T> = std::result::Result<T, NixError>;

/// The nix system string of the running host, e.g. `x86_64-linux`
pub fn current_system() -> System {
    let arch = match std::env::consts::ARCH {
        "x86" => "i686",
        other => other,
    };
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    format!("{arch}-{os}")
}
