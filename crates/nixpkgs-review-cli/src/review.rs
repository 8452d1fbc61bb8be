//! End-to-end review pipeline
//!
//! preflight ─► install expressions ─► evaluate and build ─► verify outputs
//! ─► report ─► (upload logs) ─► write artifacts

use crate::config::{nixpkgs_config_nix, ReviewConfig};
use anyhow::{Context, Result};
use nixpkgs_review_github::{GithubClient, GithubConfig};
use nixpkgs_review_nix::{
    multi_system_eval, nix_build, require_platform, require_tool, AttrsPerSystem, BuildRequest,
    EvalOptions, NixContext, NixExpressions, System,
};
use nixpkgs_review_report::{verify_outputs, Report, ReportOptions};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Run a full review; returns whether it succeeded
pub async fn run_build(config: &ReviewConfig) -> Result<bool> {
    let wrapper = preflight(config)?;
    let ctx = NixContext::new();
    let request = prepare(config, wrapper)?;

    let mut attrs = nix_build(&ctx, &request).await?;
    verify_outputs(&mut attrs, &ctx).await;

    let mut report = Report::new(attrs, report_options(config));
    if config.post_logs {
        post_logs(config, &mut report, &ctx).await;
    }

    std::fs::create_dir_all(&config.output_dir).with_context(|| {
        format!("Failed to create output directory {}", config.output_dir.display())
    })?;
    report.write(&config.output_dir, config.pr, &ctx).await?;
    report.print_console(config.pr);

    info!(
        output_dir = %config.output_dir.display(),
        succeeded = report.succeeded(),
        "Review finished"
    );
    Ok(report.succeeded())
}

/// Evaluate only and return the records per system
pub async fn run_eval(config: &ReviewConfig) -> Result<AttrsPerSystem> {
    require_tool("nix", None)?;
    let ctx = NixContext::new();
    let request = prepare(config, Vec::new())?;

    let attrs = multi_system_eval(
        &ctx,
        &request.attrs_per_system,
        &request.eval,
        request.eval_threads,
    )
    .await?;
    Ok(request.pre_build_filter.apply(attrs).await?)
}

/// Check the host and return the command prefix the build runs under
fn preflight(config: &ReviewConfig) -> Result<Vec<String>> {
    require_tool("nix", None)?;
    if config.build_graph != "nix" {
        require_tool(
            &config.build_graph,
            Some("Install it or pass '--build-graph nix'."),
        )?;
    }
    if !config.sandbox {
        return Ok(Vec::new());
    }

    require_platform("Sandbox mode", &["linux"])?;
    require_tool("bwrap", Some("Install it to use '--sandbox' flag."))?;
    Ok(sandbox_wrapper(&config.cache_dir))
}

/// Minimal bubblewrap prefix: read-only host, private /tmp, writable cache
pub fn sandbox_wrapper(cache_dir: &Path) -> Vec<String> {
    let cache = cache_dir.display().to_string();
    let mut args: Vec<String> = [
        "bwrap",
        "--die-with-parent",
        "--unshare-cgroup",
        "--unshare-ipc",
        "--unshare-uts",
        "--ro-bind",
        "/",
        "/",
        "--dev-bind",
        "/dev",
        "/dev",
        "--tmpfs",
        "/tmp",
        "--bind-try",
        "/nix/var/nix/daemon-socket",
        "/nix/var/nix/daemon-socket",
        "--bind",
    ]
    .map(String::from)
    .to_vec();
    args.push(cache.clone());
    args.push(cache);
    args.push("--".to_string());
    args
}

/// Lay out the cache directory and assemble the build request
fn prepare(config: &ReviewConfig, wrapper: Vec<String>) -> Result<BuildRequest> {
    std::fs::create_dir_all(&config.cache_dir).with_context(|| {
        format!("Failed to create cache directory {}", config.cache_dir.display())
    })?;
    let expressions = NixExpressions::install(&config.cache_dir)?;
    link_nixpkgs(&config.nixpkgs, &config.nixpkgs_link())?;

    let nixpkgs_config = config.nixpkgs_config_path();
    std::fs::write(&nixpkgs_config, nixpkgs_config_nix(&config.extra_nixpkgs_config))
        .with_context(|| format!("Failed to write {}", nixpkgs_config.display()))?;

    let mut eval = EvalOptions::new(
        format!("nixpkgs={}", config.nixpkgs_link().display()),
        expressions.eval_attrs,
    );
    eval.allow = config.allow;
    eval.raw_output_dir = Some(config.cache_dir.clone());
    eval.nixpkgs_config = Some(nixpkgs_config.clone());

    Ok(BuildRequest {
        attrs_per_system: attrs_per_system(&config.systems, &config.packages),
        extra_args: config.build_args.clone(),
        cache_directory: config.cache_dir.clone(),
        local_system: config.local_system.clone(),
        eval,
        build_graph: config.build_graph.clone(),
        nixpkgs_config,
        review_shell: expressions.review_shell,
        eval_threads: config.eval_threads,
        pre_build_filter: config.pre_build_filter.clone(),
        wrapper,
    })
}

/// The same package set for every system
pub fn attrs_per_system(
    systems: &[System],
    packages: &BTreeSet<String>,
) -> BTreeMap<System, BTreeSet<String>> {
    systems
        .iter()
        .map(|system| (system.clone(), packages.clone()))
        .collect()
}

/// Point `link` at the reviewed nixpkgs tree, replacing an older link
pub fn link_nixpkgs(nixpkgs: &Path, link: &Path) -> Result<()> {
    let target: PathBuf = nixpkgs
        .canonicalize()
        .with_context(|| format!("nixpkgs tree {} not found", nixpkgs.display()))?;

    if let Ok(metadata) = std::fs::symlink_metadata(link) {
        if !metadata.file_type().is_symlink() {
            anyhow::bail!("{} exists and is not a symlink", link.display());
        }
        std::fs::remove_file(link)
            .with_context(|| format!("Failed to replace {}", link.display()))?;
    }
    std::os::unix::fs::symlink(&target, link)
        .with_context(|| format!("Failed to link {}", link.display()))?;
    Ok(())
}

pub(crate) fn report_options(config: &ReviewConfig) -> ReportOptions {
    ReportOptions {
        show_header: config.show_header,
        checkout: config.checkout,
        extra_nixpkgs_config: Some(config.extra_nixpkgs_config.clone()),
        display_limit: config.display_limit,
        error_log_tail: config.error_log_tail,
    }
}

async fn post_logs(config: &ReviewConfig, report: &mut Report, ctx: &NixContext) {
    let mut github = GithubConfig::from_env();
    if let Some(token) = &config.token {
        github = github.with_token(token.clone());
    }
    if github.token.is_none() {
        warn!("No GitHub token set, log uploads will be rate limited");
    }

    match GithubClient::new(github, &config.remote) {
        Ok(client) => report.upload_logs(&client, ctx, config.pr).await,
        Err(e) => warn!(error = %e, "Not uploading build logs"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attrs_per_system() {
        let packages: BTreeSet<String> = ["hello", "curl"].iter().map(|s| s.to_string()).collect();
        let systems = vec!["x86_64-linux".to_string(), "aarch64-darwin".to_string()];
        let map = attrs_per_system(&systems, &packages);
        assert_eq!(map.len(), 2);
        assert_eq!(map["aarch64-darwin"], packages);
    }

    #[test]
    fn test_link_nixpkgs_replaces_link() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        std::fs::create_dir(&first).unwrap();
        std::fs::create_dir(&second).unwrap();
        let link = dir.path().join("nixpkgs");

        link_nixpkgs(&first, &link).unwrap();
        link_nixpkgs(&second, &link).unwrap();
        assert_eq!(std::fs::read_link(&link).unwrap(), second.canonicalize().unwrap());
    }

    #[test]
    fn test_link_nixpkgs_refuses_to_clobber_directory() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        let existing = dir.path().join("nixpkgs");
        std::fs::create_dir(&tree).unwrap();
        std::fs::create_dir(&existing).unwrap();

        assert!(link_nixpkgs(&tree, &existing).is_err());
        assert!(link_nixpkgs(&dir.path().join("missing"), &dir.path().join("x")).is_err());
    }

    #[test]
    fn test_sandbox_wrapper_binds_cache() {
        let args = sandbox_wrapper(Path::new("/home/u/.cache/nixpkgs-review/pr-1"));
        assert_eq!(args[0], "bwrap");
        assert_eq!(args.last().unwrap(), "--");
        let bind = args.iter().rposition(|a| a == "--bind").unwrap();
        assert_eq!(args[bind + 1], "/home/u/.cache/nixpkgs-review/pr-1");
        assert_eq!(args[bind + 2], "/home/u/.cache/nixpkgs-review/pr-1");
    }
}
