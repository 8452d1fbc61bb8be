//! Building evaluated attributes
//!
//! Runs the build tool once over every buildable attribute of every system
//! with `--keep-going`, then reads its stderr to find out which derivations
//! failed because of broken dependencies or timeouts. Partial failures never
//! surface as errors here; they are recorded on the [`Attr`] records.

use crate::attr::{Attr, AttrsPerSystem, System};
use crate::error::NixError;
use crate::eval::{multi_system_eval, render_command, EvalOptions};
use crate::hooks::PreBuildFilter;
use crate::store::NixContext;
use crate::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Markers of a derivation that failed because its dependencies failed
const DEPENDENCY_FAILURE_MARKERS: &[&str] = &[
    "dependencies couldn't be built",
    "dependencies of derivation",
];

/// Marker of a build killed by the build tool's timeout
const TIMEOUT_MARKER: &str = "timed out after";

/// Everything needed to build one review
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Attribute names to build, per system
    pub attrs_per_system: BTreeMap<System, BTreeSet<String>>,
    /// Extra arguments appended to the build command
    pub extra_args: Vec<String>,
    /// Review cache directory; holds `attrs.nix` and the `nixpkgs/` checkout
    pub cache_directory: PathBuf,
    /// System of the host running the review
    pub local_system: System,
    /// Evaluation options
    pub eval: EvalOptions,
    /// Build tool, `nix` or `nom`
    pub build_graph: String,
    /// Path to the nixpkgs config passed to the review shell
    pub nixpkgs_config: PathBuf,
    /// Path to the installed `review-shell.nix`
    pub review_shell: PathBuf,
    /// Maximum number of concurrent evaluations
    pub eval_threads: usize,
    /// Filters applied between evaluation and build
    pub pre_build_filter: PreBuildFilter,
    /// Command prefix the build tool runs under, e.g. a sandbox
    pub wrapper: Vec<String>,
}

/// Derivations the build tool reported as failed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildFailures {
    /// Derivations whose dependencies could not be built
    pub failed_dependencies: Vec<String>,
    /// Timed out derivations with the line reporting the timeout
    pub timed_out: Vec<(String, String)>,
}

impl BuildFailures {
    /// Whether the run reported any timeout
    pub fn any_timeout(&self) -> bool {
        !self.timed_out.is_empty()
    }
}

/// Evaluate, filter and build.
///
/// Returns the evaluated records of every system, annotated with failure
/// context from the build. An empty request returns an empty map without
/// running anything.
pub async fn nix_build(ctx: &NixContext, request: &BuildRequest) -> Result<AttrsPerSystem> {
    if request.attrs_per_system.values().all(BTreeSet::is_empty) {
        info!("Nothing to be built.");
        return Ok(AttrsPerSystem::new());
    }

    let attrs_per_system = multi_system_eval(
        ctx,
        &request.attrs_per_system,
        &request.eval,
        request.eval_threads,
    )
    .await?;
    let mut attrs_per_system = request.pre_build_filter.apply(attrs_per_system).await?;

    let filtered_per_system = buildable_per_system(&attrs_per_system);
    if filtered_per_system.values().all(Vec::is_empty) {
        info!("No buildable attributes left after evaluation.");
        return Ok(attrs_per_system);
    }

    let mut args = build_args(request);
    args.extend(build_shell_file_args(
        &request.cache_directory,
        &filtered_per_system,
        &request.local_system,
        &request.nixpkgs_config,
    )?);
    args.extend(request.extra_args.iter().cloned());

    let (program, args) = match request.wrapper.split_first() {
        Some((wrapper, wrapper_args)) => {
            let mut full = wrapper_args.to_vec();
            full.push(request.build_graph.clone());
            full.extend(args);
            (PathBuf::from(wrapper), full)
        }
        None => (PathBuf::from(&request.build_graph), args),
    };

    info!(
        attrs = filtered_per_system.values().map(Vec::len).sum::<usize>(),
        "Building attributes"
    );
    debug!(command = %render_command(&program, &args), "Running build tool");

    let output = Command::new(&program)
        .args(&args)
        .stdout(Stdio::inherit())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| NixError::from_spawn(&program, e))?;

    if !output.status.success() {
        warn!(status = %output.status, "Build finished with failures");
    }

    let stderr = strip_copying_lines(&String::from_utf8_lossy(&output.stderr));
    let store_dir = ctx.store_dir().await?;
    let failures = parse_build_stderr(&stderr, store_dir);
    annotate_build_failures(&mut attrs_per_system, &stderr, &failures);

    Ok(attrs_per_system)
}

/// Names of the attributes that should be handed to the build tool
pub fn buildable_per_system(attrs_per_system: &AttrsPerSystem) -> BTreeMap<System, Vec<String>> {
    attrs_per_system
        .iter()
        .map(|(system, attrs)| {
            let names = attrs
                .iter()
                .filter(|a| !(a.broken || a.blacklisted || a.skipped))
                .map(|a| a.name.clone())
                .collect();
            (system.clone(), names)
        })
        .collect()
}

fn build_args(request: &BuildRequest) -> Vec<String> {
    let allow = &request.eval.allow;
    let mut args = vec![
        "build".to_string(),
        "--file".to_string(),
        request.review_shell.display().to_string(),
        "--nix-path".to_string(),
        request.eval.nix_path.clone(),
        "--extra-experimental-features".to_string(),
        allow.experimental_features().to_string(),
        "--no-link".to_string(),
        "--keep-going".to_string(),
        allow.ifd_flag().to_string(),
    ];

    if cfg!(target_os = "linux") {
        // only matters for single-user nix and trusted users
        args.extend(["--option", "build-use-sandbox", "relaxed"].map(String::from));
    }
    args
}

/// Write `attrs.nix` into `cache_dir` and return the `--argstr` arguments
/// pointing the review shell at it.
pub fn build_shell_file_args(
    cache_dir: &Path,
    attrs_per_system: &BTreeMap<System, Vec<String>>,
    local_system: &str,
    nixpkgs_config: &Path,
) -> Result<Vec<String>> {
    let attrs_file = cache_dir.join("attrs.nix");
    let content = render_attrs_nix(attrs_per_system);
    std::fs::write(&attrs_file, &content)?;
    debug!(path = %attrs_file.display(), "Wrote attrs.nix\n{content}");

    Ok(vec![
        "--argstr".to_string(),
        "local-system".to_string(),
        local_system.to_string(),
        "--argstr".to_string(),
        "nixpkgs-path".to_string(),
        cache_dir.join("nixpkgs/").display().to_string(),
        "--argstr".to_string(),
        "nixpkgs-config-path".to_string(),
        nixpkgs_config.display().to_string(),
        "--argstr".to_string(),
        "attrs-path".to_string(),
        attrs_file.display().to_string(),
    ])
}

/// Render `{ system = [ "attr" ]; }`
pub fn render_attrs_nix(attrs_per_system: &BTreeMap<System, Vec<String>>) -> String {
    let mut out = String::from("{\n");
    for (system, attrs) in attrs_per_system {
        out.push_str(&format!("  {system} = [\n"));
        for attr in attrs {
            out.push_str(&format!("    \"{attr}\"\n"));
        }
        out.push_str("  ];\n");
    }
    out.push('}');
    out
}

/// Drop the `copying path '...' from '...'...` chatter
pub fn strip_copying_lines(stderr: &str) -> String {
    stderr
        .lines()
        .filter(|line| !(line.starts_with("copying path '") && line.ends_with("...")))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Find failed and timed out derivations in the build tool's stderr
pub fn parse_build_stderr(stderr: &str, store_dir: &str) -> BuildFailures {
    let mut failures = BuildFailures::default();
    for line in stderr.lines() {
        let is_dependency_failure = DEPENDENCY_FAILURE_MARKERS
            .iter()
            .any(|marker| line.contains(marker));
        let is_timeout = line.contains(TIMEOUT_MARKER);
        if !(is_dependency_failure || is_timeout) {
            continue;
        }

        let Some(drv_path) = store_path_token(line, store_dir) else {
            debug!(line, "Failure line without a store path");
            continue;
        };
        if is_timeout {
            failures.timed_out.push((drv_path, line.to_string()));
        } else {
            failures.failed_dependencies.push(drv_path);
        }
    }
    failures
}

/// First whitespace separated token mentioning the store, without quotes
/// and trailing colons
fn store_path_token(line: &str, store_dir: &str) -> Option<String> {
    line.split_whitespace()
        .find(|item| item.contains(store_dir))
        .map(|item| {
            item.trim_start_matches('\'')
                .trim_end_matches([':', '\''])
                .to_string()
        })
}

/// Attach build failures to the matching records.
///
/// Dependency failures get the whole stderr as context. Timeouts get the line
/// that reported them. If anything timed out, dependency failures are marked
/// as timed out too: a dependency that failed without an error of its own is
/// most likely a cascade of the timeout. That is a heuristic and can misfire
/// when an unrelated failure happens in the same run.
pub fn annotate_build_failures(
    attrs_per_system: &mut AttrsPerSystem,
    stderr: &str,
    failures: &BuildFailures,
) {
    let failed: HashSet<&str> = failures
        .failed_dependencies
        .iter()
        .map(String::as_str)
        .collect();
    let timed_out: HashMap<&str, &str> = failures
        .timed_out
        .iter()
        .map(|(drv, line)| (drv.as_str(), line.as_str()))
        .collect();
    let any_timeout = failures.any_timeout();

    for attr in attrs_per_system.values_mut().flatten() {
        let Some(drv_path) = attr.drv_path.as_deref() else {
            continue;
        };
        let dependency_failed = failed.contains(drv_path);
        let timeout_line = timed_out.get(drv_path).copied();

        if dependency_failed {
            mark_failed(attr, stderr, any_timeout);
        }
        if let Some(line) = timeout_line {
            attr.timed_out = true;
            attr.build_err_msg = Some(line.to_string());
        }
    }
}

fn mark_failed(attr: &mut Attr, stderr: &str, any_timeout: bool) {
    attr.build_err_msg = Some(stderr.to_string());
    if any_timeout {
        attr.timed_out = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STORE: &str = "/nix/store";

    fn attrs_with(drvs: &[(&str, &str)]) -> AttrsPerSystem {
        let attrs = drvs
            .iter()
            .map(|(name, drv)| {
                Attr::new(*name, true, false).with_paths(format!("{STORE}/out-{name}"), *drv)
            })
            .collect();
        let mut map = AttrsPerSystem::new();
        map.insert("x86_64-linux".to_string(), attrs);
        map
    }

    #[test]
    fn test_strip_copying_lines() {
        let stderr = "copying path '/nix/store/a' from 'https://cache.nixos.org'...\n\
                      building '/nix/store/b.drv'...\n\
                      copying path '/nix/store/c' to somewhere";
        assert_eq!(
            strip_copying_lines(stderr),
            "building '/nix/store/b.drv'...\ncopying path '/nix/store/c' to somewhere"
        );
    }

    #[test]
    fn test_parse_dependency_failure() {
        let stderr = "error: cannot build derivation '/nix/store/abc-foo.drv': 1 dependencies couldn't be built";
        let failures = parse_build_stderr(stderr, STORE);
        assert_eq!(failures.failed_dependencies, vec!["/nix/store/abc-foo.drv"]);
        assert!(!failures.any_timeout());
    }

    #[test]
    fn test_parse_new_style_dependency_failure() {
        let stderr = "error: 1 dependencies of derivation '/nix/store/abc-foo.drv' failed to build";
        let failures = parse_build_stderr(stderr, STORE);
        assert_eq!(failures.failed_dependencies, vec!["/nix/store/abc-foo.drv"]);
    }

    #[test]
    fn test_parse_timeout() {
        let stderr = "building of '/nix/store/xyz-bar.drv' timed out after 3600 seconds of silence";
        let failures = parse_build_stderr(stderr, STORE);
        assert_eq!(
            failures.timed_out,
            vec![("/nix/store/xyz-bar.drv".to_string(), stderr.to_string())]
        );
    }

    #[test]
    fn test_parse_respects_custom_store_dir() {
        let stderr = "error: cannot build derivation '/gnu/store/abc-foo.drv': 1 dependencies couldn't be built";
        assert!(parse_build_stderr(stderr, STORE).failed_dependencies.is_empty());
        assert_eq!(
            parse_build_stderr(stderr, "/gnu/store").failed_dependencies,
            vec!["/gnu/store/abc-foo.drv"]
        );
    }

    #[test]
    fn test_dependency_failure_without_timeout() {
        let mut attrs = attrs_with(&[("foo", "/nix/store/abc-foo.drv")]);
        let stderr = "some context\nerror: cannot build derivation '/nix/store/abc-foo.drv': 1 dependencies couldn't be built";
        let failures = parse_build_stderr(stderr, STORE);
        annotate_build_failures(&mut attrs, stderr, &failures);

        let foo = &attrs["x86_64-linux"][0];
        assert!(!foo.timed_out);
        assert_eq!(foo.build_err_msg.as_deref(), Some(stderr));
    }

    #[test]
    fn test_timeout_cascades_to_dependency_failures() {
        let mut attrs = attrs_with(&[
            ("x", "/nix/store/xxx-x.drv"),
            ("y", "/nix/store/yyy-y.drv"),
            ("z", "/nix/store/zzz-z.drv"),
        ]);
        let timeout_line = "building of '/nix/store/xxx-x.drv' timed out after 10 seconds";
        let stderr = format!(
            "{timeout_line}\nerror: cannot build derivation '/nix/store/yyy-y.drv': 1 dependencies couldn't be built"
        );
        let failures = parse_build_stderr(&stderr, STORE);
        annotate_build_failures(&mut attrs, &stderr, &failures);

        let records = &attrs["x86_64-linux"];
        assert!(records[0].timed_out);
        assert_eq!(records[0].build_err_msg.as_deref(), Some(timeout_line));
        assert!(records[1].timed_out);
        assert_eq!(records[1].build_err_msg.as_deref(), Some(stderr.as_str()));
        assert!(!records[2].timed_out);
        assert!(records[2].build_err_msg.is_none());
    }

    #[test]
    fn test_timeout_line_wins_over_dependency_context() {
        let mut attrs = attrs_with(&[("x", "/nix/store/xxx-x.drv")]);
        attrs.insert("aarch64-linux".to_string(), attrs["x86_64-linux"].clone());
        let timeout_line = "building of '/nix/store/xxx-x.drv' timed out after 10 seconds";
        let stderr = format!(
            "error: cannot build derivation '/nix/store/xxx-x.drv': \
             1 dependencies couldn't be built\n{timeout_line}"
        );
        let failures = parse_build_stderr(&stderr, STORE);
        annotate_build_failures(&mut attrs, &stderr, &failures);

        for records in attrs.values() {
            assert!(records[0].timed_out);
            assert_eq!(records[0].build_err_msg.as_deref(), Some(timeout_line));
        }
    }

    #[test]
    fn test_buildable_excludes_broken_blacklisted_skipped() {
        let mut broken = Attr::new("broken", true, true);
        broken.path = None;
        let blacklisted = Attr::new("tests.trivial", true, false);
        let mut skipped = Attr::new("skipped", true, false);
        skipped.skipped = true;
        let ok = Attr::new("ok", true, false);

        let mut map = AttrsPerSystem::new();
        map.insert("x86_64-linux".to_string(), vec![broken, blacklisted, skipped, ok]);

        let buildable = buildable_per_system(&map);
        assert_eq!(buildable["x86_64-linux"], vec!["ok".to_string()]);
    }

    #[test]
    fn test_render_attrs_nix() {
        let mut map = BTreeMap::new();
        map.insert(
            "aarch64-linux".to_string(),
            vec!["hello".to_string(), "python3Packages.requests".to_string()],
        );
        map.insert("x86_64-linux".to_string(), vec![]);

        assert_eq!(
            render_attrs_nix(&map),
            "{\n  aarch64-linux = [\n    \"hello\"\n    \"python3Packages.requests\"\n  ];\n  x86_64-linux = [\n  ];\n}"
        );
    }

    #[test]
    fn test_build_shell_file_args_writes_attrs_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = BTreeMap::new();
        map.insert("x86_64-linux".to_string(), vec!["hello".to_string()]);

        let args =
            build_shell_file_args(dir.path(), &map, "x86_64-linux", Path::new("/etc/cfg.nix"))
                .unwrap();

        let attrs_file = dir.path().join("attrs.nix");
        assert!(attrs_file.is_file());
        assert_eq!(args.last().unwrap(), &attrs_file.display().to_string());
        assert_eq!(args[2], "x86_64-linux");
        assert_eq!(args[8], "/etc/cfg.nix");
    }
}
